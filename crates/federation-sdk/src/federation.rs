use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use reqwest::{Client, ClientBuilder, header};
use serde::de::DeserializeOwned;
use url::Url;

use crate::homeserver::PaginationDirection;
use crate::signing::RequestSigner;
use crate::types::{
    EventAuth, FederationResponse, NotaryKeys, PduTransaction, RoomState, ServerKeys,
    ServerVersion, StateIds, TimestampToEvent, UserDevices, WellKnownServer,
};
use crate::FederationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Https,
    /// Plain HTTP, only useful against local test servers.
    Http,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Https => "https",
            Scheme::Http => "http",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FederationClientConfig {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub scheme: Scheme,
    pub user_agent: String,
}

impl Default for FederationClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            scheme: Scheme::Https,
            user_agent: concat!("fedprobe/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Where to send a federation request: connect to `addresses` on `port`, but
/// present `tls_name` for SNI, certificate validation and `Host`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAddr {
    pub tls_name: String,
    pub port: u16,
    pub addresses: Vec<IpAddr>,
}

impl EndpointAddr {
    pub fn new(tls_name: impl Into<String>, port: u16) -> Self {
        Self {
            tls_name: tls_name.into(),
            port,
            addresses: Vec::new(),
        }
    }

    pub fn with_addresses(mut self, addresses: Vec<IpAddr>) -> Self {
        self.addresses = addresses;
        self
    }

    fn authority(&self) -> String {
        match self.tls_name.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{ip}]:{}", self.port),
            _ => format!("{}:{}", self.tls_name, self.port),
        }
    }
}

#[derive(Clone)]
pub struct FederationClient {
    http: Client,
    config: FederationClientConfig,
}

impl FederationClient {
    pub fn new(config: FederationClientConfig) -> Result<Self, FederationError> {
        let http = Self::builder(&config).build()?;
        Ok(Self { http, config })
    }

    fn builder(config: &FederationClientConfig) -> ClientBuilder {
        Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
    }

    /// Fetches `/.well-known/matrix/server` from the bare server name, using
    /// ordinary DNS.
    pub async fn well_known(
        &self,
        server_name: &str,
    ) -> Result<FederationResponse<WellKnownServer>, FederationError> {
        let mut url = Url::parse(&format!("{}://{server_name}", self.config.scheme.as_str()))?;
        push_segments(&mut url, &[".well-known", "matrix", "server"])?;
        get_json(&self.http, url).await
    }

    pub async fn server_version(
        &self,
        endpoint: &EndpointAddr,
    ) -> Result<FederationResponse<ServerVersion>, FederationError> {
        let url = self.endpoint_url(endpoint, &["_matrix", "federation", "v1", "version"])?;
        get_json(&self.client_for(endpoint)?, url).await
    }

    pub async fn server_keys(
        &self,
        endpoint: &EndpointAddr,
    ) -> Result<FederationResponse<ServerKeys>, FederationError> {
        let url = self.endpoint_url(endpoint, &["_matrix", "key", "v2", "server"])?;
        get_json(&self.client_for(endpoint)?, url).await
    }

    /// Asks the notary at `endpoint` for the keys it holds for `server_name`.
    pub async fn notary_keys(
        &self,
        endpoint: &EndpointAddr,
        server_name: &str,
    ) -> Result<FederationResponse<NotaryKeys>, FederationError> {
        let url = self.endpoint_url(endpoint, &["_matrix", "key", "v2", "query", server_name])?;
        get_json(&self.client_for(endpoint)?, url).await
    }

    /// One PDU by id, from `destination`'s point of view.
    pub async fn event(
        &self,
        endpoint: &EndpointAddr,
        destination: &str,
        signer: &RequestSigner,
        event_id: &str,
    ) -> Result<FederationResponse<PduTransaction>, FederationError> {
        let url = self.endpoint_url(endpoint, &["_matrix", "federation", "v1", "event", event_id])?;
        self.signed_get(endpoint, destination, signer, url).await
    }

    /// Ids of the room state (and its auth chain) at `event_id`.
    pub async fn state_ids(
        &self,
        endpoint: &EndpointAddr,
        destination: &str,
        signer: &RequestSigner,
        room_id: &str,
        event_id: &str,
    ) -> Result<FederationResponse<StateIds>, FederationError> {
        let mut url =
            self.endpoint_url(endpoint, &["_matrix", "federation", "v1", "state_ids", room_id])?;
        url.query_pairs_mut().append_pair("event_id", event_id);
        self.signed_get(endpoint, destination, signer, url).await
    }

    /// Full room state PDUs at `event_id`.
    pub async fn room_state(
        &self,
        endpoint: &EndpointAddr,
        destination: &str,
        signer: &RequestSigner,
        room_id: &str,
        event_id: &str,
    ) -> Result<FederationResponse<RoomState>, FederationError> {
        let mut url =
            self.endpoint_url(endpoint, &["_matrix", "federation", "v1", "state", room_id])?;
        url.query_pairs_mut().append_pair("event_id", event_id);
        self.signed_get(endpoint, destination, signer, url).await
    }

    /// Up to `limit` PDUs preceding (and including) `event_id`.
    pub async fn backfill(
        &self,
        endpoint: &EndpointAddr,
        destination: &str,
        signer: &RequestSigner,
        room_id: &str,
        event_id: &str,
        limit: u32,
    ) -> Result<FederationResponse<PduTransaction>, FederationError> {
        let mut url =
            self.endpoint_url(endpoint, &["_matrix", "federation", "v1", "backfill", room_id])?;
        url.query_pairs_mut()
            .append_pair("v", event_id)
            .append_pair("limit", &limit.to_string());
        self.signed_get(endpoint, destination, signer, url).await
    }

    pub async fn event_auth(
        &self,
        endpoint: &EndpointAddr,
        destination: &str,
        signer: &RequestSigner,
        room_id: &str,
        event_id: &str,
    ) -> Result<FederationResponse<EventAuth>, FederationError> {
        let url = self.endpoint_url(
            endpoint,
            &["_matrix", "federation", "v1", "event_auth", room_id, event_id],
        )?;
        self.signed_get(endpoint, destination, signer, url).await
    }

    pub async fn user_devices(
        &self,
        endpoint: &EndpointAddr,
        destination: &str,
        signer: &RequestSigner,
        user_id: &str,
    ) -> Result<FederationResponse<UserDevices>, FederationError> {
        let url = self.endpoint_url(
            endpoint,
            &["_matrix", "federation", "v1", "user", "devices", user_id],
        )?;
        self.signed_get(endpoint, destination, signer, url).await
    }

    /// The event closest to `ts` (ms since the epoch) in direction `dir`.
    pub async fn timestamp_to_event(
        &self,
        endpoint: &EndpointAddr,
        destination: &str,
        signer: &RequestSigner,
        room_id: &str,
        ts: i64,
        dir: PaginationDirection,
    ) -> Result<FederationResponse<TimestampToEvent>, FederationError> {
        let mut url = self.endpoint_url(
            endpoint,
            &["_matrix", "federation", "v1", "timestamp_to_event", room_id],
        )?;
        url.query_pairs_mut()
            .append_pair("ts", &ts.to_string())
            .append_pair("dir", dir.as_query());
        self.signed_get(endpoint, destination, signer, url).await
    }

    async fn signed_get<T>(
        &self,
        endpoint: &EndpointAddr,
        destination: &str,
        signer: &RequestSigner,
        url: Url,
    ) -> Result<FederationResponse<T>, FederationError>
    where
        T: DeserializeOwned,
    {
        let uri = match url.query() {
            Some(query) => format!("{}?{query}", url.path()),
            None => url.path().to_string(),
        };
        let authorization = signer.authorization("GET", &uri, destination, None);
        tracing::debug!(
            target = "federation_sdk",
            url = %url,
            origin = signer.origin(),
            destination,
            "signed GET"
        );
        let res = self
            .client_for(endpoint)?
            .get(url)
            .header(header::AUTHORIZATION, authorization)
            .send()
            .await?;
        decode(res).await
    }

    fn endpoint_url(&self, endpoint: &EndpointAddr, segments: &[&str]) -> Result<Url, FederationError> {
        let mut url = Url::parse(&format!(
            "{}://{}",
            self.config.scheme.as_str(),
            endpoint.authority()
        ))?;
        push_segments(&mut url, segments)?;
        Ok(url)
    }

    /// A client whose resolver is pinned to the endpoint's addresses. Falls
    /// back to the shared client when there is nothing to pin.
    fn client_for(&self, endpoint: &EndpointAddr) -> Result<Client, FederationError> {
        if endpoint.addresses.is_empty() || endpoint.tls_name.parse::<IpAddr>().is_ok() {
            return Ok(self.http.clone());
        }
        let addrs: Vec<SocketAddr> = endpoint
            .addresses
            .iter()
            .map(|ip| SocketAddr::new(*ip, endpoint.port))
            .collect();
        Ok(Self::builder(&self.config)
            .resolve_to_addrs(&endpoint.tls_name, &addrs)
            .build()?)
    }
}

pub(crate) fn push_segments(url: &mut Url, segments: &[&str]) -> Result<(), FederationError> {
    let url_str = url.to_string();
    url.path_segments_mut()
        .map_err(|_| FederationError::InvalidUrl(format!("{url_str} cannot be a base")))?
        .pop_if_empty()
        .extend(segments);
    Ok(())
}

pub(crate) async fn get_json<T>(
    client: &Client,
    url: Url,
) -> Result<FederationResponse<T>, FederationError>
where
    T: DeserializeOwned,
{
    tracing::debug!(target = "federation_sdk", url = %url, "GET");
    let res = client.get(url).send().await?;
    decode(res).await
}

pub(crate) async fn decode<T>(res: reqwest::Response) -> Result<FederationResponse<T>, FederationError>
where
    T: DeserializeOwned,
{
    let status = res.status();
    let server_header = res
        .headers()
        .get(header::SERVER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        return Err(FederationError::UnexpectedStatus { status, body });
    }

    let bytes = res.bytes().await?;
    let raw: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|err| FederationError::Malformed(format!("invalid json: {err}")))?;
    let body = serde_json::from_value(raw.clone())
        .map_err(|err| FederationError::Malformed(err.to_string()))?;
    Ok(FederationResponse {
        body,
        raw,
        status,
        server_header,
    })
}
