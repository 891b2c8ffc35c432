//! Bindings from the core's collaborator traits to `federation_sdk` clients.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use federation_sdk::types::{ServerKeys, UserDevices};
use federation_sdk::{
    EndpointAddr, FederationClient, FederationError, HomeserverClient, PaginationDirection,
    RequestSigner,
};
use serde_json::Value;

use crate::backwalk::{Direction, Page, PageFetchError, PageSource};
use crate::delegation::ResolvedEndpoint;
use crate::delegation::well_known::{WellKnownError, WellKnownSource};
use crate::error::FedProbeError;
use crate::events::{DeviceList, DeviceSummary, EventTransport};
use crate::hosts::{MembershipEvent, MembershipSource};
use crate::probe::{FailureKind, FederationTransport, KeySet, OldKey, ProbeFailure, VersionInfo};
use crate::server_name::ServerName;
use crate::targets::RoomDirectory;

/// Maps a transport error onto the probe failure taxonomy. TLS is checked
/// before the generic transport case since handshake failures also surface as
/// connect errors.
pub fn classify(err: &FederationError) -> ProbeFailure {
    if err.is_timeout() {
        return ProbeFailure::new(FailureKind::Timeout, err.to_string());
    }
    if err.is_tls() {
        return ProbeFailure::new(FailureKind::Tls, err.to_string());
    }
    match err {
        FederationError::UnexpectedStatus { status, body } => {
            let reason = status
                .canonical_reason()
                .map(str::to_owned)
                .unwrap_or_else(|| body.chars().take(120).collect());
            ProbeFailure::http_status(status.as_u16(), reason)
        }
        FederationError::Malformed(message) => ProbeFailure::new(FailureKind::Malformed, message.clone()),
        FederationError::Http(inner) if inner.is_decode() => {
            ProbeFailure::new(FailureKind::Malformed, err.to_string())
        }
        FederationError::InvalidUrl(message) | FederationError::InvalidKey(message) => {
            ProbeFailure::internal(message.clone())
        }
        FederationError::Http(_) => ProbeFailure::new(FailureKind::Transport, err.to_string()),
    }
}

fn endpoint_addr(endpoint: &ResolvedEndpoint) -> EndpointAddr {
    EndpointAddr::new(endpoint.tls_server_name.clone(), endpoint.port)
        .with_addresses(endpoint.addresses.clone())
}

fn key_set(keys: ServerKeys, raw: Value) -> KeySet {
    KeySet {
        server_name: keys.server_name,
        verify_keys: keys.verify_keys.into_keys().collect(),
        old_verify_keys: keys
            .old_verify_keys
            .into_iter()
            .map(|(key_id, old)| OldKey {
                key_id,
                expired_ts: old.expired_ts,
            })
            .collect(),
        valid_until_ts: keys.valid_until_ts,
        raw,
    }
}

#[async_trait]
impl FederationTransport for FederationClient {
    async fn version(&self, endpoint: &ResolvedEndpoint) -> Result<VersionInfo, ProbeFailure> {
        let response = self
            .server_version(&endpoint_addr(endpoint))
            .await
            .map_err(|err| classify(&err))?;
        Ok(VersionInfo {
            software: response.body.server.name,
            version: response.body.server.version,
            served_by: response.server_header,
        })
    }

    async fn server_keys(&self, endpoint: &ResolvedEndpoint) -> Result<KeySet, ProbeFailure> {
        let response = FederationClient::server_keys(self, &endpoint_addr(endpoint))
            .await
            .map_err(|err| classify(&err))?;
        Ok(key_set(response.body, response.raw))
    }

    async fn notary_keys(
        &self,
        endpoint: &ResolvedEndpoint,
        server_name: &ServerName,
    ) -> Result<Vec<KeySet>, ProbeFailure> {
        let response = FederationClient::notary_keys(self, &endpoint_addr(endpoint), server_name.as_str())
            .await
            .map_err(|err| classify(&err))?;
        let raw_sets = response
            .raw
            .get("server_keys")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(response
            .body
            .server_keys
            .into_iter()
            .enumerate()
            .map(|(index, keys)| {
                let raw = raw_sets.get(index).cloned().unwrap_or(Value::Null);
                key_set(keys, raw)
            })
            .collect())
    }
}

/// The SDK client plus the origin's signing key, for the authenticated
/// federation endpoints.
#[derive(Clone)]
pub struct SignedFederation {
    client: Arc<FederationClient>,
    signer: Arc<RequestSigner>,
}

impl SignedFederation {
    pub fn new(client: Arc<FederationClient>, signer: RequestSigner) -> Self {
        Self {
            client,
            signer: Arc::new(signer),
        }
    }

    pub fn origin(&self) -> &str {
        self.signer.origin()
    }
}

fn device_list(devices: UserDevices) -> DeviceList {
    DeviceList {
        user_id: devices.user_id,
        stream_id: devices.stream_id,
        devices: devices
            .devices
            .into_iter()
            .map(|device| {
                let keys = device.keys.unwrap_or(Value::Null);
                DeviceSummary {
                    device_id: device.device_id,
                    display_name: device.device_display_name,
                    algorithms: keys
                        .get("algorithms")
                        .and_then(Value::as_array)
                        .map(|algorithms| {
                            algorithms
                                .iter()
                                .filter_map(Value::as_str)
                                .map(str::to_owned)
                                .collect()
                        })
                        .unwrap_or_default(),
                    key_count: keys
                        .get("keys")
                        .and_then(Value::as_object)
                        .map_or(0, |keys| keys.len()),
                }
            })
            .collect(),
    }
}

#[async_trait]
impl EventTransport for SignedFederation {
    async fn event(
        &self,
        endpoint: &ResolvedEndpoint,
        destination: &ServerName,
        event_id: &str,
    ) -> Result<Value, ProbeFailure> {
        let response = self
            .client
            .event(&endpoint_addr(endpoint), destination.as_str(), &self.signer, event_id)
            .await
            .map_err(|err| classify(&err))?;
        response.body.pdus.into_iter().next().ok_or_else(|| {
            ProbeFailure::new(FailureKind::Malformed, format!("no pdu returned for {event_id}"))
        })
    }

    async fn state_ids(
        &self,
        endpoint: &ResolvedEndpoint,
        destination: &ServerName,
        room_id: &str,
        event_id: &str,
    ) -> Result<Vec<String>, ProbeFailure> {
        self.client
            .state_ids(
                &endpoint_addr(endpoint),
                destination.as_str(),
                &self.signer,
                room_id,
                event_id,
            )
            .await
            .map(|response| response.body.pdu_ids)
            .map_err(|err| classify(&err))
    }

    async fn room_state(
        &self,
        endpoint: &ResolvedEndpoint,
        destination: &ServerName,
        room_id: &str,
        event_id: &str,
    ) -> Result<Vec<Value>, ProbeFailure> {
        self.client
            .room_state(
                &endpoint_addr(endpoint),
                destination.as_str(),
                &self.signer,
                room_id,
                event_id,
            )
            .await
            .map(|response| response.body.pdus)
            .map_err(|err| classify(&err))
    }

    async fn backfill(
        &self,
        endpoint: &ResolvedEndpoint,
        destination: &ServerName,
        room_id: &str,
        event_id: &str,
        limit: u32,
    ) -> Result<Vec<Value>, ProbeFailure> {
        self.client
            .backfill(
                &endpoint_addr(endpoint),
                destination.as_str(),
                &self.signer,
                room_id,
                event_id,
                limit,
            )
            .await
            .map(|response| response.body.pdus)
            .map_err(|err| classify(&err))
    }

    async fn event_auth(
        &self,
        endpoint: &ResolvedEndpoint,
        destination: &ServerName,
        room_id: &str,
        event_id: &str,
    ) -> Result<Vec<Value>, ProbeFailure> {
        self.client
            .event_auth(
                &endpoint_addr(endpoint),
                destination.as_str(),
                &self.signer,
                room_id,
                event_id,
            )
            .await
            .map(|response| response.body.auth_chain)
            .map_err(|err| classify(&err))
    }

    async fn user_devices(
        &self,
        endpoint: &ResolvedEndpoint,
        destination: &ServerName,
        user_id: &str,
    ) -> Result<DeviceList, ProbeFailure> {
        self.client
            .user_devices(&endpoint_addr(endpoint), destination.as_str(), &self.signer, user_id)
            .await
            .map(|response| device_list(response.body))
            .map_err(|err| classify(&err))
    }

    async fn event_before(
        &self,
        endpoint: &ResolvedEndpoint,
        destination: &ServerName,
        room_id: &str,
        ts: i64,
    ) -> Result<String, ProbeFailure> {
        self.client
            .timestamp_to_event(
                &endpoint_addr(endpoint),
                destination.as_str(),
                &self.signer,
                room_id,
                ts,
                PaginationDirection::Backward,
            )
            .await
            .map(|response| response.body.event_id)
            .map_err(|err| classify(&err))
    }
}

#[async_trait]
impl WellKnownSource for FederationClient {
    async fn fetch_well_known(&self, server_name: &ServerName) -> Result<String, WellKnownError> {
        match self.well_known(&server_name.host().to_string()).await {
            Ok(response) => Ok(response.body.server),
            Err(err) if err.is_timeout() => Err(WellKnownError::Timeout),
            Err(FederationError::UnexpectedStatus { status, .. }) => Err(WellKnownError::Status {
                status: status.as_u16(),
            }),
            Err(FederationError::Malformed(message)) => Err(WellKnownError::Malformed(message)),
            Err(err) => Err(WellKnownError::Transport(err.to_string())),
        }
    }
}

fn homeserver_error(err: FederationError) -> FedProbeError {
    FedProbeError::Homeserver(classify(&err).to_string())
}

#[async_trait]
impl PageSource for HomeserverClient {
    async fn fetch_page(
        &self,
        room_id: &str,
        direction: Direction,
        token: Option<&str>,
        limit: u32,
    ) -> Result<Page, PageFetchError> {
        let dir = match direction {
            Direction::Forward => PaginationDirection::Forward,
            Direction::Backward => PaginationDirection::Backward,
        };
        let page = self
            .room_messages(room_id, dir, token, limit)
            .await
            .map_err(|err| PageFetchError(classify(&err).to_string()))?;
        let event_ids: Vec<String> = page.event_ids().map(str::to_owned).collect();
        // An empty chunk is the end of the timeline even if a token came back.
        let next_token = if event_ids.is_empty() { None } else { page.end };
        Ok(Page {
            event_ids,
            next_token,
        })
    }
}

#[async_trait]
impl RoomDirectory for HomeserverClient {
    async fn resolve_alias(&self, alias: &str) -> Result<String, FedProbeError> {
        HomeserverClient::resolve_alias(self, alias)
            .await
            .map(|resolution| resolution.room_id)
            .map_err(homeserver_error)
    }

    async fn joined_members(&self, room_id: &str) -> Result<Vec<String>, FedProbeError> {
        HomeserverClient::joined_members(self, room_id)
            .await
            .map_err(homeserver_error)
    }
}

/// Room state from a saved federation `/state` response (`{"pdus": [...]}`)
/// or a bare JSON array of state events.
///
/// A dump is one snapshot. Scoping it to an event keeps only the state no
/// deeper than that event, which must itself be in the dump with its
/// `event_id`.
#[derive(Debug, Clone)]
pub struct StateDumpSource {
    path: PathBuf,
}

impl StateDumpSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn parse(
        document: &Value,
        as_of_event: Option<&str>,
    ) -> Result<Vec<MembershipEvent>, FedProbeError> {
        let events = match document {
            Value::Array(events) => events,
            Value::Object(map) => map
                .get("pdus")
                .or_else(|| map.get("state"))
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    FedProbeError::Membership("state dump has no `pdus` or `state` array".into())
                })?,
            _ => {
                return Err(FedProbeError::Membership(
                    "state dump must be a JSON array or object".into(),
                ));
            }
        };
        let max_depth = match as_of_event {
            Some(event_id) => Some(depth_of(events, event_id).ok_or_else(|| {
                FedProbeError::Membership(format!(
                    "event {event_id} with a depth is not in the state dump"
                ))
            })?),
            None => None,
        };
        Ok(events
            .iter()
            .filter_map(MembershipEvent::from_json)
            .filter(|event| max_depth.is_none_or(|max| event.depth <= max))
            .collect())
    }
}

fn depth_of(events: &[Value], event_id: &str) -> Option<i64> {
    events
        .iter()
        .find(|event| event.get("event_id").and_then(Value::as_str) == Some(event_id))
        .and_then(|event| event.get("depth"))
        .and_then(Value::as_i64)
}

#[async_trait]
impl MembershipSource for StateDumpSource {
    async fn resolve_room_membership(
        &self,
        room_id: &str,
        as_of_event: Option<&str>,
    ) -> Result<Vec<MembershipEvent>, FedProbeError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|err| {
            FedProbeError::Membership(format!("reading {}: {err}", self.path.display()))
        })?;
        let document: Value = serde_json::from_slice(&bytes).map_err(|err| {
            FedProbeError::Membership(format!("parsing {}: {err}", self.path.display()))
        })?;
        tracing::debug!(
            target = "fedprobe::adapters",
            room_id,
            as_of_event = as_of_event.unwrap_or("-"),
            path = %self.path.display(),
            "loading room state dump"
        );
        Self::parse(&document, as_of_event)
    }
}
