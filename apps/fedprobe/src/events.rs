//! Signed federation reads: single events, room state, backfill, auth chains
//! and device lists, each seen from one server.
//!
//! Every request here carries an `X-Matrix` signature from the configured
//! origin server, so the target must already federate with that origin for
//! the answer to mean anything.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use crate::delegation::ResolvedEndpoint;
use crate::error::FedProbeError;
use crate::hosts::{MembershipEvent, MembershipSource};
use crate::probe::{FailureKind, FederationProber, ProbeFailure};
use crate::server_name::ServerName;

/// The fields of a PDU worth showing, plus the PDU itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventSummary {
    /// Absent for PDUs of room versions that derive ids from the content
    /// hash, unless the id was what we asked for.
    pub event_id: Option<String>,
    pub room_id: Option<String>,
    pub event_type: String,
    pub sender: Option<String>,
    pub state_key: Option<String>,
    pub depth: Option<i64>,
    pub origin_server_ts: Option<i64>,
    pub prev_events: Vec<String>,
    pub auth_events: Vec<String>,
    pub raw: Value,
}

impl EventSummary {
    pub fn from_pdu(event_id: Option<&str>, pdu: Value) -> Result<Self, ProbeFailure> {
        let field = |name: &str| pdu.get(name).and_then(Value::as_str).map(str::to_owned);
        let event_type = field("type")
            .ok_or_else(|| ProbeFailure::new(FailureKind::Malformed, "event has no type"))?;
        Ok(Self {
            event_id: event_id.map(str::to_owned).or_else(|| field("event_id")),
            room_id: field("room_id"),
            event_type,
            sender: field("sender"),
            state_key: field("state_key"),
            depth: pdu.get("depth").and_then(Value::as_i64),
            origin_server_ts: pdu.get("origin_server_ts").and_then(Value::as_i64),
            prev_events: event_refs(&pdu, "prev_events"),
            auth_events: event_refs(&pdu, "auth_events"),
            raw: pdu,
        })
    }
}

/// Room versions 1 and 2 reference events as `[id, {hashes}]` pairs, later
/// versions as bare ids.
fn event_refs(pdu: &Value, field: &str) -> Vec<String> {
    pdu.get(field)
        .and_then(Value::as_array)
        .map(|refs| {
            refs.iter()
                .filter_map(|reference| match reference {
                    Value::String(id) => Some(id.clone()),
                    Value::Array(pair) => pair.first().and_then(Value::as_str).map(str::to_owned),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSummary {
    pub device_id: String,
    pub display_name: Option<String>,
    pub algorithms: Vec<String>,
    pub key_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceList {
    pub user_id: String,
    pub stream_id: i64,
    pub devices: Vec<DeviceSummary>,
}

/// Signed federation requests against an already resolved endpoint.
/// `destination` is the server name the request is signed for.
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn event(
        &self,
        endpoint: &ResolvedEndpoint,
        destination: &ServerName,
        event_id: &str,
    ) -> Result<Value, ProbeFailure>;

    async fn state_ids(
        &self,
        endpoint: &ResolvedEndpoint,
        destination: &ServerName,
        room_id: &str,
        event_id: &str,
    ) -> Result<Vec<String>, ProbeFailure>;

    async fn room_state(
        &self,
        endpoint: &ResolvedEndpoint,
        destination: &ServerName,
        room_id: &str,
        event_id: &str,
    ) -> Result<Vec<Value>, ProbeFailure>;

    async fn backfill(
        &self,
        endpoint: &ResolvedEndpoint,
        destination: &ServerName,
        room_id: &str,
        event_id: &str,
        limit: u32,
    ) -> Result<Vec<Value>, ProbeFailure>;

    async fn event_auth(
        &self,
        endpoint: &ResolvedEndpoint,
        destination: &ServerName,
        room_id: &str,
        event_id: &str,
    ) -> Result<Vec<Value>, ProbeFailure>;

    async fn user_devices(
        &self,
        endpoint: &ResolvedEndpoint,
        destination: &ServerName,
        user_id: &str,
    ) -> Result<DeviceList, ProbeFailure>;

    /// Id of the last event at or before `ts` (ms since the epoch).
    async fn event_before(
        &self,
        endpoint: &ResolvedEndpoint,
        destination: &ServerName,
        room_id: &str,
        ts: i64,
    ) -> Result<String, ProbeFailure>;
}

impl FederationProber {
    pub async fn fetch_event(
        &self,
        server: &ServerName,
        event_id: &str,
    ) -> Result<EventSummary, ProbeFailure> {
        let events = self.event_transport()?;
        let endpoint = self.endpoint_for(server).await?;
        let pdu = events.event(&endpoint, server, event_id).await?;
        EventSummary::from_pdu(Some(event_id), pdu)
    }

    pub async fn state_ids(
        &self,
        server: &ServerName,
        room_id: &str,
        event_id: &str,
    ) -> Result<Vec<String>, ProbeFailure> {
        let events = self.event_transport()?;
        let endpoint = self.endpoint_for(server).await?;
        events.state_ids(&endpoint, server, room_id, event_id).await
    }

    pub async fn room_state(
        &self,
        server: &ServerName,
        room_id: &str,
        event_id: &str,
    ) -> Result<Vec<Value>, ProbeFailure> {
        let events = self.event_transport()?;
        let endpoint = self.endpoint_for(server).await?;
        events.room_state(&endpoint, server, room_id, event_id).await
    }

    pub async fn backfill(
        &self,
        server: &ServerName,
        room_id: &str,
        event_id: &str,
        limit: u32,
    ) -> Result<Vec<EventSummary>, ProbeFailure> {
        let events = self.event_transport()?;
        let endpoint = self.endpoint_for(server).await?;
        let pdus = events
            .backfill(&endpoint, server, room_id, event_id, limit)
            .await?;
        summarise(pdus)
    }

    pub async fn event_auth(
        &self,
        server: &ServerName,
        room_id: &str,
        event_id: &str,
    ) -> Result<Vec<EventSummary>, ProbeFailure> {
        let events = self.event_transport()?;
        let endpoint = self.endpoint_for(server).await?;
        let pdus = events.event_auth(&endpoint, server, room_id, event_id).await?;
        summarise(pdus)
    }

    /// Devices the user's own server lists for them.
    pub async fn user_devices(&self, user_id: &str) -> Result<DeviceList, ProbeFailure> {
        let server = crate::server_name::domain_of(user_id)
            .ok_or_else(|| ProbeFailure::internal(format!("{user_id} has no server part")))
            .and_then(|domain| {
                ServerName::parse(domain).map_err(|err| ProbeFailure::internal(err.to_string()))
            })?;
        let events = self.event_transport()?;
        let endpoint = self.endpoint_for(&server).await?;
        events.user_devices(&endpoint, &server, user_id).await
    }

    /// The most recent event `server` knows of in `room_id`.
    pub async fn latest_event(
        &self,
        server: &ServerName,
        room_id: &str,
    ) -> Result<String, ProbeFailure> {
        let events = self.event_transport()?;
        let endpoint = self.endpoint_for(server).await?;
        events
            .event_before(&endpoint, server, room_id, Utc::now().timestamp_millis())
            .await
    }

    /// Depth of the latest event `server` has in `room_id`.
    pub async fn room_depth(&self, server: &ServerName, room_id: &str) -> Result<i64, ProbeFailure> {
        let latest = self.latest_event(server, room_id).await?;
        let event = self.fetch_event(server, &latest).await?;
        event.depth.ok_or_else(|| {
            ProbeFailure::new(FailureKind::Malformed, format!("{latest} has no depth"))
        })
    }
}

fn summarise(pdus: Vec<Value>) -> Result<Vec<EventSummary>, ProbeFailure> {
    pdus.into_iter()
        .map(|pdu| EventSummary::from_pdu(None, pdu))
        .collect()
}

/// Room membership from one server's federation `/state`, at `as_of_event`
/// or at the latest event that server has.
#[derive(Clone)]
pub struct FederationStateSource {
    prober: FederationProber,
    server: ServerName,
}

impl FederationStateSource {
    pub fn new(prober: FederationProber, server: ServerName) -> Self {
        Self { prober, server }
    }
}

#[async_trait]
impl MembershipSource for FederationStateSource {
    async fn resolve_room_membership(
        &self,
        room_id: &str,
        as_of_event: Option<&str>,
    ) -> Result<Vec<MembershipEvent>, FedProbeError> {
        let membership_error =
            |failure: ProbeFailure| FedProbeError::Membership(format!("{}: {failure}", self.server));
        let anchor = match as_of_event {
            Some(event_id) => event_id.to_string(),
            None => self
                .prober
                .latest_event(&self.server, room_id)
                .await
                .map_err(membership_error)?,
        };
        let pdus = self
            .prober
            .room_state(&self.server, room_id, &anchor)
            .await
            .map_err(membership_error)?;
        tracing::debug!(
            target = "fedprobe::events",
            room_id,
            server = %self.server,
            anchor = %anchor,
            state_events = pdus.len(),
            "fetched room state"
        );
        Ok(pdus.iter().filter_map(MembershipEvent::from_json).collect())
    }
}
