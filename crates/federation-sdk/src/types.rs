use std::collections::BTreeMap;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

/// A decoded federation response plus the bits of the HTTP exchange the
/// reports care about.
#[derive(Debug, Clone)]
pub struct FederationResponse<T> {
    pub body: T,
    pub raw: serde_json::Value,
    pub status: StatusCode,
    /// Value of the `Server` response header, i.e. what actually terminated TLS.
    pub server_header: Option<String>,
}

/// `/.well-known/matrix/server`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WellKnownServer {
    #[serde(rename = "m.server")]
    pub server: String,
}

/// `/_matrix/federation/v1/version`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerVersion {
    pub server: ServerSoftware,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerSoftware {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// `/_matrix/key/v2/server`, also the element type of a notary response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerKeys {
    pub server_name: String,
    #[serde(default)]
    pub verify_keys: BTreeMap<String, VerifyKey>,
    #[serde(default)]
    pub old_verify_keys: BTreeMap<String, OldVerifyKey>,
    #[serde(default)]
    pub valid_until_ts: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerifyKey {
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OldVerifyKey {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub expired_ts: Option<i64>,
}

/// `/_matrix/key/v2/query/{serverName}`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotaryKeys {
    #[serde(default)]
    pub server_keys: Vec<ServerKeys>,
}

/// `/_matrix/client/v3/rooms/{roomId}/messages`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagesPage {
    #[serde(default)]
    pub chunk: Vec<serde_json::Value>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

impl MessagesPage {
    pub fn event_ids(&self) -> impl Iterator<Item = &str> {
        self.chunk
            .iter()
            .filter_map(|event| event.get("event_id").and_then(|id| id.as_str()))
    }
}

/// `/_matrix/client/v3/rooms/{roomId}/joined_members`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinedMembers {
    #[serde(default)]
    pub joined: BTreeMap<String, serde_json::Value>,
}

/// `/_matrix/client/v3/directory/room/{roomAlias}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AliasResolution {
    pub room_id: String,
    #[serde(default)]
    pub servers: Vec<String>,
}

/// `/_matrix/federation/v1/event/{eventId}` and `/backfill/{roomId}`: a
/// transaction carrying PDUs. PDUs stay raw JSON since their shape depends on
/// the room version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PduTransaction {
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub origin_server_ts: Option<i64>,
    #[serde(default)]
    pub pdus: Vec<serde_json::Value>,
}

/// `/_matrix/federation/v1/state_ids/{roomId}`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateIds {
    #[serde(default)]
    pub pdu_ids: Vec<String>,
    #[serde(default)]
    pub auth_chain_ids: Vec<String>,
}

/// `/_matrix/federation/v1/state/{roomId}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomState {
    #[serde(default)]
    pub pdus: Vec<serde_json::Value>,
    #[serde(default)]
    pub auth_chain: Vec<serde_json::Value>,
}

/// `/_matrix/federation/v1/event_auth/{roomId}/{eventId}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventAuth {
    #[serde(default)]
    pub auth_chain: Vec<serde_json::Value>,
}

/// `/_matrix/federation/v1/user/devices/{userId}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserDevices {
    pub user_id: String,
    #[serde(default)]
    pub stream_id: i64,
    #[serde(default)]
    pub devices: Vec<UserDevice>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserDevice {
    pub device_id: String,
    #[serde(default)]
    pub device_display_name: Option<String>,
    #[serde(default)]
    pub keys: Option<serde_json::Value>,
}

/// `/_matrix/federation/v1/timestamp_to_event/{roomId}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimestampToEvent {
    pub event_id: String,
    pub origin_server_ts: i64,
}
