//! Join-order reconstruction for the hosts participating in a room.
//!
//! Depth is a causal lower bound, not a timestamp: the order produced here is
//! a plausible join order, not ground truth. A host that left and rejoined is
//! represented only by its earliest join still present in state.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::FedProbeError;
use crate::server_name::domain_of;

/// The few fields of an `m.room.member` state event that ordering needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MembershipEvent {
    pub event_type: String,
    /// The member's user id.
    pub state_key: String,
    pub sender: String,
    pub membership: Option<String>,
    pub depth: i64,
}

impl MembershipEvent {
    /// Extracts the ordering fields from a federation-format event. Returns
    /// `None` when `type`, `state_key` or `depth` are missing.
    pub fn from_json(event: &serde_json::Value) -> Option<Self> {
        let field = |name: &str| event.get(name).and_then(|v| v.as_str()).map(str::to_owned);
        Some(Self {
            event_type: field("type")?,
            state_key: field("state_key")?,
            sender: field("sender").unwrap_or_default(),
            membership: event
                .get("content")
                .and_then(|c| c.get("membership"))
                .and_then(|m| m.as_str())
                .map(str::to_owned),
            depth: event.get("depth").and_then(|d| d.as_i64())?,
        })
    }

    fn is_join(&self) -> bool {
        self.event_type == "m.room.member" && self.membership.as_deref() == Some("join")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostRecord {
    pub host: String,
    pub earliest_join_depth: i64,
}

/// Deduplicated hosts ascending by their earliest join depth, ties broken by
/// host name.
pub fn order_hosts(membership_state: &[MembershipEvent]) -> Vec<HostRecord> {
    let mut earliest: BTreeMap<&str, i64> = BTreeMap::new();
    for event in membership_state.iter().filter(|event| event.is_join()) {
        let Some(host) = domain_of(&event.state_key) else {
            continue;
        };
        earliest
            .entry(host)
            .and_modify(|depth| *depth = (*depth).min(event.depth))
            .or_insert(event.depth);
    }

    let mut hosts: Vec<HostRecord> = earliest
        .into_iter()
        .map(|(host, depth)| HostRecord {
            host: host.to_string(),
            earliest_join_depth: depth,
        })
        .collect();
    hosts.sort_by(|a, b| {
        a.earliest_join_depth
            .cmp(&b.earliest_join_depth)
            .then_with(|| a.host.cmp(&b.host))
    });
    hosts
}

/// Room state as of an event, from the federation state collaborator.
#[async_trait]
pub trait MembershipSource: Send + Sync {
    async fn resolve_room_membership(
        &self,
        room_id: &str,
        as_of_event: Option<&str>,
    ) -> Result<Vec<MembershipEvent>, FedProbeError>;
}

#[derive(Clone)]
pub struct HostOrderingResolver {
    source: Arc<dyn MembershipSource>,
}

impl HostOrderingResolver {
    pub fn new(source: Arc<dyn MembershipSource>) -> Self {
        Self { source }
    }

    pub async fn ordered_hosts(
        &self,
        room_id: &str,
        as_of_event: Option<&str>,
    ) -> Result<Vec<HostRecord>, FedProbeError> {
        let state = self
            .source
            .resolve_room_membership(room_id, as_of_event)
            .await?;
        let hosts = order_hosts(&state);
        tracing::debug!(
            target = "fedprobe::hosts",
            room_id,
            state_events = state.len(),
            hosts = hosts.len(),
            "ordered room hosts"
        );
        Ok(hosts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn member(user: &str, membership: &str, depth: i64) -> MembershipEvent {
        MembershipEvent {
            event_type: "m.room.member".into(),
            state_key: user.into(),
            sender: user.into(),
            membership: Some(membership.into()),
            depth,
        }
    }

    #[test]
    fn orders_by_minimum_join_depth() {
        let state = vec![
            member("@a:late.example", "join", 40),
            member("@b:early.example", "join", 9),
            member("@c:early.example", "join", 5),
            member("@d:gone.example", "leave", 1),
            member("@e:mid.example", "join", 20),
        ];
        let hosts = order_hosts(&state);
        let names: Vec<_> = hosts.iter().map(|h| h.host.as_str()).collect();
        assert_eq!(names, vec!["early.example", "mid.example", "late.example"]);
        assert_eq!(hosts[0].earliest_join_depth, 5);
    }

    #[test]
    fn ties_break_lexically_and_ordering_is_idempotent() {
        let state = vec![
            member("@x:zeta.example", "join", 3),
            member("@y:alpha.example", "join", 3),
        ];
        let first = order_hosts(&state);
        assert_eq!(first[0].host, "alpha.example");
        assert_eq!(first, order_hosts(&state));
    }

    #[test]
    fn ignores_non_member_events_and_bad_ids() {
        let mut topic = member("", "join", 0);
        topic.event_type = "m.room.topic".into();
        let state = vec![topic, member("@nodomain", "join", 1), member("@ok:ok.example", "join", 2)];
        let hosts = order_hosts(&state);
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].host, "ok.example");
    }

    #[test]
    fn parses_federation_event_json() {
        let event = json!({
            "type": "m.room.member",
            "state_key": "@alice:example.org",
            "sender": "@alice:example.org",
            "content": {"membership": "join"},
            "depth": 12
        });
        let parsed = MembershipEvent::from_json(&event).unwrap();
        assert_eq!(parsed.depth, 12);
        assert!(parsed.is_join());
        assert!(MembershipEvent::from_json(&json!({"type": "m.room.member"})).is_none());
    }
}
