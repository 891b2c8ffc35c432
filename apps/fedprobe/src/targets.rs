//! What a command was pointed at, and the server set it expands to.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{FedProbeError, InputError};
use crate::server_name::{ServerName, domain_of};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    Server(ServerName),
    /// `@user:server`, probed as its server.
    User { user_id: String, server: ServerName },
    /// `!room:server`, expanded to its joined members' servers.
    Room(String),
    /// `#alias:server`, resolved to a room first.
    Alias(String),
}

impl TargetSpec {
    pub fn parse(input: &str) -> Result<Self, InputError> {
        let input = input.trim();
        let Some(sigil) = input.chars().next() else {
            return Err(InputError::MissingIdentifier("target"));
        };
        match sigil {
            '@' => {
                let server = sigil_domain(input)?;
                Ok(TargetSpec::User {
                    user_id: input.to_string(),
                    server,
                })
            }
            '!' => {
                sigil_domain(input)?;
                Ok(TargetSpec::Room(input.to_string()))
            }
            '#' => {
                sigil_domain(input)?;
                Ok(TargetSpec::Alias(input.to_string()))
            }
            '$' | '+' => Err(InputError::UnrecognisedTarget(input.to_string())),
            _ => Ok(TargetSpec::Server(ServerName::parse(input)?)),
        }
    }

    pub fn is_room_scoped(&self) -> bool {
        matches!(self, TargetSpec::Room(_) | TargetSpec::Alias(_))
    }
}

impl fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSpec::Server(name) => write!(f, "{name}"),
            TargetSpec::User { user_id, .. } => f.write_str(user_id),
            TargetSpec::Room(id) | TargetSpec::Alias(id) => f.write_str(id),
        }
    }
}

fn sigil_domain(input: &str) -> Result<ServerName, InputError> {
    let local = &input[1..];
    match domain_of(input) {
        Some(domain) if !local.starts_with(':') => ServerName::parse(domain),
        _ => Err(InputError::UnrecognisedTarget(input.to_string())),
    }
}

/// Homeserver lookups needed to turn rooms into server sets.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn resolve_alias(&self, alias: &str) -> Result<String, FedProbeError>;

    async fn joined_members(&self, room_id: &str) -> Result<Vec<String>, FedProbeError>;
}

fn directory_required() -> FedProbeError {
    FedProbeError::Config(
        "room targets need FEDPROBE_HOMESERVER_URL and FEDPROBE_ACCESS_TOKEN".into(),
    )
}

/// Room id for a room-scoped target.
pub async fn resolve_room(
    spec: &TargetSpec,
    directory: Option<&dyn RoomDirectory>,
) -> Result<String, FedProbeError> {
    match spec {
        TargetSpec::Room(room_id) => Ok(room_id.clone()),
        TargetSpec::Alias(alias) => {
            let directory = directory.ok_or_else(directory_required)?;
            let room_id = directory.resolve_alias(alias).await?;
            debug!(target = "fedprobe::targets", alias = %alias, room_id = %room_id, "alias resolved");
            Ok(room_id)
        }
        _ => Err(InputError::MissingIdentifier("room id or alias").into()),
    }
}

/// Sorted, deduplicated servers for `spec`. Fails before any probe runs when
/// the set is larger than `max_servers`.
pub async fn expand_targets(
    spec: &TargetSpec,
    directory: Option<&dyn RoomDirectory>,
    max_servers: usize,
) -> Result<Vec<ServerName>, FedProbeError> {
    let servers: BTreeSet<ServerName> = match spec {
        TargetSpec::Server(name) => BTreeSet::from([name.clone()]),
        TargetSpec::User { server, .. } => BTreeSet::from([server.clone()]),
        TargetSpec::Room(_) | TargetSpec::Alias(_) => {
            let room_id = resolve_room(spec, directory).await?;
            let directory = directory.ok_or_else(directory_required)?;
            let members = directory.joined_members(&room_id).await?;
            let mut servers = BTreeSet::new();
            for member in &members {
                match domain_of(member).map(ServerName::parse) {
                    Some(Ok(server)) => {
                        servers.insert(server);
                    }
                    _ => warn!(
                        target = "fedprobe::targets",
                        room_id = %room_id,
                        member = %member,
                        "skipping member with unusable server name"
                    ),
                }
            }
            if servers.is_empty() {
                return Err(FedProbeError::Membership(format!(
                    "{room_id} has no joined members with a usable server name"
                )));
            }
            servers
        }
    };

    if servers.len() > max_servers {
        return Err(InputError::TooManyTargets {
            count: servers.len(),
            max: max_servers,
        }
        .into());
    }
    Ok(servers.into_iter().collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use super::*;

    #[derive(Default)]
    pub(crate) struct MockDirectory {
        pub aliases: HashMap<String, String>,
        pub members: HashMap<String, Vec<String>>,
    }

    #[async_trait]
    impl RoomDirectory for MockDirectory {
        async fn resolve_alias(&self, alias: &str) -> Result<String, FedProbeError> {
            self.aliases
                .get(alias)
                .cloned()
                .ok_or_else(|| FedProbeError::Homeserver(format!("404:unknown alias {alias}")))
        }

        async fn joined_members(&self, room_id: &str) -> Result<Vec<String>, FedProbeError> {
            self.members
                .get(room_id)
                .cloned()
                .ok_or_else(|| FedProbeError::Homeserver(format!("403:not in room {room_id}")))
        }
    }

    fn directory() -> MockDirectory {
        let mut dir = MockDirectory::default();
        dir.aliases
            .insert("#lobby:a.org".into(), "!room:a.org".into());
        dir.members.insert(
            "!room:a.org".into(),
            vec![
                "@x:b.org".into(),
                "@y:a.org".into(),
                "@z:b.org".into(),
                "@broken".into(),
            ],
        );
        dir
    }

    #[test]
    fn parses_every_target_shape() {
        assert!(matches!(
            TargetSpec::parse("example.org:8448"),
            Ok(TargetSpec::Server(_))
        ));
        match TargetSpec::parse("@alice:example.org").unwrap() {
            TargetSpec::User { server, .. } => assert_eq!(server.as_str(), "example.org"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(TargetSpec::parse("!abc:example.org").unwrap().is_room_scoped());
        assert!(TargetSpec::parse("#room:example.org").unwrap().is_room_scoped());
        assert_eq!(
            TargetSpec::parse("  "),
            Err(InputError::MissingIdentifier("target"))
        );
        assert!(matches!(
            TargetSpec::parse("@nodomain"),
            Err(InputError::UnrecognisedTarget(_))
        ));
        assert!(matches!(
            TargetSpec::parse("https://example.org"),
            Err(InputError::SchemePrefix(_))
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn alias_expands_to_sorted_member_servers() {
        let dir = directory();
        let spec = TargetSpec::parse("#lobby:a.org").unwrap();
        let servers = expand_targets(&spec, Some(&dir), 400).await.unwrap();
        let names: Vec<_> = servers.iter().map(|s| s.as_str()).collect();
        assert_eq!(names, vec!["a.org", "b.org"]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn oversized_rooms_are_rejected_before_probing() {
        let dir = directory();
        let spec = TargetSpec::Room("!room:a.org".into());
        let err = expand_targets(&spec, Some(&dir), 1).await.unwrap_err();
        assert!(matches!(
            err,
            FedProbeError::Input(InputError::TooManyTargets { count: 2, max: 1 })
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn room_targets_need_a_directory() {
        let spec = TargetSpec::Room("!room:a.org".into());
        assert!(matches!(
            expand_targets(&spec, None, 400).await,
            Err(FedProbeError::Config(_))
        ));
        let server = TargetSpec::parse("@u:c.org").unwrap();
        assert_eq!(expand_targets(&server, None, 400).await.unwrap().len(), 1);
    }
}
