//! Per-target probe results and the federation probes built on top of
//! delegation resolution.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::delegation::{DelegationResolver, Resolution, ResolvedEndpoint};
use crate::diagnostics::{StepId, StepOutcome};
use crate::events::{EventSummary, EventTransport};
use crate::server_name::ServerName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transport,
    Tls,
    Timeout,
    ClientError,
    ServerError,
    Malformed,
    Unresolved,
    Internal,
    Cancelled,
}

impl FailureKind {
    pub fn label(self) -> &'static str {
        match self {
            FailureKind::Transport => "transport",
            FailureKind::Tls => "tls",
            FailureKind::Timeout => "timeout",
            FailureKind::ClientError => "client_error",
            FailureKind::ServerError => "server_error",
            FailureKind::Malformed => "malformed",
            FailureKind::Unresolved => "unresolved",
            FailureKind::Internal => "internal",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeFailure {
    pub kind: FailureKind,
    /// HTTP status for `ClientError`/`ServerError`.
    pub status: Option<u16>,
    pub message: String,
}

impl ProbeFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    pub fn http_status(status: u16, message: impl Into<String>) -> Self {
        let kind = if status >= 500 {
            FailureKind::ServerError
        } else if status >= 400 {
            FailureKind::ClientError
        } else {
            FailureKind::Malformed
        };
        Self {
            kind,
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("timed out after {:.1}s", after.as_secs_f64()),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, message)
    }
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{status}:{}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum ProbeOutcome<T> {
    Success(T),
    Failure(ProbeFailure),
}

impl<T> ProbeOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Success(_))
    }

    pub fn as_result(&self) -> Result<&T, &ProbeFailure> {
        match self {
            ProbeOutcome::Success(value) => Ok(value),
            ProbeOutcome::Failure(failure) => Err(failure),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProbeOutcome::Success(_) => "ok",
            ProbeOutcome::Failure(failure) => failure.kind.label(),
        }
    }
}

impl<T> From<Result<T, ProbeFailure>> for ProbeOutcome<T> {
    fn from(result: Result<T, ProbeFailure>) -> Self {
        match result {
            Ok(value) => ProbeOutcome::Success(value),
            Err(failure) => ProbeOutcome::Failure(failure),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult<K, T> {
    pub target: K,
    pub outcome: ProbeOutcome<T>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeKind {
    Version,
    ServerKeys,
    /// Ask `notary` (or the target itself when unset) for the target's keys.
    NotaryKeys { notary: Option<ServerName> },
    /// Ask the target whether it has `event_id`. Needs request signing.
    FindEvent { event_id: String },
}

impl ProbeKind {
    pub fn label(&self) -> &'static str {
        match self {
            ProbeKind::Version => "version",
            ProbeKind::ServerKeys => "server_keys",
            ProbeKind::NotaryKeys { .. } => "notary_keys",
            ProbeKind::FindEvent { .. } => "find_event",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub software: Option<String>,
    pub version: Option<String>,
    /// `Server` header of the response.
    pub served_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OldKey {
    pub key_id: String,
    pub expired_ts: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeySet {
    pub server_name: String,
    pub verify_keys: Vec<String>,
    pub old_verify_keys: Vec<OldKey>,
    pub valid_until_ts: Option<i64>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ProbePayload {
    Version(VersionInfo),
    ServerKeys(KeySet),
    NotaryKeys(Vec<KeySet>),
    Event(EventSummary),
}

/// One unsigned federation request against an already resolved endpoint.
#[async_trait]
pub trait FederationTransport: Send + Sync {
    async fn version(&self, endpoint: &ResolvedEndpoint) -> Result<VersionInfo, ProbeFailure>;

    async fn server_keys(&self, endpoint: &ResolvedEndpoint) -> Result<KeySet, ProbeFailure>;

    async fn notary_keys(
        &self,
        endpoint: &ResolvedEndpoint,
        server_name: &ServerName,
    ) -> Result<Vec<KeySet>, ProbeFailure>;
}

/// Resolution plus a connectivity check against the resolved endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DelegationDiagnosis {
    pub resolution: Resolution,
    pub version: Option<VersionInfo>,
    pub connectivity_error: Option<ProbeFailure>,
}

#[derive(Clone)]
pub struct FederationProber {
    resolver: DelegationResolver,
    transport: Arc<dyn FederationTransport>,
    events: Option<Arc<dyn EventTransport>>,
}

impl FederationProber {
    pub fn new(resolver: DelegationResolver, transport: Arc<dyn FederationTransport>) -> Self {
        Self {
            resolver,
            transport,
            events: None,
        }
    }

    /// Enables the signed event and state requests.
    pub fn with_events(mut self, events: Arc<dyn EventTransport>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn resolver(&self) -> &DelegationResolver {
        &self.resolver
    }

    pub fn can_sign(&self) -> bool {
        self.events.is_some()
    }

    pub(crate) fn event_transport(&self) -> Result<&Arc<dyn EventTransport>, ProbeFailure> {
        self.events.as_ref().ok_or_else(|| {
            ProbeFailure::internal(
                "request signing is not configured (set FEDPROBE_ORIGIN_SERVER and FEDPROBE_SIGNING_KEY_PATH)",
            )
        })
    }

    pub async fn probe_one(
        &self,
        server: &ServerName,
        kind: &ProbeKind,
    ) -> Result<ProbePayload, ProbeFailure> {
        match kind {
            ProbeKind::Version => {
                let endpoint = self.endpoint_for(server).await?;
                self.transport
                    .version(&endpoint)
                    .await
                    .map(ProbePayload::Version)
            }
            ProbeKind::ServerKeys => {
                let endpoint = self.endpoint_for(server).await?;
                self.transport
                    .server_keys(&endpoint)
                    .await
                    .map(ProbePayload::ServerKeys)
            }
            ProbeKind::NotaryKeys { notary } => {
                let endpoint = self.endpoint_for(notary.as_ref().unwrap_or(server)).await?;
                self.transport
                    .notary_keys(&endpoint, server)
                    .await
                    .map(ProbePayload::NotaryKeys)
            }
            ProbeKind::FindEvent { event_id } => self
                .fetch_event(server, event_id)
                .await
                .map(ProbePayload::Event),
        }
    }

    pub async fn diagnose(&self, server: &ServerName) -> DelegationDiagnosis {
        let mut resolution = self.resolver.resolve_name(server).await;
        let Some(endpoint) = resolution.endpoint.clone() else {
            resolution.trace.record(
                StepId::Connectivity,
                StepOutcome::NotAttempted,
                "no endpoint to test",
            );
            return DelegationDiagnosis {
                resolution,
                version: None,
                connectivity_error: None,
            };
        };

        match self.transport.version(&endpoint).await {
            Ok(version) => {
                resolution.trace.record(
                    StepId::Connectivity,
                    StepOutcome::Ok,
                    format!(
                        "{}:{} answered as {} {}",
                        endpoint.host,
                        endpoint.port,
                        version.software.as_deref().unwrap_or("unknown"),
                        version.version.as_deref().unwrap_or("")
                    )
                    .trim_end()
                    .to_string(),
                );
                DelegationDiagnosis {
                    resolution,
                    version: Some(version),
                    connectivity_error: None,
                }
            }
            Err(failure) => {
                resolution.trace.record(
                    StepId::Connectivity,
                    StepOutcome::Failed,
                    format!("{} ({})", failure, failure.kind.label()),
                );
                DelegationDiagnosis {
                    resolution,
                    version: None,
                    connectivity_error: Some(failure),
                }
            }
        }
    }

    pub(crate) async fn endpoint_for(&self, server: &ServerName) -> Result<ResolvedEndpoint, ProbeFailure> {
        let resolution = self.resolver.resolve_name(server).await;
        match resolution.endpoint {
            Some(endpoint) => Ok(endpoint),
            None => {
                let detail = resolution
                    .trace
                    .failures()
                    .last()
                    .map(|step| format!("{}: {}", step.id, step.detail))
                    .unwrap_or_else(|| "no endpoint".into());
                Err(ProbeFailure::new(FailureKind::Unresolved, detail))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;
    use crate::delegation::tests::{MockDns, MockWellKnown, build_resolver};

    /// Answers by endpoint host; hosts not listed refuse the connection.
    #[derive(Default)]
    pub(crate) struct MockTransport {
        pub versions: HashMap<String, Result<VersionInfo, ProbeFailure>>,
        pub calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FederationTransport for MockTransport {
        async fn version(&self, endpoint: &ResolvedEndpoint) -> Result<VersionInfo, ProbeFailure> {
            self.calls.lock().push(endpoint.host.clone());
            self.versions
                .get(&endpoint.host)
                .cloned()
                .unwrap_or_else(|| Err(ProbeFailure::new(FailureKind::Transport, "connection refused")))
        }

        async fn server_keys(&self, endpoint: &ResolvedEndpoint) -> Result<KeySet, ProbeFailure> {
            Ok(KeySet {
                server_name: endpoint.tls_server_name.clone(),
                verify_keys: vec!["ed25519:a".into()],
                old_verify_keys: Vec::new(),
                valid_until_ts: Some(0),
                raw: serde_json::Value::Null,
            })
        }

        async fn notary_keys(
            &self,
            endpoint: &ResolvedEndpoint,
            server_name: &ServerName,
        ) -> Result<Vec<KeySet>, ProbeFailure> {
            self.calls.lock().push(endpoint.host.clone());
            Ok(vec![KeySet {
                server_name: server_name.to_string(),
                verify_keys: Vec::new(),
                old_verify_keys: Vec::new(),
                valid_until_ts: None,
                raw: serde_json::Value::Null,
            }])
        }
    }

    fn synapse() -> VersionInfo {
        VersionInfo {
            software: Some("Synapse".into()),
            version: Some("1.99.0".into()),
            served_by: Some("nginx".into()),
        }
    }

    fn name(s: &str) -> ServerName {
        ServerName::parse(s).unwrap()
    }

    #[test]
    fn http_status_picks_client_or_server_error() {
        assert_eq!(ProbeFailure::http_status(404, "Not Found").kind, FailureKind::ClientError);
        assert_eq!(ProbeFailure::http_status(502, "Bad Gateway").kind, FailureKind::ServerError);
        assert_eq!(ProbeFailure::http_status(502, "Bad Gateway").to_string(), "502:Bad Gateway");
    }

    #[test_timeout::tokio_timeout_test]
    async fn diagnose_appends_connectivity_step() {
        let dns = MockDns::default().with_ip("example.org", "10.0.0.1");
        let mut transport = MockTransport::default();
        transport.versions.insert("example.org".into(), Ok(synapse()));
        let prober = FederationProber::new(
            build_resolver(dns, MockWellKnown::default()),
            Arc::new(transport),
        );

        let diagnosis = prober.diagnose(&name("example.org")).await;
        let last = diagnosis.resolution.trace.steps().last().unwrap();
        assert_eq!(last.id, StepId::Connectivity);
        assert_eq!(last.outcome, StepOutcome::Ok);
        assert_eq!(diagnosis.version, Some(synapse()));
    }

    #[test_timeout::tokio_timeout_test]
    async fn diagnose_records_connectivity_failure() {
        let prober = FederationProber::new(
            build_resolver(MockDns::default(), MockWellKnown::default()),
            Arc::new(MockTransport::default()),
        );

        let diagnosis = prober.diagnose(&name("1.2.3.4")).await;
        let failure = diagnosis.connectivity_error.expect("failure");
        assert_eq!(failure.kind, FailureKind::Transport);
        assert_eq!(
            diagnosis.resolution.trace.outcome(StepId::Connectivity),
            Some(StepOutcome::Failed)
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn notary_probe_goes_to_the_notary() {
        let transport = Arc::new(MockTransport::default());
        let prober = FederationProber::new(
            build_resolver(
                MockDns::default().with_ip("notary.example", "10.0.0.2"),
                MockWellKnown::default(),
            ),
            transport.clone(),
        );

        let payload = prober
            .probe_one(
                &name("target.example"),
                &ProbeKind::NotaryKeys {
                    notary: Some(name("notary.example:8448")),
                },
            )
            .await
            .expect("payload");
        match payload {
            ProbePayload::NotaryKeys(sets) => assert_eq!(sets[0].server_name, "target.example"),
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(transport.calls.lock().as_slice(), ["notary.example"]);
    }
}
