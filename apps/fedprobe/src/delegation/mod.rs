//! Server name to federation endpoint resolution, following the Matrix
//! server-server "Resolving server names" algorithm.
//!
//! Every resolution produces a [`DiagnosticTrace`] holding each step of
//! [`StepId::RESOLUTION`] exactly once: steps that ran are `ok`/`failed`,
//! steps that did not apply to this name are `not-attempted`, and steps made
//! unreachable by an earlier success are `skipped`.

pub mod dns;
pub mod well_known;

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;

use crate::diagnostics::{DiagnosticTrace, StepId, StepOutcome};
use crate::metrics;
use crate::server_name::{DEFAULT_FEDERATION_PORT, Host, ServerName};

use self::dns::{CnamePolicy, DnsResolver, sort_srv};
use self::well_known::{WellKnownSource, parse_delegation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Via {
    LiteralIp,
    DnsWithPort,
    WellKnown,
    SrvModern,
    SrvDeprecated,
    HostnameDefaultPort,
}

impl Via {
    pub fn label(self) -> &'static str {
        match self {
            Via::LiteralIp => "literal-ip",
            Via::DnsWithPort => "dns-with-port",
            Via::WellKnown => "well-known",
            Via::SrvModern => "srv-modern",
            Via::SrvDeprecated => "srv-deprecated",
            Via::HostnameDefaultPort => "hostname-default-port",
        }
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Where to connect and which name to present for TLS and `Host`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedEndpoint {
    pub host: String,
    pub port: u16,
    pub tls_server_name: String,
    pub via: Via,
    /// Addresses found for `host`; empty when the lookup failed.
    pub addresses: Vec<IpAddr>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub server_name: String,
    /// `None` only when the server name itself was rejected.
    pub endpoint: Option<ResolvedEndpoint>,
    pub trace: DiagnosticTrace,
}

/// Appends steps in canonical order, back-filling the ones a branch never
/// touched.
struct TraceCursor {
    trace: DiagnosticTrace,
    next: usize,
}

impl TraceCursor {
    fn new() -> Self {
        Self {
            trace: DiagnosticTrace::new(),
            next: 0,
        }
    }

    fn record(&mut self, id: StepId, outcome: StepOutcome, detail: impl Into<String>) {
        while let Some(pending) = StepId::RESOLUTION.get(self.next).copied() {
            self.next += 1;
            if pending == id {
                self.trace.record(id, outcome, detail);
                return;
            }
            self.trace
                .record(pending, StepOutcome::NotAttempted, "not applicable");
        }
        debug_assert!(false, "step {id:?} recorded out of order");
    }

    fn finish(mut self, outcome: StepOutcome, detail: &str) -> DiagnosticTrace {
        for id in &StepId::RESOLUTION[self.next..] {
            self.trace.record(*id, outcome, detail);
        }
        self.next = StepId::RESOLUTION.len();
        self.trace
    }
}

fn format_addrs(addrs: &[IpAddr]) -> String {
    addrs
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Clone)]
pub struct DelegationResolver {
    dns: Arc<dyn DnsResolver>,
    well_known: Arc<dyn WellKnownSource>,
}

impl DelegationResolver {
    pub fn new(dns: Arc<dyn DnsResolver>, well_known: Arc<dyn WellKnownSource>) -> Self {
        Self { dns, well_known }
    }

    /// Never fails: a malformed name comes back as a failed `server-name`
    /// step with no endpoint.
    pub async fn resolve(&self, input: &str) -> Resolution {
        match ServerName::parse(input) {
            Ok(name) => self.resolve_name(&name).await,
            Err(err) => {
                let mut cursor = TraceCursor::new();
                cursor.record(StepId::ServerName, StepOutcome::Failed, err.to_string());
                tracing::debug!(
                    target = "fedprobe::delegation",
                    server_name = input,
                    error = %err,
                    "server name rejected"
                );
                Resolution {
                    server_name: input.to_string(),
                    endpoint: None,
                    trace: cursor.finish(StepOutcome::NotAttempted, "server name rejected"),
                }
            }
        }
    }

    pub async fn resolve_name(&self, name: &ServerName) -> Resolution {
        let mut cursor = TraceCursor::new();
        cursor.record(StepId::ServerName, StepOutcome::Ok, name.as_str());
        let endpoint = self.run_steps(name, &mut cursor).await;
        let trace = cursor.finish(
            StepOutcome::Skipped,
            &format!("endpoint already resolved via {}", endpoint.via),
        );

        metrics::DELEGATIONS
            .with_label_values(&[endpoint.via.label()])
            .inc();
        tracing::debug!(
            target = "fedprobe::delegation",
            server_name = %name,
            host = %endpoint.host,
            port = endpoint.port,
            tls_server_name = %endpoint.tls_server_name,
            via = %endpoint.via,
            "resolved"
        );
        Resolution {
            server_name: name.to_string(),
            endpoint: Some(endpoint),
            trace,
        }
    }

    async fn run_steps(&self, name: &ServerName, cursor: &mut TraceCursor) -> ResolvedEndpoint {
        let hostname = match name.host() {
            Host::Ip(ip) => {
                let port = name.port().unwrap_or(DEFAULT_FEDERATION_PORT);
                cursor.record(StepId::LiteralIp, StepOutcome::Ok, format!("{ip} port {port}"));
                return literal_endpoint(*ip, port);
            }
            Host::Name(hostname) => hostname.as_str(),
        };
        cursor.record(
            StepId::LiteralIp,
            StepOutcome::NotAttempted,
            "host is not an IP literal",
        );

        if let Some(port) = name.port() {
            let addresses = self
                .address_step(cursor, StepId::DnsWithPort, hostname, port)
                .await;
            return ResolvedEndpoint {
                host: hostname.to_string(),
                port,
                tls_server_name: hostname.to_string(),
                via: Via::DnsWithPort,
                addresses,
            };
        }
        cursor.record(StepId::DnsWithPort, StepOutcome::NotAttempted, "no explicit port");

        let delegated = self
            .well_known
            .fetch_well_known(name)
            .await
            .and_then(|value| parse_delegation(&value));
        match delegated {
            Ok(delegated) => {
                cursor.record(
                    StepId::WellKnown,
                    StepOutcome::Ok,
                    format!("m.server: {delegated}"),
                );
                return self.resolve_delegated(&delegated, cursor).await;
            }
            Err(err) => cursor.record(StepId::WellKnown, StepOutcome::Failed, err.to_string()),
        }

        if let Some(endpoint) = self
            .srv_step(cursor, StepId::SrvModern, Via::SrvModern, "_matrix-fed._tcp", hostname, hostname)
            .await
        {
            return endpoint;
        }
        if let Some(endpoint) = self
            .srv_step(cursor, StepId::SrvDeprecated, Via::SrvDeprecated, "_matrix._tcp", hostname, hostname)
            .await
        {
            return endpoint;
        }

        let addresses = self
            .address_step(cursor, StepId::DefaultPort, hostname, DEFAULT_FEDERATION_PORT)
            .await;
        ResolvedEndpoint {
            host: hostname.to_string(),
            port: DEFAULT_FEDERATION_PORT,
            tls_server_name: hostname.to_string(),
            via: Via::HostnameDefaultPort,
            addresses,
        }
    }

    async fn resolve_delegated(
        &self,
        delegated: &ServerName,
        cursor: &mut TraceCursor,
    ) -> ResolvedEndpoint {
        let hostname = match delegated.host() {
            Host::Ip(ip) => {
                let port = delegated.port().unwrap_or(DEFAULT_FEDERATION_PORT);
                cursor.record(
                    StepId::DelegatedLiteralIp,
                    StepOutcome::Ok,
                    format!("{ip} port {port}"),
                );
                return literal_endpoint(*ip, port);
            }
            Host::Name(hostname) => hostname.as_str(),
        };
        cursor.record(
            StepId::DelegatedLiteralIp,
            StepOutcome::NotAttempted,
            "delegated host is not an IP literal",
        );

        if let Some(port) = delegated.port() {
            let addresses = self
                .address_step(cursor, StepId::DelegatedDnsWithPort, hostname, port)
                .await;
            return ResolvedEndpoint {
                host: hostname.to_string(),
                port,
                tls_server_name: hostname.to_string(),
                via: Via::DnsWithPort,
                addresses,
            };
        }
        cursor.record(
            StepId::DelegatedDnsWithPort,
            StepOutcome::NotAttempted,
            "no explicit port",
        );

        if let Some(endpoint) = self
            .srv_step(
                cursor,
                StepId::DelegatedSrvModern,
                Via::SrvModern,
                "_matrix-fed._tcp",
                hostname,
                hostname,
            )
            .await
        {
            return endpoint;
        }
        if let Some(endpoint) = self
            .srv_step(
                cursor,
                StepId::DelegatedSrvDeprecated,
                Via::SrvDeprecated,
                "_matrix._tcp",
                hostname,
                hostname,
            )
            .await
        {
            return endpoint;
        }

        let addresses = self
            .address_step(
                cursor,
                StepId::DelegatedDefaultPort,
                hostname,
                DEFAULT_FEDERATION_PORT,
            )
            .await;
        ResolvedEndpoint {
            host: hostname.to_string(),
            port: DEFAULT_FEDERATION_PORT,
            tls_server_name: hostname.to_string(),
            via: Via::WellKnown,
            addresses,
        }
    }

    /// A/AAAA/CNAME lookup for a step that already fixed the port. The step
    /// fails when nothing resolves, but the endpoint stands: there is no
    /// further fallback once the port is known.
    async fn address_step(
        &self,
        cursor: &mut TraceCursor,
        id: StepId,
        host: &str,
        port: u16,
    ) -> Vec<IpAddr> {
        match self.dns.lookup_ip(host, CnamePolicy::Follow).await {
            Ok(addrs) => {
                cursor.record(
                    id,
                    StepOutcome::Ok,
                    format!("{host}:{port} -> {}", format_addrs(&addrs)),
                );
                addrs
            }
            Err(err) => {
                cursor.record(id, StepOutcome::Failed, format!("{host}: {err}"));
                Vec::new()
            }
        }
    }

    /// Queries `<service>.<name>` and takes the first target (by priority and
    /// weight) that resolves through A/AAAA records alone.
    async fn srv_step(
        &self,
        cursor: &mut TraceCursor,
        id: StepId,
        via: Via,
        service: &str,
        name: &str,
        tls_server_name: &str,
    ) -> Option<ResolvedEndpoint> {
        let query = format!("{service}.{name}");
        let mut records = match self.dns.lookup_srv(&query).await {
            Ok(records) => records,
            Err(err) => {
                cursor.record(id, StepOutcome::Failed, format!("{query}: {err}"));
                return None;
            }
        };
        sort_srv(&mut records);

        let mut failures = Vec::new();
        for record in &records {
            if record.is_unavailable_marker() {
                cursor.record(
                    id,
                    StepOutcome::Failed,
                    format!("{query}: service explicitly unavailable"),
                );
                return None;
            }
            match self.dns.lookup_ip(&record.target, CnamePolicy::Forbid).await {
                Ok(addresses) => {
                    cursor.record(
                        id,
                        StepOutcome::Ok,
                        format!(
                            "{query} -> {}:{} ({})",
                            record.target,
                            record.port,
                            format_addrs(&addresses)
                        ),
                    );
                    return Some(ResolvedEndpoint {
                        host: record.target.clone(),
                        port: record.port,
                        tls_server_name: tls_server_name.to_string(),
                        via,
                        addresses,
                    });
                }
                Err(err) => failures.push(format!("{}: {err}", record.target)),
            }
        }
        cursor.record(
            id,
            StepOutcome::Failed,
            format!("{query}: no usable target ({})", failures.join("; ")),
        );
        None
    }
}

fn literal_endpoint(ip: IpAddr, port: u16) -> ResolvedEndpoint {
    ResolvedEndpoint {
        host: ip.to_string(),
        port,
        tls_server_name: ip.to_string(),
        via: Via::LiteralIp,
        addresses: vec![ip],
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::dns::{DnsError, SrvRecord};
    use super::well_known::WellKnownError;
    use super::*;

    #[derive(Default)]
    pub(crate) struct MockDns {
        pub ips: HashMap<String, Vec<IpAddr>>,
        /// alias -> canonical name
        pub cnames: HashMap<String, String>,
        pub srv: HashMap<String, Vec<SrvRecord>>,
    }

    impl MockDns {
        pub fn with_ip(mut self, host: &str, ip: &str) -> Self {
            self.ips
                .entry(host.to_string())
                .or_default()
                .push(ip.parse().unwrap());
            self
        }

        pub fn with_cname(mut self, alias: &str, canonical: &str) -> Self {
            self.cnames.insert(alias.to_string(), canonical.to_string());
            self
        }

        pub fn with_srv(mut self, query: &str, priority: u16, target: &str, port: u16) -> Self {
            self.srv.entry(query.to_string()).or_default().push(SrvRecord {
                priority,
                weight: 0,
                port,
                target: target.to_string(),
            });
            self
        }
    }

    #[async_trait]
    impl DnsResolver for MockDns {
        async fn lookup_ip(&self, host: &str, policy: CnamePolicy) -> Result<Vec<IpAddr>, DnsError> {
            if let Some(canonical) = self.cnames.get(host) {
                return match policy {
                    CnamePolicy::Forbid => Err(DnsError::CnameForbidden(host.to_string())),
                    CnamePolicy::Follow => self.ips.get(canonical).cloned().ok_or(DnsError::NoRecords),
                };
            }
            self.ips.get(host).cloned().ok_or(DnsError::NoRecords)
        }

        async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, DnsError> {
            self.srv.get(name).cloned().ok_or(DnsError::NoRecords)
        }
    }

    #[derive(Default)]
    pub(crate) struct MockWellKnown {
        pub documents: HashMap<String, Result<String, WellKnownError>>,
    }

    impl MockWellKnown {
        pub fn with(mut self, server: &str, result: Result<&str, WellKnownError>) -> Self {
            self.documents
                .insert(server.to_string(), result.map(str::to_string));
            self
        }
    }

    #[async_trait]
    impl WellKnownSource for MockWellKnown {
        async fn fetch_well_known(&self, server_name: &ServerName) -> Result<String, WellKnownError> {
            self.documents
                .get(server_name.as_str())
                .cloned()
                .unwrap_or(Err(WellKnownError::Status { status: 404 }))
        }
    }

    pub(crate) fn build_resolver(dns: MockDns, well_known: MockWellKnown) -> DelegationResolver {
        DelegationResolver::new(Arc::new(dns), Arc::new(well_known))
    }

    fn outcomes(resolution: &Resolution) -> Vec<(StepId, StepOutcome)> {
        resolution
            .trace
            .steps()
            .iter()
            .map(|step| (step.id, step.outcome))
            .collect()
    }

    #[test_timeout::tokio_timeout_test]
    async fn literal_ip_skips_everything_after_it() {
        let resolver = build_resolver(MockDns::default(), MockWellKnown::default());
        for (input, port) in [("1.2.3.4", 8448), ("[2001:db8::1]:1234", 1234)] {
            let resolution = resolver.resolve(input).await;
            let endpoint = resolution.endpoint.clone().expect("endpoint");
            assert_eq!(endpoint.via, Via::LiteralIp);
            assert_eq!(endpoint.port, port);
            assert_eq!(endpoint.tls_server_name, endpoint.host);

            let steps = resolution.trace.steps();
            assert_eq!(steps[1].id, StepId::LiteralIp);
            assert_eq!(steps[1].outcome, StepOutcome::Ok);
            assert!(steps[2..].iter().all(|s| s.outcome == StepOutcome::Skipped));
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn explicit_port_uses_dns_and_that_port() {
        let dns = MockDns::default().with_ip("matrix.example.org", "10.0.0.1");
        let resolver = build_resolver(dns, MockWellKnown::default());

        let resolution = resolver.resolve("matrix.example.org:8449").await;
        let endpoint = resolution.endpoint.expect("endpoint");
        assert_eq!(endpoint.via, Via::DnsWithPort);
        assert_eq!(endpoint.port, 8449);
        assert_eq!(endpoint.addresses, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(
            resolution.trace.outcome(StepId::WellKnown),
            Some(StepOutcome::Skipped)
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn well_known_with_port_resolves_delegated_host() {
        let dns = MockDns::default().with_ip("deleg.example.org", "10.0.0.2");
        let well_known = MockWellKnown::default().with("example.org", Ok("deleg.example.org:1234"));
        let resolver = build_resolver(dns, well_known);

        let resolution = resolver.resolve("example.org").await;
        let endpoint = resolution.endpoint.clone().expect("endpoint");
        assert_eq!(endpoint.host, "deleg.example.org");
        assert_eq!(endpoint.port, 1234);
        assert_eq!(endpoint.tls_server_name, "deleg.example.org");
        assert_eq!(endpoint.via, Via::DnsWithPort);

        let trace = &resolution.trace;
        assert_eq!(trace.outcome(StepId::WellKnown), Some(StepOutcome::Ok));
        assert_eq!(
            trace.outcome(StepId::DelegatedDnsWithPort),
            Some(StepOutcome::Ok)
        );
        for srv in [
            StepId::DelegatedSrvModern,
            StepId::DelegatedSrvDeprecated,
            StepId::SrvModern,
            StepId::SrvDeprecated,
        ] {
            assert_eq!(trace.outcome(srv), Some(StepOutcome::Skipped), "{srv:?}");
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn missing_well_known_and_srv_falls_back_to_default_port() {
        let dns = MockDns::default().with_ip("example.org", "10.0.0.3");
        let resolver = build_resolver(dns, MockWellKnown::default());

        let resolution = resolver.resolve("example.org").await;
        let endpoint = resolution.endpoint.clone().expect("endpoint");
        assert_eq!(endpoint.via, Via::HostnameDefaultPort);
        assert_eq!(endpoint.port, 8448);
        assert_eq!(
            resolution.trace.outcome(StepId::WellKnown),
            Some(StepOutcome::Failed)
        );
        assert_eq!(
            resolution.trace.outcome(StepId::SrvModern),
            Some(StepOutcome::Failed)
        );
        assert_eq!(
            resolution.trace.outcome(StepId::DelegatedSrvModern),
            Some(StepOutcome::NotAttempted)
        );
        assert_eq!(
            resolution.trace.outcome(StepId::DefaultPort),
            Some(StepOutcome::Ok)
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn unparseable_well_known_falls_through_to_srv() {
        let dns = MockDns::default()
            .with_srv("_matrix-fed._tcp.example.org", 10, "fed.example.org", 443)
            .with_ip("fed.example.org", "10.0.0.4");
        let well_known = MockWellKnown::default().with(
            "example.org",
            Err(WellKnownError::Malformed("expected value at line 1".into())),
        );
        let resolver = build_resolver(dns, well_known);

        let resolution = resolver.resolve("example.org").await;
        let endpoint = resolution.endpoint.clone().expect("endpoint");
        assert_eq!(endpoint.via, Via::SrvModern);
        assert_eq!(endpoint.host, "fed.example.org");
        assert_eq!(endpoint.port, 443);
        assert_eq!(endpoint.tls_server_name, "example.org");
        assert_eq!(
            resolution.trace.outcome(StepId::SrvDeprecated),
            Some(StepOutcome::Skipped)
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn srv_target_behind_cname_is_rejected() {
        let dns = MockDns::default()
            .with_srv("_matrix-fed._tcp.example.org", 10, "alias.example.org", 443)
            .with_cname("alias.example.org", "real.example.org")
            .with_ip("real.example.org", "10.0.0.5")
            .with_srv("_matrix._tcp.example.org", 10, "real.example.org", 8443);
        let resolver = build_resolver(dns, MockWellKnown::default());

        let resolution = resolver.resolve("example.org").await;
        let endpoint = resolution.endpoint.clone().expect("endpoint");
        assert_eq!(endpoint.via, Via::SrvDeprecated);
        assert_eq!(endpoint.port, 8443);
        let srv_step = resolution.trace.get(StepId::SrvModern).unwrap();
        assert_eq!(srv_step.outcome, StepOutcome::Failed);
        assert!(srv_step.detail.contains("CNAME"), "{}", srv_step.detail);
    }

    #[test_timeout::tokio_timeout_test]
    async fn delegated_name_without_port_tries_srv_then_default() {
        let dns = MockDns::default()
            .with_srv("_matrix._tcp.deleg.example.org", 0, "srv.example.org", 8008)
            .with_ip("srv.example.org", "10.0.0.6");
        let well_known = MockWellKnown::default().with("example.org", Ok("deleg.example.org"));
        let resolver = build_resolver(dns, well_known);

        let resolution = resolver.resolve("example.org").await;
        let endpoint = resolution.endpoint.clone().expect("endpoint");
        assert_eq!(endpoint.via, Via::SrvDeprecated);
        assert_eq!(endpoint.tls_server_name, "deleg.example.org");
        assert_eq!(
            resolution.trace.outcome(StepId::DelegatedSrvModern),
            Some(StepOutcome::Failed)
        );

        let plain = build_resolver(
            MockDns::default().with_ip("deleg.example.org", "10.0.0.7"),
            MockWellKnown::default().with("example.org", Ok("deleg.example.org")),
        );
        let resolution = plain.resolve("example.org").await;
        let endpoint = resolution.endpoint.expect("endpoint");
        assert_eq!(endpoint.via, Via::WellKnown);
        assert_eq!(endpoint.port, 8448);
        assert_eq!(endpoint.host, "deleg.example.org");
    }

    #[test_timeout::tokio_timeout_test]
    async fn unavailable_srv_marker_falls_through() {
        let dns = MockDns::default()
            .with_srv("_matrix-fed._tcp.example.org", 0, ".", 0)
            .with_ip("example.org", "10.0.0.8");
        let resolver = build_resolver(dns, MockWellKnown::default());

        let resolution = resolver.resolve("example.org").await;
        assert_eq!(
            resolution.endpoint.map(|e| e.via),
            Some(Via::HostnameDefaultPort)
        );
        let step = resolution.trace.get(StepId::SrvModern).unwrap();
        assert!(step.detail.contains("explicitly unavailable"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn unresolvable_default_host_still_yields_endpoint() {
        let resolver = build_resolver(MockDns::default(), MockWellKnown::default());
        let resolution = resolver.resolve("nowhere.example").await;
        let endpoint = resolution.endpoint.expect("endpoint");
        assert_eq!(endpoint.via, Via::HostnameDefaultPort);
        assert!(endpoint.addresses.is_empty());
        assert_eq!(
            resolution.trace.outcome(StepId::DefaultPort),
            Some(StepOutcome::Failed)
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn malformed_name_is_a_failed_step_not_an_error() {
        let resolver = build_resolver(MockDns::default(), MockWellKnown::default());
        let resolution = resolver.resolve("https://example.org").await;
        assert!(resolution.endpoint.is_none());
        let steps = resolution.trace.steps();
        assert_eq!(steps[0].outcome, StepOutcome::Failed);
        assert!(steps[0].detail.contains("scheme"));
        assert!(steps[1..]
            .iter()
            .all(|s| s.outcome == StepOutcome::NotAttempted));
    }

    #[test_timeout::tokio_timeout_test]
    async fn every_trace_has_the_same_step_identities() {
        let dns = MockDns::default()
            .with_ip("deleg.example.org", "10.0.0.2")
            .with_ip("b.example", "10.0.0.9");
        let well_known = MockWellKnown::default().with("a.example", Ok("deleg.example.org:1234"));
        let resolver = build_resolver(dns, well_known);

        for input in ["a.example", "b.example", "b.example:99", "1.1.1.1", "bad name"] {
            let resolution = resolver.resolve(input).await;
            assert_eq!(
                outcomes(&resolution)
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect::<Vec<_>>(),
                StepId::RESOLUTION.to_vec(),
                "{input}"
            );
        }
    }
}
