use std::net::IpAddr;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::rr::{RData, RecordType};
use thiserror::Error;

/// Whether an address lookup may be satisfied through a CNAME chain. SRV
/// targets must resolve to A/AAAA records directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CnamePolicy {
    Follow,
    Forbid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    /// Target host without the trailing root dot. `"."` means the service is
    /// explicitly unavailable.
    pub target: String,
}

impl SrvRecord {
    pub fn is_unavailable_marker(&self) -> bool {
        self.target == "." || self.target.is_empty()
    }
}

/// Lowest priority first, heaviest weight first within a priority.
pub fn sort_srv(records: &mut [SrvRecord]) {
    records.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| b.weight.cmp(&a.weight))
            .then_with(|| a.target.cmp(&b.target))
    });
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DnsError {
    #[error("no records found")]
    NoRecords,
    #[error("{0} is a CNAME, SRV targets must have A/AAAA records")]
    CnameForbidden(String),
    #[error("lookup failed: {0}")]
    Lookup(String),
}

#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn lookup_ip(&self, host: &str, policy: CnamePolicy) -> Result<Vec<IpAddr>, DnsError>;
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, DnsError>;
}

#[derive(Clone)]
pub struct HickoryDnsResolver {
    inner: TokioAsyncResolver,
}

impl HickoryDnsResolver {
    pub fn from_system_conf() -> Result<Self, DnsError> {
        let inner = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|err| DnsError::Lookup(format!("system resolver config: {err}")))?;
        Ok(Self { inner })
    }

    pub fn with_config(config: ResolverConfig, opts: ResolverOpts) -> Self {
        Self {
            inner: TokioAsyncResolver::tokio(config, opts),
        }
    }

    async fn lookup_direct(
        &self,
        host: &str,
        record_type: RecordType,
    ) -> Result<Vec<IpAddr>, DnsError> {
        let lookup = match self.inner.lookup(host, record_type).await {
            Ok(lookup) => lookup,
            Err(err) if is_no_records(&err) => return Ok(Vec::new()),
            Err(err) => return Err(DnsError::Lookup(err.to_string())),
        };
        let mut addrs = Vec::new();
        for record in lookup.record_iter() {
            match record.data() {
                Some(RData::A(a)) => addrs.push(IpAddr::V4(a.0)),
                Some(RData::AAAA(aaaa)) => addrs.push(IpAddr::V6(aaaa.0)),
                Some(RData::CNAME(_)) => return Err(DnsError::CnameForbidden(host.to_string())),
                _ => {}
            }
        }
        Ok(addrs)
    }
}

fn is_no_records(err: &ResolveError) -> bool {
    matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. })
}

#[async_trait]
impl DnsResolver for HickoryDnsResolver {
    async fn lookup_ip(&self, host: &str, policy: CnamePolicy) -> Result<Vec<IpAddr>, DnsError> {
        let addrs = match policy {
            CnamePolicy::Follow => match self.inner.lookup_ip(host).await {
                Ok(lookup) => lookup.iter().collect(),
                Err(err) if is_no_records(&err) => Vec::new(),
                Err(err) => return Err(DnsError::Lookup(err.to_string())),
            },
            CnamePolicy::Forbid => {
                let mut addrs = self.lookup_direct(host, RecordType::A).await?;
                addrs.extend(self.lookup_direct(host, RecordType::AAAA).await?);
                addrs
            }
        };
        if addrs.is_empty() {
            return Err(DnsError::NoRecords);
        }
        Ok(addrs)
    }

    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, DnsError> {
        let lookup = match self.inner.srv_lookup(name).await {
            Ok(lookup) => lookup,
            Err(err) if is_no_records(&err) => return Err(DnsError::NoRecords),
            Err(err) => return Err(DnsError::Lookup(err.to_string())),
        };
        let mut records: Vec<SrvRecord> = lookup
            .iter()
            .map(|srv| {
                let target = srv.target().to_utf8();
                let target = match target.as_str() {
                    "." => target,
                    other => other.trim_end_matches('.').to_string(),
                };
                SrvRecord {
                    priority: srv.priority(),
                    weight: srv.weight(),
                    port: srv.port(),
                    target,
                }
            })
            .collect();
        if records.is_empty() {
            return Err(DnsError::NoRecords);
        }
        sort_srv(&mut records);
        Ok(records)
    }
}
