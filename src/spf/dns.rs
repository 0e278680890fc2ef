use crate::config::ResolverConfig;
use async_trait::async_trait;
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::op::ResponseCode;
use hickory_resolver::TokioAsyncResolver;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DnsError {
    /// NXDOMAIN or an empty answer
    #[error("no records found for {0}")]
    NotFound(String),
    #[error("DNS lookup failed for {name}: {reason}")]
    Temporary { name: String, reason: String },
}

/// The DNS queries SPF evaluation needs. Names are given without the
/// trailing root dot.
#[async_trait]
pub trait DnsLookup: Send + Sync {
    async fn txt(&self, name: &str) -> Result<Vec<String>, DnsError>;
    async fn ipv4(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError>;
    async fn ipv6(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError>;
    /// Exchange host names, lowest preference first
    async fn mx(&self, name: &str) -> Result<Vec<String>, DnsError>;
    async fn ptr(&self, ip: IpAddr) -> Result<Vec<String>, DnsError>;
}

pub struct HickoryLookup {
    resolver: TokioAsyncResolver,
}

impl HickoryLookup {
    /// System resolver configuration with our per-query timeout and retry
    /// attempts.
    pub fn from_config(config: &ResolverConfig) -> anyhow::Result<Self> {
        let (resolver_config, mut opts) = hickory_resolver::system_conf::read_system_conf()?;
        opts.timeout = Duration::from_secs(config.timeout_seconds);
        opts.attempts = config.attempts;
        log::debug!(
            "DNS resolver: timeout {}s, {} attempts",
            config.timeout_seconds,
            config.attempts
        );
        Ok(HickoryLookup {
            resolver: TokioAsyncResolver::tokio(resolver_config, opts),
        })
    }
}

// Absolute names so the system search list is never applied
fn fqdn(name: &str) -> String {
    format!("{}.", name.trim_end_matches('.'))
}

fn map_error(name: &str, err: ResolveError) -> DnsError {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { response_code, .. }
            if *response_code == ResponseCode::NXDomain
                || *response_code == ResponseCode::NoError =>
        {
            DnsError::NotFound(name.to_string())
        }
        _ => DnsError::Temporary {
            name: name.to_string(),
            reason: err.to_string(),
        },
    }
}

fn non_empty<T>(name: &str, records: Vec<T>) -> Result<Vec<T>, DnsError> {
    if records.is_empty() {
        Err(DnsError::NotFound(name.to_string()))
    } else {
        Ok(records)
    }
}

#[async_trait]
impl DnsLookup for HickoryLookup {
    async fn txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let lookup = self
            .resolver
            .txt_lookup(fqdn(name))
            .await
            .map_err(|e| map_error(name, e))?;
        let records = lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|chunk| String::from_utf8_lossy(chunk))
                    .collect::<String>()
            })
            .collect();
        non_empty(name, records)
    }

    async fn ipv4(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        let lookup = self
            .resolver
            .ipv4_lookup(fqdn(name))
            .await
            .map_err(|e| map_error(name, e))?;
        non_empty(name, lookup.iter().map(|a| a.0).collect())
    }

    async fn ipv6(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        let lookup = self
            .resolver
            .ipv6_lookup(fqdn(name))
            .await
            .map_err(|e| map_error(name, e))?;
        non_empty(name, lookup.iter().map(|aaaa| aaaa.0).collect())
    }

    async fn mx(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let lookup = self
            .resolver
            .mx_lookup(fqdn(name))
            .await
            .map_err(|e| map_error(name, e))?;
        let mut exchanges: Vec<(u16, String)> = lookup
            .iter()
            .map(|mx| {
                let exchange = mx.exchange().to_utf8();
                (mx.preference(), exchange.trim_end_matches('.').to_string())
            })
            .collect();
        exchanges.sort();
        non_empty(name, exchanges.into_iter().map(|(_, host)| host).collect())
    }

    async fn ptr(&self, ip: IpAddr) -> Result<Vec<String>, DnsError> {
        let name = ip.to_string();
        let lookup = self
            .resolver
            .reverse_lookup(ip)
            .await
            .map_err(|e| map_error(&name, e))?;
        let names = lookup
            .iter()
            .map(|ptr| ptr.0.to_utf8().trim_end_matches('.').to_string())
            .collect();
        non_empty(&name, names)
    }
}
