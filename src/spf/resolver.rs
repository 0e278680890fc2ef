//! `check_host()` evaluation over DNS (RFC 7208 sections 4 and 5).

use super::dns::{DnsError, DnsLookup, HickoryLookup};
use super::macros::{MacroContext, MacroKind, MacroString};
use super::record::{is_spf_record, Mechanism, Record};
use super::{is_valid_domain, AuthenticationResolver, IdentityRequest, SpfCode, SpfResult};
use crate::config::Config;
use crate::network::prefix_match;
use async_trait::async_trait;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

// RFC 7208 section 4.6.4
const MAX_MX_OR_PTR_NAMES: usize = 10;

#[derive(Debug)]
enum EvalError {
    Temp(String),
    Perm(String),
}

type EvalResult<T> = Result<T, EvalError>;
type BoxedEval<'a> = Pin<Box<dyn Future<Output = EvalResult<SpfCode>> + Send + 'a>>;

impl From<DnsError> for EvalError {
    fn from(err: DnsError) -> Self {
        EvalError::Temp(err.to_string())
    }
}

/// Per-check counters and the explanation of a top level `fail`.
struct Evaluation {
    request: IdentityRequest,
    dns_mechanisms: usize,
    void_lookups: usize,
    explanation: Option<String>,
}

pub struct DnsSpfResolver {
    lookup: Arc<dyn DnsLookup>,
    receiver: String,
    default_explanation: MacroString,
    max_dns_mechanisms: usize,
    max_void_lookups: usize,
    query_timeout: Duration,
}

impl DnsSpfResolver {
    pub fn new(lookup: Arc<dyn DnsLookup>, config: &Config) -> anyhow::Result<Self> {
        let default_explanation =
            MacroString::parse(&config.default_authority_explanation, MacroKind::Explanation)
                .map_err(|e| anyhow::anyhow!("default_authority_explanation: {e}"))?;

        Ok(DnsSpfResolver {
            lookup,
            receiver: config.hostname.clone(),
            default_explanation,
            max_dns_mechanisms: config.resolver.max_dns_mechanisms,
            max_void_lookups: config.resolver.max_void_lookups,
            query_timeout: Duration::from_secs(config.resolver.query_timeout_seconds),
        })
    }

    /// Resolver backed by the system DNS configuration.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let lookup = HickoryLookup::from_config(&config.resolver)?;
        Self::new(Arc::new(lookup), config)
    }

    fn check_host<'a>(
        &'a self,
        state: &'a mut Evaluation,
        domain: String,
        nested: bool,
    ) -> BoxedEval<'a> {
        Box::pin(async move {
            if !is_valid_domain(&domain) {
                log::debug!("Not evaluating SPF for invalid domain '{domain}'");
                return Ok(SpfCode::None);
            }

            let record = match self.fetch_record(&domain).await? {
                Some(record) => record,
                None => return Ok(SpfCode::None),
            };

            for rule in &record.rules {
                if rule.mechanism.queries_dns() {
                    self.count_dns_mechanism(state)?;
                }
                if self.matches(state, &rule.mechanism, &domain).await? {
                    let code = rule.qualifier.code();
                    log::debug!("SPF {domain}: {:?} matched, result {code}", rule.mechanism);
                    if code == SpfCode::Fail && !nested {
                        let explanation = self.explain(state, &record, &domain).await;
                        state.explanation = Some(explanation);
                    }
                    return Ok(code);
                }
            }

            if let Some(redirect) = &record.redirect {
                self.count_dns_mechanism(state)?;
                let target = self.expand_domain(state, redirect, &domain);
                log::debug!("SPF {domain}: redirect to {target}");
                return match self.check_host(state, target.clone(), nested).await? {
                    SpfCode::None => Err(EvalError::Perm(format!(
                        "redirect target {target} has no SPF record"
                    ))),
                    code => Ok(code),
                };
            }

            Ok(SpfCode::Neutral)
        })
    }

    async fn fetch_record(&self, domain: &str) -> EvalResult<Option<Record>> {
        let records = match self.lookup.txt(domain).await {
            Ok(records) => records,
            Err(DnsError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut spf_records = records.iter().filter(|txt| is_spf_record(txt));
        let record = match (spf_records.next(), spf_records.next()) {
            (None, _) => return Ok(None),
            (Some(record), None) => record,
            (Some(_), Some(_)) => {
                return Err(EvalError::Perm(format!(
                    "{domain} publishes more than one SPF record"
                )))
            }
        };

        Record::parse(record)
            .map(Some)
            .map_err(|e| EvalError::Perm(format!("{domain}: {e}")))
    }

    async fn matches(
        &self,
        state: &mut Evaluation,
        mechanism: &Mechanism,
        domain: &str,
    ) -> EvalResult<bool> {
        let ip = state.request.client_ip;
        match mechanism {
            Mechanism::All => Ok(true),
            Mechanism::Ip4 { addr, prefix } => Ok(prefix_match(&IpAddr::V4(*addr), &ip, *prefix)),
            Mechanism::Ip6 { addr, prefix } => Ok(prefix_match(&IpAddr::V6(*addr), &ip, *prefix)),
            Mechanism::Include(spec) => {
                let target = self.expand_domain(state, spec, domain);
                match self.check_host(state, target.clone(), true).await? {
                    SpfCode::Pass => Ok(true),
                    SpfCode::None => Err(EvalError::Perm(format!(
                        "included domain {target} has no SPF record"
                    ))),
                    _ => Ok(false),
                }
            }
            Mechanism::A {
                domain: spec,
                cidr4,
                cidr6,
            } => {
                let target = self.target_domain(state, spec.as_ref(), domain);
                self.host_matches(state, &target, *cidr4, *cidr6, true)
                    .await
            }
            Mechanism::Mx {
                domain: spec,
                cidr4,
                cidr6,
            } => {
                let target = self.target_domain(state, spec.as_ref(), domain);
                let exchanges = match self.lookup.mx(&target).await {
                    Ok(exchanges) => exchanges,
                    Err(DnsError::NotFound(_)) => {
                        self.count_void_lookup(state)?;
                        return Ok(false);
                    }
                    Err(e) => return Err(e.into()),
                };
                if exchanges.len() > MAX_MX_OR_PTR_NAMES {
                    return Err(EvalError::Perm(format!(
                        "{target} has more than {MAX_MX_OR_PTR_NAMES} MX records"
                    )));
                }
                for exchange in &exchanges {
                    if self
                        .host_matches(state, exchange, *cidr4, *cidr6, false)
                        .await?
                    {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Mechanism::Ptr(spec) => {
                let target = self.target_domain(state, spec.as_ref(), domain);
                self.ptr_matches(state, &target).await
            }
            Mechanism::Exists(spec) => {
                let target = self.expand_domain(state, spec, domain);
                match self.lookup.ipv4(&target).await {
                    Ok(_) => Ok(true),
                    Err(DnsError::NotFound(_)) => {
                        self.count_void_lookup(state)?;
                        Ok(false)
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Do the A or AAAA records of `name` (matching the client's family)
    /// cover the client address?
    async fn host_matches(
        &self,
        state: &mut Evaluation,
        name: &str,
        cidr4: u8,
        cidr6: u8,
        count_void: bool,
    ) -> EvalResult<bool> {
        let ip = state.request.client_ip;
        let (addresses, prefix) = match ip {
            IpAddr::V4(_) => (
                self.lookup
                    .ipv4(name)
                    .await
                    .map(|addrs| addrs.into_iter().map(IpAddr::V4).collect::<Vec<_>>()),
                cidr4,
            ),
            IpAddr::V6(_) => (
                self.lookup
                    .ipv6(name)
                    .await
                    .map(|addrs| addrs.into_iter().map(IpAddr::V6).collect::<Vec<_>>()),
                cidr6,
            ),
        };

        match addresses {
            Ok(addresses) => Ok(addresses
                .iter()
                .any(|addr| prefix_match(addr, &ip, prefix))),
            Err(DnsError::NotFound(_)) => {
                if count_void {
                    self.count_void_lookup(state)?;
                }
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    // PTR lookup errors make the mechanism not match (RFC 7208 section 5.5)
    async fn ptr_matches(&self, state: &mut Evaluation, target: &str) -> EvalResult<bool> {
        let ip = state.request.client_ip;
        let names = match self.lookup.ptr(ip).await {
            Ok(names) => names,
            Err(DnsError::NotFound(_)) => {
                self.count_void_lookup(state)?;
                return Ok(false);
            }
            Err(e) => {
                log::debug!("PTR lookup failed: {e}");
                return Ok(false);
            }
        };

        let target = target.to_ascii_lowercase();
        for name in names.iter().take(MAX_MX_OR_PTR_NAMES) {
            let name = name.to_ascii_lowercase();
            if name != target && !name.ends_with(&format!(".{target}")) {
                continue;
            }
            match self.host_matches(state, &name, 32, 128, false).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(EvalError::Temp(reason)) => log::debug!("PTR validation of {name}: {reason}"),
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    async fn explain(&self, state: &Evaluation, record: &Record, domain: &str) -> String {
        let ctx = self.macro_context(state, domain);
        if let Some(spec) = &record.exp {
            let target = self.expand_domain(state, spec, domain);
            match self.lookup.txt(&target).await {
                Ok(records) if records.len() == 1 => {
                    match MacroString::parse(&records[0], MacroKind::Explanation) {
                        Ok(text) => return text.expand(&ctx),
                        Err(e) => log::debug!("Ignoring explanation from {target}: {e}"),
                    }
                }
                Ok(records) => log::debug!(
                    "Ignoring explanation from {target}: {} TXT records",
                    records.len()
                ),
                Err(e) => log::debug!("Explanation lookup failed: {e}"),
            }
        }
        self.default_explanation.expand(&ctx)
    }

    fn macro_context<'a>(&'a self, state: &'a Evaluation, domain: &'a str) -> MacroContext<'a> {
        let request = &state.request;
        MacroContext {
            sender: &request.sender,
            local_part: &request.local_part,
            sender_domain: &request.domain,
            domain,
            ip: request.client_ip,
            helo: request.helo_identity(),
            receiver: &self.receiver,
        }
    }

    fn target_domain(
        &self,
        state: &Evaluation,
        spec: Option<&MacroString>,
        domain: &str,
    ) -> String {
        match spec {
            Some(spec) => self.expand_domain(state, spec, domain),
            None => domain.to_string(),
        }
    }

    /// Expand a domain-spec, dropping leading labels past 253 characters.
    fn expand_domain(&self, state: &Evaluation, spec: &MacroString, domain: &str) -> String {
        let mut expanded = spec.expand(&self.macro_context(state, domain));
        while expanded.len() > 253 {
            match expanded.split_once('.') {
                Some((_, rest)) => expanded = rest.to_string(),
                None => break,
            }
        }
        expanded.trim_end_matches('.').to_string()
    }

    fn count_dns_mechanism(&self, state: &mut Evaluation) -> EvalResult<()> {
        state.dns_mechanisms += 1;
        if state.dns_mechanisms > self.max_dns_mechanisms {
            return Err(EvalError::Perm(format!(
                "more than {} DNS-querying terms",
                self.max_dns_mechanisms
            )));
        }
        Ok(())
    }

    fn count_void_lookup(&self, state: &mut Evaluation) -> EvalResult<()> {
        state.void_lookups += 1;
        if state.void_lookups > self.max_void_lookups {
            return Err(EvalError::Perm(format!(
                "more than {} void DNS lookups",
                self.max_void_lookups
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl AuthenticationResolver for DnsSpfResolver {
    async fn check(&self, request: &IdentityRequest) -> SpfResult {
        let mut state = Evaluation {
            request: request.clone(),
            dns_mechanisms: 0,
            void_lookups: 0,
            explanation: None,
        };

        let evaluation = self.check_host(&mut state, request.domain.clone(), false);
        let (code, detail) = match tokio::time::timeout(self.query_timeout, evaluation).await {
            Ok(Ok(code)) => (code, None),
            Ok(Err(EvalError::Temp(reason))) => {
                log::warn!("SPF {} {}: {reason}", request.scope, request.identity);
                (SpfCode::TempError, Some(reason))
            }
            Ok(Err(EvalError::Perm(reason))) => {
                log::debug!("SPF {} {}: {reason}", request.scope, request.identity);
                (SpfCode::PermError, Some(reason))
            }
            Err(_) => {
                log::warn!(
                    "SPF {} {}: evaluation timed out after {:?}",
                    request.scope,
                    request.identity,
                    self.query_timeout
                );
                (SpfCode::TempError, Some("DNS lookups timed out".to_string()))
            }
        };

        let authority_explanation = match (code, state.explanation.take()) {
            (SpfCode::Fail, Some(explanation)) => explanation,
            (SpfCode::Fail, None) => self.default_explanation.expand(&self.macro_context(
                &state,
                &request.domain,
            )),
            _ => String::new(),
        };

        SpfResult::new(
            request,
            &self.receiver,
            code,
            detail.as_deref(),
            authority_explanation,
        )
    }
}
