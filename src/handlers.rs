//! Policy handlers run by the engine, in order, for every transaction.

use crate::cache::CacheEntry;
use crate::directive::Directive;
use crate::network::NetworkSet;
use crate::protocol::PolicyRequest;
use crate::spf::{AuthenticationResolver, IdentityRequest, Scope, SpfCode, SpfResult};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;

pub const LOCAL_ORIGIN_HEADER: &str =
    "X-Comment: SPF not applicable to localhost connection - skipped check";
pub const TRUSTED_RELAY_HEADER: &str =
    "X-Comment: SPF skipped for whitelisted relay - skipped check";

#[async_trait]
pub trait PolicyHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Return `Directive::Dunno` to leave the decision to later handlers.
    async fn evaluate(&self, request: &PolicyRequest, entry: &mut CacheEntry) -> Directive;
}

/// Skips SPF for clients in a configured network set.
pub struct NetworkExemption {
    name: &'static str,
    networks: NetworkSet,
    header: &'static str,
}

impl NetworkExemption {
    pub fn local_origin(networks: NetworkSet) -> Self {
        NetworkExemption {
            name: "exempt_local_origin",
            networks,
            header: LOCAL_ORIGIN_HEADER,
        }
    }

    pub fn trusted_relay(networks: NetworkSet) -> Self {
        NetworkExemption {
            name: "exempt_relay",
            networks,
            header: TRUSTED_RELAY_HEADER,
        }
    }

    pub fn check(&self, request: &PolicyRequest) -> Directive {
        let client = request.client_address().trim();
        if client.is_empty() {
            return Directive::Dunno;
        }
        match client.parse::<IpAddr>() {
            Ok(ip) if self.networks.contains(&ip) => Directive::prepend(self.header),
            _ => Directive::Dunno,
        }
    }
}

#[async_trait]
impl PolicyHandler for NetworkExemption {
    fn name(&self) -> &str {
        self.name
    }

    async fn evaluate(&self, request: &PolicyRequest, _entry: &mut CacheEntry) -> Directive {
        self.check(request)
    }
}

/// Checks the HELO identity, then the envelope sender, and maps the results
/// to a directive.
pub struct SpfHandler {
    resolver: Arc<dyn AuthenticationResolver>,
}

impl SpfHandler {
    pub fn new(resolver: Arc<dyn AuthenticationResolver>) -> Self {
        SpfHandler { resolver }
    }

    /// Cached result for `scope`, or a fresh check stored into the entry.
    /// `None` when no valid request can be built from the attributes.
    async fn result_for(
        &self,
        scope: Scope,
        request: &PolicyRequest,
        entry: &mut CacheEntry,
    ) -> Option<SpfResult> {
        let cached = match scope {
            Scope::Helo => &entry.helo_result,
            Scope::MailFrom => &entry.mailfrom_result,
        };
        if let Some(result) = cached {
            log::debug!("Using cached {scope} result: {}", result.code);
            return Some(result.clone());
        }

        let identity_request = match scope {
            Scope::Helo => {
                IdentityRequest::new(scope, request.helo_name(), request.client_address(), None)
            }
            Scope::MailFrom => IdentityRequest::new(
                scope,
                request.sender(),
                request.client_address(),
                Some(request.helo_name()).filter(|h| !h.is_empty()),
            ),
        };
        let identity_request = match identity_request {
            Ok(identity_request) => identity_request,
            Err(e) => {
                log::warn!("Cannot build SPF {scope} request: {e}");
                return None;
            }
        };

        let result = self.resolver.check(&identity_request).await;
        log::debug!(
            "SPF {scope} {}: {} ({})",
            identity_request.identity,
            result.code,
            result.local_explanation
        );
        let slot = match scope {
            Scope::Helo => &mut entry.helo_result,
            Scope::MailFrom => &mut entry.mailfrom_result,
        };
        *slot = Some(result.clone());
        Some(result)
    }
}

fn reject_or_defer(result: &SpfResult) -> Option<Directive> {
    match result.code {
        SpfCode::Fail => Some(Directive::reject(&result.authority_explanation)),
        SpfCode::TempError => Some(Directive::defer_if_permit(&result.local_explanation)),
        _ => None,
    }
}

/// Prepend the result header unless this message already got one.
fn header_once(result: &SpfResult, entry: &mut CacheEntry) -> Directive {
    if entry.header_emitted {
        return Directive::Dunno;
    }
    entry.header_emitted = true;
    Directive::prepend(&result.header)
}

#[async_trait]
impl PolicyHandler for SpfHandler {
    fn name(&self) -> &str {
        "sender_policy_framework"
    }

    async fn evaluate(&self, request: &PolicyRequest, entry: &mut CacheEntry) -> Directive {
        let helo_result = match self.result_for(Scope::Helo, request, entry).await {
            Some(result) => result,
            None => return Directive::Dunno,
        };
        if let Some(directive) = reject_or_defer(&helo_result) {
            return directive;
        }

        // A bounce has no sender identity; the HELO result stands for the message
        if request.sender().is_empty() {
            return header_once(&helo_result, entry);
        }

        let mailfrom_result = match self.result_for(Scope::MailFrom, request, entry).await {
            Some(result) => result,
            None => return Directive::Dunno,
        };
        if let Some(directive) = reject_or_defer(&mailfrom_result) {
            return directive;
        }
        header_once(&mailfrom_result, entry)
    }
}
