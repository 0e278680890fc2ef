//! Runs the handler chain for each policy request.

use crate::cache::InstanceCache;
use crate::config::Config;
use crate::directive::Directive;
use crate::handlers::{NetworkExemption, PolicyHandler, SpfHandler};
use crate::network::NetworkSet;
use crate::protocol::PolicyRequest;
use crate::spf::{AuthenticationResolver, DnsSpfResolver};
use anyhow::Context;
use std::sync::Arc;

pub struct PolicyEngine {
    handlers: Vec<Box<dyn PolicyHandler>>,
    default_action: Directive,
    cache: InstanceCache,
}

impl PolicyEngine {
    /// Engine with the standard chain (local origin exemption, relay
    /// exemption, SPF) checking against live DNS.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let resolver = DnsSpfResolver::from_config(config)?;
        Self::with_resolver(config, Arc::new(resolver))
    }

    pub fn with_resolver(
        config: &Config,
        resolver: Arc<dyn AuthenticationResolver>,
    ) -> anyhow::Result<Self> {
        let local_origin = NetworkSet::parse(&config.local_origin_networks)
            .context("Invalid local_origin_networks entry")?;
        let trusted_relays =
            NetworkSet::parse(&config.trusted_relays).context("Invalid trusted_relays entry")?;
        log::debug!(
            "{} local origin networks, {} trusted relay networks",
            local_origin.len(),
            trusted_relays.len()
        );

        // Order matters: exemptions must be able to bypass the SPF check
        let handlers: Vec<Box<dyn PolicyHandler>> = vec![
            Box::new(NetworkExemption::local_origin(local_origin)),
            Box::new(NetworkExemption::trusted_relay(trusted_relays)),
            Box::new(SpfHandler::new(resolver)),
        ];

        Ok(PolicyEngine {
            handlers,
            default_action: config.default_action.clone().normalized(),
            cache: InstanceCache::new(&config.cache),
        })
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Decide one transaction: the first decisive handler wins, otherwise
    /// the configured default applies.
    pub async fn evaluate(&self, request: &PolicyRequest) -> Directive {
        let shared = self.cache.get_or_create(request.instance());
        // Held for the whole chain so concurrent requests for the same
        // message instance are evaluated one at a time
        let mut entry = shared.lock().await;

        let mut action = self.default_action.clone();
        for handler in &self.handlers {
            let directive = handler.evaluate(request, &mut entry).await;
            log::debug!("Handler {}: {directive}", handler.name());
            if directive.is_decisive() {
                action = directive;
                break;
            }
        }

        log::info!(
            "Action: {action} (instance={}, client={}, sender=<{}>, recipient=<{}>)",
            request.instance().unwrap_or("-"),
            request.client_address(),
            request.sender(),
            request.recipient()
        );
        action
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::ScriptedResolver;
    use crate::handlers::{LOCAL_ORIGIN_HEADER, TRUSTED_RELAY_HEADER};
    use crate::spf::dns::testing::StaticZone;
    use crate::spf::{Scope, SpfCode};

    fn engine(resolver: &Arc<ScriptedResolver>, config: Config) -> PolicyEngine {
        PolicyEngine::with_resolver(&config, resolver.clone()).unwrap()
    }

    fn request(pairs: &[(&str, &str)]) -> PolicyRequest {
        pairs.iter().copied().collect()
    }

    #[tokio::test]
    async fn test_local_origin_bypasses_spf() {
        let resolver = Arc::new(ScriptedResolver::new().with(Scope::Helo, SpfCode::Fail));
        let engine = engine(&resolver, Config::default());

        let action = engine
            .evaluate(&request(&[
                ("client_address", "127.0.0.1"),
                ("helo_name", "localhost.example.com"),
                ("sender", "root@example.com"),
            ]))
            .await;

        assert_eq!(action, Directive::prepend(LOCAL_ORIGIN_HEADER));
        assert!(resolver.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trusted_relay_bypasses_spf() {
        let resolver = Arc::new(ScriptedResolver::new().with(Scope::Helo, SpfCode::Fail));
        let config = Config {
            trusted_relays: vec!["10.0.0.0/8".to_string()],
            ..Default::default()
        };
        let engine = engine(&resolver, config);

        let action = engine
            .evaluate(&request(&[
                ("client_address", "10.0.0.5"),
                ("helo_name", "relay.example.com"),
                ("sender", "user@example.com"),
            ]))
            .await;

        assert_eq!(
            action.to_string(),
            format!("PREPEND {TRUSTED_RELAY_HEADER}")
        );
        assert!(resolver.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_header_once_per_instance() {
        let resolver = Arc::new(ScriptedResolver::new().with(Scope::Helo, SpfCode::Pass));
        let engine = engine(&resolver, Config::default());
        let base = [
            ("client_address", "192.0.2.1"),
            ("helo_name", "mail.example.com"),
            ("sender", ""),
            ("instance", "A1"),
        ];

        let mut first = request(&base);
        first.insert("recipient", "a@x");
        let mut second = request(&base);
        second.insert("recipient", "b@x");

        let action = engine.evaluate(&first).await;
        assert!(action.to_string().starts_with("PREPEND Received-SPF: Pass"));
        assert_eq!(engine.evaluate(&second).await, Directive::Dunno);
        assert_eq!(resolver.calls_for(Scope::Helo), 1);

        // A different message gets its own header
        let mut other = request(&base);
        other.insert("instance", "B2");
        assert!(matches!(
            engine.evaluate(&other).await,
            Directive::Prepend { .. }
        ));
    }

    #[tokio::test]
    async fn test_second_recipient_reuses_mailfrom_result() {
        let resolver = Arc::new(
            ScriptedResolver::new()
                .with(Scope::Helo, SpfCode::Pass)
                .with(Scope::MailFrom, SpfCode::Pass),
        );
        let engine = engine(&resolver, Config::default());
        let base = [
            ("client_address", "192.0.2.1"),
            ("helo_name", "mail.example.com"),
            ("sender", "user@example.com"),
            ("instance", "Z9"),
        ];

        let mut first = request(&base);
        first.insert("recipient", "a@x");
        let mut second = request(&base);
        second.insert("recipient", "b@x");

        match engine.evaluate(&first).await {
            Directive::Prepend { header } => {
                assert!(header.starts_with("Received-SPF: Pass"));
                assert!(header.contains("identity=mailfrom"));
            }
            other => panic!("Expected mailfrom header, got {other:?}"),
        }
        assert_eq!(engine.evaluate(&second).await, Directive::Dunno);
        assert_eq!(resolver.calls_for(Scope::Helo), 1);
        assert_eq!(resolver.calls_for(Scope::MailFrom), 1);
    }

    #[tokio::test]
    async fn test_cached_instance_makes_no_further_dns_queries() {
        let zone = Arc::new(
            StaticZone::new()
                .txt("mail.example.com", "v=spf1 a -all")
                .a("mail.example.com", "192.0.2.1")
                .txt("example.com", "v=spf1 ip4:192.0.2.0/24 -all"),
        );
        let config = Config {
            hostname: "mx.example.net".to_string(),
            ..Default::default()
        };
        let resolver = DnsSpfResolver::new(zone.clone(), &config).unwrap();
        let engine = PolicyEngine::with_resolver(&config, Arc::new(resolver)).unwrap();
        let base = [
            ("client_address", "192.0.2.1"),
            ("helo_name", "mail.example.com"),
            ("sender", "user@example.com"),
            ("instance", "Z9"),
        ];

        let mut first = request(&base);
        first.insert("recipient", "a@x");
        assert!(engine
            .evaluate(&first)
            .await
            .to_string()
            .starts_with("PREPEND Received-SPF: Pass"));
        let queries = zone.query_count();
        assert!(queries > 0);

        let mut second = request(&base);
        second.insert("recipient", "b@x");
        assert_eq!(engine.evaluate(&second).await, Directive::Dunno);
        assert_eq!(zone.query_count(), queries);
    }

    #[tokio::test]
    async fn test_without_instance_nothing_is_shared() {
        let resolver = Arc::new(ScriptedResolver::new().with(Scope::Helo, SpfCode::Pass));
        let engine = engine(&resolver, Config::default());
        let attrs = request(&[
            ("client_address", "192.0.2.1"),
            ("helo_name", "mail.example.com"),
            ("sender", ""),
        ]);

        assert!(engine.evaluate(&attrs).await.is_decisive());
        assert!(engine.evaluate(&attrs).await.is_decisive());
        assert_eq!(resolver.calls_for(Scope::Helo), 2);
    }

    #[tokio::test]
    async fn test_default_action_when_no_handler_decides() {
        let resolver = Arc::new(ScriptedResolver::new());
        let config = Config {
            default_action: Directive::prepend("X-Policy: unchecked"),
            ..Default::default()
        };
        let engine = engine(&resolver, config);

        // Unparseable client address: SPF handler has no opinion
        let action = engine
            .evaluate(&request(&[("client_address", "unknown"), ("helo_name", "x")]))
            .await;
        assert_eq!(action, Directive::prepend("X-Policy: unchecked"));
    }

    #[tokio::test]
    async fn test_configured_default_action_is_single_line() {
        let resolver = Arc::new(ScriptedResolver::new());
        let config: Config = serde_yaml::from_str(
            "default_action:\n  type: Prepend\n  header: \"X-Policy: a\\r\\nX-Other: b\"\n",
        )
        .unwrap();
        let engine = engine(&resolver, config);

        let action = engine
            .evaluate(&request(&[("client_address", "unknown"), ("helo_name", "x")]))
            .await;
        assert_eq!(action.to_string(), "PREPEND X-Policy: a  X-Other: b");
    }

    #[test]
    fn test_invalid_network_config_is_rejected() {
        let resolver = Arc::new(ScriptedResolver::new());
        let config = Config {
            trusted_relays: vec!["10.0.0.0/40".to_string()],
            ..Default::default()
        };
        assert!(PolicyEngine::with_resolver(&config, resolver).is_err());
    }

    #[test]
    fn test_handler_order() {
        let resolver = Arc::new(ScriptedResolver::new());
        let engine = engine(&resolver, Config::default());
        assert_eq!(
            engine.handler_names(),
            vec!["exempt_local_origin", "exempt_relay", "sender_policy_framework"]
        );
    }
}
