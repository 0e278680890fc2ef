use crate::directive::Directive;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where to accept policy connections. `None` serves a single session on
    /// stdin/stdout, `host:port` listens on TCP, `unix:/path` on a Unix socket.
    pub listen: Option<String>,
    /// Receiving host name, used in Received-SPF headers and explanations
    pub hostname: String,
    pub verbose: bool,
    /// Directive returned when no handler reaches a decision
    pub default_action: Directive,
    pub resolver: ResolverConfig,
    /// SPF macro string used as the authority explanation when a failing
    /// domain publishes no usable `exp=` modifier
    pub default_authority_explanation: String,
    pub local_origin_networks: Vec<String>,
    pub trusted_relays: Vec<String>,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    // Per DNS query
    pub timeout_seconds: u64,
    pub attempts: usize,
    // Whole check_host() evaluation
    pub query_timeout_seconds: u64,
    pub max_dns_mechanisms: usize,
    pub max_void_lookups: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub ttl_seconds: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            timeout_seconds: 5,
            attempts: 2,
            query_timeout_seconds: 20,
            max_dns_mechanisms: 10,
            max_void_lookups: 2,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_entries: 10_000,
            ttl_seconds: 3600,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: None,
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            verbose: false,
            default_action: Directive::Dunno,
            resolver: ResolverConfig::default(),
            default_authority_explanation:
                "Please see http://www.open-spf.org/Why?id=%{S}&ip=%{C}&r=%{R}"
                    .to_string(),
            local_origin_networks: vec!["127.0.0.0/8".to_string(), "::1/128".to_string()],
            trusted_relays: Vec::new(),
            cache: CacheConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
