//! Sender Policy Framework types and the resolver contract used by the
//! policy handlers.

pub mod dns;
pub mod macros;
pub mod record;
pub mod resolver;

use crate::directive::clean_text;
use crate::network::unmap;
use async_trait::async_trait;
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

pub use resolver::DnsSpfResolver;

/// Which identity is being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Helo,
    MailFrom,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Helo => "helo",
            Scope::MailFrom => "mailfrom",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpfCode {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    TempError,
    PermError,
}

impl SpfCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpfCode::Pass => "pass",
            SpfCode::Fail => "fail",
            SpfCode::SoftFail => "softfail",
            SpfCode::Neutral => "neutral",
            SpfCode::None => "none",
            SpfCode::TempError => "temperror",
            SpfCode::PermError => "permerror",
        }
    }

    // Header form, e.g. "Pass", "SoftFail"
    fn header_name(&self) -> &'static str {
        match self {
            SpfCode::Pass => "Pass",
            SpfCode::Fail => "Fail",
            SpfCode::SoftFail => "SoftFail",
            SpfCode::Neutral => "Neutral",
            SpfCode::None => "None",
            SpfCode::TempError => "TempError",
            SpfCode::PermError => "PermError",
        }
    }
}

impl fmt::Display for SpfCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of checking one identity. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpfResult {
    pub code: SpfCode,
    pub local_explanation: String,
    /// Only meaningful for `fail`
    pub authority_explanation: String,
    /// Complete `Received-SPF: ...` header line
    pub header: String,
}

impl SpfResult {
    /// Build a result, deriving the local explanation and the Received-SPF
    /// header from the request.
    pub fn new(
        request: &IdentityRequest,
        receiver: &str,
        code: SpfCode,
        detail: Option<&str>,
        authority_explanation: impl Into<String>,
    ) -> Self {
        let comment = describe(request, code, detail);
        let local_explanation = format!("{receiver}: {comment}");

        let mut header = format!(
            "Received-SPF: {} ({local_explanation}) receiver={receiver}; identity={}; ",
            code.header_name(),
            request.scope,
        );
        if request.scope == Scope::MailFrom {
            header.push_str(&format!("envelope-from=\"{}\"; ", request.identity));
        }
        if let Some(helo) = request.helo_identity() {
            header.push_str(&format!("helo={helo}; "));
        }
        header.push_str(&format!("client-ip={}", request.client_ip));

        SpfResult {
            code,
            local_explanation: clean_text(&local_explanation),
            authority_explanation: clean_text(&authority_explanation.into()),
            header: clean_text(&header),
        }
    }
}

fn describe(request: &IdentityRequest, code: SpfCode, detail: Option<&str>) -> String {
    let who = match request.scope {
        Scope::Helo => request.domain.clone(),
        Scope::MailFrom => request.identity.clone(),
    };
    let ip = request.client_ip;
    let base = match code {
        SpfCode::Pass => format!("domain of {who} designates {ip} as permitted sender"),
        SpfCode::Fail => format!("domain of {who} does not designate {ip} as permitted sender"),
        SpfCode::SoftFail => {
            format!("transitioning domain of {who} does not designate {ip} as permitted sender")
        }
        SpfCode::Neutral => format!("{ip} is neither permitted nor denied by domain of {who}"),
        SpfCode::None => format!("domain of {who} does not provide an SPF record"),
        SpfCode::TempError => format!("temporary error while checking domain of {who}"),
        SpfCode::PermError => format!("permanent error in SPF record of domain of {who}"),
    };
    match detail {
        Some(detail) if !detail.is_empty() => format!("{base}: {detail}"),
        _ => base,
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("empty {0} identity")]
    EmptyIdentity(Scope),
    #[error("invalid {scope} identity '{identity}'")]
    InvalidIdentity { scope: Scope, identity: String },
    #[error("invalid client address '{0}'")]
    InvalidClientAddress(String),
}

/// A validated identity check: what to check, for which client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRequest {
    pub scope: Scope,
    /// The identity as received (HELO name or envelope sender)
    pub identity: String,
    /// Sender used for macro expansion; `postmaster@<domain>` when the
    /// identity has no local part
    pub sender: String,
    pub local_part: String,
    /// Domain whose policy is evaluated
    pub domain: String,
    pub client_ip: IpAddr,
    pub helo: Option<String>,
}

impl IdentityRequest {
    pub fn new(
        scope: Scope,
        identity: &str,
        client_address: &str,
        helo: Option<&str>,
    ) -> Result<Self, RequestError> {
        let client_ip = client_address
            .trim()
            .parse::<IpAddr>()
            .map(unmap)
            .map_err(|_| RequestError::InvalidClientAddress(client_address.to_string()))?;

        let identity = identity.trim();
        if identity.is_empty() {
            return Err(RequestError::EmptyIdentity(scope));
        }
        let invalid = || RequestError::InvalidIdentity {
            scope,
            identity: identity.to_string(),
        };

        let (local_part, domain) = match scope {
            Scope::Helo => ("postmaster".to_string(), identity.to_string()),
            Scope::MailFrom => match identity.rsplit_once('@') {
                Some((local, domain)) if !local.is_empty() => {
                    (local.to_string(), domain.to_string())
                }
                Some((_, domain)) => ("postmaster".to_string(), domain.to_string()),
                None => ("postmaster".to_string(), identity.to_string()),
            },
        };
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        if !is_valid_domain(&domain) {
            return Err(invalid());
        }

        let helo = match (scope, helo) {
            (Scope::Helo, _) => Some(identity.to_string()),
            (Scope::MailFrom, Some(h)) if is_valid_domain(h.trim_end_matches('.')) => {
                Some(h.to_string())
            }
            (Scope::MailFrom, Some(h)) => {
                log::debug!("Dropping unusable HELO context '{h}'");
                None
            }
            (Scope::MailFrom, None) => None,
        };

        Ok(IdentityRequest {
            scope,
            identity: identity.to_string(),
            sender: format!("{local_part}@{domain}"),
            local_part,
            domain,
            client_ip,
            helo,
        })
    }

    pub fn helo_identity(&self) -> Option<&str> {
        self.helo.as_deref()
    }
}

/// Domain name syntax check: at least two labels, each 1-63 characters of
/// letters, digits, hyphens or underscores, and an alphanumeric top label.
pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    let labels_ok = labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    });
    let top_ok = labels
        .last()
        .is_some_and(|top| top.chars().any(|c| c.is_ascii_alphabetic()));
    labels_ok && top_ok
}

/// Evaluates one identity against published sender policy.
///
/// Implementations own their DNS retry and timeout budget and must always
/// return a result; lookup failures surface as `temperror`.
#[async_trait]
pub trait AuthenticationResolver: Send + Sync {
    async fn check(&self, request: &IdentityRequest) -> SpfResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helo_request() {
        let request =
            IdentityRequest::new(Scope::Helo, "Mail.Example.COM", "192.0.2.1", None).unwrap();

        assert_eq!(request.domain, "mail.example.com");
        assert_eq!(request.sender, "postmaster@mail.example.com");
        assert_eq!(request.helo_identity(), Some("Mail.Example.COM"));
        assert_eq!(request.client_ip, "192.0.2.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_mailfrom_request() {
        let request = IdentityRequest::new(
            Scope::MailFrom,
            "user@example.com",
            "::ffff:192.0.2.1",
            Some("mail.example.com"),
        )
        .unwrap();

        assert_eq!(request.local_part, "user");
        assert_eq!(request.domain, "example.com");
        assert_eq!(request.client_ip, "192.0.2.1".parse::<IpAddr>().unwrap());
        assert_eq!(request.helo_identity(), Some("mail.example.com"));

        let bare = IdentityRequest::new(Scope::MailFrom, "example.com", "192.0.2.1", None).unwrap();
        assert_eq!(bare.sender, "postmaster@example.com");
    }

    #[test]
    fn test_invalid_requests() {
        assert_eq!(
            IdentityRequest::new(Scope::Helo, "mail.example.com", "not-an-ip", None),
            Err(RequestError::InvalidClientAddress("not-an-ip".to_string()))
        );
        assert_eq!(
            IdentityRequest::new(Scope::Helo, "", "192.0.2.1", None),
            Err(RequestError::EmptyIdentity(Scope::Helo))
        );
        assert!(matches!(
            IdentityRequest::new(Scope::Helo, "[192.0.2.1]", "192.0.2.1", None),
            Err(RequestError::InvalidIdentity { .. })
        ));
        assert!(matches!(
            IdentityRequest::new(Scope::MailFrom, "user@localhost", "192.0.2.1", None),
            Err(RequestError::InvalidIdentity { .. })
        ));
    }

    #[test]
    fn test_invalid_helo_context_is_dropped() {
        let request =
            IdentityRequest::new(Scope::MailFrom, "a@example.com", "192.0.2.1", Some("[1.2.3.4]"))
                .unwrap();
        assert_eq!(request.helo_identity(), None);
    }

    #[test]
    fn test_domain_validation() {
        assert!(is_valid_domain("example.com"));
        assert!(is_valid_domain("_spf.example.com"));
        assert!(!is_valid_domain("example"));
        assert!(!is_valid_domain("example..com"));
        assert!(!is_valid_domain("-bad.example.com"));
        assert!(!is_valid_domain("192.0.2.1"));
    }

    #[test]
    fn test_result_header() {
        let request = IdentityRequest::new(
            Scope::MailFrom,
            "user@example.com",
            "192.0.2.1",
            Some("mail.example.com"),
        )
        .unwrap();
        let result = SpfResult::new(&request, "mx.example.net", SpfCode::SoftFail, None, "");

        assert_eq!(
            result.local_explanation,
            "mx.example.net: transitioning domain of user@example.com does not designate 192.0.2.1 as permitted sender"
        );
        assert_eq!(
            result.header,
            "Received-SPF: SoftFail (mx.example.net: transitioning domain of user@example.com does not designate 192.0.2.1 as permitted sender) receiver=mx.example.net; identity=mailfrom; envelope-from=\"user@example.com\"; helo=mail.example.com; client-ip=192.0.2.1"
        );
    }

    #[test]
    fn test_result_strips_trailing_nuls() {
        let request =
            IdentityRequest::new(Scope::Helo, "mail.example.com", "192.0.2.1", None).unwrap();
        let result = SpfResult::new(&request, "mx", SpfCode::Fail, None, "Forbidden\0\0");
        assert_eq!(result.authority_explanation, "Forbidden");
    }
}
