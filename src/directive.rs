use serde::{Deserialize, Serialize};
use std::fmt;

/// Instruction returned to the MTA for one policy transaction.
///
/// `Dunno` doubles as the "no opinion" answer of a single handler; every other
/// variant is decisive and ends the handler chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Directive {
    Dunno,
    /// Accept, adding a header line to the message
    Prepend { header: String },
    /// Permanent 550 rejection
    Reject { message: String },
    /// Temporary failure, applied only if the message would otherwise be accepted
    DeferIfPermit { message: String },
}

impl Directive {
    pub fn is_decisive(&self) -> bool {
        !matches!(self, Directive::Dunno)
    }

    pub fn prepend(header: impl Into<String>) -> Self {
        Directive::Prepend {
            header: clean_text(&header.into()),
        }
    }

    pub fn reject(message: impl Into<String>) -> Self {
        Directive::Reject {
            message: clean_text(&message.into()),
        }
    }

    pub fn defer_if_permit(message: impl Into<String>) -> Self {
        Directive::DeferIfPermit {
            message: clean_text(&message.into()),
        }
    }

    /// Re-apply text cleaning to a directive that did not come through the
    /// constructors, such as one read from the configuration file.
    pub fn normalized(self) -> Self {
        match self {
            Directive::Dunno => Directive::Dunno,
            Directive::Prepend { header } => Directive::prepend(header),
            Directive::Reject { message } => Directive::reject(message),
            Directive::DeferIfPermit { message } => Directive::defer_if_permit(message),
        }
    }
}

/// Strip trailing NULs and fold line breaks so the text fits on one
/// protocol line.
pub fn clean_text(text: &str) -> String {
    text.trim_end_matches('\0')
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect()
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Directive::Dunno => write!(f, "DUNNO"),
            Directive::Prepend { header } => write!(f, "PREPEND {header}"),
            Directive::Reject { message } => write!(f, "550 {message}"),
            Directive::DeferIfPermit { message } => {
                write!(f, "DEFER_IF_PERMIT SPF-Result={message}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_text() {
        assert_eq!(Directive::Dunno.to_string(), "DUNNO");
        assert_eq!(
            Directive::prepend("Received-SPF: pass").to_string(),
            "PREPEND Received-SPF: pass"
        );
        assert_eq!(Directive::reject("Forbidden").to_string(), "550 Forbidden");
        assert_eq!(
            Directive::defer_if_permit("mx: DNS timeout").to_string(),
            "DEFER_IF_PERMIT SPF-Result=mx: DNS timeout"
        );
    }

    #[test]
    fn test_constructors_keep_single_line() {
        let directive = Directive::reject("Go away\r\nnow\0\0");
        assert_eq!(directive.to_string(), "550 Go away  now");
    }

    #[test]
    fn test_normalized_cleans_deserialized_text() {
        let directive = Directive::Prepend {
            header: "X-Policy: one\nX-Injected: two".to_string(),
        };
        assert_eq!(
            directive.normalized().to_string(),
            "PREPEND X-Policy: one X-Injected: two"
        );
        assert_eq!(Directive::Dunno.normalized(), Directive::Dunno);
    }

    #[test]
    fn test_only_dunno_is_indecisive() {
        assert!(!Directive::Dunno.is_decisive());
        assert!(Directive::prepend("X-Comment: x").is_decisive());
        assert!(Directive::reject("no").is_decisive());
        assert!(Directive::defer_if_permit("later").is_decisive());
    }
}
