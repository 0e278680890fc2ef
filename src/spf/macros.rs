//! SPF macro strings (RFC 7208 section 7).

use super::record::RecordError;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Where a macro string appears; explanation text may use `c`, `r` and `t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroKind {
    DomainSpec,
    Explanation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Macro {
        letter: char,
        url_escape: bool,
        keep: Option<usize>,
        reverse: bool,
        delimiters: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroString {
    tokens: Vec<Token>,
}

/// Values the macro letters expand to.
pub struct MacroContext<'a> {
    pub sender: &'a str,
    pub local_part: &'a str,
    pub sender_domain: &'a str,
    /// The domain currently being evaluated
    pub domain: &'a str,
    pub ip: IpAddr,
    pub helo: Option<&'a str>,
    pub receiver: &'a str,
}

const DELIMITERS: &str = ".-+,/_=";

impl MacroString {
    pub fn parse(text: &str, kind: MacroKind) -> Result<Self, RecordError> {
        let invalid = || RecordError::InvalidMacro(text.to_string());
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }
            match chars.next() {
                Some('%') => literal.push('%'),
                Some('_') => literal.push(' '),
                Some('-') => literal.push_str("%20"),
                Some('{') => {
                    let letter = chars.next().ok_or_else(invalid)?;
                    let lower = letter.to_ascii_lowercase();
                    let allowed = match kind {
                        MacroKind::DomainSpec => "slodipvh",
                        MacroKind::Explanation => "slodipvhcrt",
                    };
                    if !allowed.contains(lower) {
                        return Err(invalid());
                    }

                    let mut digits = String::new();
                    while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                        digits.push(*d);
                        chars.next();
                    }
                    let keep = if digits.is_empty() {
                        None
                    } else {
                        match digits.parse::<usize>() {
                            Ok(0) | Err(_) => return Err(invalid()),
                            Ok(n) => Some(n),
                        }
                    };

                    let reverse = matches!(chars.peek(), Some('r') | Some('R'));
                    if reverse {
                        chars.next();
                    }

                    let mut delimiters = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(d) if DELIMITERS.contains(d) => delimiters.push(d),
                            _ => return Err(invalid()),
                        }
                    }

                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(Token::Macro {
                        letter: lower,
                        url_escape: letter.is_ascii_uppercase(),
                        keep,
                        reverse,
                        delimiters,
                    });
                }
                _ => return Err(invalid()),
            }
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }
        Ok(MacroString { tokens })
    }

    pub fn expand(&self, ctx: &MacroContext<'_>) -> String {
        let mut out = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(text) => out.push_str(text),
                Token::Macro {
                    letter,
                    url_escape,
                    keep,
                    reverse,
                    delimiters,
                } => {
                    let value = letter_value(*letter, ctx);
                    let value = transform(&value, *keep, *reverse, delimiters);
                    if *url_escape {
                        out.push_str(&url_escape_str(&value));
                    } else {
                        out.push_str(&value);
                    }
                }
            }
        }
        out
    }
}

fn letter_value(letter: char, ctx: &MacroContext<'_>) -> String {
    match letter {
        's' => ctx.sender.to_string(),
        'l' => ctx.local_part.to_string(),
        'o' => ctx.sender_domain.to_string(),
        'd' => ctx.domain.to_string(),
        'i' => dotted_ip(ctx.ip),
        // Validated PTR names are not looked up for macro use
        'p' => "unknown".to_string(),
        'v' => match ctx.ip {
            IpAddr::V4(_) => "in-addr".to_string(),
            IpAddr::V6(_) => "ip6".to_string(),
        },
        'h' => ctx.helo.unwrap_or("unknown").to_string(),
        'c' => ctx.ip.to_string(),
        'r' => ctx.receiver.to_string(),
        't' => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            .to_string(),
        _ => String::new(),
    }
}

/// IPv4 as dotted quad, IPv6 as 32 dot separated nibbles.
fn dotted_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => v6
            .octets()
            .iter()
            .flat_map(|byte| [byte >> 4, byte & 0x0f])
            .map(|nibble| format!("{nibble:x}"))
            .collect::<Vec<_>>()
            .join("."),
    }
}

fn transform(value: &str, keep: Option<usize>, reverse: bool, delimiters: &str) -> String {
    if keep.is_none() && !reverse && (delimiters.is_empty() || delimiters == ".") {
        return value.to_string();
    }
    let delimiters = if delimiters.is_empty() { "." } else { delimiters };
    let mut parts: Vec<&str> = value.split(|c| delimiters.contains(c)).collect();
    if reverse {
        parts.reverse();
    }
    if let Some(keep) = keep {
        if parts.len() > keep {
            parts.drain(..parts.len() - keep);
        }
    }
    parts.join(".")
}

fn url_escape_str(value: &str) -> String {
    let mut out = String::new();
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || b"-._~".contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}
