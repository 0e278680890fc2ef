//! SPF record syntax (RFC 7208 sections 4.6 and 5).

use super::macros::{MacroKind, MacroString};
use super::SpfCode;
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("unknown mechanism '{0}'")]
    UnknownMechanism(String),
    #[error("invalid term '{0}'")]
    InvalidTerm(String),
    #[error("invalid macro string '{0}'")]
    InvalidMacro(String),
    #[error("duplicate {0} modifier")]
    DuplicateModifier(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qualifier {
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

impl Qualifier {
    pub fn code(&self) -> SpfCode {
        match self {
            Qualifier::Pass => SpfCode::Pass,
            Qualifier::Fail => SpfCode::Fail,
            Qualifier::SoftFail => SpfCode::SoftFail,
            Qualifier::Neutral => SpfCode::Neutral,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mechanism {
    All,
    Include(MacroString),
    A {
        domain: Option<MacroString>,
        cidr4: u8,
        cidr6: u8,
    },
    Mx {
        domain: Option<MacroString>,
        cidr4: u8,
        cidr6: u8,
    },
    Ptr(Option<MacroString>),
    Ip4 {
        addr: Ipv4Addr,
        prefix: u8,
    },
    Ip6 {
        addr: Ipv6Addr,
        prefix: u8,
    },
    Exists(MacroString),
}

impl Mechanism {
    /// Mechanisms that count against the DNS lookup limit
    pub fn queries_dns(&self) -> bool {
        matches!(
            self,
            Mechanism::Include(_)
                | Mechanism::A { .. }
                | Mechanism::Mx { .. }
                | Mechanism::Ptr(_)
                | Mechanism::Exists(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub qualifier: Qualifier,
    pub mechanism: Mechanism,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    pub rules: Vec<Rule>,
    pub redirect: Option<MacroString>,
    pub exp: Option<MacroString>,
}

/// `v=spf1` followed by a space or the end of the record.
pub fn is_spf_record(txt: &str) -> bool {
    let bytes = txt.as_bytes();
    bytes.len() >= 6
        && bytes[..6].eq_ignore_ascii_case(b"v=spf1")
        && (bytes.len() == 6 || bytes[6] == b' ')
}

impl Record {
    pub fn parse(txt: &str) -> Result<Self, RecordError> {
        let mut record = Record::default();
        let body = txt.get(6..).unwrap_or("");

        for term in body.split_ascii_whitespace() {
            if let Some((name, value)) = modifier_parts(term) {
                let target = match name.to_ascii_lowercase().as_str() {
                    "redirect" => Some((&mut record.redirect, "redirect")),
                    "exp" => Some((&mut record.exp, "exp")),
                    _ => None,
                };
                if let Some((slot, label)) = target {
                    if slot.is_some() {
                        return Err(RecordError::DuplicateModifier(label));
                    }
                    if value.is_empty() {
                        return Err(RecordError::InvalidTerm(term.to_string()));
                    }
                    *slot = Some(MacroString::parse(value, MacroKind::DomainSpec)?);
                }
                continue;
            }
            record.rules.push(parse_rule(term)?);
        }
        Ok(record)
    }
}

// name = ALPHA *( ALPHA / DIGIT / "-" / "_" / "." )
fn modifier_parts(term: &str) -> Option<(&str, &str)> {
    let (name, value) = term.split_once('=')?;
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c));
    (first_ok && rest_ok).then_some((name, value))
}

fn parse_rule(term: &str) -> Result<Rule, RecordError> {
    let invalid = || RecordError::InvalidTerm(term.to_string());
    let (qualifier, rest) = match term.chars().next() {
        Some('+') => (Qualifier::Pass, &term[1..]),
        Some('-') => (Qualifier::Fail, &term[1..]),
        Some('~') => (Qualifier::SoftFail, &term[1..]),
        Some('?') => (Qualifier::Neutral, &term[1..]),
        _ => (Qualifier::Pass, term),
    };

    let name_end = rest.find([':', '/']).unwrap_or(rest.len());
    let (name, args) = rest.split_at(name_end);
    let domain_arg = args.strip_prefix(':');

    let mechanism = match name.to_ascii_lowercase().as_str() {
        "all" => {
            if !args.is_empty() {
                return Err(invalid());
            }
            Mechanism::All
        }
        "include" => Mechanism::Include(required_domain(domain_arg, term)?),
        "exists" => Mechanism::Exists(required_domain(domain_arg, term)?),
        "ptr" => {
            if domain_arg.is_none() && !args.is_empty() {
                return Err(invalid());
            }
            Mechanism::Ptr(optional_domain(domain_arg.unwrap_or(""))?)
        }
        kind @ ("a" | "mx") => {
            let spec = domain_arg.unwrap_or(args);
            let (domain, cidr4, cidr6) = split_dual_cidr(spec).ok_or_else(invalid)?;
            if domain_arg.is_none() && !domain.is_empty() {
                return Err(invalid());
            }
            let domain = optional_domain(domain)?;
            if kind == "a" {
                Mechanism::A {
                    domain,
                    cidr4,
                    cidr6,
                }
            } else {
                Mechanism::Mx {
                    domain,
                    cidr4,
                    cidr6,
                }
            }
        }
        "ip4" => {
            let arg = domain_arg.ok_or_else(invalid)?;
            let (addr, prefix) = match arg.split_once('/') {
                Some((addr, prefix)) => (addr, Some(prefix)),
                None => (arg, None),
            };
            let addr = addr.parse::<Ipv4Addr>().map_err(|_| invalid())?;
            let prefix = parse_prefix(prefix, 32).ok_or_else(invalid)?;
            Mechanism::Ip4 { addr, prefix }
        }
        "ip6" => {
            let arg = domain_arg.ok_or_else(invalid)?;
            let (addr, prefix) = match arg.split_once('/') {
                Some((addr, prefix)) => (addr, Some(prefix)),
                None => (arg, None),
            };
            let addr = addr.parse::<Ipv6Addr>().map_err(|_| invalid())?;
            let prefix = parse_prefix(prefix, 128).ok_or_else(invalid)?;
            Mechanism::Ip6 { addr, prefix }
        }
        _ => return Err(RecordError::UnknownMechanism(name.to_string())),
    };

    Ok(Rule {
        qualifier,
        mechanism,
    })
}

fn required_domain(arg: Option<&str>, term: &str) -> Result<MacroString, RecordError> {
    match arg {
        Some(spec) if !spec.is_empty() => MacroString::parse(spec, MacroKind::DomainSpec),
        _ => Err(RecordError::InvalidTerm(term.to_string())),
    }
}

fn optional_domain(spec: &str) -> Result<Option<MacroString>, RecordError> {
    if spec.is_empty() {
        Ok(None)
    } else {
        MacroString::parse(spec, MacroKind::DomainSpec).map(Some)
    }
}

fn parse_prefix(prefix: Option<&str>, max: u8) -> Option<u8> {
    match prefix {
        None => Some(max),
        Some(p) if !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()) => {
            p.parse::<u8>().ok().filter(|n| *n <= max)
        }
        Some(_) => None,
    }
}

/// Split `domain/cidr4//cidr6` (each part optional) from the right.
fn split_dual_cidr(spec: &str) -> Option<(&str, u8, u8)> {
    let mut rest = spec;
    let mut cidr6 = 128;
    let mut cidr4 = 32;

    if let Some(pos) = rest.rfind("//") {
        cidr6 = parse_prefix(Some(&rest[pos + 2..]), 128)?;
        rest = &rest[..pos];
    }
    if let Some(pos) = rest.rfind('/') {
        cidr4 = parse_prefix(Some(&rest[pos + 1..]), 32)?;
        rest = &rest[..pos];
    }
    Some((rest, cidr4, cidr6))
}
