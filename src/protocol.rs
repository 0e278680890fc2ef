//! Policy delegation wire protocol.
//!
//! A request is a run of `name=value` lines closed by an empty line; the
//! response is a single `action=...` line followed by an empty line.

use crate::directive::Directive;
use std::borrow::Cow;
use std::collections::HashMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

pub const ATTR_INSTANCE: &str = "instance";
pub const ATTR_CLIENT_ADDRESS: &str = "client_address";
pub const ATTR_HELO_NAME: &str = "helo_name";
pub const ATTR_SENDER: &str = "sender";
pub const ATTR_RECIPIENT: &str = "recipient";

/// Attributes of one policy transaction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PolicyRequest {
    pub attributes: HashMap<String, String>,
}

impl PolicyRequest {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn instance(&self) -> Option<&str> {
        self.get(ATTR_INSTANCE).filter(|s| !s.is_empty())
    }

    pub fn client_address(&self) -> &str {
        self.get(ATTR_CLIENT_ADDRESS).unwrap_or("")
    }

    pub fn helo_name(&self) -> &str {
        self.get(ATTR_HELO_NAME).unwrap_or("")
    }

    /// Envelope sender; empty for the null (bounce) sender.
    pub fn sender(&self) -> &str {
        self.get(ATTR_SENDER).unwrap_or("")
    }

    pub fn recipient(&self) -> &str {
        self.get(ATTR_RECIPIENT).unwrap_or("")
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(name.into(), value.into());
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PolicyRequest {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        PolicyRequest {
            attributes: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

pub struct PolicyReader<R> {
    reader: R,
    line: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> PolicyReader<R> {
    pub fn new(reader: R) -> Self {
        PolicyReader {
            reader,
            line: Vec::new(),
        }
    }

    /// Read the next request block. Returns `Ok(None)` at end of input; any
    /// attributes read without a closing empty line are discarded.
    pub async fn next_request(&mut self) -> std::io::Result<Option<PolicyRequest>> {
        let mut request = PolicyRequest::default();

        loop {
            self.line.clear();
            if self.reader.read_until(b'\n', &mut self.line).await? == 0 {
                if !request.attributes.is_empty() {
                    log::debug!(
                        "End of input with {} unterminated attributes",
                        request.attributes.len()
                    );
                }
                return Ok(None);
            }

            // Attribute values are client controlled and need not be UTF-8
            let line = String::from_utf8_lossy(&self.line);
            if let Cow::Owned(replaced) = &line {
                log::warn!("Invalid UTF-8 in policy input line: {}", replaced.trim_end());
            }
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                return Ok(Some(request));
            }

            match line.split_once('=') {
                Some((name, value)) => {
                    log::debug!("Attribute: {name}={value}");
                    request.insert(name, value);
                }
                None => log::warn!("Ignoring malformed policy input line: {line}"),
            }
        }
    }
}

/// Write `action=<directive>` and the closing empty line, then flush.
pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    directive: &Directive,
) -> std::io::Result<()> {
    let response = format!("action={directive}\n\n");
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}
