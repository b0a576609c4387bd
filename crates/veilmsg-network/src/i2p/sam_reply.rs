//! SAM reply line grammar
//!
//! A reply is a sequence of bare keywords followed by `KEY=value` pairs:
//!
//! ```text
//! SESSION STATUS RESULT=OK DESTINATION=AAAA...
//! NAMING REPLY RESULT=KEY_NOT_FOUND NAME=foo.i2p MESSAGE="no such name"
//! ```
//!
//! Values may be double-quoted when they contain spaces. Once the first
//! pair has been seen every following token must be a pair as well.

use super::sam_client::{Result, SamError};
use std::collections::HashMap;

/// Parsed SAM reply line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamReply {
    raw: String,
    topic: Vec<String>,
    fields: HashMap<String, String>,
}

impl SamReply {
    /// Parse a single reply line (trailing newline allowed)
    pub fn parse(line: &str) -> Result<Self> {
        let raw = line.trim_end_matches(['\r', '\n']).to_string();
        let mut topic = Vec::new();
        let mut fields = HashMap::new();

        for token in tokenize(&raw)? {
            match token.split_once('=') {
                Some((key, value)) => {
                    if key.is_empty() {
                        return Err(SamError::MalformedReply(raw.clone()));
                    }
                    fields.insert(key.to_string(), unquote(value));
                }
                None if fields.is_empty() => topic.push(token),
                None => return Err(SamError::MalformedReply(raw.clone())),
            }
        }

        if topic.is_empty() {
            return Err(SamError::MalformedReply(raw));
        }

        Ok(SamReply { raw, topic, fields })
    }

    /// The raw line, kept for diagnostics
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Leading keyword sequence, e.g. `["SESSION", "STATUS"]`
    pub fn topic(&self) -> &[String] {
        &self.topic
    }

    pub fn has_topic(&self, expected: &[&str]) -> bool {
        self.topic.len() >= expected.len()
            && self.topic.iter().zip(expected).all(|(a, b)| a == b)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Fetch a field that must be present
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| SamError::MissingField {
            field: key.to_string(),
            response: self.raw.clone(),
        })
    }

    pub fn result(&self) -> Option<&str> {
        self.get("RESULT")
    }

    pub fn is_ok(&self) -> bool {
        self.result() == Some("OK")
    }

    /// Check the topic and `RESULT=OK`, turning anything else into a
    /// protocol error that carries the raw reply
    pub fn expect_ok(self, command: &str, topic: &[&str]) -> Result<Self> {
        if !self.has_topic(topic) {
            return Err(SamError::UnexpectedReply {
                command: command.to_string(),
                response: self.raw,
            });
        }
        if !self.is_ok() {
            return Err(SamError::Protocol {
                command: command.to_string(),
                result: self.result().unwrap_or("NONE").to_string(),
                response: self.raw,
            });
        }
        Ok(self)
    }
}

fn tokenize(line: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ' ' | '\t' if !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }

    if in_quotes {
        return Err(SamError::MalformedReply(line.to_string()));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}
