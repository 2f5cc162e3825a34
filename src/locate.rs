use axum::http::header::COOKIE;
use axum::http::HeaderMap;

use crate::config::LocationRule;

/// Finds the raw token in request headers by scanning the configured locations in order.
#[derive(Debug, Clone)]
pub struct CredentialLocator {
    rules: Vec<LocationRule>,
}

impl CredentialLocator {
    pub fn new(rules: Vec<LocationRule>) -> Self {
        Self { rules }
    }

    /// The rules in evaluation order.
    pub fn rules(&self) -> &[LocationRule] {
        &self.rules
    }

    /// Returns the token of the first rule yielding a non-empty value.
    pub fn locate<'h>(&self, headers: &'h HeaderMap) -> Option<&'h str> {
        self.rules
            .iter()
            .find_map(|rule| extract(rule, headers).filter(|token| !token.is_empty()))
    }
}

fn extract<'h>(rule: &LocationRule, headers: &'h HeaderMap) -> Option<&'h str> {
    match rule {
        LocationRule::Header { name, value_prefix } => {
            let value = headers.get(name.as_str())?.to_str().ok()?;
            match value_prefix {
                Some(prefix) => value.strip_prefix(prefix.as_str()),
                None => Some(value),
            }
        }
        LocationRule::Cookie { name } => headers
            .get(COOKIE)?
            .to_str()
            .ok()?
            .split("; ")
            .filter_map(|pair| pair.split_once('='))
            .find(|(cookie, _)| *cookie == name.as_str())
            .map(|(_, value)| value),
    }
}
