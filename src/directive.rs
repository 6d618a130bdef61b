//! In-band rewrite directives carried in the `User-Agent` header.
//!
//! A client asks the proxy to dial a different destination by sending
//!
//! ```text
//! User-Agent: [RULE]<key>@<destination>$<original-user-agent>
//! ```
//!
//! The proxy stores `key -> destination` in the [`RuleTable`] and forwards
//! only `<original-user-agent>` upstream. Anything that does not fit the
//! format is left alone.

use http::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, trace};

use crate::rules::RuleTable;

pub const RULE_MARKER: &str = "[RULE]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Directive<'a> {
    pub key: &'a str,
    pub destination: &'a str,
    pub user_agent: &'a str,
}

/// Splits a `User-Agent` value into a directive, or `None` when malformed.
pub fn parse(user_agent: &str) -> Option<Directive<'_>> {
    if user_agent.len() <= RULE_MARKER.len() {
        return None;
    }
    let rest = user_agent.strip_prefix(RULE_MARKER)?;
    let end = rest.find('$')?;

    let mut segments = rest[..end].split('@');
    let (key, destination) = match (segments.next(), segments.next(), segments.next()) {
        (Some(key), Some(destination), None) if !key.is_empty() && !destination.is_empty() => {
            (key, destination)
        }
        _ => return None,
    };

    Some(Directive {
        key,
        destination,
        user_agent: &rest[end + 1..],
    })
}

/// Records the directive found in `headers`, if any, and restores the
/// client's real `User-Agent`.
///
/// Returns `true` when a rule was stored. A malformed directive leaves both
/// the table and the headers untouched.
pub fn apply(rules: &RuleTable, headers: &mut HeaderMap) -> bool {
    let Some(value) = headers.get(USER_AGENT) else {
        return false;
    };
    let Ok(raw) = std::str::from_utf8(value.as_bytes()) else {
        return false;
    };
    let Some(directive) = parse(raw) else {
        if raw.starts_with(RULE_MARKER) {
            trace!(user_agent = raw, "ignoring malformed rule directive");
        }
        return false;
    };
    let Ok(restored) = HeaderValue::from_bytes(directive.user_agent.as_bytes()) else {
        return false;
    };

    debug!(
        key = directive.key,
        destination = directive.destination,
        "rule stored"
    );
    rules.store(directive.key, directive.destination);
    headers.insert(USER_AGENT, restored);
    true
}
