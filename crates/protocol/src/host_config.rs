//! Host configuration served at [`HOST_CONFIG_PATH`](crate::constants::HOST_CONFIG_PATH).

use serde::{Deserialize, Serialize};

/// Host settings the backend hands to the client before the stream opens.
///
/// Every field is optional on the wire; unknown fields are ignored so newer
/// servers stay readable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostConfig {
    /// Origins allowed to exchange messages with the embedding host.
    /// A leading `*.` label matches exactly one subdomain label.
    pub allowed_origins: Vec<String>,
    pub use_external_auth_token: bool,
    pub enable_custom_parent_messages: bool,
    pub enforce_download_in_new_tab: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_url: Option<String>,
    pub block_error_dialogs: bool,
    pub disable_fullscreen_mode: bool,
}

impl HostConfig {
    /// Returns `true` if `origin` matches any entry of `allowed_origins`.
    pub fn is_allowed_origin(&self, origin: &str) -> bool {
        self.allowed_origins
            .iter()
            .any(|pattern| origin_matches(pattern, origin))
    }
}

/// Scheme, host and port of an origin string.
#[derive(Debug, PartialEq)]
struct Origin<'a> {
    scheme: &'a str,
    host: &'a str,
    port: Option<&'a str>,
}

fn parse_origin(s: &str) -> Option<Origin<'_>> {
    let (scheme, rest) = s.split_once("://")?;
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if scheme.is_empty() || authority.is_empty() {
        return None;
    }
    let (host, port) = match authority.rsplit_once(':') {
        // Bracketed IPv6 literals contain colons of their own.
        Some((h, p)) if !p.contains(']') => (h, Some(p)),
        _ => (authority, None),
    };
    Some(Origin { scheme, host, port })
}

/// Matches one origin against an allowed-origin pattern.
pub fn origin_matches(pattern: &str, origin: &str) -> bool {
    let (Some(allowed), Some(candidate)) = (parse_origin(pattern), parse_origin(origin)) else {
        return false;
    };
    if !allowed.scheme.eq_ignore_ascii_case(candidate.scheme) || allowed.port != candidate.port {
        return false;
    }
    if allowed.host.eq_ignore_ascii_case(candidate.host) {
        return true;
    }

    let mut allowed_labels = allowed.host.split('.');
    let mut candidate_labels = candidate.host.split('.');
    if allowed_labels.next() != Some("*") || candidate_labels.next().is_none_or(str::is_empty) {
        return false;
    }
    let allowed_rest: Vec<_> = allowed_labels.collect();
    let candidate_rest: Vec<_> = candidate_labels.collect();
    !allowed_rest.is_empty()
        && allowed_rest.len() == candidate_rest.len()
        && allowed_rest
            .iter()
            .zip(&candidate_rest)
            .all(|(a, c)| a.eq_ignore_ascii_case(c))
}
