//! Target URL validation guarding outbound calls against SSRF.
//!
//! The check is purely syntactic: host names are not resolved, so a public
//! name pointing at a private address is not caught here.

use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::{Host, Url};

/// Validation switches, normally taken from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlPolicy {
    /// Reject plain `http`.
    pub enforce_https: bool,
    /// Reject loopback, private, link-local and unspecified hosts.
    pub block_private_networks: bool,
}

impl Default for UrlPolicy {
    fn default() -> Self {
        Self { enforce_https: true, block_private_networks: true }
    }
}

impl UrlPolicy {
    /// Policy that accepts any syntactically valid http(s) URL.
    pub const fn permissive() -> Self {
        Self { enforce_https: false, block_private_networks: false }
    }
}

/// Why a target URL was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UrlValidationError {
    /// Not parseable as a URL.
    #[error("invalid target URL '{url}': {reason}")]
    Malformed {
        /// Offending input
        url: String,
        /// Parser message
        reason: String,
    },

    /// Scheme other than http or https.
    #[error("unsupported URL scheme '{scheme}'")]
    UnsupportedScheme {
        /// Scheme found
        scheme: String,
    },

    /// Plain http while HTTPS is enforced.
    #[error("target URL must use https")]
    HttpsRequired,

    /// The URL has no host component.
    #[error("target URL has no host")]
    MissingHost,

    /// Host is loopback, private or otherwise internal.
    #[error("target host '{host}' is in a blocked network range")]
    BlockedHost {
        /// Offending host
        host: String,
    },
}

impl UrlValidationError {
    /// Stable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Malformed { .. } | Self::MissingHost => "URL_INVALID",
            Self::UnsupportedScheme { .. } => "URL_UNSUPPORTED_SCHEME",
            Self::HttpsRequired => "URL_HTTPS_REQUIRED",
            Self::BlockedHost { .. } => "URL_BLOCKED_HOST",
        }
    }
}

/// Validates `raw` against `policy` and returns the parsed URL.
///
/// # Errors
///
/// Returns the first rule the URL violates.
pub fn validate_target_url(raw: &str, policy: &UrlPolicy) -> Result<Url, UrlValidationError> {
    let url = Url::parse(raw.trim()).map_err(|e| UrlValidationError::Malformed {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "https" => {},
        "http" if !policy.enforce_https => {},
        "http" => return Err(UrlValidationError::HttpsRequired),
        other => return Err(UrlValidationError::UnsupportedScheme { scheme: other.to_string() }),
    }

    let host = url.host().ok_or(UrlValidationError::MissingHost)?;

    if policy.block_private_networks && is_blocked_host(&host) {
        return Err(UrlValidationError::BlockedHost { host: host.to_string() });
    }

    Ok(url)
}

/// Redirect policy for outbound clients.
///
/// Every hop is validated against `policy` like the original target, and
/// the chain stops with an error after `max_redirects` hops. A rejected hop
/// surfaces as a reqwest redirect error whose source is the
/// [`UrlValidationError`].
pub fn redirect_policy(policy: UrlPolicy, max_redirects: usize) -> reqwest::redirect::Policy {
    reqwest::redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() > max_redirects {
            return attempt.error(format!("more than {max_redirects} redirects"));
        }
        match validate_target_url(attempt.url().as_str(), &policy) {
            Ok(_) => attempt.follow(),
            Err(e) => attempt.error(e),
        }
    })
}

fn is_blocked_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(name) => {
            let name = name.trim_end_matches('.').to_ascii_lowercase();
            name == "localhost" || name.ends_with(".localhost")
        },
        Host::Ipv4(addr) => is_blocked_v4(*addr),
        Host::Ipv6(addr) => is_blocked_v6(*addr),
    }
}

fn is_blocked_v4(addr: Ipv4Addr) -> bool {
    addr.is_loopback() || addr.is_private() || addr.is_link_local() || addr.is_unspecified()
}

fn is_blocked_v6(addr: Ipv6Addr) -> bool {
    if let Some(v4) = addr.to_ipv4_mapped() {
        return is_blocked_v4(v4);
    }
    let first = addr.segments()[0];
    addr.is_loopback()
        || addr.is_unspecified()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
}
