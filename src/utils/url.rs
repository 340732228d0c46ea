// src/utils/url.rs

//! URL and name normalization used to derive record identities.

use std::sync::OnceLock;

use regex::Regex;
use url::{Host, Url};

use crate::error::{AppError, Result};

/// Query parameters that never distinguish one program page from another.
const TRACKING_PARAMS: &[&str] = &["from", "ref", "fbclid", "gclid", "mc_cid", "mc_eid"];

fn rank_prefix() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+\.\s*").ok()).as_ref()
}

/// Normalize a university name for identity comparison.
///
/// Strips a leading ranking prefix ("12. "), collapses whitespace and
/// lowercases. Names containing `::` or ending with `:` are rejected.
///
/// # Examples
/// ```
/// use enricher::utils::url::normalize_name;
///
/// assert_eq!(normalize_name("  3.  Carnegie   Mellon ").unwrap(), "carnegie mellon");
/// ```
pub fn normalize_name(name: &str) -> Result<String> {
    let name = name.trim();
    let trimmed = match rank_prefix() {
        Some(re) => re.replace(name, ""),
        None => name.into(),
    };
    let collapsed = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return Err(AppError::validation("university name is empty"));
    }
    // `::` separates name from url in an identity; a normalized url never
    // starts with ':'.
    if collapsed.contains("::") || collapsed.ends_with(':') {
        return Err(AppError::validation(format!(
            "university name may not contain '::' or end with ':': {collapsed}"
        )));
    }
    Ok(collapsed.to_lowercase())
}

/// Parse a program URL, accepting inputs without a scheme.
///
/// Only `http` and `https` are accepted, and the host must be a domain with
/// at least one dot or an IP literal.
pub fn parse_program_url(raw: &str) -> Result<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(AppError::validation("url is empty"));
    }
    if raw.chars().any(char::is_whitespace) {
        return Err(AppError::validation(format!("url contains whitespace: {raw}")));
    }

    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };

    let url = Url::parse(&candidate)
        .map_err(|e| AppError::validation(format!("malformed url '{raw}': {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(AppError::validation(format!(
                "unsupported url scheme '{other}' in {raw}"
            )));
        }
    }

    match url.host() {
        Some(Host::Domain(domain)) if domain.contains('.') && !domain.ends_with('.') => {}
        Some(Host::Ipv4(_)) | Some(Host::Ipv6(_)) => {}
        _ => return Err(AppError::validation(format!("url has no valid host: {raw}"))),
    }

    Ok(url)
}

/// Canonical form of a program URL for storage and for fetching.
///
/// Drops the fragment, the default port, tracking parameters and any
/// trailing slash; sorts the remaining query pairs.
pub fn canonical_url(url: &Url) -> Url {
    let mut canonical = url.clone();
    canonical.set_fragment(None);
    if canonical.port() == default_port(canonical.scheme()) {
        let _ = canonical.set_port(None);
    }

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        canonical.set_query(None);
    } else {
        canonical.query_pairs_mut().clear().extend_pairs(pairs);
    }

    let path = canonical.path().trim_end_matches('/').to_string();
    canonical.set_path(if path.is_empty() { "/" } else { &path });
    canonical
}

/// The scheme-independent identity form of a URL: `host/path[?query]`.
///
/// # Examples
/// ```
/// use enricher::utils::url::{normalize_url, parse_program_url};
///
/// let url = parse_program_url("http://WWW.MIT.edu/ds/?utm_source=x#top").unwrap();
/// assert_eq!(normalize_url(&url), "mit.edu/ds");
/// ```
pub fn normalize_url(url: &Url) -> String {
    let canonical = canonical_url(url);
    let host = canonical
        .host_str()
        .unwrap_or_default()
        .to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();

    let mut key = host;
    if let Some(port) = canonical.port() {
        key.push_str(&format!(":{port}"));
    }
    let path = canonical.path();
    if path != "/" {
        key.push_str(path);
    }
    if let Some(query) = canonical.query() {
        key.push('?');
        key.push_str(query);
    }
    key
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}
