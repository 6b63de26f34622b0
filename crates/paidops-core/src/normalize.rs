//! URL comparison keys.

use url::Url;

/// Canonical comparison key for a URL.
///
/// Scheme and host are lower-cased, one leading `www.` label is dropped and a
/// single trailing path slash is removed. Query and fragment are kept as-is.
/// Input that does not parse as an absolute URL still yields a key.
pub fn normalize_url(input: &str) -> String {
    let trimmed = input.trim();
    match Url::parse(trimmed) {
        Ok(parsed) if parsed.has_host() => key_from_parsed(&parsed),
        _ => best_effort_key(trimmed),
    }
}

fn key_from_parsed(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);

    let mut key = format!("{}://{}", url.scheme(), host);
    if let Some(port) = url.port() {
        key.push(':');
        key.push_str(&port.to_string());
    }
    let path = url.path();
    key.push_str(path.strip_suffix('/').unwrap_or(path));
    if let Some(query) = url.query() {
        key.push('?');
        key.push_str(query);
    }
    if let Some(fragment) = url.fragment() {
        key.push('#');
        key.push_str(fragment);
    }
    key
}

fn best_effort_key(input: &str) -> String {
    let (scheme, rest) = match input.split_once("://") {
        Some((scheme, rest)) => (Some(scheme.to_ascii_lowercase()), rest),
        None => (None, input),
    };

    let split_at = rest
        .find(|c: char| matches!(c, '/' | '?' | '#'))
        .unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(split_at);
    let authority = authority.to_ascii_lowercase();
    let authority = authority.strip_prefix("www.").unwrap_or(&authority);

    let suffix_at = tail
        .find(|c: char| matches!(c, '?' | '#'))
        .unwrap_or(tail.len());
    let (path, suffix) = tail.split_at(suffix_at);
    let path = path.strip_suffix('/').unwrap_or(path);

    match scheme {
        Some(scheme) => format!("{scheme}://{authority}{path}{suffix}"),
        None => format!("{authority}{path}{suffix}"),
    }
}

/// Build an absolute URL from a site base URL and a path from the analytics table.
pub fn join_base_and_path(base_url: &str, path: &str) -> String {
    let path = path.trim();
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim().trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
