//! Small, dependency-free helpers shared across the discoverer and config
//! validation: URL/hostname extraction and hostname glob matching.

use url::Url;

pub fn extract_hostname(url: &str) -> Option<String> {
    Url::parse(url).ok().and_then(|u| u.host_str().map(|h| h.to_string()))
}

pub fn is_same_host(url1: &str, url2: &str) -> bool {
    match (extract_hostname(url1), extract_hostname(url2)) {
        (Some(h1), Some(h2)) => h1 == h2,
        _ => false,
    }
}

/// Hostname glob matching: `*` matches exactly one label, a leading `*.`
/// matches any (possibly empty chain of) subdomain labels, and a bare `*`
/// matches everything.
pub fn hostname_matches(pattern: &str, hostname: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return hostname == suffix || hostname.ends_with(&format!(".{suffix}"));
    }
    let pattern_labels: Vec<&str> = pattern.split('.').collect();
    let hostname_labels: Vec<&str> = hostname.split('.').collect();
    if pattern_labels.len() != hostname_labels.len() {
        return false;
    }
    pattern_labels
        .iter()
        .zip(hostname_labels.iter())
        .all(|(p, h)| *p == "*" || p == h)
}

pub fn hostname_matches_any(patterns: &[String], hostname: &str) -> bool {
    patterns.iter().any(|p| hostname_matches(p, hostname))
}

pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;
    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }
    if unit_index == 0 {
        format!("{bytes} {}", UNITS[unit_index])
    } else {
        format!("{size:.1}{}", UNITS[unit_index])
    }
}
