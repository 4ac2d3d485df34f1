//! Wire and in-process data model: `Snapshot`, `Resource`,
//! `ResponseCacheEntry`, `Build`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Mimetypes the discoverer will keep a non-root resource for; anything
/// else is dropped.
pub const ACCEPTED_MIME_PREFIXES: &[&str] = &["text/", "image/", "font/"];
pub const ACCEPTED_MIMES: &[&str] = &[
    "application/javascript",
    "application/json",
    "application/octet-stream",
];

pub const MAX_RESOURCE_BYTES: usize = 15 * 1024 * 1024;

pub fn mimetype_accepted(mimetype: &str) -> bool {
    ACCEPTED_MIME_PREFIXES
        .iter()
        .any(|prefix| mimetype.starts_with(prefix))
        || ACCEPTED_MIMES.contains(&mimetype)
}

pub fn sha256_hex(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SnapshotPayload {
    pub name: String,
    pub url: String,
    pub widths: Vec<u32>,
    #[serde(rename = "minHeight", default)]
    pub min_height: Option<u32>,
    #[serde(rename = "requestHeaders", default)]
    pub request_headers: HashMap<String, String>,
    #[serde(rename = "clientInfo", default)]
    pub client_info: Option<String>,
    #[serde(rename = "environmentInfo", default)]
    pub environment_info: Option<String>,
    #[serde(rename = "domSnapshot", default)]
    pub dom_snapshot: Option<String>,
    #[serde(rename = "enableJavaScript", default)]
    pub enable_javascript: Option<bool>,
    #[serde(default = "default_concurrent")]
    pub concurrent: bool,
}

fn default_concurrent() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    Pending,
    Discovering,
    Uploading,
    Complete,
    Failed,
}

/// A validated, in-process snapshot job built from a `SnapshotPayload`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub name: String,
    pub url: String,
    pub widths: Vec<u32>,
    pub min_height: u32,
    pub request_headers: HashMap<String, String>,
    pub dom_snapshot: Option<String>,
    pub enable_javascript: bool,
    pub concurrent: bool,
}

impl Snapshot {
    /// Validates a payload against the Snapshot schema and fills in the
    /// config-level defaults the payload omitted.
    pub fn from_payload(
        payload: SnapshotPayload,
        defaults: &crate::config::SnapshotDefaults,
    ) -> Result<Self, crate::error::PercyError> {
        use crate::error::PercyError;

        if payload.name.is_empty() {
            return Err(PercyError::ConfigValidationError(
                "snapshot name is required".to_string(),
            ));
        }
        if !payload.url.starts_with("http://") && !payload.url.starts_with("https://") {
            return Err(PercyError::ConfigValidationError(
                "snapshot url must be absolute http(s)".to_string(),
            ));
        }
        let widths = if payload.widths.is_empty() {
            defaults.widths.clone()
        } else {
            payload.widths
        };
        if widths.is_empty() {
            return Err(PercyError::ConfigValidationError(
                "snapshot widths must be non-empty".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for w in &widths {
            if *w == 0 {
                return Err(PercyError::ConfigValidationError(
                    "snapshot width must be positive".to_string(),
                ));
            }
            if !seen.insert(*w) {
                return Err(PercyError::ConfigValidationError(
                    "snapshot widths must not contain duplicates".to_string(),
                ));
            }
        }
        let min_height = payload.min_height.unwrap_or(defaults.min_height).min(2000);
        let has_dom = payload.dom_snapshot.is_some();
        let enable_javascript = payload.enable_javascript.unwrap_or(!has_dom);

        Ok(Self {
            name: payload.name,
            url: payload.url,
            widths,
            min_height,
            request_headers: payload.request_headers,
            dom_snapshot: payload.dom_snapshot,
            enable_javascript,
            concurrent: payload.concurrent,
        })
    }
}

/// A single captured artifact. The tuple (snapshot, sha) is unique,
/// enforced by the discoverer's per-snapshot dedup map, keyed by sha.
#[derive(Debug, Clone, Serialize)]
pub struct Resource {
    pub url: String,
    #[serde(skip)]
    pub content: Vec<u8>,
    pub mimetype: String,
    pub sha: String,
    #[serde(rename = "is-root")]
    pub root: bool,
    #[serde(rename = "forWidths")]
    pub for_widths: std::collections::BTreeSet<u32>,
}

impl Resource {
    pub fn new(url: String, content: Vec<u8>, mimetype: String, root: bool, width: u32) -> Self {
        let sha = sha256_hex(&content);
        let mut for_widths = std::collections::BTreeSet::new();
        for_widths.insert(width);
        Self {
            url,
            content,
            mimetype,
            sha,
            root,
            for_widths,
        }
    }
}

/// A bounded-by-bytes cache entry.
#[derive(Debug, Clone)]
pub struct ResponseCacheEntry {
    pub sha: String,
    pub mimetype: String,
    pub content: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl ResponseCacheEntry {
    pub fn byte_len(&self) -> usize {
        self.content.len()
    }
}

/// Opaque handle returned by the remote API on start. One per PercyCore
/// lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: String,
    pub number: u64,
    pub url: String,
}
