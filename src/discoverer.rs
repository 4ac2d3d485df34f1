//! `AssetDiscoverer`: per-snapshot discovery across widths, routing,
//! filtering, body fetch, and sha-keyed dedup.
//!
//! The routing table and dedup/ordering rules are pure functions so they
//! can be exercised without a live browser. Per-width capture is driven by
//! `DiscoveryHooks`, an `InterceptHooks` implementation that turns routing
//! decisions into `BrowserController` actions and records captured bodies.

use crate::browser_controller::{BrowserController, InterceptAction, InterceptHooks, PageOptions};
use crate::config::{DiscoveryConfig, Timeouts};
use crate::error::PercyError;
use crate::model::{mimetype_accepted, Resource, ResponseCacheEntry, Snapshot, MAX_RESOURCE_BYTES};
use crate::response_cache::ResponseCache;
use crate::utils::{extract_hostname, hostname_matches_any, is_same_host};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Narrow fault-injection seam: a test double can observe every decision
/// the discoverer makes without mutating private fields.
pub trait DiscovererHooks: Send + Sync {
    fn on_request(&self, _url: &str) {}
    fn on_finished(&self, _url: &str, _status: u16) {}
    fn on_error(&self, _url: &str, _message: &str) {}
}

pub struct NoopHooks;
impl DiscovererHooks for NoopHooks {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Non-network scheme (data/blob/file): abort capture, continue request.
    AbortNonNetwork,
    /// Prefetch/preload hint: continue, do not capture.
    ContinuePassthrough,
    /// This request *is* the snapshot root.
    ServeRoot,
    /// Same-origin or explicitly allow-listed: capture.
    Capture,
    /// Matches a disallowed pattern: abort the request entirely.
    AbortDisallowed,
    /// External, not allow-listed: continue, do not capture.
    ContinueExternal,
}

/// The routing decision table. `r` is the request URL, `u` is the
/// snapshot's root URL.
pub fn route_request(
    r: &str,
    u: &str,
    discovery: &DiscoveryConfig,
    is_prefetch: bool,
) -> RoutingDecision {
    if r.starts_with("data:") || r.starts_with("blob:") || r.starts_with("file:") {
        return RoutingDecision::AbortNonNetwork;
    }

    if let Some(host) = extract_hostname(r) {
        if hostname_matches_any(&discovery.disallowed_hostnames, &host) {
            return RoutingDecision::AbortDisallowed;
        }
    }

    if is_prefetch {
        return RoutingDecision::ContinuePassthrough;
    }

    if r == u {
        return RoutingDecision::ServeRoot;
    }

    if is_same_host(r, u) {
        return RoutingDecision::Capture;
    }

    if let Some(host) = extract_hostname(r) {
        if hostname_matches_any(&discovery.allowed_hostnames, &host) {
            return RoutingDecision::Capture;
        }
    }

    RoutingDecision::ContinueExternal
}

/// One intercepted request/response pair, used by the pure invariant checks
/// below (size cap, mimetype allowlist).
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub url: String,
    pub content: Vec<u8>,
    pub mimetype: String,
}

/// Applies the post-capture invariants: size cap and mimetype allowlist
/// (root is exempt from the mimetype allowlist).
pub fn accept_capture(captured: &CapturedResponse, is_root: bool) -> Result<(), String> {
    if captured.content.len() > MAX_RESOURCE_BYTES {
        return Err(format!(
            "Skipping - Max file size exceeded [{:.1}MB]",
            captured.content.len() as f64 / (1024.0 * 1024.0)
        ));
    }
    if !is_root && !mimetype_accepted(&captured.mimetype) {
        return Err(format!("Skipping - mimetype not accepted: {}", captured.mimetype));
    }
    Ok(())
}

/// Deduplicates by sha and orders root-first, then ascending sha.
pub fn dedup_and_order(resources: Vec<Resource>) -> Vec<Resource> {
    let mut by_sha: HashMap<String, Resource> = HashMap::new();
    for resource in resources {
        by_sha
            .entry(resource.sha.clone())
            .and_modify(|existing| {
                existing.for_widths.extend(resource.for_widths.iter().copied());
            })
            .or_insert(resource);
    }
    let mut out: Vec<Resource> = by_sha.into_values().collect();
    out.sort_by(|a, b| match (a.root, b.root) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        _ => a.sha.cmp(&b.sha),
    });
    out
}

/// Writes a resource body to `<tmp>/percy/<sha>` at most once per sha.
async fn persist_body(temp_dir: &std::path::Path, sha: &str, content: &[u8]) -> Result<(), PercyError> {
    tokio::fs::create_dir_all(temp_dir).await?;
    let path = temp_dir.join(sha);
    if tokio::fs::metadata(&path).await.is_ok() {
        return Ok(());
    }
    tokio::fs::write(path, content).await?;
    Ok(())
}

/// Per-width `InterceptHooks` implementation: turns routing decisions into
/// `InterceptAction`s and, on capture, records a `Resource`, populates the
/// response cache, and persists the body to the temp directory.
struct DiscoveryHooks {
    root_url: String,
    dom_snapshot: Option<String>,
    discovery: DiscoveryConfig,
    cache: Arc<ResponseCache>,
    width: u32,
    results: Mutex<Vec<Resource>>,
    test_hooks: Arc<dyn DiscovererHooks>,
    temp_dir: std::path::PathBuf,
    /// Maps a CDP request id to the URL first seen for it, so a captured
    /// body is recorded under the originally requested URL even after a
    /// redirect changes `event.request.url`.
    original_urls: Mutex<HashMap<String, String>>,
}

impl DiscoveryHooks {
    async fn remember_original_url(&self, request_id: &str, url: &str) -> String {
        let mut map = self.original_urls.lock().await;
        map.entry(request_id.to_string())
            .or_insert_with(|| url.to_string())
            .clone()
    }

    async fn record(&self, url: String, mimetype: String, content: Vec<u8>, is_root: bool, from_cache: bool) {
        let captured = CapturedResponse {
            url: url.clone(),
            content: content.clone(),
            mimetype: mimetype.clone(),
        };
        if !from_cache {
            if let Err(reason) = accept_capture(&captured, is_root) {
                debug!("{reason}");
                return;
            }
        }

        let resource = Resource::new(url.clone(), content.clone(), mimetype.clone(), is_root, self.width);

        if let Err(e) = persist_body(&self.temp_dir, &resource.sha, &content).await {
            warn!("failed to persist body for {url} ({}): {e}", resource.sha);
        }

        if !from_cache {
            self.cache
                .put(
                    url.clone(),
                    ResponseCacheEntry {
                        sha: resource.sha.clone(),
                        mimetype,
                        content,
                        headers: HashMap::new(),
                    },
                )
                .await;
        }

        self.test_hooks.on_finished(&url, 200);
        self.results.lock().await.push(resource);
    }
}

#[async_trait]
impl InterceptHooks for DiscoveryHooks {
    async fn decide(&self, request_id: &str, url: &str, is_prefetch: bool) -> InterceptAction {
        self.test_hooks.on_request(url);
        self.remember_original_url(request_id, url).await;
        match route_request(url, &self.root_url, &self.discovery, is_prefetch) {
            RoutingDecision::AbortNonNetwork | RoutingDecision::AbortDisallowed => InterceptAction::Abort,
            RoutingDecision::ContinuePassthrough | RoutingDecision::ContinueExternal => InterceptAction::Continue,
            RoutingDecision::ServeRoot => match &self.dom_snapshot {
                Some(dom) => {
                    let bytes = dom.clone().into_bytes();
                    self.record(url.to_string(), "text/html".to_string(), bytes.clone(), true, false)
                        .await;
                    InterceptAction::Fulfill {
                        body: bytes,
                        mimetype: "text/html".to_string(),
                    }
                }
                None => InterceptAction::Continue,
            },
            RoutingDecision::Capture => {
                if let Some(cached) = self.cache.get(url).await {
                    self.record(url.to_string(), cached.mimetype.clone(), cached.content.clone(), false, true)
                        .await;
                    InterceptAction::Fulfill {
                        body: cached.content,
                        mimetype: cached.mimetype,
                    }
                } else {
                    InterceptAction::Continue
                }
            }
        }
    }

    async fn wants_capture(&self, _request_id: &str, url: &str, is_prefetch: bool) -> bool {
        if url == self.root_url {
            return self.dom_snapshot.is_none();
        }
        matches!(
            route_request(url, &self.root_url, &self.discovery, is_prefetch),
            RoutingDecision::Capture
        )
    }

    async fn on_response(&self, request_id: &str, url: &str, mimetype: &str, body: Vec<u8>) {
        let original_url = self.remember_original_url(request_id, url).await;
        let is_root = original_url == self.root_url;
        self.record(original_url, mimetype.to_string(), body, is_root, false).await;
    }

    async fn on_error(&self, request_id: &str, url: &str, message: &str) {
        debug!("capture failed for {url}: {message}");
        let original_url = self.remember_original_url(request_id, url).await;
        self.test_hooks.on_error(&original_url, message);
    }
}

pub struct AssetDiscoverer {
    browser: Arc<BrowserController>,
    cache: Arc<ResponseCache>,
    discovery: DiscoveryConfig,
    timeouts: Timeouts,
    percy_css: String,
    hooks: Arc<dyn DiscovererHooks>,
    temp_dir: std::path::PathBuf,
}

impl AssetDiscoverer {
    pub fn new(
        browser: Arc<BrowserController>,
        cache: Arc<ResponseCache>,
        discovery: DiscoveryConfig,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            browser,
            cache,
            discovery,
            timeouts,
            percy_css: String::new(),
            hooks: Arc::new(NoopHooks),
            temp_dir: std::env::temp_dir().join("percy"),
        }
    }

    pub fn with_percy_css(mut self, percy_css: String) -> Self {
        self.percy_css = percy_css;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn DiscovererHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Runs discovery for every width in order, returning the deduplicated
    /// resource list.
    pub async fn run(&self, snapshot: &Snapshot) -> Result<Vec<Resource>, PercyError> {
        let mut all_resources = Vec::new();

        for &width in &snapshot.widths {
            let width_resources = self.run_width(snapshot, width).await?;
            all_resources.extend(width_resources);
        }

        info!(
            "discovery complete for {}: {} resources across {} widths",
            snapshot.name,
            all_resources.len(),
            snapshot.widths.len()
        );
        Ok(dedup_and_order(all_resources))
    }

    /// Appends `percyCSS` to a serialized DOM as a `<style>` element,
    /// matching the config-level default carried through from
    /// `snapshot.percyCSS`.
    fn dom_with_percy_css(&self, dom: &str) -> String {
        if self.percy_css.is_empty() {
            dom.to_string()
        } else {
            format!("{dom}<style>{}</style>", self.percy_css)
        }
    }

    async fn run_width(&self, snapshot: &Snapshot, width: u32) -> Result<Vec<Resource>, PercyError> {
        let dom_snapshot = snapshot
            .dom_snapshot
            .as_ref()
            .map(|dom| self.dom_with_percy_css(dom));

        let discovery_hooks = Arc::new(DiscoveryHooks {
            root_url: snapshot.url.clone(),
            dom_snapshot: dom_snapshot.clone(),
            discovery: self.discovery.clone(),
            cache: self.cache.clone(),
            width,
            results: Mutex::new(Vec::new()),
            test_hooks: self.hooks.clone(),
            temp_dir: self.temp_dir.clone(),
            original_urls: Mutex::new(HashMap::new()),
        });

        let mut request_headers = self.discovery.request_headers.clone();
        request_headers.extend(snapshot.request_headers.clone());

        let opts = PageOptions {
            width,
            height: snapshot.min_height,
            request_headers,
            network_idle_timeout: std::time::Duration::from_millis(self.discovery.network_idle_timeout_ms),
            intercept: discovery_hooks.clone(),
        };

        let page = self.browser.page(opts).await?;

        // When there's no DOM snapshot to rewrite, the JS toggle can be
        // applied up front. When there is one, the rewrite itself relies on
        // `evaluate`, so script execution must stay enabled until after that
        // call, then switch to the snapshot's requested state.
        if dom_snapshot.is_none() && !snapshot.enable_javascript {
            if let Err(e) = page.set_scripts_enabled(false).await {
                debug!("failed to disable script execution (non-fatal): {e}");
            }
        }

        let goto_result = page.goto(&snapshot.url, self.timeouts.navigation).await;
        if let Err(e) = goto_result {
            page.close().await;
            return Err(PercyError::SnapshotDiscoveryError(format!(
                "root navigation failed: {e}"
            )));
        }

        if let Some(dom) = &dom_snapshot {
            let escaped = dom.replace('\\', "\\\\").replace('`', "\\`");
            let script = format!("document.open(); document.write(`{escaped}`); document.close();");
            if let Err(e) = page.evaluate(&script).await {
                debug!("dom rewrite evaluate failed (non-fatal): {e}");
            }
            if !snapshot.enable_javascript {
                if let Err(e) = page.set_scripts_enabled(false).await {
                    debug!("failed to disable script execution (non-fatal): {e}");
                }
            }
        }

        let idle_window = std::time::Duration::from_millis(self.discovery.network_idle_timeout_ms);
        if let Err(e) = page.wait_network_idle(idle_window, self.timeouts.navigation).await {
            debug!("network idle wait did not settle for width {width} (non-fatal): {e}");
        }

        page.close().await;

        let resources = discovery_hooks.results.lock().await.clone();
        Ok(resources)
    }
}
