//! `BrowserController`: manages a single headless browser process and
//! hands out scoped `Page` handles with request interception wired up.
//!
//! Grounded in the single-process launch/handler-task/graceful-close shape
//! used by chromiumoxide PoCs in the reference corpus (snapvrt's
//! `ManagedBrowser`), the two-stage Fetch-domain interception (request stage
//! decides continue/abort/fulfill, response stage fetches the real body via
//! `Fetch.getResponseBody`) from the rdr-parent-cache browser server, and
//! the request/response event bookkeeping style from webfetch's `browser.rs`.

use crate::config::{chrome_args, Timeouts};
use crate::error::PercyError;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetScriptExecutionDisabledParams;
use chromiumoxide::cdp::browser_protocol::fetch::{
    self, ContinueRequestParams, EventRequestPaused, FailRequestParams, FulfillRequestParams,
    GetResponseBodyParams, HeaderEntry, RequestPattern, RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::{
    self, ErrorReason, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
    SetDeviceMetricsOverrideParams,
};
use chromiumoxide::Page;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The synchronous decision the interception hook makes for every request
/// at the point it is paused before being sent.
#[derive(Debug, Clone)]
pub enum InterceptAction {
    Continue,
    Abort,
    Fulfill { body: Vec<u8>, mimetype: String },
}

/// The per-page interception contract. `decide` is the request-stage hook;
/// `on_response` is an asynchronous body-fetch callback, invoked once
/// `BrowserController` has already pulled the body over the protocol, so
/// implementors never touch CDP directly.
#[async_trait]
pub trait InterceptHooks: Send + Sync {
    /// `request_id` is the CDP `Fetch.requestId`, stable across a redirect
    /// chain for the same logical request. Callers that want to record
    /// captures under the *original* URL despite a redirect should key
    /// state off it rather than off `url`.
    async fn decide(&self, request_id: &str, url: &str, is_prefetch: bool) -> InterceptAction;

    /// Whether the controller should bother fetching the response body at
    /// all for `url` (avoids a `Fetch.getResponseBody` round trip for
    /// requests the hook already decided not to capture).
    async fn wants_capture(&self, request_id: &str, url: &str, is_prefetch: bool) -> bool;

    async fn on_response(&self, request_id: &str, url: &str, mimetype: &str, body: Vec<u8>);

    async fn on_error(&self, _request_id: &str, _url: &str, _message: &str) {}
}

pub struct NoopIntercept;

#[async_trait]
impl InterceptHooks for NoopIntercept {
    async fn decide(&self, _request_id: &str, _url: &str, _is_prefetch: bool) -> InterceptAction {
        InterceptAction::Continue
    }

    async fn wants_capture(&self, _request_id: &str, _url: &str, _is_prefetch: bool) -> bool {
        false
    }

    async fn on_response(&self, _request_id: &str, _url: &str, _mimetype: &str, _body: Vec<u8>) {}
}

#[derive(Clone)]
pub struct PageOptions {
    pub width: u32,
    pub height: u32,
    pub request_headers: std::collections::HashMap<String, String>,
    pub network_idle_timeout: Duration,
    pub intercept: Arc<dyn InterceptHooks>,
}

fn mimetype_from_headers(headers: Option<&[HeaderEntry]>) -> String {
    headers
        .and_then(|entries| {
            entries.iter().find_map(|entry| {
                if entry.name.eq_ignore_ascii_case("content-type") {
                    Some(entry.value.split(';').next().unwrap_or("").trim().to_string())
                } else {
                    None
                }
            })
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

async fn continue_request(page: &Page, event: &EventRequestPaused) {
    if let Err(e) = page
        .execute(ContinueRequestParams::new(event.request_id.clone()))
        .await
    {
        debug!("continue_request failed (non-fatal): {e}");
    }
}

async fn fail_request(page: &Page, event: &EventRequestPaused, reason: ErrorReason) {
    if let Err(e) = page
        .execute(FailRequestParams {
            request_id: event.request_id.clone(),
            error_reason: reason,
        })
        .await
    {
        debug!("fail_request failed (non-fatal): {e}");
    }
}

async fn fulfill_request(page: &Page, event: &EventRequestPaused, mimetype: &str, body: &[u8]) {
    let headers = vec![HeaderEntry {
        name: "content-type".to_string(),
        value: mimetype.to_string(),
    }];
    let encoded = STANDARD.encode(body);
    if let Err(e) = page
        .execute(FulfillRequestParams {
            request_id: event.request_id.clone(),
            response_code: 200,
            response_headers: Some(headers),
            binary_response_headers: None,
            body: Some(encoded),
            response_phrase: None,
        })
        .await
    {
        debug!("fulfill_request failed (non-fatal): {e}");
    }
}

/// Drains `Fetch.requestPaused` events for one page: request-stage events
/// call `hooks.decide`; response-stage events fetch the body over the
/// protocol and hand it to `hooks.on_response`.
async fn run_intercept_loop(page: Page, hooks: Arc<dyn InterceptHooks>) {
    let mut paused = match page.event_listener::<EventRequestPaused>().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("failed to subscribe to Fetch.requestPaused: {e}");
            return;
        }
    };

    while let Some(event) = paused.next().await {
        let url = event.request.url.clone();
        let request_id = event.request_id.to_string();
        let is_prefetch = matches!(event.resource_type, network::ResourceType::Prefetch);

        if event.response_status_code.is_none() {
            match hooks.decide(&request_id, &url, is_prefetch).await {
                InterceptAction::Abort => fail_request(&page, &event, ErrorReason::BlockedByClient).await,
                InterceptAction::Continue => continue_request(&page, &event).await,
                InterceptAction::Fulfill { body, mimetype } => {
                    fulfill_request(&page, &event, &mimetype, &body).await
                }
            }
            continue;
        }

        if hooks.wants_capture(&request_id, &url, is_prefetch).await {
            match page
                .execute(GetResponseBodyParams::new(event.request_id.clone()))
                .await
            {
                Ok(resp) => {
                    let body = if resp.result.base64_encoded {
                        STANDARD.decode(&resp.result.body).unwrap_or_default()
                    } else {
                        resp.result.body.clone().into_bytes()
                    };
                    let mimetype = mimetype_from_headers(event.response_headers.as_deref());
                    hooks.on_response(&request_id, &url, &mimetype, body).await;
                }
                Err(e) => hooks.on_error(&request_id, &url, &e.to_string()).await,
            }
        }

        continue_request(&page, &event).await;
    }
}

async fn track_network_idle(page: Page, in_flight: Arc<AtomicI64>) {
    let mut will_be_sent = match page.event_listener::<EventRequestWillBeSent>().await {
        Ok(s) => s,
        Err(_) => return,
    };
    let mut finished = match page.event_listener::<EventLoadingFinished>().await {
        Ok(s) => s,
        Err(_) => return,
    };
    let mut failed = match page.event_listener::<EventLoadingFailed>().await {
        Ok(s) => s,
        Err(_) => return,
    };

    let a = in_flight.clone();
    let t1 = tokio::spawn(async move {
        while (will_be_sent.next().await).is_some() {
            a.fetch_add(1, Ordering::SeqCst);
        }
    });
    let b = in_flight.clone();
    let t2 = tokio::spawn(async move {
        while (finished.next().await).is_some() {
            b.fetch_sub(1, Ordering::SeqCst);
        }
    });
    let c = in_flight.clone();
    let t3 = tokio::spawn(async move {
        while (failed.next().await).is_some() {
            c.fetch_sub(1, Ordering::SeqCst);
        }
    });
    let _ = tokio::join!(t1, t2, t3);
}

/// A scoped page. Closed on every exit path by the discoverer that opened
/// it; `Drop` is a last-resort safety net, not the primary close path, so
/// it only logs; it can't await.
pub struct PageHandle {
    page: Page,
    in_flight: Arc<AtomicI64>,
    background: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PageHandle {
    pub async fn goto(&self, url: &str, timeout: Duration) -> Result<(), PercyError> {
        tokio::time::timeout(timeout, self.page.goto(url))
            .await
            .map_err(|_| PercyError::NavigationError {
                url: url.to_string(),
                reason: "navigation timed out".to_string(),
            })?
            .map_err(|e| PercyError::NavigationError {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    pub async fn evaluate(&self, js: &str) -> Result<(), PercyError> {
        self.page
            .evaluate(js)
            .await
            .map_err(|e| PercyError::NavigationError {
                url: "<evaluate>".to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    /// Toggles page script execution. Applied as a distinct step rather
    /// than baked into page setup, so a `domSnapshot` rewrite's own
    /// `evaluate` call always runs even when the snapshot asks for
    /// JavaScript to be disabled afterward.
    pub async fn set_scripts_enabled(&self, enabled: bool) -> Result<(), PercyError> {
        self.page
            .execute(SetScriptExecutionDisabledParams { value: !enabled })
            .await
            .map_err(|e| PercyError::BrowserLaunchError(e.to_string()))?;
        Ok(())
    }

    /// Blocks until no request has been in flight for `idle_window`, or
    /// `deadline` elapses, whichever comes first. A timeout here is not
    /// fatal to the caller; it logs and moves on.
    pub async fn wait_network_idle(&self, idle_window: Duration, deadline: Duration) -> Result<(), PercyError> {
        let start = tokio::time::Instant::now();
        let mut idle_since: Option<tokio::time::Instant> = None;
        loop {
            let now = tokio::time::Instant::now();
            if now.duration_since(start) > deadline {
                return Err(PercyError::Timeout(deadline));
            }
            if self.in_flight.load(Ordering::SeqCst) <= 0 {
                let since = *idle_since.get_or_insert(now);
                if now.duration_since(since) >= idle_window {
                    return Ok(());
                }
            } else {
                idle_since = None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for handle in self.background.lock().await.drain(..) {
            handle.abort();
        }
        if let Err(e) = self.page.close().await {
            debug!("page close error (non-fatal): {e}");
        }
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            warn!("PageHandle dropped without an explicit close(), leaked target");
        }
    }
}

pub struct BrowserController {
    browser: Mutex<Option<Browser>>,
    handler: Mutex<Option<JoinHandle<()>>>,
    user_data_dir: std::path::PathBuf,
    timeouts: Timeouts,
    launched: AtomicBool,
}

impl BrowserController {
    pub fn new(timeouts: Timeouts) -> Self {
        let user_data_dir = std::env::temp_dir().join(format!("percy-{}", std::process::id()));
        Self {
            browser: Mutex::new(None),
            handler: Mutex::new(None),
            user_data_dir,
            timeouts,
            launched: AtomicBool::new(false),
        }
    }

    /// Idempotent: starts the process, attaches to its debugging endpoint,
    /// waits for readiness. Fails with `BrowserLaunchError` on timeout or
    /// executable absence.
    pub async fn launch(&self) -> Result<(), PercyError> {
        if self.launched.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let config = BrowserConfig::builder()
            .args(chrome_args(&self.user_data_dir))
            .build()
            .map_err(PercyError::BrowserLaunchError)?;

        let (browser, mut handler) = tokio::time::timeout(self.timeouts.browser_launch, Browser::launch(config))
            .await
            .map_err(|_| PercyError::BrowserLaunchError("launch timed out".to_string()))?
            .map_err(|e| PercyError::BrowserLaunchError(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        *self.browser.lock().await = Some(browser);
        *self.handler.lock().await = Some(handler_task);
        info!("browser launched");
        Ok(())
    }

    /// Opens a new target, applies the viewport and JS toggle, installs
    /// Fetch-domain interception driven by `opts.intercept`, and returns a
    /// scoped page handle.
    pub async fn page(&self, opts: PageOptions) -> Result<PageHandle, PercyError> {
        let guard = self.browser.lock().await;
        let browser = guard
            .as_ref()
            .ok_or_else(|| PercyError::BrowserLaunchError("browser not launched".to_string()))?;

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| PercyError::BrowserLaunchError(e.to_string()))?;

        page.execute(
            SetDeviceMetricsOverrideParams::builder()
                .width(opts.width as i64)
                .height(opts.height as i64)
                .device_scale_factor(1.0)
                .mobile(false)
                .build()
                .map_err(PercyError::BrowserLaunchError)?,
        )
        .await
        .map_err(|e| PercyError::BrowserLaunchError(e.to_string()))?;

        if !opts.request_headers.is_empty() {
            page.set_extra_http_headers(opts.request_headers.clone())
                .await
                .map_err(|e| PercyError::BrowserLaunchError(e.to_string()))?;
        }

        page.execute(
            fetch::EnableParams::builder()
                .patterns(
                    [
                        RequestPattern::builder()
                            .url_pattern("*")
                            .request_stage(RequestStage::Request)
                            .build(),
                        RequestPattern::builder()
                            .url_pattern("*")
                            .request_stage(RequestStage::Response)
                            .build(),
                    ]
                    .into_iter(),
                )
                .build(),
        )
        .await
        .map_err(|e| PercyError::BrowserLaunchError(e.to_string()))?;

        page.execute(network::EnableParams::default())
            .await
            .map_err(|e| PercyError::BrowserLaunchError(e.to_string()))?;

        let in_flight = Arc::new(AtomicI64::new(0));
        let intercept_task = tokio::spawn(run_intercept_loop(page.clone(), opts.intercept));
        let idle_task = tokio::spawn(track_network_idle(page.clone(), in_flight.clone()));

        Ok(PageHandle {
            page,
            in_flight,
            background: Mutex::new(vec![intercept_task, idle_task]),
            closed: AtomicBool::new(false),
        })
    }

    /// Closes all pages then tears down the browser; idempotent.
    pub async fn close(&self) {
        let mut guard = self.browser.lock().await;
        if let Some(browser) = guard.take() {
            if let Err(e) = browser.close().await {
                debug!("browser close error (non-fatal): {e}");
            }
        }
        drop(guard);

        if let Some(handle) = self.handler.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.launched.store(false, Ordering::SeqCst);
    }
}
