//! `PercyCore`: lifecycle (start/idle/stop), owns every other component,
//! creates the build, and drives the snapshot queue.
//!
//! Grounded in the teacher's `ScreenshotService` (owns the browser pool,
//! config, and a circuit breaker) and `CliRunner`'s construction/shutdown
//! sequencing in `main.rs`.

use crate::browser_controller::BrowserController;
use crate::build_client::BuildClient;
use crate::config::Config;
use crate::discoverer::AssetDiscoverer;
use crate::error::PercyError;
use crate::model::{Build, Snapshot, SnapshotPayload};
use crate::queue::SnapshotQueue;
use crate::response_cache::ResponseCache;
use crate::server::{self, AppState};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub type LogReloadHandle =
    tracing_subscriber::reload::Handle<tracing_subscriber::EnvFilter, tracing_subscriber::Registry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

pub struct PercyCore {
    config: RwLock<Config>,
    state: RwLock<CoreState>,
    browser: Arc<BrowserController>,
    cache: Arc<ResponseCache>,
    queue: Arc<SnapshotQueue>,
    build_client: Arc<dyn BuildClient>,
    build: RwLock<Option<Build>>,
    server_handle: RwLock<Option<JoinHandle<()>>>,
    log_reload: Option<LogReloadHandle>,
}

impl PercyCore {
    pub fn new(config: Config, build_client: Arc<dyn BuildClient>, log_reload: Option<LogReloadHandle>) -> Self {
        let timeouts = crate::config::Timeouts::default();
        let concurrency = config.discovery.concurrency;
        let disable_cache = config.discovery.disable_asset_cache;

        Self {
            browser: Arc::new(BrowserController::new(timeouts)),
            cache: Arc::new(ResponseCache::new(None, disable_cache)),
            queue: Arc::new(SnapshotQueue::new(concurrency)),
            build_client,
            build: RwLock::new(None),
            server_handle: RwLock::new(None),
            log_reload,
            config: RwLock::new(config),
            state: RwLock::new(CoreState::Idle),
        }
    }

    /// Validates config, creates a build, launches the browser, starts the
    /// control server (unless `server: false`), transitions to Running.
    /// Idempotent: re-entrant calls return the existing build. Takes
    /// `Arc<Self>` because the control server needs to share ownership of
    /// the core to dispatch `/percy/*` calls back into it.
    pub async fn start(self: &Arc<Self>) -> Result<Build, PercyError> {
        {
            let state = self.state.read().await;
            if *state == CoreState::Running {
                if let Some(build) = self.build.read().await.clone() {
                    return Ok(build);
                }
            }
        }

        let config = self.config.read().await.clone();
        config.validate()?;

        let build = self.build_client.create_build().await?;
        *self.build.write().await = Some(build.clone());

        // PERCY_ENABLE=0: the daemon still answers control-plane calls and
        // reports a build, but never launches Chrome. snapshot() short
        // circuits to a no-op success instead of discovering anything.
        if config.enabled {
            self.browser.launch().await?;
        } else {
            info!("percy-core disabled via PERCY_ENABLE=0; capture is a no-op");
        }

        if config.server {
            let app_state = AppState::new(self.clone());
            let port = config.port;
            let handle = tokio::spawn(async move {
                if let Err(e) = server::serve(app_state, port).await {
                    error!("control server exited with error: {e}");
                }
            });
            *self.server_handle.write().await = Some(handle);
        }

        *self.state.write().await = CoreState::Running;
        info!("percy core started, build {}", build.id);
        Ok(build)
    }

    /// Validates payload, enqueues a discovery job, returns synchronously
    /// after enqueue. Only accepted while Running.
    pub async fn snapshot(&self, payload: SnapshotPayload) -> Result<(), PercyError> {
        if *self.state.read().await != CoreState::Running {
            return Err(PercyError::NotRunningError);
        }

        let config = self.config.read().await.clone();
        let snapshot = Snapshot::from_payload(payload, &config.snapshot)?;

        if !config.enabled {
            info!("skipping snapshot {} (PERCY_ENABLE=0)", snapshot.name);
            return Ok(());
        }

        let concurrent = snapshot.concurrent;

        let discoverer = AssetDiscoverer::new(
            self.browser.clone(),
            self.cache.clone(),
            config.discovery.clone(),
            crate::config::Timeouts::default(),
        )
        .with_percy_css(config.snapshot.percy_css.clone());
        let build_client = self.build_client.clone();
        let build_id = self
            .build
            .read()
            .await
            .as_ref()
            .map(|b| b.id.clone())
            .ok_or(PercyError::NotRunningError)?;

        let job_name = snapshot.name.clone();
        let job = async move {
            let resources = discoverer.run(&snapshot).await?;
            build_client
                .create_snapshot(&build_id, &snapshot.name, &snapshot.widths, &resources)
                .await
                .map(|_| ())
        };

        if concurrent {
            let queue = self.queue.clone();
            tokio::spawn(async move {
                match queue.push(job).await {
                    Ok(Err(e)) => warn!("snapshot job failed for {job_name}: {e}"),
                    Err(e) => warn!("snapshot job failed for {job_name}: {e}"),
                    Ok(Ok(())) => {}
                }
            });
            Ok(())
        } else {
            // The non-concurrent path surfaces discovery/upload failure to
            // the caller (and from there, `server::snapshot` to a 500)
            // instead of swallowing it the way the fire-and-forget path
            // does.
            self.queue.push(job).await?
        }
    }

    pub async fn idle(&self) {
        self.queue.idle().await;
    }

    /// Awaits idle, finalizes the build, closes browser and server.
    /// Idempotent; subsequent calls are no-ops.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().await;
            if *state == CoreState::Stopped || *state == CoreState::Stopping {
                return;
            }
            *state = CoreState::Stopping;
        }

        self.queue.stop(true).await;

        if let Some(build) = self.build.read().await.clone() {
            if let Err(e) = self.build_client.finalize_build(&build.id).await {
                warn!("finalize_build failed: {e}");
            }
        }

        self.browser.close().await;

        if let Some(handle) = self.server_handle.write().await.take() {
            handle.abort();
        }

        *self.state.write().await = CoreState::Stopped;
        info!("percy core stopped");
    }

    /// Sets the shared log level.
    pub fn loglevel(&self, level: &str) {
        if let Some(reload) = &self.log_reload {
            let filter = tracing_subscriber::EnvFilter::new(level);
            if let Err(e) = reload.reload(filter) {
                warn!("failed to reload log level: {e}");
            }
        }
    }

    pub async fn current_state(&self) -> CoreState {
        *self.state.read().await
    }

    pub async fn current_build(&self) -> Option<Build> {
        self.build.read().await.clone()
    }

    pub async fn effective_config(&self) -> Config {
        self.config.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Build;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeBuildClient {
        build_calls: AtomicUsize,
    }

    #[async_trait]
    impl BuildClient for FakeBuildClient {
        async fn create_build(&self) -> Result<Build, PercyError> {
            self.build_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Build {
                id: "build-1".to_string(),
                number: 1,
                url: "https://percy.example.com/build-1".to_string(),
            })
        }

        async fn create_snapshot(
            &self,
            _build_id: &str,
            _name: &str,
            _widths: &[u32],
            _resources: &[crate::model::Resource],
        ) -> Result<String, PercyError> {
            Ok("snapshot-1".to_string())
        }

        async fn finalize_build(&self, _build_id: &str) -> Result<(), PercyError> {
            Ok(())
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.token = "tok".to_string();
        config.server = false;
        config
    }

    #[tokio::test]
    async fn snapshot_rejected_before_start() {
        let client = Arc::new(FakeBuildClient {
            build_calls: AtomicUsize::new(0),
        });
        let core = PercyCore::new(test_config(), client, None);
        let payload = SnapshotPayload {
            name: "home".into(),
            url: "https://example.com".into(),
            widths: vec![375],
            min_height: None,
            request_headers: Default::default(),
            client_info: None,
            environment_info: None,
            dom_snapshot: Some("<html></html>".into()),
            enable_javascript: None,
            concurrent: false,
        };
        let result = core.snapshot(payload).await;
        assert!(matches!(result, Err(PercyError::NotRunningError)));
    }

    #[tokio::test]
    async fn stop_is_idempotent_without_start() {
        let client = Arc::new(FakeBuildClient {
            build_calls: AtomicUsize::new(0),
        });
        let core = PercyCore::new(test_config(), client, None);
        core.stop().await;
        core.stop().await;
        assert_eq!(core.current_state().await, CoreState::Stopped);
    }

    #[tokio::test]
    async fn disabled_core_starts_without_launching_a_browser_and_snapshot_is_a_noop() {
        let client = Arc::new(FakeBuildClient {
            build_calls: AtomicUsize::new(0),
        });
        let mut config = test_config();
        config.enabled = false;
        let core = Arc::new(PercyCore::new(config, client, None));

        core.start().await.expect("start should succeed without touching Chrome");
        assert_eq!(core.current_state().await, CoreState::Running);

        let payload = SnapshotPayload {
            name: "home".into(),
            url: "https://example.com".into(),
            widths: vec![375],
            min_height: None,
            request_headers: Default::default(),
            client_info: None,
            environment_info: None,
            dom_snapshot: Some("<html></html>".into()),
            enable_javascript: None,
            concurrent: false,
        };
        core.snapshot(payload).await.expect("snapshot should no-op successfully");

        core.stop().await;
    }

    #[tokio::test]
    async fn non_concurrent_snapshot_surfaces_discovery_failure() {
        let client = Arc::new(FakeBuildClient {
            build_calls: AtomicUsize::new(0),
        });
        let core = PercyCore::new(test_config(), client, None);

        // Mark the core Running with a build, without actually launching a
        // browser, so discovery fails the way it would on a real navigation
        // error. Exercises the concurrent:false path's error propagation
        // without requiring a real Chrome process in this test.
        *core.state.write().await = CoreState::Running;
        *core.build.write().await = Some(Build {
            id: "build-1".to_string(),
            number: 1,
            url: "https://percy.example.com/build-1".to_string(),
        });

        let payload = SnapshotPayload {
            name: "home".into(),
            url: "https://example.com".into(),
            widths: vec![375],
            min_height: None,
            request_headers: Default::default(),
            client_info: None,
            environment_info: None,
            dom_snapshot: Some("<html></html>".into()),
            enable_javascript: None,
            concurrent: false,
        };
        let result = core.snapshot(payload).await;
        assert!(result.is_err());
    }
}
