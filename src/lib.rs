//! # percy-core
//!
//! The local daemon that orchestrates visual-snapshot asset discovery
//! through a headless Chrome instance: a small HTTP control surface
//! (`/percy/snapshot`, `/percy/idle`, `/percy/stop`) backed by a single
//! `BrowserController`, a bounded `SnapshotQueue`, and a byte-budgeted
//! `ResponseCache`.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use percy_core::config::Config;
//! use percy_core::core::PercyCore;
//! use percy_core::build_client::HttpBuildClient;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default().apply_env_overrides();
//!     let build_client = Arc::new(HttpBuildClient::new(
//!         "https://percy.io/api/v1",
//!         config.token.clone(),
//!     ));
//!     let core = Arc::new(PercyCore::new(config, build_client, None));
//!     core.start().await?;
//!     Ok(())
//! }
//! ```

/// Configuration: token, control-server settings, snapshot and discovery
/// defaults.
pub mod config;

/// Error taxonomy and retry policy.
pub mod error;

/// Wire and in-process data model (`Snapshot`, `Resource`, `Build`, ...).
pub mod model;

/// Headless browser process management and CDP request interception.
pub mod browser_controller;

/// Byte-budgeted LRU cache of captured response bodies.
pub mod response_cache;

/// Per-snapshot asset discovery: routing, capture, dedup.
pub mod discoverer;

/// Bounded-concurrency job queue for snapshot discovery.
pub mod queue;

/// Remote visual-testing API client.
pub mod build_client;

/// `PercyCore`: lifecycle and orchestration.
pub mod core;

/// The local HTTP control surface.
pub mod server;

/// Command-line interface.
pub mod cli;

/// Small shared helpers: hostname extraction and glob matching.
pub mod utils;
