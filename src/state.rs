//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: many handlers and actors hold the same state
//! - **RwLock**: many concurrent readers, or one writer
//! - config and metrics are small, so readers clone a snapshot and drop the
//!   lock right away instead of holding it across an `.await`
//!
//! ### What lives here
//! - configuration (updatable at runtime through `PUT /api/v1/config`)
//! - request and turn metrics
//! - the [`TurnCoordinator`], which owns the session store and collaborators

use crate::config::AppConfig;
use crate::conversation::{CoordinatorSettings, SessionStore, TurnCoordinator};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// The main application state shared across all handlers.
///
/// Cloning is cheap: every field is an `Arc` or `Copy`.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request and turn counters, updated by middleware and the gateway
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Turn pipeline and, through it, the session store
    pub coordinator: Arc<TurnCoordinator>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected since startup.
///
/// - **request_count** / **error_count**: HTTP traffic seen by the metrics middleware
/// - **active_sessions**: filled in from the session store when a snapshot is taken
/// - **connections_opened**: WebSocket upgrades accepted
/// - **turns_completed** / **turns_failed**: turn outcomes reported by the gateway,
///   where a turn delivered without audio counts as failed
#[derive(Debug, Default)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub active_sessions: usize,
    pub connections_opened: u64,
    pub turns_completed: u64,
    pub turns_failed: u64,
    /// Key: endpoint name such as `"POST /api/v1/chat"`
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Per-endpoint request statistics.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Build state around an already wired coordinator.
    pub fn new(config: AppConfig, coordinator: Arc<TurnCoordinator>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            coordinator,
            start_time: Instant::now(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        self.coordinator.sessions()
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the read lock immediately.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Validate and install a new configuration.
    ///
    /// The coordinator's timeouts and history limit, and the session cap, take
    /// effect for the next turn. Host and port changes apply on restart.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;

        self.coordinator
            .update_settings(CoordinatorSettings::from(&new_config.conversation));
        self.sessions()
            .set_max_sessions(new_config.performance.max_concurrent_sessions);

        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.write_metrics().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.write_metrics().error_count += 1;
    }

    /// Record one request against its endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.write_metrics();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn record_connection(&self) {
        self.write_metrics().connections_opened += 1;
    }

    /// Record a finished turn. `degraded` turns were delivered without audio.
    pub fn record_turn(&self, degraded: bool) {
        let mut metrics = self.write_metrics();
        if degraded {
            metrics.turns_failed += 1;
        } else {
            metrics.turns_completed += 1;
        }
    }

    /// Get a consistent copy of the counters for the `/metrics` endpoint.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let active_sessions = self.sessions().active_count();
        let metrics = self.metrics.read().unwrap_or_else(PoisonError::into_inner);
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_sessions,
            connections_opened: metrics.connections_opened,
            turns_completed: metrics.turns_completed,
            turns_failed: metrics.turns_failed,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn write_metrics(&self) -> std::sync::RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EndpointMetric {
    /// Total duration ÷ request count, 0 when the endpoint is unused.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Errors ÷ requests, in `0.0..=1.0`.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
