//! Health and metrics endpoints.

use crate::config::AppConfig;
use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": ratio(metrics.error_count, metrics.request_count),
            "active_sessions": metrics.active_sessions,
            "turns_completed": metrics.turns_completed,
            "turns_failed": metrics.turns_failed
        },
        "memory": get_memory_info(),
        "collaborators": collaborator_status(&state, &config),
        "system": get_system_status(&config, &metrics)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let config = state.get_config();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    let turns = metrics.turns_completed + metrics.turns_failed;

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": ratio(metrics.error_count, metrics.request_count),
            "requests_per_second": ratio(metrics.request_count, uptime_seconds)
        },
        "conversation": {
            "active_sessions": metrics.active_sessions,
            "connections_opened": metrics.connections_opened,
            "turns_completed": metrics.turns_completed,
            "turns_failed": metrics.turns_failed,
            "turn_failure_rate": ratio(metrics.turns_failed, turns),
            "sessions": state.sessions().summaries()
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info(),
        "performance": {
            "max_concurrent_sessions": config.performance.max_concurrent_sessions,
            "history_limit": config.conversation.history_limit
        }
    }))
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator > 0 {
        numerator as f64 / denominator as f64
    } else {
        0.0
    }
}

/// Which collaborators are wired and whether they have credentials.
fn collaborator_status(state: &AppState, config: &AppConfig) -> serde_json::Value {
    let providers = &config.providers;
    json!({
        "language_model": {
            "name": state.coordinator.model().name(),
            "model": providers.language_model.model,
            "configured": providers.language_model.api_key.is_some()
        },
        "speech_synthesis": {
            "name": state.coordinator.synthesizer().name(),
            "model": providers.speech_synthesis.model_id,
            "configured": providers.speech_synthesis.api_key.is_some()
        },
        "speech_recognition": {
            "model": providers.speech_recognition.model,
            "enabled": state.coordinator.accepts_audio(),
            "configured": providers.speech_recognition.api_key.is_some()
        }
    })
}

#[cfg(target_os = "linux")]
fn get_memory_info() -> serde_json::Value {
    let status = std::fs::read_to_string("/proc/self/status").unwrap_or_default();
    let read_kb = |key: &str| -> u64 {
        status
            .lines()
            .find(|line| line.starts_with(key))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
            .unwrap_or(0)
            * 1024
    };

    json!({
        "resident_memory_bytes": read_kb("VmRSS:"),
        "virtual_memory_bytes": read_kb("VmSize:"),
        "available": !status.is_empty()
    })
}

#[cfg(not(target_os = "linux"))]
fn get_memory_info() -> serde_json::Value {
    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

fn get_system_status(config: &AppConfig, metrics: &AppMetrics) -> serde_json::Value {
    let max_sessions = config.performance.max_concurrent_sessions;
    let session_usage = if max_sessions > 0 {
        metrics.active_sessions as f64 / max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": max_sessions,
        "current_sessions": metrics.active_sessions,
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}
