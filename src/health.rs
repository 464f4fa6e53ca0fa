//! Health and metrics endpoints.

use crate::state::{AppState, RelayCounters};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let counters = state.metrics.snapshot();
    let config = &state.config;

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "upstream": {
            "url": config.upstream.url,
            "credentials_configured": config.has_credentials()
        },
        "metrics": {
            "active_sessions": counters.active_sessions,
            "results_relayed": counters.results_relayed,
            "upstream_errors": counters.upstream_errors,
            "upstream_error_rate": counters.upstream_error_rate()
        },
        "system": load_status(state.registry.len(), state.registry.max_sessions())
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let counters = state.metrics.snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "counters": counters,
        "derived": derived_rates(&counters, uptime_seconds),
        "registry": {
            "registered_clients": state.registry.len(),
            "idle": state.registry.is_empty(),
            "max_concurrent_sessions": state.registry.max_sessions()
        }
    }))
}

fn derived_rates(counters: &RelayCounters, uptime_seconds: u64) -> serde_json::Value {
    json!({
        "upstream_error_rate": counters.upstream_error_rate(),
        "connect_failure_rate": counters.connect_failure_rate(),
        "audio_frames_per_second": if uptime_seconds > 0 {
            counters.audio_frames_sent as f64 / uptime_seconds as f64
        } else {
            0.0
        },
        "average_frame_bytes": if counters.audio_frames_sent > 0 {
            counters.audio_bytes_sent as f64 / counters.audio_frames_sent as f64
        } else {
            0.0
        }
    })
}

/// Load classification based on how full the session registry is.
fn load_status(current: usize, max: usize) -> serde_json::Value {
    let usage = if max > 0 {
        current as f64 / max as f64
    } else {
        0.0
    };

    let status = if usage > 0.9 {
        "high_load"
    } else if usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (usage * 100.0).round(),
        "max_sessions": max,
        "current_sessions": current,
        "load_warnings": if usage > 0.8 {
            vec!["High session usage - consider increasing session.max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::App;

    #[test]
    fn test_load_status_thresholds() {
        assert_eq!(load_status(0, 100)["status"], "normal");
        assert_eq!(load_status(75, 100)["status"], "moderate_load");
        assert_eq!(load_status(95, 100)["status"], "high_load");
        assert_eq!(load_status(85, 100)["load_warnings"].as_array().unwrap().len(), 1);
        assert_eq!(load_status(3, 0)["session_usage_percent"], 0.0);
    }

    #[actix_web::test]
    async fn test_health_and_metrics_endpoints() {
        let state = AppState::new(AppConfig::default());
        state.metrics.record_audio_frame(100);
        state.metrics.record_audio_frame(300);

        let app = actix_web::test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check))
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = actix_web::test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = actix_web::test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"]["name"], "speech-relay");
        assert_eq!(body["upstream"]["credentials_configured"], false);

        let req = actix_web::test::TestRequest::get().uri("/metrics").to_request();
        let body: serde_json::Value = actix_web::test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["counters"]["audio_frames_sent"], 2);
        assert_eq!(body["derived"]["average_frame_bytes"], 200.0);
        assert_eq!(body["registry"]["max_concurrent_sessions"], 100);
        assert_eq!(body["registry"]["idle"], true);
    }
}
