use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Effective configuration. The app secret never leaves the process.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let mut config = serde_json::to_value(state.config.as_ref())?;

    if let Some(secret) = config.pointer_mut("/upstream/app_secret") {
        let redacted = if secret.as_str().map(str::is_empty).unwrap_or(true) {
            ""
        } else {
            "<redacted>"
        };
        *secret = json!(redacted);
    }

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::App;

    #[actix_web::test]
    async fn test_secret_is_redacted() {
        let mut config = AppConfig::default();
        config.upstream.app_key = "key-123".to_string();
        config.upstream.app_secret = "very-secret".to_string();

        let app = actix_web::test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::new(config)))
                .route("/config", web::get().to(get_config)),
        )
        .await;

        let req = actix_web::test::TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value = actix_web::test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["config"]["upstream"]["app_key"], "key-123");
        assert_eq!(body["config"]["upstream"]["app_secret"], "<redacted>");
        assert_eq!(body["config"]["session"]["default_from"], "zh-CHS");
        assert!(!body.to_string().contains("very-secret"));
    }
}
