use crate::{config::AppConfig, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// API keys are `skip_serializing`, so the whole config can be echoed back.
fn config_view(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": config.server,
        "conversation": config.conversation,
        "audio": config.audio,
        "performance": config.performance,
        "providers": config.providers
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

/// Partial update: only the fields present in the body change.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::coordinator::tests::{FakeModel, FakeSynthesizer};
    use crate::state::tests::state_with;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_update_history_limit_and_hide_keys() {
        let state = state_with(FakeModel::echo(), FakeSynthesizer::wav(441));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::get().to(get_config))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"conversation": {"history_limit": 4}}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["updated_config"]["conversation"]["history_limit"], 4);
        assert_eq!(state.coordinator.settings().history_limit, 4);

        let req = test::TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert!(body["config"]["providers"]["language_model"].get("api_key").is_none());
    }

    #[actix_web::test]
    async fn test_invalid_update_is_rejected() {
        let state = state_with(FakeModel::echo(), FakeSynthesizer::wav(441));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"performance": {"max_concurrent_sessions": 0}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
    }
}
