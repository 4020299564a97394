use crate::state::HealthState;
use axum::extract::State;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};

pub async fn readiness_probe(State(health): State<HealthState>) -> impl IntoResponse {
    if health.is_ready() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub fn create_app(health: HealthState) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .with_state(health)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_readiness_follows_first_scan() {
        let health = HealthState::default();
        let response = readiness_probe(State(health.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        health.mark_ready();
        let response = readiness_probe(State(health)).await.into_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_liveness() {
        assert_eq!(
            liveness_probe().await.into_response().status(),
            StatusCode::NO_CONTENT
        );
    }
}
