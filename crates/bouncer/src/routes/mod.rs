//! Status HTTP server routes.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    routing::get,
};
use bouncer_common::{VerificationRecord, VerificationStats};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

mod health;

const DEFAULT_VERIFICATIONS_LIMIT: usize = 20;
const MAX_VERIFICATIONS_LIMIT: usize = 200;

/// Create the status router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Status
        .route("/health", get(health::health_check))
        .route("/ready", get(health::ready_check))
        .route("/stats", get(get_stats))

        // Audit log
        .route("/verifications", get(recent_verifications))

        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct StatsResponse {
    ai_backend: &'static str,
    uptime_secs: u64,
    #[serde(flatten)]
    verifications: VerificationStats,
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, StatusCode> {
    let verifications = state.store.verification_stats().await.map_err(|e| {
        tracing::error!(error = %e, "Failed to read verification stats");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(StatsResponse {
        ai_backend: state.ai_backend,
        uptime_secs: state.uptime_secs(),
        verifications,
    }))
}

#[derive(Deserialize)]
struct VerificationsQuery {
    limit: Option<usize>,
}

async fn recent_verifications(
    State(state): State<AppState>,
    Query(query): Query<VerificationsQuery>,
) -> Result<Json<Vec<VerificationRecord>>, StatusCode> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_VERIFICATIONS_LIMIT)
        .min(MAX_VERIFICATIONS_LIMIT);

    state
        .store
        .recent_verifications(limit)
        .await
        .map(Json)
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to read verification history");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use bouncer_common::{ChatId, PendingChallenge, UserId, Verdict};
    use chrono::DateTime;
    use tower::ServiceExt;

    use super::*;
    use crate::storage::{MemoryStore, Store};

    async fn seeded_state() -> AppState {
        let store = Arc::new(MemoryStore::new());
        let pending = PendingChallenge {
            user_id: UserId(1),
            chat_id: ChatId(42),
            chat_title: "Science Club".into(),
            display_name: "Ada".into(),
            issued_at_ms: 1_000_000,
            challenge: "What is H2O?".into(),
        };

        for i in 0..3 {
            let verdict = if i == 2 { Verdict::Declined } else { Verdict::Accepted };
            let now = DateTime::from_timestamp(1_000 + i, 0).unwrap();
            store
                .record_verification(&VerificationRecord::resolve(&pending, "water", verdict, "", now))
                .await
                .unwrap();
        }
        store.insert_pending(&pending).await.unwrap();

        AppState::new(store, "scripted")
    }

    async fn get_json(state: AppState, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = create_router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let (status, body) = get_json(seeded_state().await, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = get_json(seeded_state().await, "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["storage"], true);
    }

    #[tokio::test]
    async fn test_stats() {
        let (status, body) = get_json(seeded_state().await, "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pending"], 1);
        assert_eq!(body["accepted"], 2);
        assert_eq!(body["declined"], 1);
        assert_eq!(body["ai_backend"], "scripted");
    }

    #[tokio::test]
    async fn test_verifications_newest_first_with_limit() {
        let (status, body) = get_json(seeded_state().await, "/verifications?limit=2").await;
        assert_eq!(status, StatusCode::OK);

        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["timestamp"], 1_002);
        assert_eq!(rows[0]["verdict"], "declined");

        let (_, body) = get_json(seeded_state().await, "/verifications").await;
        assert_eq!(body.as_array().unwrap().len(), 3);
    }
}
