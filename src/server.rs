use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::Database;
use crate::models::{BookSummary, ClaimRow, VerdictRow, VerifyBatchRequest, VerifyBatchResponse};
use crate::pipeline::Verifier;

#[derive(Clone)]
struct AppState {
    db: Database,
    verifier: Arc<Verifier>,
    batch_concurrency: usize,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    books: usize,
    chunks: usize,
}

pub async fn run_server(config: AppConfig, db: Database, verifier: Arc<Verifier>) -> Result<()> {
    let addr: SocketAddr = config.bind_addr.parse()?;
    let app = build_router(db, verifier, config.judge.batch_concurrency);

    tracing::info!("listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn build_router(db: Database, verifier: Arc<Verifier>, batch_concurrency: usize) -> Router {
    let state = AppState {
        db,
        verifier,
        batch_concurrency: batch_concurrency.max(1),
    };

    Router::new()
        .route("/api/health", get(health))
        .route("/api/books", get(list_books))
        .route("/api/verify", post(verify_one))
        .route("/api/verify/batch", post(verify_batch))
        .route("/api/runs/:run_id", get(get_run))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let index = state.verifier.index();
    Json(HealthResponse {
        status: "ok",
        books: index.books().len(),
        chunks: index.len(),
    })
}

async fn list_books(State(state): State<AppState>) -> Json<Vec<BookSummary>> {
    Json(state.verifier.index().books())
}

async fn verify_one(
    State(state): State<AppState>,
    Json(row): Json<ClaimRow>,
) -> Result<Json<VerdictRow>, ApiError> {
    validate_row(&row)?;
    let verdict = state.verifier.verify(&row).await;
    persist(&state.db, &format!("api-{}", Uuid::new_v4()), &[verdict.clone()]).await;
    Ok(Json(verdict))
}

async fn verify_batch(
    State(state): State<AppState>,
    Json(request): Json<VerifyBatchRequest>,
) -> Result<Json<VerifyBatchResponse>, ApiError> {
    if request.rows.is_empty() {
        return Err(ApiError::bad_request("rows must not be empty".to_string()));
    }
    for row in &request.rows {
        validate_row(row)?;
    }

    let run_id = Uuid::new_v4().to_string();
    let results = state
        .verifier
        .verify_batch(&request.rows, state.batch_concurrency)
        .await;
    persist(&state.db, &run_id, &results).await;

    Ok(Json(VerifyBatchResponse { run_id, results }))
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Vec<VerdictRow>>, ApiError> {
    let verdicts = state.db.verdicts_for_run(&run_id).await?;
    if verdicts.is_empty() {
        return Err(ApiError::not_found(format!("run not found: {}", run_id)));
    }
    Ok(Json(verdicts))
}

fn validate_row(row: &ClaimRow) -> Result<(), ApiError> {
    if row.claim_text.trim().is_empty() {
        return Err(ApiError::bad_request(format!(
            "row {}: claim_text must not be empty",
            row.id
        )));
    }
    Ok(())
}

/// Verdicts are already computed, so a storage failure is logged rather than returned.
async fn persist(db: &Database, run_id: &str, verdicts: &[VerdictRow]) {
    for verdict in verdicts {
        if let Err(err) = db.record_verdict(run_id, verdict).await {
            tracing::warn!(run_id, row = %verdict.id, error = %err, "failed to store verdict");
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: String) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }

    fn bad_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: value.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::pipeline::tests::{test_config, test_index, RuleFollowingModel};

    async fn router() -> Router {
        let config = test_config();
        let model = Arc::new(RuleFollowingModel {
            calls: AtomicUsize::new(0),
        });
        let verifier = Verifier::with_language_model(&config, test_index(&config).await, model);
        let db = Database::in_memory().await.unwrap();
        build_router(db, Arc::new(verifier), 2)
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_index_size() {
        let (status, body) = send(
            router().await,
            Request::get("/api/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["books"], 1);
        assert_eq!(body["chunks"], 3);
    }

    #[tokio::test]
    async fn verify_returns_a_verdict() {
        let (status, body) = send(
            router().await,
            post_json(
                "/api/verify",
                serde_json::json!({
                    "id": "9",
                    "book_name": "monte cristo",
                    "char": "Dantes",
                    "content": "In 1815, Dantes was in Paris."
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "9");
        assert_eq!(body["label"], "Contradictory");
        assert_eq!(body["confidence"], "High");
    }

    #[tokio::test]
    async fn batch_is_stored_under_its_run_id() {
        let app = router().await;
        let (status, body) = send(
            app.clone(),
            post_json(
                "/api/verify/batch",
                serde_json::json!({ "rows": [
                    { "id": "1", "book_name": "monte", "character": "Dantes", "claim_text": "He loved the sea." },
                    { "id": "2", "book_name": "castaways", "character": "Dantes", "claim_text": "He met Ayrton." }
                ]}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["results"][0]["id"], "1");
        assert_eq!(body["results"][1]["id"], "2");

        let run_id = body["run_id"].as_str().unwrap().to_string();
        let (status, stored) = send(
            app,
            Request::get(format!("/api/runs/{run_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stored.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        let (status, body) = send(
            router().await,
            post_json("/api/verify/batch", serde_json::json!({ "rows": [] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "rows must not be empty");
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let (status, _) = send(
            router().await,
            Request::get("/api/runs/nope").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
