//! REST API Server for the advisory orchestrator
//!
//! Exposes the orchestrator via HTTP endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::agent::{Orchestrator, RunReport};
use crate::models::{InvestmentProfile, InvestmentStyle, RiskTolerance, TimeHorizon};
use crate::observer::TracingObserver;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AnalyzeRequest {
    pub question: String,
    pub risk_tolerance: Option<String>,
    pub time_horizon: Option<String>,
    pub investment_style: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub risk_tolerance: Option<String>,
    pub time_horizon: Option<String>,
    pub investment_style: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    fn error_with(message: String, data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            ..Self::error(message)
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

/// =============================
/// Helpers: String → Enum Parsing
/// =============================

fn parse_risk(r: Option<String>) -> RiskTolerance {
    match r.unwrap_or_default().to_lowercase().as_str() {
        "low" | "conservative" => RiskTolerance::Conservative,
        "high" | "aggressive" => RiskTolerance::Aggressive,
        _ => RiskTolerance::Moderate,
    }
}

fn parse_horizon(h: Option<String>) -> TimeHorizon {
    match h.unwrap_or_default().to_lowercase().as_str() {
        "short" | "short_term" | "short-term" => TimeHorizon::ShortTerm,
        "long" | "long_term" | "long-term" => TimeHorizon::LongTerm,
        _ => TimeHorizon::MediumTerm,
    }
}

fn parse_style(s: Option<String>) -> InvestmentStyle {
    match s.unwrap_or_default().to_lowercase().as_str() {
        "value" => InvestmentStyle::Value,
        "growth" => InvestmentStyle::Growth,
        _ => InvestmentStyle::Blend,
    }
}

fn report_json(report: &RunReport) -> serde_json::Value {
    serde_json::json!({
        "run_id": report.run_id,
        "answer": report.answer,
        "steps": report.steps,
        "dispatched": report.dispatched,
        "agents": report.agents,
        "historical": report.historical,
        "reasoning_trace": report.reasoning_trace,
        "context_hash": report.context_hash,
        "elapsed_ms": report.elapsed_ms,
    })
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Analysis Endpoint
/// =============================

async fn analyze(
    State(state): State<ApiState>,
    Json(req): Json<AnalyzeRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    if req.question.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("question must not be empty".into())),
        );
    }

    info!(question = %req.question, "Received analysis request");

    let profile = InvestmentProfile {
        risk_tolerance: parse_risk(req.risk_tolerance),
        time_horizon: parse_horizon(req.time_horizon),
        investment_style: parse_style(req.investment_style),
    };

    match state
        .orchestrator
        .run(&req.question, profile, &TracingObserver)
        .await
    {
        Ok(report) => (StatusCode::OK, Json(ApiResponse::success(report_json(&report)))),
        Err(e) => match e.partial_state() {
            // Step ceiling: report how far the run got.
            Some(partial) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ApiResponse::error_with(
                    format!("Analysis aborted: {}", e),
                    serde_json::json!({
                        "run_id": partial.run_id,
                        "partial_messages": partial.messages.len(),
                        "dispatched": partial.dispatched,
                    }),
                )),
            ),
            None => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(format!("Analysis failed: {}", e))),
            ),
        },
    }
}

/// =============================
/// Chat Endpoint
/// =============================

async fn chat_handler(
    State(state): State<ApiState>,
    Json(req): Json<ChatRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    // Only the latest user turn is analysed; runs do not share state.
    let Some(user_msg) = req.messages.iter().rev().find(|m| m.role == "user") else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("No user message found".into())),
        );
    };

    let analyze_req = AnalyzeRequest {
        question: user_msg.content.clone(),
        risk_tolerance: req.risk_tolerance,
        time_horizon: req.time_horizon,
        investment_style: req.investment_style,
    };

    analyze(State(state), Json(analyze_req)).await
}

/// =============================
/// Run Log Endpoints
/// =============================

async fn get_run(
    State(state): State<ApiState>,
    Path(run_id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse>) {
    let log = state.orchestrator.run_log();

    match log.get(run_id).await {
        Some(report) => {
            let verified = log.verify_integrity(run_id).await;
            let mut data = report_json(&report);
            data["verified"] = serde_json::json!(verified);
            data["messages"] = serde_json::to_value(&report.messages).unwrap_or_default();
            (StatusCode::OK, Json(ApiResponse::success(data)))
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("Run {} not found", run_id))),
        ),
    }
}

async fn recent_runs(
    State(state): State<ApiState>,
    Query(query): Query<RecentQuery>,
) -> Json<ApiResponse> {
    let runs: Vec<serde_json::Value> = state
        .orchestrator
        .run_log()
        .recent(query.limit.unwrap_or(20))
        .await
        .iter()
        .map(|r| {
            serde_json::json!({
                "run_id": r.run_id,
                "question": r.question,
                "analysis_time": r.analysis_time,
                "steps": r.steps,
            })
        })
        .collect();

    Json(ApiResponse::success(runs))
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/api/analyze", post(analyze))
        .route("/api/chat", post(chat_handler))
        .route("/api/runs", get(recent_runs))
        .route("/api/runs/:run_id", get(get_run))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<Orchestrator>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Collaborators;
    use crate::config::OrchestratorConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn router(config: OrchestratorConfig) -> Router {
        let orchestrator = Orchestrator::new(config, Collaborators::offline()).unwrap();
        create_router(Arc::new(orchestrator))
    }

    async fn post_json(router: Router, uri: &str, body: serde_json::Value) -> (StatusCode, ApiResponse) {
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn profile_strings_parse_leniently() {
        assert_eq!(parse_risk(Some("LOW".into())), RiskTolerance::Conservative);
        assert_eq!(parse_risk(None), RiskTolerance::Moderate);
        assert_eq!(parse_horizon(Some("long-term".into())), TimeHorizon::LongTerm);
        assert_eq!(parse_style(Some("Growth".into())), InvestmentStyle::Growth);
    }

    #[tokio::test]
    async fn health_is_ok() {
        let response = router(OrchestratorConfig::default())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn analyze_returns_the_report() {
        let (status, body) = post_json(
            router(OrchestratorConfig::default()),
            "/api/analyze",
            serde_json::json!({"question": "Should I buy AAPL?", "risk_tolerance": "aggressive"}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.success);
        let data = body.data.unwrap();
        assert!(data["answer"].as_str().unwrap().starts_with("Offline demo recommendation."));
        assert_eq!(data["dispatched"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn empty_question_is_a_bad_request() {
        let (status, body) = post_json(
            router(OrchestratorConfig::default()),
            "/api/analyze",
            serde_json::json!({"question": "  "}),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.success);
    }

    #[tokio::test]
    async fn step_ceiling_maps_to_unprocessable() {
        let config = OrchestratorConfig {
            max_steps: 2,
            ..OrchestratorConfig::default()
        };
        let (status, body) = post_json(
            router(config),
            "/api/analyze",
            serde_json::json!({"question": "Should I buy AAPL?"}),
        )
        .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body.error.unwrap().contains("limit 2"));
        assert!(body.data.unwrap()["partial_messages"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn chat_without_user_message_is_rejected() {
        let (status, _) = post_json(
            router(OrchestratorConfig::default()),
            "/api/chat",
            serde_json::json!({"messages": [{"role": "assistant", "content": "hi"}]}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let response = router(OrchestratorConfig::default())
            .oneshot(
                Request::builder()
                    .uri(format!("/api/runs/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
