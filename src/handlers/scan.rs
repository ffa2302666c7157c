//! Scan endpoints.

use axum::extract::State;
use axum::{Extension, Json};

use crate::error::GatewayError;
use crate::gate::RequestId;
use crate::handlers::AppState;
use crate::observability::metrics;
use crate::scanner::engine::Turn;
use crate::scanner::ScanResult;

use serde::Deserialize;

/// Request to scan external content for prompt injection.
#[derive(Debug, Deserialize)]
pub struct ScanContentRequest {
    pub text: String,
    /// Where the content came from, e.g. "https://github.com/...".
    #[serde(default)]
    pub source_url: String,
    /// "web_page", "file", "api_response", "code_repo".
    #[serde(default)]
    pub source_type: String,
    /// "html", "markdown", "json", "text", "code".
    #[serde(default)]
    pub content_type: String,
}

/// Request to scan model output for credential leaks.
#[derive(Debug, Deserialize)]
pub struct ScanOutputRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct ScanUnifiedRequest {
    pub text: String,
    /// "input", "output", or "both" (default).
    #[serde(default)]
    pub mode: String,
}

#[derive(Debug, Deserialize)]
pub struct ScanMultiturnRequest {
    pub session_id: String,
    pub turns: Vec<Turn>,
}

pub async fn scan_content(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(req): Json<ScanContentRequest>,
) -> Result<Json<ScanResult>, GatewayError> {
    if req.text.is_empty() {
        return Err(GatewayError::BadRequest("Text is required".into()));
    }

    let mut result = state.engine.scan_content(
        &req.text,
        &req.source_url,
        &req.source_type,
        &req.content_type,
    );
    result.request_id = request_id.0;
    metrics::record_scan("content", result.decision);

    Ok(Json(result))
}

pub async fn scan_output(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(req): Json<ScanOutputRequest>,
) -> Result<Json<ScanResult>, GatewayError> {
    if req.text.is_empty() {
        return Err(GatewayError::BadRequest("Text is required".into()));
    }

    let mut result = state.engine.scan_output(&req.text);
    result.request_id = request_id.0;
    metrics::record_scan("output", result.decision);

    Ok(Json(result))
}

pub async fn scan_unified(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(req): Json<ScanUnifiedRequest>,
) -> Result<Json<ScanResult>, GatewayError> {
    if req.text.is_empty() {
        return Err(GatewayError::BadRequest("Text is required".into()));
    }

    let mode = if req.mode.is_empty() { "both" } else { req.mode.as_str() };
    if !matches!(mode, "input" | "output" | "both") {
        return Err(GatewayError::BadRequest(
            "Invalid mode. Must be 'input', 'output', or 'both'".into(),
        ));
    }

    let mut result = state.engine.scan_unified(&req.text, mode);
    result.request_id = request_id.0;
    metrics::record_scan("unified", result.decision);

    Ok(Json(result))
}

pub async fn scan_multiturn(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(req): Json<ScanMultiturnRequest>,
) -> Result<Json<ScanResult>, GatewayError> {
    if req.session_id.is_empty() {
        return Err(GatewayError::BadRequest("Session ID is required".into()));
    }
    if req.turns.is_empty() {
        return Err(GatewayError::BadRequest("At least one turn is required".into()));
    }

    let mut result = state.engine.scan_multiturn(&req.session_id, &req.turns);
    result.request_id = request_id.0;
    metrics::record_scan("multiturn", result.decision);

    Ok(Json(result))
}
