//! Read-only diagnostic HTTP handlers (section 6, "Diagnostic HTTP
//! surface"). Exposes the Manager's existing public contract; never the
//! browser UI and never session/auth.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::manager::Manager;
use crate::model::{CacheEntry, ValueRecord};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Serialize)]
pub struct PortStatusResponse {
    pub path: String,
    pub status: String,
    pub connected: bool,
    pub error_reason: Option<String>,
}

pub async fn list_ports(State(manager): State<Manager>) -> Json<Vec<PortStatusResponse>> {
    let statuses = manager.get_port_statuses().await;
    let mut out: Vec<PortStatusResponse> = statuses
        .into_iter()
        .map(|(path, snapshot)| PortStatusResponse {
            path,
            status: format!("{:?}", snapshot.status),
            connected: snapshot.connected,
            error_reason: snapshot.error_reason,
        })
        .collect();
    out.sort_by(|a, b| a.path.cmp(&b.path));
    Json(out)
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome")]
pub enum DataPointResponse {
    Ok { value: ValueRecord },
    Err { code: String },
}

pub async fn query_data_point(
    State(manager): State<Manager>,
    Path(name): Path<String>,
) -> Result<Json<DataPointResponse>, (StatusCode, Json<ErrorResponse>)> {
    match manager.query(&name).await {
        Ok(CacheEntry::Ok(value)) => Ok(Json(DataPointResponse::Ok { value })),
        Ok(CacheEntry::Err(reason)) => Ok(Json(DataPointResponse::Err { code: reason })),
        Err(err) => Err(not_found_or_error(err)),
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

fn not_found_or_error(err: crate::error::CoreError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match err.code() {
        "not_found" | "no_data" => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: err.code(),
        }),
    )
}

#[derive(Debug, Serialize)]
pub struct DataPointListEntry {
    pub name: String,
    pub description: String,
}

pub async fn list_data_points(State(manager): State<Manager>) -> Json<Vec<DataPointListEntry>> {
    let mut entries: Vec<DataPointListEntry> = manager
        .list_data_points()
        .await
        .into_iter()
        .map(|(name, description)| DataPointListEntry { name, description })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Json(entries)
}

/// Unused directly but kept importable for handlers that need to shape a
/// `HashMap` response without pulling in serde_json at the call site.
pub type JsonMap = HashMap<String, serde_json::Value>;
