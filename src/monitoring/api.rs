//! Admin read/control surface under `/v1/monitoring`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use super::alerts::AlertStatus;
use super::health::HealthStatus;
use super::service::MonitoringService;
use super::Severity;

pub fn monitoring_router(service: Arc<MonitoringService>) -> Router {
    Router::new()
        .route("/v1/monitoring/status", get(get_status))
        .route("/v1/monitoring/health", get(get_health))
        .route("/v1/monitoring/metrics", get(get_metrics))
        .route("/v1/monitoring/metrics/prometheus", get(get_metrics_prometheus))
        .route("/v1/monitoring/alerts", get(get_alerts))
        .route("/v1/monitoring/alerts/:name/acknowledge", post(acknowledge_alert))
        .route("/v1/monitoring/alerts/:name/resolve", post(resolve_alert))
        .route("/v1/monitoring/alerts/:name/silence", post(silence_alert))
        .route("/v1/monitoring/alerts/silence/:id", delete(unsilence_alert))
        .route("/v1/monitoring/optimization", get(get_optimization))
        .route("/v1/monitoring/optimization/analyze", post(trigger_analyze))
        .route("/v1/monitoring/optimization/optimize", post(trigger_optimize))
        .route("/v1/monitoring/optimization/toggle", post(toggle_optimization))
        .with_state(service)
}

fn error_body(code: &str, message: impl std::fmt::Display) -> Json<Value> {
    Json(json!({ "code": code, "message": message.to_string() }))
}

async fn get_status(State(service): State<Arc<MonitoringService>>) -> Json<Value> {
    let active = service.alerts().active_alerts().await;
    Json(json!({
        "health": service.health().overall(),
        "uptime_seconds": service.uptime().as_secs(),
        "active_alerts": active.len(),
        "metrics": service.metrics().snapshot().len(),
        "optimization": service
            .optimization()
            .map(|o| json!({ "state": o.state(), "automatic": o.is_automatic() }))
            .unwrap_or(json!({ "enabled": false })),
    }))
}

async fn get_health(State(service): State<Arc<MonitoringService>>) -> Response {
    let overall = service.health().overall();
    let body = Json(json!({
        "status": overall,
        "checks": service.health().states(),
    }));
    let code = match overall {
        HealthStatus::Unhealthy => StatusCode::INTERNAL_SERVER_ERROR,
        HealthStatus::Degraded => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, body).into_response()
}

async fn get_metrics(State(service): State<Arc<MonitoringService>>) -> Json<Value> {
    Json(json!(service.metrics().snapshot()))
}

async fn get_metrics_prometheus(State(service): State<Arc<MonitoringService>>) -> Response {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        service.metrics().render_text_exposition(),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct AlertQuery {
    limit: Option<usize>,
    severity: Option<String>,
    status: Option<String>,
    #[serde(rename = "startTime")]
    start_time: Option<i64>,
    #[serde(rename = "endTime")]
    end_time: Option<i64>,
}

async fn get_alerts(
    State(service): State<Arc<MonitoringService>>,
    Query(query): Query<AlertQuery>,
) -> Response {
    let severity = match query.severity.as_deref().map(str::parse::<Severity>) {
        Some(Err(e)) => return (StatusCode::BAD_REQUEST, error_body("bad_request", e)).into_response(),
        Some(Ok(s)) => Some(s),
        None => None,
    };
    let status: Option<AlertStatus> = match query.status.as_deref() {
        Some("active") => Some(AlertStatus::Active),
        Some("acknowledged") => Some(AlertStatus::Acknowledged),
        Some("silenced") => Some(AlertStatus::Silenced),
        Some("resolved") => Some(AlertStatus::Resolved),
        Some(other) => {
            return (
                StatusCode::BAD_REQUEST,
                error_body("bad_request", format!("unknown status: {other}")),
            )
                .into_response()
        }
        None => None,
    };

    let active = service.alerts().active_alerts().await;
    let history: Vec<_> = service
        .alerts()
        .history(None)
        .await
        .into_iter()
        .filter(|a| severity.is_none_or(|s| a.severity == s))
        .filter(|a| status.is_none_or(|s| a.status == s))
        .filter(|a| {
            query
                .start_time
                .is_none_or(|t| a.created_at.timestamp_millis() >= t)
        })
        .filter(|a| {
            query
                .end_time
                .is_none_or(|t| a.created_at.timestamp_millis() <= t)
        })
        .take(query.limit.unwrap_or(usize::MAX))
        .collect();

    Json(json!({ "active": active, "history": history })).into_response()
}

#[derive(Debug, Deserialize)]
struct AcknowledgeBody {
    #[serde(rename = "acknowledgedBy")]
    acknowledged_by: Option<String>,
    message: Option<String>,
}

async fn acknowledge_alert(
    State(service): State<Arc<MonitoringService>>,
    Path(name): Path<String>,
    Json(body): Json<AcknowledgeBody>,
) -> Response {
    let Some(by) = body.acknowledged_by.filter(|b| !b.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            error_body("bad_request", "acknowledgedBy is required"),
        )
            .into_response();
    };
    if service
        .alerts()
        .acknowledge(&name, &by, body.message.as_deref())
        .await
    {
        Json(json!({ "acknowledged": name })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            error_body("not_found", format!("no active alert named {name}")),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
struct ResolveBody {
    message: Option<String>,
}

async fn resolve_alert(
    State(service): State<Arc<MonitoringService>>,
    Path(name): Path<String>,
    Json(body): Json<ResolveBody>,
) -> Response {
    if service
        .alerts()
        .resolve(&name, body.message.as_deref())
        .await
    {
        Json(json!({ "resolved": name })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            error_body("not_found", format!("no active alert named {name}")),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
struct SilenceBody {
    /// Seconds; zero means permanent.
    duration: Option<u64>,
    labels: Option<Vec<String>>,
    #[serde(rename = "silencedBy")]
    silenced_by: Option<String>,
    message: Option<String>,
}

async fn silence_alert(
    State(service): State<Arc<MonitoringService>>,
    Path(name): Path<String>,
    Json(body): Json<SilenceBody>,
) -> Response {
    let (Some(duration), Some(by)) = (body.duration, body.silenced_by.filter(|b| !b.is_empty()))
    else {
        return (
            StatusCode::BAD_REQUEST,
            error_body("bad_request", "duration and silencedBy are required"),
        )
            .into_response();
    };

    let silence_id = service
        .alerts()
        .silence(
            &name,
            body.labels.unwrap_or_default(),
            Duration::from_secs(duration),
            &by,
            body.message,
        )
        .await;
    Json(json!({ "silenceId": silence_id })).into_response()
}

async fn unsilence_alert(
    State(service): State<Arc<MonitoringService>>,
    Path(id): Path<String>,
) -> Response {
    if service.alerts().unsilence(&id).await {
        Json(json!({ "removed": id })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            error_body("not_found", format!("no silence with id {id}")),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
struct OptimizationQuery {
    limit: Option<usize>,
}

async fn get_optimization(
    State(service): State<Arc<MonitoringService>>,
    Query(query): Query<OptimizationQuery>,
) -> Json<Value> {
    match service.optimization() {
        Some(optimization) => Json(json!({
            "enabled": true,
            "state": optimization.state(),
            "automatic": optimization.is_automatic(),
            "optimizers": optimization.optimizer_names(),
            "history": optimization.history(query.limit),
        })),
        None => Json(json!({ "enabled": false })),
    }
}

async fn trigger_analyze(State(service): State<Arc<MonitoringService>>) -> Response {
    let Some(optimization) = service.optimization() else {
        return (
            StatusCode::NOT_IMPLEMENTED,
            error_body("disabled", "optimization loop is disabled"),
        )
            .into_response();
    };
    match optimization.run_analysis().await {
        Ok(outcome) => Json(json!(outcome)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body("analysis_failed", e),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct OptimizeBody {
    optimizers: Option<Vec<String>>,
}

async fn trigger_optimize(
    State(service): State<Arc<MonitoringService>>,
    Json(body): Json<OptimizeBody>,
) -> Response {
    let Some(optimization) = service.optimization() else {
        return (
            StatusCode::NOT_IMPLEMENTED,
            error_body("disabled", "optimization loop is disabled"),
        )
            .into_response();
    };
    let Some(names) = body.optimizers.filter(|n| !n.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            error_body("bad_request", "optimizers is required"),
        )
            .into_response();
    };
    match optimization.run_optimization(&names).await {
        Ok(record) => Json(json!(record)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body("optimization_failed", e),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ToggleBody {
    enabled: Option<bool>,
}

async fn toggle_optimization(
    State(service): State<Arc<MonitoringService>>,
    Json(body): Json<ToggleBody>,
) -> Response {
    let Some(optimization) = service.optimization() else {
        return (
            StatusCode::NOT_IMPLEMENTED,
            error_body("disabled", "optimization loop is disabled"),
        )
            .into_response();
    };
    let Some(enabled) = body.enabled else {
        return (
            StatusCode::BAD_REQUEST,
            error_body("bad_request", "enabled is required"),
        )
            .into_response();
    };
    if enabled {
        optimization.enable_automatic();
    } else {
        optimization.disable_automatic();
    }
    Json(json!({ "automatic": enabled })).into_response()
}
