use crate::routing::{Dispatcher, RouteRequest, RoutingResult};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

pub fn create_router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/stage1", get(stage1_handler))
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(dispatcher)
}

#[derive(Debug, Deserialize)]
struct Stage1Query {
    caller: Option<String>,
    called: Option<String>,
}

/// Operator/test inspection of a stage-1 computation: the full routing tree,
/// the main result and every per-node result, without touching the cache.
async fn stage1_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    Query(query): Query<Stage1Query>,
) -> Response {
    let (Some(caller), Some(called)) = (query.caller, query.called) else {
        return (StatusCode::BAD_REQUEST, "Provide at least <caller> and <called>").into_response();
    };

    let report = dispatcher
        .route_diagnostic(RouteRequest {
            caller,
            called,
            call_id: None,
        })
        .await;

    let (status, details) = match &report.error {
        None => ("OK", String::new()),
        Some(err) => ("ERROR", format!("{}: {}", err.code(), err)),
    };
    let all_results: BTreeMap<String, &RoutingResult> = report
        .all_results
        .iter()
        .map(|(path, result)| (path.as_str().to_string(), result))
        .collect();

    Json(json!({
        "routing_tree": report.tree,
        "main_routing_result": report.result,
        "all_routing_results": all_results,
        "routing_status": status,
        "routing_status_details": details,
    }))
    .into_response()
}
