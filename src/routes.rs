use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Query, State},
    http::{
        header::{CONTENT_TYPE, IF_NONE_MATCH},
        HeaderMap,
        Method,
        StatusCode,
        Uri,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json,
    Router,
};
use bytes::Bytes;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    conversion::ConversionOrchestrator,
    gateway::{StorageGateway, WriteOptions},
    http_objects::{ApiError, ConversionsResponse, HealthResponse, ListKeysResponse, WriteParams},
    middleware::InstanceRequestSpan,
};

const CONVERSIONS_PATH: &str = "/conversions";

#[derive(Clone)]
pub struct RouteState {
    pub gateway: Arc<StorageGateway>,
    pub orchestrator: ConversionOrchestrator,
    pub route_prefix: String,
}

impl RouteState {
    /// Raw, still percent-encoded key following `base` in the request path.
    fn raw_key<'a>(base: &str, uri: &'a Uri) -> &'a str {
        uri.path()
            .strip_prefix(base)
            .map(|rest| rest.strip_prefix('/').unwrap_or(rest))
            .unwrap_or_default()
    }

    fn item_key<'a>(&self, uri: &'a Uri) -> &'a str {
        Self::raw_key(&self.route_prefix, uri)
    }
}

pub fn create_routes(
    route_state: RouteState,
    max_body_bytes: usize,
    request_span: InstanceRequestSpan,
) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::HEAD,
            Method::PUT,
            Method::DELETE,
        ])
        .allow_origin(Any)
        .allow_headers(Any);

    let prefix = route_state.route_prefix.clone();
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route(CONVERSIONS_PATH, get(list_conversions))
        .route(
            &format!("{CONVERSIONS_PATH}/{{*key}}"),
            get(conversion_status),
        )
        .route(&prefix, get(list_items))
        .route(&format!("{prefix}/"), get(list_items))
        .route(
            &format!("{prefix}/{{*key}}"),
            get(read_item)
                .head(item_exists)
                .put(write_item)
                .delete(remove_item),
        )
        .with_state(route_state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(request_span)
                .on_failure(()),
        )
        .layer(cors)
        .layer(DefaultBodyLimit::max(max_body_bytes))
}

async fn index() -> &'static str {
    "Storage Gateway"
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn list_items(State(state): State<RouteState>) -> Result<Json<ListKeysResponse>, ApiError> {
    let keys = state.gateway.list("").await?;
    Ok(Json(ListKeysResponse {
        prefix: String::new(),
        keys,
    }))
}

#[axum::debug_handler]
async fn read_item(State(state): State<RouteState>, uri: Uri) -> Result<Response, ApiError> {
    let key = state.item_key(&uri);
    if key.ends_with('/') {
        let keys = state.gateway.list(key).await?;
        return Ok(Json(ListKeysResponse {
            prefix: key.to_string(),
            keys,
        })
        .into_response());
    }

    let object = state.gateway.read(key).await?;
    Ok(([(CONTENT_TYPE, object.content_type)], object.bytes).into_response())
}

async fn item_exists(State(state): State<RouteState>, uri: Uri) -> Result<StatusCode, ApiError> {
    if state.gateway.exists(state.item_key(&uri)).await? {
        Ok(StatusCode::OK)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

#[axum::debug_handler]
async fn write_item(
    State(state): State<RouteState>,
    uri: Uri,
    Query(params): Query<WriteParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let fail_if_exists = params.fail_if_exists ||
        headers
            .get(IF_NONE_MATCH)
            .is_some_and(|value| value.as_bytes() == b"*");
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let result = state
        .gateway
        .write(
            state.item_key(&uri),
            body,
            content_type,
            WriteOptions { fail_if_exists },
        )
        .await?;
    let status = if result.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(result)).into_response())
}

async fn remove_item(State(state): State<RouteState>, uri: Uri) -> Result<StatusCode, ApiError> {
    state.gateway.remove(state.item_key(&uri)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_conversions(State(state): State<RouteState>) -> Json<ConversionsResponse> {
    Json(ConversionsResponse {
        jobs: state.orchestrator.list(),
    })
}

async fn conversion_status(
    State(state): State<RouteState>,
    uri: Uri,
) -> Result<Response, ApiError> {
    let key = RouteState::raw_key(CONVERSIONS_PATH, &uri);
    match state.orchestrator.status(key)? {
        Some(snapshot) => Ok(Json(snapshot).into_response()),
        None => Err(ApiError::not_found("no conversion tracked for this key")),
    }
}
