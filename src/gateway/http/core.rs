use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use super::generator::{CoinflipStats, VerifyOutcome, verify_hash_prefix};
use super::{
    AccountCreated, AccountOverview, BatchRequest, BatchResponse, CoinflipRequest,
    CreateAccountRequest, Gateway, GatewayError, GatewayMode, GenerateRequest, GenerateResponse,
    IssueKeyRequest, IssuedCredential, ObservabilitySnapshot, ResolvedCredential, StoreError,
    SubscribeRequest, SubscriptionRecord, UsageSummary, generate_request_id,
};

const SERVICE_NAME: &str = "GoldenSeed API";
const RETRY_AFTER_SECS: &str = "60";

#[derive(Clone)]
pub struct GatewayHttpState {
    gateway: Arc<Gateway>,
    admin_token: Option<String>,
    cors_permissive: bool,
}

impl GatewayHttpState {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            admin_token: None,
            cors_permissive: false,
        }
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }

    pub fn with_permissive_cors(mut self, enabled: bool) -> Self {
        self.cors_permissive = enabled;
        self
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

type HttpError = (StatusCode, HeaderMap, Json<ErrorResponse>);

#[derive(Debug, Serialize)]
struct RootResponse {
    service: &'static str,
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    generator: &'static str,
    generator_available: bool,
    store: &'static str,
    database_available: bool,
    mode: GatewayMode,
    version: &'static str,
}

pub fn router(state: GatewayHttpState) -> Router {
    let mut router = Router::new()
        .route("/", get(root))
        .route("/api/v1/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/v1/generate", post(generate))
        .route("/api/v1/batch", post(batch))
        .route("/api/v1/verify/:hash_prefix", get(verify))
        .route("/api/v1/stats/coinflip", get(coinflip))
        .route("/api/v1/usage", get(usage));

    if state.admin_token.is_some() {
        router = router
            .route("/admin/accounts", post(create_account))
            .route(
                "/admin/accounts/:id",
                get(get_account).delete(delete_account),
            )
            .route(
                "/admin/accounts/:id/subscription",
                post(change_subscription).delete(cancel_subscription),
            )
            .route("/admin/accounts/:id/keys", post(issue_key))
            .route("/admin/keys/:id", delete(deactivate_key))
            .route("/admin/reservations/reap", post(reap_reservations));
    }

    let cors_permissive = state.cors_permissive;
    let router = router.with_state(state);
    if cors_permissive {
        return router.layer(CorsLayer::permissive());
    }
    router
}

async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        service: SERVICE_NAME,
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn health(State(state): State<GatewayHttpState>) -> Json<HealthResponse> {
    let gateway = &state.gateway;
    let mode = gateway.mode();
    Json(HealthResponse {
        status: "healthy",
        generator: gateway.generator_name(),
        generator_available: true,
        store: gateway.store_backend(),
        database_available: mode == GatewayMode::Production,
        mode,
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn metrics(State(state): State<GatewayHttpState>) -> Json<ObservabilitySnapshot> {
    Json(state.gateway.observability())
}

async fn generate(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<(HeaderMap, Json<GenerateResponse>), HttpError> {
    let caller = authenticate(&state, &headers).await?;
    let Json(request) = payload.map_err(json_rejection)?;
    let request_id = generate_request_id();
    let response = state
        .gateway
        .generate(&caller, &request_id, request)
        .await
        .map_err(map_gateway_error)?;
    Ok((request_id_headers(&request_id), Json(response)))
}

async fn batch(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    payload: Result<Json<BatchRequest>, JsonRejection>,
) -> Result<(HeaderMap, Json<BatchResponse>), HttpError> {
    let caller = authenticate(&state, &headers).await?;
    let Json(request) = payload.map_err(json_rejection)?;
    let request_id = generate_request_id();
    let response = state
        .gateway
        .batch(&caller, &request_id, request)
        .await
        .map_err(map_gateway_error)?;
    Ok((request_id_headers(&request_id), Json(response)))
}

async fn verify(Path(hash_prefix): Path<String>) -> Json<VerifyOutcome> {
    Json(verify_hash_prefix(&hash_prefix))
}

async fn coinflip(
    State(state): State<GatewayHttpState>,
    query: Result<Query<CoinflipRequest>, QueryRejection>,
) -> Result<Json<CoinflipStats>, HttpError> {
    let Query(request) = query.map_err(|rejection| {
        error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            rejection.body_text(),
        )
    })?;
    let stats = state
        .gateway
        .coinflip(request)
        .await
        .map_err(map_gateway_error)?;
    Ok(Json(stats))
}

async fn usage(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
) -> Result<Json<UsageSummary>, HttpError> {
    let caller = authenticate(&state, &headers).await?;
    let summary = state
        .gateway
        .usage_summary(&caller)
        .await
        .map_err(map_gateway_error)?;
    Ok(Json(summary))
}

async fn authenticate(
    state: &GatewayHttpState,
    headers: &HeaderMap,
) -> Result<ResolvedCredential, HttpError> {
    let secret = extract_api_key(headers)?;
    state
        .gateway
        .authenticate(&secret)
        .await
        .map_err(map_gateway_error)
}

/// `Authorization: Bearer <secret>`, scheme matched case-insensitively.
fn extract_api_key(headers: &HeaderMap) -> Result<String, HttpError> {
    let Some(raw) = headers.get("authorization") else {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "missing_credential",
            "missing API key; send Authorization: Bearer gs_...",
        ));
    };
    extract_bearer_value(raw).ok_or_else(|| {
        error_response(
            StatusCode::UNAUTHORIZED,
            "invalid_auth_format",
            "invalid auth format; use Authorization: Bearer gs_...",
        )
    })
}

fn extract_bearer_value(raw: &HeaderValue) -> Option<String> {
    let auth = raw.to_str().ok()?.trim();
    let (scheme, rest) = auth.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    headers.get("authorization").and_then(extract_bearer_value)
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn request_id_headers(request_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert("x-request-id", value);
    }
    headers
}

fn json_rejection(rejection: JsonRejection) -> HttpError {
    error_response(
        StatusCode::BAD_REQUEST,
        "invalid_request",
        rejection.body_text(),
    )
}

/// Parses an optional JSON body: empty means `T::default()`, anything else must be
/// valid.
fn optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, HttpError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|err| {
        error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            format!("invalid JSON body: {err}"),
        )
    })
}

fn map_gateway_error(err: GatewayError) -> HttpError {
    match err {
        GatewayError::InvalidCredential => error_response(
            StatusCode::FORBIDDEN,
            "invalid_credential",
            "invalid or expired API key",
        ),
        GatewayError::NoSubscription => error_response(
            StatusCode::PAYMENT_REQUIRED,
            "no_subscription",
            "no active subscription for this account",
        ),
        GatewayError::RateLimited { limit } => {
            let (status, mut headers, body) = error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                format!("rate limit exceeded: {limit} requests/minute"),
            );
            headers.insert("retry-after", HeaderValue::from_static(RETRY_AFTER_SECS));
            (status, headers, body)
        }
        GatewayError::QuotaExceeded { limit, used } => error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "quota_exceeded",
            format!("monthly unit limit exceeded: used {used} of {limit}"),
        ),
        GatewayError::InvalidRequest { reason } => {
            error_response(StatusCode::BAD_REQUEST, "invalid_request", reason)
        }
        GatewayError::MeteringUnavailable(err) => {
            tracing::error!(error = %err, "metering unavailable");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "metering_unavailable",
                "usage metering is temporarily unavailable",
            )
        }
        GatewayError::Store(StoreError::AccountNotFound(id)) => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("account not found: {id}"),
        ),
        GatewayError::Store(StoreError::Conflict(message)) => {
            error_response(StatusCode::CONFLICT, "conflict", message)
        }
        GatewayError::Store(err) => {
            tracing::error!(error = %err, "store error");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "store_error",
                "storage is temporarily unavailable",
            )
        }
        GatewayError::Generator(err) => {
            tracing::error!(error = %err, "generation failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "generation_failed",
                format!("generation failed: {err}"),
            )
        }
        GatewayError::Internal { message } => {
            tracing::error!(%message, "internal error");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "internal error",
            )
        }
    }
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> HttpError {
    (
        status,
        HeaderMap::new(),
        Json(ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message: message.into(),
            },
        }),
    )
}
