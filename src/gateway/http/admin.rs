#[derive(Debug, Deserialize)]
struct ReapReservationsRequest {
    #[serde(default = "default_reap_older_than_secs")]
    older_than_secs: u64,
}

fn default_reap_older_than_secs() -> u64 {
    300
}

impl Default for ReapReservationsRequest {
    fn default() -> Self {
        Self {
            older_than_secs: default_reap_older_than_secs(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ReapReservationsResponse {
    reaped: u64,
}

/// Accepts the admin token as a bearer credential or in `x-admin-token`.
fn ensure_admin(state: &GatewayHttpState, headers: &HeaderMap) -> Result<(), HttpError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "not_configured",
            "admin auth not configured",
        ));
    };

    let provided = extract_bearer(headers)
        .or_else(|| extract_header(headers, "x-admin-token"))
        .unwrap_or_default();
    if provided == expected {
        return Ok(());
    }

    Err(error_response(
        StatusCode::UNAUTHORIZED,
        "unauthorized",
        "invalid admin token",
    ))
}

async fn create_account(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    payload: Result<Json<CreateAccountRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AccountCreated>), HttpError> {
    ensure_admin(&state, &headers)?;
    let Json(request) = payload.map_err(json_rejection)?;
    let created = state
        .gateway
        .create_account(request)
        .await
        .map_err(map_gateway_error)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_account(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
) -> Result<Json<AccountOverview>, HttpError> {
    ensure_admin(&state, &headers)?;
    let overview = state
        .gateway
        .account_overview(&account_id)
        .await
        .map_err(map_gateway_error)?;
    Ok(Json(overview))
}

async fn delete_account(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
) -> Result<StatusCode, HttpError> {
    ensure_admin(&state, &headers)?;
    let deleted = state
        .gateway
        .delete_account(&account_id)
        .await
        .map_err(map_gateway_error)?;
    if !deleted {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("account not found: {account_id}"),
        ));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn change_subscription(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
    payload: Result<Json<SubscribeRequest>, JsonRejection>,
) -> Result<Json<SubscriptionRecord>, HttpError> {
    ensure_admin(&state, &headers)?;
    let Json(request) = payload.map_err(json_rejection)?;
    let subscription = state
        .gateway
        .change_subscription(&account_id, request)
        .await
        .map_err(map_gateway_error)?;
    Ok(Json(subscription))
}

async fn cancel_subscription(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
) -> Result<StatusCode, HttpError> {
    ensure_admin(&state, &headers)?;
    let cancelled = state
        .gateway
        .cancel_subscription(&account_id)
        .await
        .map_err(map_gateway_error)?;
    if cancelled == 0 {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no active subscription for account: {account_id}"),
        ));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn issue_key(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<IssuedCredential>), HttpError> {
    ensure_admin(&state, &headers)?;
    let request: IssueKeyRequest = optional_json(&body)?;
    let issued = state
        .gateway
        .issue_key(&account_id, request)
        .await
        .map_err(map_gateway_error)?;
    Ok((StatusCode::CREATED, Json(issued)))
}

async fn deactivate_key(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path(credential_id): Path<String>,
) -> Result<StatusCode, HttpError> {
    ensure_admin(&state, &headers)?;
    let changed = state
        .gateway
        .deactivate_key(&credential_id)
        .await
        .map_err(map_gateway_error)?;
    if !changed {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("active key not found: {credential_id}"),
        ));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn reap_reservations(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ReapReservationsResponse>, HttpError> {
    ensure_admin(&state, &headers)?;
    let request: ReapReservationsRequest = optional_json(&body)?;
    let older_than_ms = i64::try_from(request.older_than_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
    let reaped = state
        .gateway
        .reap_reservations(older_than_ms)
        .await
        .map_err(map_gateway_error)?;
    Ok(Json(ReapReservationsResponse { reaped }))
}
