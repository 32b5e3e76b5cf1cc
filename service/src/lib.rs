pub mod api_envelope;
pub mod config;
pub mod events;
pub mod experiments;
pub mod leads;
pub mod metrics;
pub mod observability;
pub mod payments;
pub mod store;


use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tower::ServiceBuilder;
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::trace::TraceLayer;

use crate::api_envelope::{
    created_data, error_response, error_response_with_details, internal_error,
    invalid_request_error, not_found_error, ok_data, unauthorized_error, ApiErrorCode,
    ApiErrorTuple,
};
use crate::config::Config;
use crate::events::EventSubmission;
use crate::experiments::{
    validate_blob, Archetype, CopyPack, CreativeBrief, ExperimentPatch, ExperimentStatus,
    KillCriteria,
};
use crate::leads::{LeadContext, LeadIntakeError, LeadSubmission};
use crate::metrics::{MetricsError, MetricsImport};
use crate::observability::{AuditEvent, Observability};
use crate::payments::WebhookError;
use crate::store::{
    Conflict, ExperimentUpdate, MemoKind, NewExperiment, Store, StoreError,
};

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    store: Arc<Store>,
    observability: Observability,
}

pub fn build_router(config: Config) -> Result<Router, StoreError> {
    build_router_with_observability(config, Observability::default())
}

pub fn build_router_with_observability(
    config: Config,
    observability: Observability,
) -> Result<Router, StoreError> {
    let store = Store::open_at(config.database_path.as_ref())?;
    let state = AppState {
        config: Arc::new(config),
        store: Arc::new(store),
        observability,
    };
    let admin_state = state.clone();

    let public_router = Router::new()
        .route("/health", get(health))
        .route("/leads", post(capture_lead))
        .route("/events", post(record_event))
        .route("/experiments/by-slug/:slug", get(show_public_experiment))
        .route("/payments/webhook", post(stripe_webhook));

    let admin_router = Router::new()
        .route("/experiments", get(list_experiments).post(create_experiment))
        .route(
            "/experiments/:id",
            get(show_experiment).patch(update_experiment),
        )
        .route(
            "/experiments/:id/metrics",
            get(list_experiment_metrics).post(import_experiment_metrics),
        )
        .route("/experiments/:id/leads", get(list_experiment_leads))
        .route(
            "/experiments/:id/decision-memos",
            get(list_decision_memos).post(create_decision_memo),
        )
        .route(
            "/experiments/:id/learning-memos",
            get(list_learning_memos).post(create_learning_memo),
        )
        .route_layer(middleware::from_fn_with_state(admin_state, api_key_gate));

    Ok(Router::new()
        .merge(public_router)
        .merge(admin_router)
        .fallback(unmatched_route)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeShortRequestId))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http()),
        ))
}

/// Request ids look like `req_` plus 16 lowercase hex characters.
#[derive(Debug, Clone, Copy, Default)]
struct MakeShortRequestId;

impl MakeRequestId for MakeShortRequestId {
    fn make_request_id<B>(&mut self, _: &axum::http::Request<B>) -> Option<RequestId> {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("req_{}", &hex[..16]);
        HeaderValue::from_str(&id).ok().map(RequestId::new)
    }
}

fn request_id(headers: &HeaderMap) -> String {
    header_string(headers, "x-request-id")
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| {
            let hex = uuid::Uuid::new_v4().simple().to_string();
            format!("req_{}", &hex[..16])
        })
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

async fn api_key_gate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiErrorTuple> {
    let headers = request.headers();
    let request_id = request_id(headers);
    let presented = header_string(headers, AUTHORIZATION.as_str())
        .and_then(|value| {
            value
                .strip_prefix("Bearer ")
                .map(|token| token.trim().to_string())
        })
        .or_else(|| header_string(headers, "x-api-key"));

    let authorized = presented
        .as_deref()
        .filter(|key| !key.is_empty())
        .is_some_and(|key| state.config.api_keys.iter().any(|known| known == key));
    if !authorized {
        state
            .observability
            .increment_counter("api_key_rejected", &request_id);
        return Err(unauthorized_error("Invalid or missing API key.", &request_id));
    }
    Ok(next.run(request).await)
}

async fn unmatched_route(headers: HeaderMap) -> ApiErrorTuple {
    not_found_error("Not found.", &request_id(&headers))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    ok_data(serde_json::json!({
        "status": "ok",
        "timestamp": store::now_ms(),
        "version": env!("CARGO_PKG_VERSION"),
        "environment": state.config.environment,
    }))
}

// ─── Public intake ───────────────────────────────────────────────────

async fn capture_lead(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(submission): Json<LeadSubmission>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let request_id = request_id(&headers);
    let context = LeadContext {
        user_agent: header_string(&headers, "user-agent"),
        ip_country: header_string(&headers, "cf-ipcountry")
            .or_else(|| header_string(&headers, "x-ip-country")),
        referrer: header_string(&headers, "referer"),
    };

    let outcome = leads::submit_lead(&state.store, submission, context).map_err(|error| {
        match error {
            LeadIntakeError::MissingField(field) => {
                invalid_request_error(format!("{field} is required."), &request_id)
            }
            LeadIntakeError::InvalidCustomFields => {
                invalid_request_error("custom_fields must be a JSON object.", &request_id)
            }
            LeadIntakeError::ExperimentNotFound => error_response(
                ApiErrorCode::ExperimentNotFound,
                "Experiment not found.",
                &request_id,
            ),
            LeadIntakeError::DuplicateLead => error_response(
                ApiErrorCode::DuplicateLead,
                "A lead with this email already exists for this experiment.",
                &request_id,
            ),
            LeadIntakeError::Store(error) => {
                tracing::error!(%request_id, %error, "lead intake storage failure");
                internal_error(&request_id)
            }
        }
    })?;

    state
        .observability
        .increment_counter("leads_captured", &request_id);
    Ok(created_data(serde_json::json!({
        "lead_id": outcome.lead_id,
        "experiment_id": outcome.experiment_id,
        "slug": outcome.slug,
    })))
}

async fn record_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(submission): Json<EventSubmission>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let request_id = request_id(&headers);
    if submission.event_type.trim().is_empty() {
        return Err(invalid_request_error("event_type is required.", &request_id));
    }

    let user_agent = header_string(&headers, "user-agent");
    let ip_country = header_string(&headers, "cf-ipcountry")
        .or_else(|| header_string(&headers, "x-ip-country"));
    let outcome = events::submit_event(
        &state.store,
        state.config.event_dedup_window_seconds,
        submission,
        user_agent,
        ip_country,
    )
    .map_err(|error| {
        tracing::error!(%request_id, %error, "event submission storage failure");
        internal_error(&request_id)
    })?;

    Ok(created_data(serde_json::json!({
        "event_id": outcome.event_id,
        "deduplicated": outcome.deduplicated,
    })))
}

async fn show_public_experiment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(slug): Path<String>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let request_id = request_id(&headers);
    let record = state
        .store
        .get_experiment_by_slug(&slug)
        .map_err(|error| map_store_error(error, &request_id))?
        .filter(|record| record.status.accepts_leads())
        .ok_or_else(|| {
            error_response(
                ApiErrorCode::ExperimentNotFound,
                "Experiment not found.",
                &request_id,
            )
        })?;
    Ok(ok_data(record.public_payload()))
}

async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let request_id = request_id(&headers);
    let signature_header = header_string(&headers, "stripe-signature");

    payments::handle_webhook(
        &state.store,
        &state.observability,
        state.config.stripe_webhook_secret.as_deref(),
        signature_header.as_deref(),
        &body,
        &request_id,
    )
    .map_err(|error| match error {
        WebhookError::MissingSecret | WebhookError::SigningKey => {
            tracing::error!(%request_id, %error, "stripe webhook misconfiguration");
            internal_error(&request_id)
        }
        WebhookError::MissingSignatureHeader
        | WebhookError::MalformedHeader
        | WebhookError::MalformedPayload => {
            invalid_request_error(error.to_string(), &request_id)
        }
        WebhookError::InvalidSignature => invalid_request_error("invalid signature", &request_id),
        WebhookError::Store(error) => {
            tracing::error!(%request_id, %error, "stripe webhook storage failure");
            internal_error(&request_id)
        }
    })?;

    Ok(ok_data(serde_json::json!({ "received": true })))
}

// ─── Admin API ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CreateExperimentPayload {
    name: String,
    slug: String,
    archetype: String,
    #[serde(default)]
    problem_statement: Option<String>,
    #[serde(default)]
    target_audience: Option<String>,
    #[serde(default)]
    value_proposition: Option<String>,
    #[serde(default)]
    market_size_estimate: Option<String>,
    #[serde(default)]
    min_signups: Option<i64>,
    #[serde(default)]
    max_spend_cents: Option<i64>,
    #[serde(default)]
    max_duration_days: Option<i64>,
    #[serde(default)]
    kill_criteria: Option<Value>,
    #[serde(default)]
    copy_pack: Option<Value>,
    #[serde(default)]
    creative_brief: Option<Value>,
    #[serde(default)]
    stripe_price_id: Option<String>,
    #[serde(default)]
    stripe_product_id: Option<String>,
    #[serde(default)]
    price_cents: Option<i64>,
}

fn validate_slug(slug: &str, request_id: &str) -> Result<String, ApiErrorTuple> {
    let slug = slug.trim().to_string();
    let valid = !slug.is_empty()
        && slug.len() <= 100
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(slug)
    } else {
        Err(invalid_request_error(
            "slug must contain only lowercase letters, digits, and hyphens.",
            request_id,
        ))
    }
}

fn validate_blob_field<T>(
    field: &'static str,
    value: Option<&Value>,
    version_of: impl Fn(&T) -> u32,
    request_id: &str,
) -> Result<Option<String>, ApiErrorTuple>
where
    T: serde::de::DeserializeOwned + serde::Serialize,
{
    value
        .map(|value| validate_blob(field, value, version_of))
        .transpose()
        .map_err(|error| invalid_request_error(error.to_string(), request_id))
}

fn validate_thresholds(
    max_spend_cents: Option<i64>,
    max_duration_days: Option<i64>,
    price_cents: Option<i64>,
    request_id: &str,
) -> Result<(), ApiErrorTuple> {
    if max_spend_cents.is_some_and(|value| value < 0) {
        return Err(invalid_request_error(
            "max_spend_cents must not be negative.",
            request_id,
        ));
    }
    if max_duration_days.is_some_and(|value| value <= 0) {
        return Err(invalid_request_error(
            "max_duration_days must be positive.",
            request_id,
        ));
    }
    if price_cents.is_some_and(|value| value < 0) {
        return Err(invalid_request_error(
            "price_cents must not be negative.",
            request_id,
        ));
    }
    Ok(())
}

fn page_limit(config: &Config, requested: Option<u32>) -> u32 {
    requested
        .unwrap_or_else(|| config.default_page_limit())
        .clamp(1, config.max_page_limit())
}

async fn create_experiment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateExperimentPayload>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let request_id = request_id(&headers);

    let name = payload.name.trim().to_string();
    if name.is_empty() {
        return Err(invalid_request_error("name is required.", &request_id));
    }
    let slug = validate_slug(&payload.slug, &request_id)?;
    let archetype = Archetype::parse(payload.archetype.trim()).ok_or_else(|| {
        invalid_request_error(
            format!("unknown archetype '{}'.", payload.archetype.trim()),
            &request_id,
        )
    })?;
    validate_thresholds(
        payload.max_spend_cents,
        payload.max_duration_days,
        payload.price_cents,
        &request_id,
    )?;
    let kill_criteria = validate_blob_field::<KillCriteria>(
        "kill_criteria",
        payload.kill_criteria.as_ref(),
        |blob| blob.version,
        &request_id,
    )?;
    let copy_pack = validate_blob_field::<CopyPack>(
        "copy_pack",
        payload.copy_pack.as_ref(),
        |blob| blob.version,
        &request_id,
    )?;
    let creative_brief = validate_blob_field::<CreativeBrief>(
        "creative_brief",
        payload.creative_brief.as_ref(),
        |blob| blob.version,
        &request_id,
    )?;

    let record = state
        .store
        .create_experiment(NewExperiment {
            name,
            slug,
            archetype,
            problem_statement: payload.problem_statement,
            target_audience: payload.target_audience,
            value_proposition: payload.value_proposition,
            market_size_estimate: payload.market_size_estimate,
            min_signups: payload.min_signups,
            max_spend_cents: payload.max_spend_cents,
            max_duration_days: payload.max_duration_days,
            kill_criteria,
            copy_pack,
            creative_brief,
            stripe_price_id: payload.stripe_price_id,
            stripe_product_id: payload.stripe_product_id,
            price_cents: payload.price_cents,
        })
        .map_err(|error| map_store_error(error, &request_id))?;

    state.observability.audit(
        AuditEvent::new("experiment_created", request_id)
            .with_attribute("experiment_id", record.id.clone())
            .with_attribute("archetype", record.archetype.as_str()),
    );
    Ok(created_data(record))
}

async fn list_experiments(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let request_id = request_id(&headers);
    let limit = page_limit(&state.config, query.limit);
    let page = state
        .store
        .list_experiments(query.cursor.as_deref(), limit)
        .map_err(|error| map_store_error(error, &request_id))?;
    Ok(ok_data(page))
}

async fn show_experiment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let request_id = request_id(&headers);
    let record = fetch_experiment_or_404(&state, &id, &request_id)?;
    Ok(ok_data(record))
}

async fn update_experiment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(patch): Json<ExperimentPatch>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let request_id = request_id(&headers);
    if patch.is_empty() {
        return Err(invalid_request_error("no fields to update.", &request_id));
    }

    let status = patch
        .status
        .as_deref()
        .map(|raw| {
            ExperimentStatus::parse(raw.trim()).ok_or_else(|| {
                invalid_request_error(format!("unknown status '{}'.", raw.trim()), &request_id)
            })
        })
        .transpose()?;
    let slug = patch
        .slug
        .as_deref()
        .map(|raw| validate_slug(raw, &request_id))
        .transpose()?;
    validate_thresholds(
        patch.max_spend_cents,
        patch.max_duration_days,
        patch.price_cents,
        &request_id,
    )?;
    let kill_criteria = validate_blob_field::<KillCriteria>(
        "kill_criteria",
        patch.kill_criteria.as_ref(),
        |blob| blob.version,
        &request_id,
    )?;
    let copy_pack = validate_blob_field::<CopyPack>(
        "copy_pack",
        patch.copy_pack.as_ref(),
        |blob| blob.version,
        &request_id,
    )?;
    let creative_brief = validate_blob_field::<CreativeBrief>(
        "creative_brief",
        patch.creative_brief.as_ref(),
        |blob| blob.version,
        &request_id,
    )?;

    let record = state
        .store
        .update_experiment(
            &id,
            ExperimentUpdate {
                status,
                name: patch.name,
                slug,
                problem_statement: patch.problem_statement,
                target_audience: patch.target_audience,
                value_proposition: patch.value_proposition,
                market_size_estimate: patch.market_size_estimate,
                min_signups: patch.min_signups,
                max_spend_cents: patch.max_spend_cents,
                max_duration_days: patch.max_duration_days,
                kill_criteria,
                copy_pack,
                creative_brief,
                stripe_price_id: patch.stripe_price_id,
                stripe_product_id: patch.stripe_product_id,
                price_cents: patch.price_cents,
            },
        )
        .map_err(|error| map_store_error(error, &request_id))?;

    if status.is_some() {
        state.observability.audit(
            AuditEvent::new("experiment_status_changed", request_id)
                .with_attribute("experiment_id", record.id.clone())
                .with_attribute("status", record.status.as_str()),
        );
    }
    Ok(ok_data(record))
}

async fn import_experiment_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(import): Json<MetricsImport>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let request_id = request_id(&headers);
    fetch_experiment_or_404(&state, &id, &request_id)?;
    let record = metrics::import_daily(&state.store, &id, import).map_err(|error| match error {
        MetricsError::NegativeCounter { .. } | MetricsError::BadDate => {
            invalid_request_error(error.to_string(), &request_id)
        }
        MetricsError::Store(error) => map_store_error(error, &request_id),
    })?;
    Ok(created_data(record))
}

async fn list_experiment_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let request_id = request_id(&headers);
    fetch_experiment_or_404(&state, &id, &request_id)?;
    let records = state
        .store
        .list_metrics_daily(&id)
        .map_err(|error| map_store_error(error, &request_id))?;
    Ok(ok_data(records))
}

async fn list_experiment_leads(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let request_id = request_id(&headers);
    fetch_experiment_or_404(&state, &id, &request_id)?;
    let cursor = query
        .cursor
        .as_deref()
        .map(|raw| {
            raw.parse::<i64>()
                .map_err(|_| invalid_request_error("invalid cursor.", &request_id))
        })
        .transpose()?;
    let limit = page_limit(&state.config, query.limit);
    let page = state
        .store
        .list_leads(&id, cursor, limit)
        .map_err(|error| map_store_error(error, &request_id))?;
    Ok(ok_data(page))
}

#[derive(Debug, Deserialize)]
struct MemoPayload {
    title: String,
    body: String,
}

async fn create_decision_memo(
    state: State<AppState>,
    headers: HeaderMap,
    path: Path<String>,
    payload: Json<MemoPayload>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    create_memo(state, headers, path, payload, MemoKind::Decision).await
}

async fn create_learning_memo(
    state: State<AppState>,
    headers: HeaderMap,
    path: Path<String>,
    payload: Json<MemoPayload>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    create_memo(state, headers, path, payload, MemoKind::Learning).await
}

async fn create_memo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(payload): Json<MemoPayload>,
    kind: MemoKind,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let request_id = request_id(&headers);
    fetch_experiment_or_404(&state, &id, &request_id)?;
    let title = payload.title.trim();
    let body = payload.body.trim();
    if title.is_empty() || body.is_empty() {
        return Err(invalid_request_error(
            "title and body are required.",
            &request_id,
        ));
    }
    let memo = state
        .store
        .insert_memo(kind, &id, title, body)
        .map_err(|error| map_store_error(error, &request_id))?;
    Ok(created_data(memo))
}

async fn list_decision_memos(
    state: State<AppState>,
    headers: HeaderMap,
    path: Path<String>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    list_memos(state, headers, path, MemoKind::Decision).await
}

async fn list_learning_memos(
    state: State<AppState>,
    headers: HeaderMap,
    path: Path<String>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    list_memos(state, headers, path, MemoKind::Learning).await
}

async fn list_memos(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    kind: MemoKind,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let request_id = request_id(&headers);
    fetch_experiment_or_404(&state, &id, &request_id)?;
    let memos = state
        .store
        .list_memos(kind, &id)
        .map_err(|error| map_store_error(error, &request_id))?;
    Ok(ok_data(memos))
}

fn fetch_experiment_or_404(
    state: &AppState,
    id: &str,
    request_id: &str,
) -> Result<crate::experiments::ExperimentRecord, ApiErrorTuple> {
    state
        .store
        .get_experiment(id)
        .map_err(|error| map_store_error(error, request_id))?
        .ok_or_else(|| {
            error_response(
                ApiErrorCode::ExperimentNotFound,
                "Experiment not found.",
                request_id,
            )
        })
}

fn map_store_error(error: StoreError, request_id: &str) -> ApiErrorTuple {
    match error {
        StoreError::NotFound => error_response(
            ApiErrorCode::ExperimentNotFound,
            "Experiment not found.",
            request_id,
        ),
        StoreError::Validation { field, message } => {
            invalid_request_error(format!("{field}: {message}"), request_id)
        }
        StoreError::Conflict(Conflict::ExperimentSlug) => error_response(
            ApiErrorCode::DuplicateSlug,
            "An experiment with this slug already exists.",
            request_id,
        ),
        StoreError::Conflict(Conflict::LeadEmail) => error_response(
            ApiErrorCode::DuplicateLead,
            "A lead with this email already exists for this experiment.",
            request_id,
        ),
        StoreError::InvalidTransition { current, requested } => {
            let allowed: Vec<&str> = current
                .allowed_transitions()
                .iter()
                .map(|status| status.as_str())
                .collect();
            error_response_with_details(
                ApiErrorCode::InvalidStatusTransition,
                format!(
                    "cannot transition from '{}' to '{}'.",
                    current.as_str(),
                    requested.as_str()
                ),
                Some(serde_json::json!({
                    "current_status": current.as_str(),
                    "requested_status": requested.as_str(),
                    "allowed_transitions": allowed,
                })),
                request_id,
            )
        }
        other => {
            tracing::error!(%request_id, error = %other, "storage failure");
            internal_error(request_id)
        }
    }
}
