//! Public HTTP surface
//!
//! Both public dialects funnel into one pipeline: authorize, preflight
//! billing, translate, call upstream with the streaming engine, then
//! encode back out as OpenAI SSE, Anthropic SSE, or a collected JSON body.
//! Billing settles after the stream terminates, from reported usage when
//! the upstream sent any and from the tokenizer estimate otherwise.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use kiro_auth::AuthMethod;
use kiro_pool::RequestBinding;
use serde_json::{Value, json};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::anthropic::{CountTokensRequest, CreateBatchRequest, CreateMessageRequest};
use crate::batches::BatchWork;
use crate::config::ApiKeySource;
use crate::error::{ApiError, Dialect, GatewayError};
use crate::openai::{ChatCompletionRequest, ChatCompletionResponse, ModelList, OpenAiModel};
use crate::state::AppState;
use crate::stream::anthropic_sse::AnthropicSseEncoder;
use crate::stream::collect::Collector;
use crate::stream::demux::FrameDecoder;
use crate::stream::openai_sse::OpenAiSseEncoder;
use crate::stream::{StreamEvent, UsageCounters, UsageTracker};
use crate::tokenizer;
use crate::translate::{
    anthropic_to_openai, build_upstream_payload, openai_response_to_anthropic_message,
};
use crate::upstream::{StreamingStart, api_host, q_host};

pub fn router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/v1/models", get(list_models))
        .route("/v1/models/{model_id}", get(get_model))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1/messages/count_tokens", post(count_tokens))
        .route("/v1/messages/batches", post(create_batch).get(list_batches))
        .route(
            "/v1/messages/batches/{batch_id}",
            get(get_batch).delete(delete_batch),
        )
        .route("/v1/messages/batches/{batch_id}/results", get(batch_results))
        .route("/v1/messages/batches/{batch_id}/cancel", post(cancel_batch))
        .with_state(state)
}

/// The caller behind a validated API key. `user_id` is present only when
/// keys come from the ledger.
#[derive(Debug, Clone)]
struct AuthedUser {
    user_id: Option<String>,
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| {
            headers
                .get("x-api-key")
                .and_then(|value| value.to_str().ok())
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
}

async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<AuthedUser, GatewayError> {
    let Some(key) = extract_api_key(headers) else {
        warn!("request without API key");
        return Err(GatewayError::AuthMissing);
    };

    match state.config.api_key_source {
        ApiKeySource::Static => {
            let expected = state.config.api_key.expose();
            let matches: bool = expected.as_bytes().ct_eq(key.as_bytes()).into();
            if matches {
                Ok(AuthedUser { user_id: None })
            } else {
                warn!("request with invalid API key");
                Err(GatewayError::AuthInvalid)
            }
        }
        ApiKeySource::Ledger => {
            let ledger = state
                .ledger
                .as_ref()
                .ok_or_else(|| GatewayError::Internal("ledger not configured".into()))?;
            match ledger.find_user_by_api_key(&key).await? {
                Some(user) => Ok(AuthedUser {
                    user_id: Some(user.user_id),
                }),
                None => {
                    warn!("request with unknown API key");
                    Err(GatewayError::AuthInvalid)
                }
            }
        }
    }
}

// --- liveness ---

async fn root() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Kiro gateway is running",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
    Json(json!({
        "status": "healthy",
        "timestamp": timestamp,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "pool": state.auth.pool_health().await,
    }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// --- model listing ---

async fn list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let anthropic_shape = headers.contains_key("anthropic-version");
    let dialect = if anthropic_shape {
        Dialect::Anthropic
    } else {
        Dialect::OpenAi
    };
    authorize(&state, &headers)
        .await
        .map_err(|e| ApiError { error: e, dialect })?;
    info!("request to /v1/models");

    if anthropic_shape {
        let created_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        let models: Vec<Value> = state
            .models
            .model_ids()
            .await
            .into_iter()
            .map(|id| {
                json!({
                    "id": &id,
                    "type": "model",
                    "display_name": &id,
                    "created_at": &created_at,
                })
            })
            .collect();
        let first_id = models.first().and_then(|m| m.get("id").cloned());
        let last_id = models.last().and_then(|m| m.get("id").cloned());
        return Ok(Json(json!({
            "data": models,
            "first_id": first_id,
            "last_id": last_id,
            "has_more": false,
        }))
        .into_response());
    }

    if state.models.needs_refresh().await {
        refresh_model_cache(&state).await;
    }

    let models = state
        .models
        .model_ids()
        .await
        .into_iter()
        .map(OpenAiModel::new)
        .collect();
    Ok(Json(ModelList::new(models)).into_response())
}

/// Best-effort upstream fetch; the static list covers failures.
async fn refresh_model_cache(state: &AppState) {
    let binding = RequestBinding::new();
    let grant = match state.auth.get_access_token(&binding).await {
        Ok(grant) => grant,
        Err(error) => {
            warn!(error = %error, "failed to authorize model list fetch");
            return;
        }
    };

    let mut query: Vec<(&str, String)> = vec![("origin", "AI_EDITOR".to_string())];
    // Device-OAuth accounts must not send a profile; the upstream rejects it
    if grant.method == AuthMethod::DesktopRefresh
        && let Some(profile_arn) = &grant.profile_arn
    {
        query.push(("profileArn", profile_arn.clone()));
    }

    let url = format!("{}/ListAvailableModels", q_host(state.auth.region()));
    match state.upstream.get_json(&binding, &url, &query).await {
        Ok(value) => {
            if let Some(models) = value.get("models").and_then(Value::as_array) {
                info!(count = models.len(), "model list fetched from upstream");
                state.models.update(models.clone()).await;
            }
        }
        Err(error) => warn!(error = %error, "failed to fetch models from upstream"),
    }
}

async fn get_model(
    State(state): State<Arc<AppState>>,
    Path(model_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&state, &headers)
        .await
        .map_err(ApiError::anthropic)?;
    if !headers.contains_key("anthropic-version") {
        return Err(ApiError::openai(GatewayError::NotFound));
    }
    let created_at = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
    Ok(Json(json!({
        "id": &model_id,
        "type": "model",
        "display_name": &model_id,
        "created_at": created_at,
    }))
    .into_response())
}

// --- completion pipeline ---

struct Prepared {
    payload: Value,
    binding: RequestBinding,
}

/// Preflight billing, bind an account, and build the upstream payload.
async fn prepare(
    state: &AppState,
    user: &AuthedUser,
    request: &ChatCompletionRequest,
    prompt_estimate: u64,
) -> Result<Prepared, GatewayError> {
    if let (Some(user_id), Some(ledger)) = (&user.user_id, &state.ledger) {
        let required = state
            .pricing
            .preflight_charge(&request.model, prompt_estimate)?;
        state.pricing.preflight(ledger, user_id, required).await?;
    }

    let binding = RequestBinding::new();
    let grant = state
        .auth
        .get_access_token(&binding)
        .await
        .map_err(GatewayError::from_auth)?;
    // The profile identifier rides along only for desktop credentials;
    // the device-OAuth upstream 403s when it is present
    let profile_arn = match grant.method {
        AuthMethod::DesktopRefresh => grant.profile_arn.as_deref(),
        AuthMethod::DeviceOauth => None,
    };

    let conversation_id = Uuid::new_v4().to_string();
    let payload = build_upstream_payload(request, &conversation_id, profile_arn)?;
    Ok(Prepared { payload, binding })
}

/// Extract a human-readable message from an upstream error body.
fn parse_upstream_error(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return body.to_string();
    };
    let Some(message) = value.get("message").and_then(Value::as_str) else {
        return body.to_string();
    };
    match value.get("reason").and_then(Value::as_str) {
        Some(reason) => format!("{message} (reason: {reason})"),
        None => message.to_string(),
    }
}

/// Issue the upstream call and fail fast on a non-2xx response so the
/// client sees the upstream's own error before any SSE bytes go out.
async fn start_stream(
    state: &AppState,
    prepared: &Prepared,
) -> Result<StreamingStart, GatewayError> {
    let url = format!(
        "{}/generateAssistantResponse",
        api_host(state.auth.region())
    );
    let start = state
        .upstream
        .request_streaming(&prepared.binding, &url, &prepared.payload)
        .await?;

    let status = start.response.status();
    if !status.is_success() {
        let body = start.response.text().await.unwrap_or_default();
        let message = parse_upstream_error(&body);
        warn!(status = status.as_u16(), %message, "upstream rejected completion request");
        return Err(GatewayError::UpstreamStatus {
            status: status.as_u16(),
            message,
        });
    }
    Ok(start)
}

async fn settle_billing(
    state: &AppState,
    user: &AuthedUser,
    model: &str,
    usage: &UsageCounters,
) -> Result<(), GatewayError> {
    let (Some(user_id), Some(ledger)) = (&user.user_id, &state.ledger) else {
        return Ok(());
    };
    state.pricing.deduct(ledger, user_id, model, usage).await?;
    Ok(())
}

/// Run a completion to the end and collect it into one response object.
/// Uses the non-streaming retry policy (backoff, 502 on exhaustion); the
/// upstream body is still frame-decoded like any other reply.
async fn run_collected(
    state: &AppState,
    user: &AuthedUser,
    request: &ChatCompletionRequest,
    prompt_estimate: u64,
) -> Result<ChatCompletionResponse, GatewayError> {
    let prepared = prepare(state, user, request, prompt_estimate).await?;

    let url = format!(
        "{}/generateAssistantResponse",
        api_host(state.auth.region())
    );
    let mut response = state
        .upstream
        .request_json(&prepared.binding, &url, &prepared.payload, &[])
        .await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = parse_upstream_error(&body);
        warn!(status = status.as_u16(), %message, "upstream rejected completion request");
        return Err(GatewayError::UpstreamStatus {
            status: status.as_u16(),
            message,
        });
    }

    let mut decoder = FrameDecoder::new();
    let mut collector = Collector::new();
    let mut tracker = UsageTracker::new();

    loop {
        if collector.error().is_some() {
            break;
        }
        match response.chunk().await {
            Ok(Some(chunk)) => {
                for event in decoder.push(&chunk) {
                    tracker.observe(&event);
                    collector.observe(&event);
                }
            }
            Ok(None) => {
                for event in decoder.finish() {
                    tracker.observe(&event);
                    collector.observe(&event);
                }
                break;
            }
            Err(error) => {
                collector.observe(&StreamEvent::Error {
                    message: error.to_string(),
                });
                break;
            }
        }
    }

    if let Some(message) = collector.error() {
        return Err(GatewayError::UpstreamNetwork(message.to_string()));
    }

    let usage = tracker.finalize(prompt_estimate);
    let response = collector.into_response(&request.model, &usage);
    settle_billing(state, user, &request.model, &usage).await?;
    Ok(response)
}

/// Either dialect's SSE encoder.
enum SseEncoder {
    OpenAi(OpenAiSseEncoder),
    Anthropic(AnthropicSseEncoder),
}

impl SseEncoder {
    fn start(&mut self) -> Vec<String> {
        match self {
            SseEncoder::OpenAi(_) => Vec::new(),
            SseEncoder::Anthropic(encoder) => encoder.start(),
        }
    }

    fn encode(&mut self, event: &StreamEvent) -> Vec<String> {
        match self {
            SseEncoder::OpenAi(encoder) => encoder.encode(event),
            SseEncoder::Anthropic(encoder) => encoder.encode(event),
        }
    }

    fn finish(&mut self, usage: &UsageCounters) -> Vec<String> {
        match self {
            SseEncoder::OpenAi(encoder) => encoder.finish(usage),
            SseEncoder::Anthropic(encoder) => encoder.finish(usage),
        }
    }
}

async fn send_frames(
    tx: &mpsc::Sender<Result<Bytes, Infallible>>,
    frames: Vec<String>,
) -> bool {
    for frame in frames {
        if tx.send(Ok(Bytes::from(frame))).await.is_err() {
            return false;
        }
    }
    true
}

/// Spawn the stream pump and hand its receiving end to the response body.
///
/// The pump owns the upstream response: dropping it on any exit path
/// (client disconnect included) closes the upstream stream promptly.
/// Billing settles inside the pump so a disconnect still deducts whatever
/// usage accumulated.
fn spawn_stream_pump(
    state: Arc<AppState>,
    user: AuthedUser,
    model: String,
    mut start: StreamingStart,
    prompt_estimate: u64,
    mut encoder: SseEncoder,
) -> Body {
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(64);

    tokio::spawn(async move {
        let mut decoder = FrameDecoder::new();
        let mut tracker = UsageTracker::new();

        let mut connected = send_frames(&tx, encoder.start()).await;

        if connected && let Some(chunk) = start.first_chunk.take() {
            let mut frames = Vec::new();
            for event in decoder.push(&chunk) {
                tracker.observe(&event);
                frames.extend(encoder.encode(&event));
            }
            connected = send_frames(&tx, frames).await;
        }

        while connected {
            let (events, end_of_stream) = match start.response.chunk().await {
                Ok(Some(chunk)) => (decoder.push(&chunk), false),
                Ok(None) => (decoder.finish(), true),
                Err(error) => {
                    warn!(error = %error, "upstream stream failed mid-body");
                    (
                        vec![StreamEvent::Error {
                            message: error.to_string(),
                        }],
                        true,
                    )
                }
            };
            let errored = events
                .iter()
                .any(|e| matches!(e, StreamEvent::Error { .. }));

            let mut frames = Vec::new();
            for event in &events {
                tracker.observe(event);
                frames.extend(encoder.encode(event));
            }
            connected = send_frames(&tx, frames).await;
            if end_of_stream || errored {
                break;
            }
        }

        let usage = tracker.finalize(prompt_estimate);
        if connected {
            let _ = send_frames(&tx, encoder.finish(&usage)).await;
        } else {
            info!("client disconnected during streaming");
        }

        if let Err(error) = settle_billing(&state, &user, &model, &usage).await {
            warn!(error = %error, "post-stream billing failed");
        }
    });

    Body::from_stream(ReceiverStream::new(rx))
}

fn sse_response(body: Body) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

// --- completions endpoints ---

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    let user = authorize(&state, &headers)
        .await
        .map_err(ApiError::openai)?;
    info!(model = %request.model, stream = request.stream, "request to /v1/chat/completions");
    metrics::counter!("gateway_requests_total").increment(1);

    let prompt_estimate =
        tokenizer::estimate_openai_request(&request.messages, request.tools.as_deref()).total();

    if request.stream {
        let prepared = prepare(&state, &user, &request, prompt_estimate)
            .await
            .map_err(ApiError::openai)?;
        let start = start_stream(&state, &prepared)
            .await
            .map_err(ApiError::openai)?;
        let encoder = SseEncoder::OpenAi(OpenAiSseEncoder::new(&request.model));
        let body = spawn_stream_pump(
            Arc::clone(&state),
            user,
            request.model.clone(),
            start,
            prompt_estimate,
            encoder,
        );
        Ok(sse_response(body))
    } else {
        let response = run_collected(&state, &user, &request, prompt_estimate)
            .await
            .map_err(ApiError::openai)?;
        Ok(Json(response).into_response())
    }
}

async fn anthropic_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CreateMessageRequest>,
) -> Result<Response, ApiError> {
    let user = authorize(&state, &headers)
        .await
        .map_err(ApiError::anthropic)?;
    info!(model = %request.model, stream = request.stream, "request to /v1/messages");
    metrics::counter!("gateway_requests_total").increment(1);

    let prompt_estimate = tokenizer::estimate_anthropic_request(
        &request.messages,
        request.tools.as_deref(),
        request.system.as_ref(),
    )
    .total();
    let openai_request = anthropic_to_openai(&request);

    if request.stream {
        let prepared = prepare(&state, &user, &openai_request, prompt_estimate)
            .await
            .map_err(ApiError::anthropic)?;
        let start = start_stream(&state, &prepared)
            .await
            .map_err(ApiError::anthropic)?;
        let encoder = SseEncoder::Anthropic(AnthropicSseEncoder::new(&openai_request.model));
        let body = spawn_stream_pump(
            Arc::clone(&state),
            user,
            openai_request.model.clone(),
            start,
            prompt_estimate,
            encoder,
        );
        Ok(sse_response(body))
    } else {
        let response = run_collected(&state, &user, &openai_request, prompt_estimate)
            .await
            .map_err(ApiError::anthropic)?;
        Ok(Json(openai_response_to_anthropic_message(&response)).into_response())
    }
}

async fn count_tokens(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CountTokensRequest>,
) -> Result<Response, ApiError> {
    authorize(&state, &headers)
        .await
        .map_err(ApiError::anthropic)?;
    let estimate = tokenizer::estimate_anthropic_request(
        &request.messages,
        request.tools.as_deref(),
        request.system.as_ref(),
    );
    Ok(Json(json!({ "input_tokens": estimate.total() })).into_response())
}

// --- batches ---

fn batch_base_url(headers: &HeaderMap) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{host}")
}

async fn create_batch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CreateBatchRequest>,
) -> Result<Response, ApiError> {
    let user = authorize(&state, &headers)
        .await
        .map_err(ApiError::anthropic)?;
    if request.requests.is_empty() {
        return Err(ApiError::anthropic(GatewayError::InvalidRequest(
            "batch must contain at least one request".into(),
        )));
    }

    let (status, work) = state
        .batches
        .create(&batch_base_url(&headers), request.requests, user.user_id)
        .await;
    info!(batch_id = %status.id, items = work.items.len(), "batch created");

    let runner_state = Arc::clone(&state);
    let batch_id = status.id.clone();
    let task = tokio::spawn(async move {
        run_batch(runner_state, work).await;
    });
    state.batches.attach_task(&batch_id, task).await;

    Ok(Json(status).into_response())
}

async fn run_batch(state: Arc<AppState>, work: BatchWork) {
    let user = AuthedUser {
        user_id: work.user_id.clone(),
    };

    for item in &work.items {
        if work.cancel.load(Ordering::Relaxed) {
            break;
        }

        let result = run_batch_item(&state, &user, &item.params).await;
        let (payload, succeeded) = match result {
            Ok(message) => (
                json!({
                    "custom_id": item.custom_id,
                    "result": { "type": "succeeded", "message": message },
                }),
                true,
            ),
            Err(error) => (
                json!({
                    "custom_id": item.custom_id,
                    "result": {
                        "type": "errored",
                        "error": { "type": "api_error", "message": error.to_string() },
                    },
                }),
                false,
            ),
        };
        state.batches.record_result(&work.id, payload, succeeded).await;
    }

    state.batches.finish(&work.id).await;
    info!(batch_id = %work.id, "batch finished");
}

async fn run_batch_item(
    state: &AppState,
    user: &AuthedUser,
    params: &Value,
) -> Result<Value, GatewayError> {
    let mut params = params.clone();
    if let Some(object) = params.as_object_mut() {
        object.insert("stream".into(), Value::Bool(false));
    }
    let request: CreateMessageRequest = serde_json::from_value(params)
        .map_err(|e| GatewayError::InvalidRequest(format!("batch item params: {e}")))?;

    let prompt_estimate = tokenizer::estimate_anthropic_request(
        &request.messages,
        request.tools.as_deref(),
        request.system.as_ref(),
    )
    .total();
    let openai_request = anthropic_to_openai(&request);
    let response = run_collected(state, user, &openai_request, prompt_estimate).await?;
    Ok(openai_response_to_anthropic_message(&response))
}

async fn list_batches(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&state, &headers)
        .await
        .map_err(ApiError::anthropic)?;
    let batches = state.batches.list().await;
    let first_id = batches.first().map(|b| b.id.clone());
    let last_id = batches.last().map(|b| b.id.clone());
    Ok(Json(json!({
        "data": batches,
        "has_more": false,
        "first_id": first_id,
        "last_id": last_id,
    }))
    .into_response())
}

async fn get_batch(
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&state, &headers)
        .await
        .map_err(ApiError::anthropic)?;
    match state.batches.snapshot(&batch_id).await {
        Some(status) => Ok(Json(status).into_response()),
        None => Err(ApiError::anthropic(GatewayError::NotFound)),
    }
}

async fn cancel_batch(
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&state, &headers)
        .await
        .map_err(ApiError::anthropic)?;
    match state.batches.cancel(&batch_id).await {
        Some(status) => Ok(Json(status).into_response()),
        None => Err(ApiError::anthropic(GatewayError::NotFound)),
    }
}

async fn delete_batch(
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&state, &headers)
        .await
        .map_err(ApiError::anthropic)?;
    if !state.batches.delete(&batch_id).await {
        return Err(ApiError::anthropic(GatewayError::NotFound));
    }
    Ok(Json(json!({ "deleted": true, "id": batch_id })).into_response())
}

/// Stream batch results as NDJSON, following the buffer until the batch
/// leaves the in-progress state.
async fn batch_results(
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&state, &headers)
        .await
        .map_err(ApiError::anthropic)?;
    let Some(results) = state.batches.results_handle(&batch_id).await else {
        return Err(ApiError::anthropic(GatewayError::NotFound));
    };

    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(16);
    let poll_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut yielded = 0usize;
        loop {
            let pending: Vec<Value> = {
                let buffer = results.lock().await;
                buffer[yielded.min(buffer.len())..].to_vec()
            };
            for result in pending {
                yielded += 1;
                let line = format!("{result}\n");
                if tx.send(Ok(Bytes::from(line))).await.is_err() {
                    return;
                }
            }
            if poll_state.batches.is_finished(&batch_id).await {
                // Drain anything recorded between the copy and the check
                let buffer = results.lock().await;
                for result in &buffer[yielded.min(buffer.len())..] {
                    let line = format!("{result}\n");
                    if tx.send(Ok(Bytes::from(line))).await.is_err() {
                        return;
                    }
                }
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response())
}
