use std::{any::Any, sync::Arc};

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, Instrument};
use uuid::Uuid;

use crate::{
    assistant::{AssistantRuns, OpenAiAssistants},
    classify::classify,
    config::Config,
    crm::{Crm, GhlClient},
    error::RelayError,
    gate::RunGate,
    logging,
    reconcile::reconcile,
    tokens::{self, MemoryTokenStore, RailwayTokenStore, TokenPair, TokenStore},
    types::{ConversationContext, OutwardPayload, NO_NEW_TURNS_INFO},
};

pub struct AppState {
    pub crm: Arc<dyn Crm>,
    pub assistant: Arc<dyn AssistantRuns>,
    pub gate: RunGate,
}

const REQUIRED_FIELDS: [&str; 4] = [
    "thread_id",
    "assistant_id",
    "ghl_contact_id",
    "ghl_recent_message",
];

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Reads a string field, treating absent, empty and the literal `"null"` alike.
fn field(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty() && *value != "null")
        .map(str::to_string)
}

/// Validated request fields; `ghl_convo_id` may still need resolving.
#[derive(Debug, Clone, PartialEq, Eq)]
struct WebhookFields {
    thread_id: String,
    assistant_id: String,
    ghl_contact_id: String,
    ghl_recent_message: String,
    ghl_convo_id: Option<String>,
}

fn validate_fields(payload: &Value) -> Result<WebhookFields, RelayError> {
    if !payload.is_object() {
        return Err(RelayError::Validation(REQUIRED_FIELDS.join(", ")));
    }

    let missing = REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|key| field(payload, key).is_none())
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(RelayError::Validation(missing.join(", ")));
    }

    Ok(WebhookFields {
        thread_id: field(payload, "thread_id").unwrap_or_default(),
        assistant_id: field(payload, "assistant_id").unwrap_or_default(),
        ghl_contact_id: field(payload, "ghl_contact_id").unwrap_or_default(),
        ghl_recent_message: field(payload, "ghl_recent_message").unwrap_or_default(),
        ghl_convo_id: field(payload, "ghl_convo_id"),
    })
}

async fn resolve_context(
    state: &AppState,
    fields: WebhookFields,
) -> Result<ConversationContext, RelayError> {
    let (ghl_convo_id, convo_id_resolved) = match fields.ghl_convo_id {
        Some(id) => (id, false),
        None => {
            let id = state
                .crm
                .find_conversation_id(&fields.ghl_contact_id)
                .await?
                .ok_or(RelayError::ConversationNotFound)?;
            info!(
                scope = "Validation",
                ghl_contact_id = %fields.ghl_contact_id,
                ghl_convo_id = %id,
                "resolved conversation id"
            );
            (id, true)
        }
    };

    Ok(ConversationContext {
        thread_id: fields.thread_id,
        assistant_id: fields.assistant_id,
        ghl_contact_id: fields.ghl_contact_id,
        ghl_convo_id,
        ghl_recent_message: fields.ghl_recent_message,
        convo_id_resolved,
    })
}

/// One webhook call, from validated body to outward payload.
pub async fn relay_turn(state: &AppState, payload: &Value) -> Result<OutwardPayload, RelayError> {
    let fields = validate_fields(payload)?;
    let ctx = resolve_context(state, fields).await?;
    info!(
        scope = "Validation",
        thread_id = %ctx.thread_id,
        assistant_id = %ctx.assistant_id,
        ghl_contact_id = %ctx.ghl_contact_id,
        ghl_convo_id = %ctx.ghl_convo_id,
        ghl_recent_message = %ctx.ghl_recent_message,
        "fields received"
    );

    let history = state.crm.conversation_messages(&ctx.ghl_convo_id).await?;
    let turns = reconcile(&history, &ctx.ghl_recent_message);
    if turns.is_empty() {
        info!(
            scope = "Compile Messages",
            ghl_contact_id = %ctx.ghl_contact_id,
            ghl_convo_id = %ctx.ghl_convo_id,
            history_len = history.len(),
            "no new inbound messages"
        );
        return Ok(OutwardPayload::NoNewTurns {
            info: NO_NEW_TURNS_INFO.to_string(),
            ghl_convo_id: ctx.ghl_convo_id,
            add_convo_id_action: ctx.convo_id_resolved,
        });
    }
    info!(
        scope = "Compile Messages",
        ghl_contact_id = %ctx.ghl_contact_id,
        ghl_convo_id = %ctx.ghl_convo_id,
        turns = turns.len(),
        history_len = history.len(),
        "compiled new turns"
    );

    let _permit = state.gate.acquire(&ctx.ghl_convo_id).await?;
    let outcome = state
        .assistant
        .create_and_poll(&ctx.thread_id, &ctx.assistant_id, &turns)
        .await?;
    classify(outcome, &ctx, state.assistant.as_ref()).await
}

async fn post_webhook(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let span = tracing::info_span!("webhook", request_id = %Uuid::new_v4());
    async move {
        let payload = serde_json::from_slice::<Value>(&body).unwrap_or(Value::Null);
        match relay_turn(&state, &payload).await {
            Ok(outward) => (StatusCode::OK, Json(outward)).into_response(),
            Err(err) => {
                let thread_id = payload.get("thread_id").and_then(Value::as_str);
                let ghl_contact_id = payload.get("ghl_contact_id").and_then(Value::as_str);
                let ghl_convo_id = payload.get("ghl_convo_id").and_then(Value::as_str);
                error!(
                    scope = "Request",
                    status = err.status().as_u16(),
                    error = %err,
                    thread_id,
                    ghl_contact_id,
                    ghl_convo_id,
                    "webhook failed"
                );
                err.into_response()
            }
        }
    }
    .instrument(span)
    .await
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

fn panic_response(_panic: Box<dyn Any + Send + 'static>) -> Response {
    error!(scope = "Request", "handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal server error" })),
    )
        .into_response()
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/", post(post_webhook))
        .route("/webhook", post(post_webhook))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn token_store(config: &Config, http: &reqwest::Client) -> Arc<dyn TokenStore> {
    match &config.railway {
        Some(railway) => Arc::new(RailwayTokenStore::new(http.clone(), railway.clone())),
        None => Arc::new(MemoryTokenStore::new(TokenPair {
            access: config.ghl_access_token.clone(),
            refresh: config.ghl_refresh_token.clone(),
        })),
    }
}

pub async fn run() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let config = Config::from_env()?;
    logging::init(config.log_format);

    let http = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .build()?;
    let tokens = token_store(&config, &http);

    if let Some(oauth) = config.oauth.clone() {
        info!(
            scope = "Token Refresh",
            interval_secs = oauth.refresh_interval.as_secs(),
            "starting token refresher"
        );
        tokens::spawn_refresher(
            http.clone(),
            tokens.clone(),
            config.ghl_base_url.clone(),
            oauth,
        );
    }

    let state = Arc::new(AppState {
        crm: Arc::new(GhlClient::new(
            http.clone(),
            config.ghl_base_url.clone(),
            config.ghl_location_id.clone(),
            tokens,
        )),
        assistant: Arc::new(OpenAiAssistants::new(
            http,
            config.openai_base_url.clone(),
            config.openai_api_key.clone(),
            config.run_poll_interval,
            config.run_timeout,
        )),
        gate: RunGate::new(config.max_concurrent_runs),
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(port = config.port, "relay server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
