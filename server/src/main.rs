mod matcher;
mod speech;

use crate::matcher::CannedTable;
use crate::speech::SpeechSynthesizer;
use anyhow::{anyhow, Context};
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{body::Body, Json, Router};
use dotenvy::Error as DotenvError;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::env::VarError;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower::service_fn;
use tower::ServiceExt;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const GEMINI_MODEL_NAME: &str = "gemini-1.5-flash";
const GEMINI_ENDPOINT: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-flash:generateContent";
const MAX_QUESTION_CHARS: usize = 800;
const DEFAULT_TIMEOUT_SECS: u64 = 20;
const GENERATION_FAILED_REPLY: &str = "Sorry, I'm having trouble generating a response.";
const EMPTY_GENERATION_REPLY: &str = "I couldn't generate a response.";

#[derive(Clone)]
struct AppState {
    canned: CannedTable,
    client: RelayClient,
    speech: Option<SpeechSynthesizer>,
}

#[derive(Clone)]
struct RelayClient {
    http: reqwest::Client,
    gemini: GeminiBackend,
    intent: Option<IntentBackend>,
}

#[derive(Clone)]
struct GeminiBackend {
    endpoint: &'static str,
    model: &'static str,
    api_key: Arc<String>,
}

#[derive(Clone)]
struct IntentBackend {
    endpoint: Arc<String>,
    api_key: Arc<String>,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    question: String,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    reply: String,
    /// Always null in the immediate response; synthesis runs detached and
    /// its artifact is only announced in the log.
    audio: Option<String>,
}

impl ChatResponse {
    fn reply(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            audio: None,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env_files();
    configure_tracing();

    let gemini_key = std::env::var("GEMINI_API_KEY")
        .context("GEMINI_API_KEY is required to run the chat relay")?;

    let intent = match std::env::var("INTENT_API_URL") {
        Ok(url) => {
            let key = std::env::var("INTENT_API_KEY")
                .context("INTENT_API_KEY is required when INTENT_API_URL is set")?;
            Some(IntentBackend {
                endpoint: Arc::new(url),
                api_key: Arc::new(key),
            })
        }
        Err(VarError::NotPresent) => {
            warn!(target: "chat", msg = "INTENT_API_URL not set; intent backend disabled");
            None
        }
        Err(VarError::NotUnicode(err)) => {
            return Err(anyhow!("INTENT_API_URL contains invalid unicode: {:?}", err));
        }
    };

    let timeout_secs: u64 = std::env::var("REQUEST_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .context("Failed to build outbound HTTP client")?;

    let speech = match std::env::var("TTS_API_URL") {
        Ok(url) => {
            let audio_dir =
                PathBuf::from(std::env::var("AUDIO_DIR").unwrap_or_else(|_| "audio".to_string()));
            info!(
                target: "speech",
                audio_dir = %audio_dir.display(),
                msg = "speech synthesis backend configured"
            );
            Some(SpeechSynthesizer::new(http.clone(), url, audio_dir))
        }
        Err(VarError::NotPresent) => {
            warn!(target: "speech", msg = "TTS_API_URL not set; speech synthesis disabled");
            None
        }
        Err(VarError::NotUnicode(err)) => {
            return Err(anyhow!("TTS_API_URL contains invalid unicode: {:?}", err));
        }
    };

    let responses_file = PathBuf::from(
        std::env::var("RESPONSES_FILE").unwrap_or_else(|_| "responses.json".to_string()),
    );
    let canned = CannedTable::load(&responses_file)?;
    if canned.is_empty() {
        warn!(target: "chat", msg = "canned table is empty; every question goes to the AI backends");
    } else {
        info!(target: "chat", entries = canned.len(), msg = "canned response table loaded");
    }

    let client = RelayClient::new(http, gemini_key, intent);
    info!(
        target: "chat",
        model = GEMINI_MODEL_NAME,
        intent_backend = client.has_intent(),
        msg = "generative backend configured"
    );

    let state = Arc::new(AppState {
        canned,
        client,
        speech,
    });

    let static_dir =
        PathBuf::from(std::env::var("STATIC_DIR").unwrap_or_else(|_| "public".to_string()));
    let static_root = Arc::new(static_dir);
    let static_service = service_fn(move |req: Request<Body>| {
        let dir =
            ServeDir::new(static_root.as_ref().clone()).append_index_html_on_directories(true);
        async move {
            match dir.oneshot(req).await {
                Ok(response) => Ok::<Response, Infallible>(response.into_response()),
                Err(err) => Ok((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Static file error: {err}"),
                )
                    .into_response()),
            }
        }
    });

    let router = Router::new()
        .route("/api/chat", post(handle_chat))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
        .fallback_service(static_service);

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .context("Invalid HOST/PORT combination")?;

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind TCP listener")?;
    let bound = listener
        .local_addr()
        .context("Failed to read listener address")?;
    info!(listening = %bound, model = GEMINI_MODEL_NAME, msg = "server ready");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("msg" = "shutdown signal received");
}

fn configure_tracing() {
    let default_filter = "info";
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

fn load_env_files() {
    fn load(file: &str) {
        match dotenvy::from_filename(file) {
            Ok(_) => {}
            Err(DotenvError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => eprintln!("Warning: unable to load {file}: {err}"),
        }
    }

    load(".env.local");
    load(".env");
}

async fn handle_chat(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ChatRequest>,
) -> impl IntoResponse {
    let question = payload.question.trim();
    if question.is_empty() {
        let response = ChatResponse::reply("Please provide a question.");
        return (StatusCode::BAD_REQUEST, Json(response));
    }

    if question.len() > MAX_QUESTION_CHARS {
        let response = ChatResponse::reply("Question is too long. Please shorten it.");
        return (StatusCode::BAD_REQUEST, Json(response));
    }

    info!(target: "chat", chars = question.len(), msg = "question received");

    let reply = match state.canned.best_match(question) {
        Some(answer) => {
            info!(target: "chat", msg = "matched canned response");
            answer.to_string()
        }
        None => {
            let reply = state.client.answer(question).await;
            info!(
                target: "chat",
                chars = reply.len(),
                msg = "reply relayed from AI backends"
            );
            reply
        }
    };

    if let Some(speech) = &state.speech {
        speech.submit(reply.clone());
    }

    (StatusCode::OK, Json(ChatResponse::reply(reply)))
}

impl RelayClient {
    fn new(http: reqwest::Client, gemini_key: String, intent: Option<IntentBackend>) -> Self {
        let gemini = GeminiBackend {
            endpoint: GEMINI_ENDPOINT,
            model: GEMINI_MODEL_NAME,
            api_key: Arc::new(gemini_key),
        };
        Self {
            http,
            gemini,
            intent,
        }
    }

    fn has_intent(&self) -> bool {
        self.intent.is_some()
    }

    /// Produces the best-effort reply for a question no canned entry
    /// covered. Both backends are awaited before the reply is chosen; the
    /// intent backend wins whenever it returned a reply.
    async fn answer(&self, question: &str) -> String {
        let (generated, intent_reply) = match &self.intent {
            Some(intent) => {
                let (generated, classified) =
                    tokio::join!(self.ask_gemini(question), self.ask_intent(intent, question));
                let intent_reply = match classified {
                    Ok(Some(reply)) => Some(reply),
                    Ok(None) => {
                        info!(target: "chat", msg = "intent backend returned no reply");
                        None
                    }
                    Err(err) => {
                        warn!(target: "chat", error = %err, msg = "intent backend error");
                        None
                    }
                };
                (generated, intent_reply)
            }
            None => (self.ask_gemini(question).await, None),
        };

        if let Err(err) = &generated {
            error!(
                target: "chat",
                model = self.gemini.model,
                error = %err,
                msg = "generative backend error"
            );
        }

        resolve_reply(intent_reply, generated)
    }

    async fn ask_gemini(&self, question: &str) -> Result<String, BackendError> {
        let payload = GeminiGenerateRequest::new(question);
        let response = self
            .http
            .post(self.gemini.endpoint)
            .header("x-goog-api-key", self.gemini.api_key.as_str())
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(BackendError::ApiFailure(status, detail));
        }

        let body: GeminiGenerateResponse = response.json().await?;
        let answer = body
            .candidates
            .unwrap_or_default()
            .into_iter()
            .find_map(GeminiCandidate::into_text)
            .ok_or(BackendError::EmptyAnswer)?;

        info!(
            target: "chat",
            chars = question.len(),
            model = self.gemini.model,
            msg = "reply generated by backend"
        );
        Ok(answer)
    }

    async fn ask_intent(
        &self,
        backend: &IntentBackend,
        question: &str,
    ) -> Result<Option<String>, BackendError> {
        let payload = IntentRequest { query: question };
        let response = self
            .http
            .post(backend.endpoint.as_str())
            .bearer_auth(backend.api_key.as_str())
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(BackendError::ApiFailure(status, detail));
        }

        let body: IntentResponse = response.json().await?;
        Ok(body
            .reply
            .map(|reply| reply.trim().to_string())
            .filter(|reply| !reply.is_empty()))
    }
}

/// Fixed precedence between the two collaborators: an intent reply wins
/// outright, otherwise the generated text is used, and a generation error
/// degrades to a fixed fallback string instead of surfacing.
fn resolve_reply(intent_reply: Option<String>, generated: Result<String, BackendError>) -> String {
    if let Some(reply) = intent_reply {
        return reply;
    }
    match generated {
        Ok(reply) => reply,
        Err(BackendError::EmptyAnswer) => EMPTY_GENERATION_REPLY.to_string(),
        Err(_) => GENERATION_FAILED_REPLY.to_string(),
    }
}

#[derive(Debug, thiserror::Error)]
enum BackendError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("api failure ({0}): {1}")]
    ApiFailure(StatusCode, String),
    #[error("AI response did not contain any answer")]
    EmptyAnswer,
}

#[derive(Serialize)]
struct GeminiGenerateRequest<'a> {
    contents: [GeminiContent<'a>; 1],
}

#[derive(Serialize)]
struct GeminiContent<'a> {
    role: &'static str,
    parts: [GeminiPart<'a>; 1],
}

#[derive(Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

impl<'a> GeminiGenerateRequest<'a> {
    fn new(question: &'a str) -> Self {
        Self {
            contents: [GeminiContent {
                role: "user",
                parts: [GeminiPart { text: question }],
            }],
        }
    }
}

#[derive(Serialize)]
struct IntentRequest<'a> {
    query: &'a str,
}

#[derive(Deserialize)]
struct IntentResponse {
    reply: Option<String>,
}

#[derive(Deserialize)]
struct GeminiGenerateResponse {
    candidates: Option<Vec<GeminiCandidate>>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiCandidateContent>,
}

#[derive(Deserialize)]
struct GeminiCandidateContent {
    parts: Option<Vec<GeminiCandidatePart>>,
}

#[derive(Deserialize)]
struct GeminiCandidatePart {
    text: Option<String>,
}

impl GeminiCandidate {
    fn into_text(self) -> Option<String> {
        self.content.and_then(|content| {
            content
                .parts
                .unwrap_or_default()
                .into_iter()
                .find_map(|part| {
                    part.text
                        .map(|text| text.trim().to_string())
                        .filter(|value| !value.is_empty())
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_requires_a_text_question() {
        assert!(serde_json::from_str::<ChatRequest>(r#"{"question": "hi"}"#).is_ok());
        assert!(serde_json::from_str::<ChatRequest>(r#"{"question": 42}"#).is_err());
        assert!(serde_json::from_str::<ChatRequest>(r#"{}"#).is_err());
    }

    #[test]
    fn chat_response_serializes_null_audio() {
        let value = serde_json::to_value(ChatResponse::reply("hi there")).expect("serializes");
        assert_eq!(
            value,
            serde_json::json!({ "reply": "hi there", "audio": null })
        );
    }

    #[test]
    fn gemini_request_wraps_question_as_user_turn() {
        let question = "What is the capital of France?";
        let request = GeminiGenerateRequest::new(question);
        assert_eq!(request.contents[0].role, "user");
        assert_eq!(request.contents[0].parts[0].text, question);
    }

    #[test]
    fn gemini_candidate_extracts_trimmed_text() {
        let candidate = GeminiCandidate {
            content: Some(GeminiCandidateContent {
                parts: Some(vec![GeminiCandidatePart {
                    text: Some("  Answer with whitespace  ".to_string()),
                }]),
            }),
        };
        assert_eq!(
            candidate.into_text(),
            Some("Answer with whitespace".to_string())
        );
    }

    #[test]
    fn gemini_candidate_skips_empty_parts() {
        let candidate = GeminiCandidate {
            content: Some(GeminiCandidateContent {
                parts: Some(vec![
                    GeminiCandidatePart {
                        text: Some("   ".to_string()),
                    },
                    GeminiCandidatePart {
                        text: Some("real answer".to_string()),
                    },
                ]),
            }),
        };
        assert_eq!(candidate.into_text(), Some("real answer".to_string()));
    }

    #[test]
    fn intent_reply_takes_precedence_over_generated_text() {
        let reply = resolve_reply(
            Some("intent reply".to_string()),
            Ok("generated reply".to_string()),
        );
        assert_eq!(reply, "intent reply");
    }

    #[test]
    fn generated_text_is_used_without_an_intent_reply() {
        let reply = resolve_reply(None, Ok("generated reply".to_string()));
        assert_eq!(reply, "generated reply");
    }

    #[test]
    fn backend_error_degrades_to_the_fixed_apology() {
        let failure = BackendError::ApiFailure(StatusCode::BAD_GATEWAY, "boom".to_string());
        let reply = resolve_reply(None, Err(failure));
        assert_eq!(reply, GENERATION_FAILED_REPLY);
    }

    #[test]
    fn empty_generation_has_its_own_fallback_text() {
        let reply = resolve_reply(None, Err(BackendError::EmptyAnswer));
        assert_eq!(reply, EMPTY_GENERATION_REPLY);
    }

    #[test]
    fn intent_reply_still_wins_when_generation_fails() {
        let failure = BackendError::ApiFailure(StatusCode::SERVICE_UNAVAILABLE, String::new());
        let reply = resolve_reply(Some("intent reply".to_string()), Err(failure));
        assert_eq!(reply, "intent reply");
    }

    #[test]
    fn intent_request_carries_the_raw_question() {
        let payload = IntentRequest { query: "hello?" };
        let value = serde_json::to_value(&payload).expect("serializes");
        assert_eq!(value, serde_json::json!({ "query": "hello?" }));
    }

    #[test]
    fn intent_response_reply_is_optional() {
        let none: IntentResponse =
            serde_json::from_str(r#"{"reply": null}"#).expect("deserializes");
        assert!(none.reply.is_none());
        let some: IntentResponse =
            serde_json::from_str(r#"{"reply": "routed"}"#).expect("deserializes");
        assert_eq!(some.reply.as_deref(), Some("routed"));
    }
}
