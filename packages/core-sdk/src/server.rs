use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, get_service, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::services::ServeDir;

use crate::{
    credentials::CredentialState,
    db::{KvStore, SqliteStore},
    error::GatewayError,
    extract::Explanation,
    history::{HistoryStore, HISTORY_LIMIT},
    llm::Gateway,
    models::{Flashcard, HistoryEntry, LearningStep},
    prompts::{self, Level},
    providers::WireFamily,
    session, telemetry,
};

/**
 * \brief 错误响应体：稳定错误码与可展示的信息。
 */
#[derive(Serialize, Debug)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            code,
            message: message.into(),
        }),
    )
}

/**
 * \brief 各处理函数共享的状态。凭据状态在每次请求时从存储读取。
 */
#[derive(Clone)]
pub struct AppState {
    gateway: Gateway,
    store: Arc<dyn KvStore>,
}

impl AppState {
    pub fn new(gateway: Gateway, store: Arc<dyn KvStore>) -> Self {
        Self { gateway, store }
    }

    fn credentials(&self) -> Result<CredentialState, ApiError> {
        CredentialState::load(self.store.as_ref(), self.gateway.registry()).map_err(internal_err)
    }

    fn history(&self) -> HistoryStore {
        HistoryStore::new(self.store.clone())
    }
}

/**
 * \brief 启动本地 HTTP 服务，提供静态前端与 API。
 * \param addr 监听地址，如 "127.0.0.1:5173"
 */
pub async fn run(addr: &str) -> Result<()> {
    let store: Arc<dyn KvStore> = Arc::new(SqliteStore::open_default()?);
    telemetry::init_from_store(store.as_ref());

    let state = AppState::new(Gateway::from_env()?, store);
    let ui_root = std::env::var("NIX_UI_DIR").unwrap_or_else(|_| "web".to_string());
    let static_service = get_service(ServeDir::new(ui_root).append_index_html_on_directories(true));
    let app = router(state).fallback_service(static_service);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on http://{}", addr);
    telemetry::log_event("server.run", &format!("listening on {}", addr));
    axum::serve(listener, app).await?;
    Ok(())
}

/**
 * \brief API 路由（不含静态资源）。
 */
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/providers", get(get_providers))
        .route("/api/providers/{id}/select", post(select_provider))
        .route(
            "/api/credential",
            put(save_credential).delete(clear_credential),
        )
        .route("/api/levels", get(get_levels))
        .route("/api/explain", post(explain))
        .route("/api/flashcards", post(flashcards))
        .route("/api/learning-path", post(learning_path))
        .route("/api/history", get(list_history))
        .route("/api/history/{id}", delete(delete_history))
        .route("/api/health", get(health_check))
        .with_state(state)
}

#[derive(Serialize, Debug)]
struct ProviderItem {
    id: String,
    name: String,
    family: WireFamily,
    model: String,
    key_prefix: String,
    signup_url: String,
}

#[derive(Serialize, Debug)]
struct ProvidersState {
    providers: Vec<ProviderItem>,
    selected_provider: String,
    has_credential: bool,
    using_fallback: bool,
    /** \brief 脱敏后的用户密钥 */
    user_key: Option<String>,
    /** \brief 用户密钥前缀与所选 Provider 不符时给出提示 */
    key_warning: Option<String>,
}

#[derive(Deserialize, Debug)]
struct CredentialInput {
    api_key: String,
    #[serde(default)]
    provider: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ExplainRequest {
    text: String,
    #[serde(default)]
    level: Option<u8>,
}

#[derive(Serialize, Debug)]
struct ExplainResponse {
    #[serde(flatten)]
    explanation: Explanation,
    history_id: Option<i64>,
}

#[derive(Deserialize, Debug)]
struct ArtifactRequest {
    #[serde(default)]
    text: String,
    /** \brief 学习路径输入为空时的回退正文 */
    #[serde(default)]
    fallback: Option<String>,
}

#[derive(Serialize, Debug)]
struct FlashcardsResponse {
    cards: Vec<Flashcard>,
}

#[derive(Serialize, Debug)]
struct LearningPathResponse {
    steps: Vec<LearningStep>,
}

#[derive(Deserialize, Debug)]
struct HistoryQuery {
    limit: Option<usize>,
}

fn build_provider_state(state: &AppState) -> Result<ProvidersState, ApiError> {
    let creds = state.credentials()?;
    let registry = state.gateway.registry();
    let providers = registry
        .iter()
        .map(|p| ProviderItem {
            id: p.id.clone(),
            name: p.display_name.clone(),
            family: p.family,
            model: p.default_model.clone(),
            key_prefix: p.credential_prefix_hint.clone(),
            signup_url: p.signup_url.clone(),
        })
        .collect();
    let key_warning = match (creds.user_credential(), registry.get(creds.selected_provider())) {
        (Some(key), Some(p)) if !p.key_looks_valid(key) => Some(format!(
            "{} keys usually start with \"{}\"",
            p.display_name, p.credential_prefix_hint
        )),
        _ => None,
    };
    Ok(ProvidersState {
        providers,
        selected_provider: creds.selected_provider().to_string(),
        has_credential: state.gateway.has_credential(&creds),
        using_fallback: state.gateway.is_using_fallback(&creds),
        user_key: creds.masked_credential(),
        key_warning,
    })
}

async fn get_providers(State(state): State<AppState>) -> Result<Json<ProvidersState>, ApiError> {
    Ok(Json(build_provider_state(&state)?))
}

async fn select_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProvidersState>, ApiError> {
    let mut creds = state.credentials()?;
    creds
        .select_provider(state.store.as_ref(), state.gateway.registry(), &id)
        .map_err(gateway_err)?;
    Ok(Json(build_provider_state(&state)?))
}

/**
 * \brief 保存用户密钥，可同时切换 Provider。
 */
async fn save_credential(
    State(state): State<AppState>,
    Json(payload): Json<CredentialInput>,
) -> Result<Json<ProvidersState>, ApiError> {
    let mut creds = state.credentials()?;
    if let Some(provider) = payload.provider.as_deref() {
        creds
            .select_provider(state.store.as_ref(), state.gateway.registry(), provider)
            .map_err(gateway_err)?;
    }
    creds
        .save_user_credential(state.store.as_ref(), &payload.api_key)
        .map_err(internal_err)?;
    Ok(Json(build_provider_state(&state)?))
}

async fn clear_credential(State(state): State<AppState>) -> Result<Json<ProvidersState>, ApiError> {
    let mut creds = state.credentials()?;
    creds
        .clear_user_credential(state.store.as_ref())
        .map_err(internal_err)?;
    Ok(Json(build_provider_state(&state)?))
}

async fn get_levels() -> Json<&'static [Level]> {
    Json(&prompts::LEVELS[..])
}

async fn explain(
    State(state): State<AppState>,
    Json(req): Json<ExplainRequest>,
) -> Result<Json<ExplainResponse>, ApiError> {
    let level = req.level.unwrap_or(prompts::DEFAULT_LEVEL);
    let creds = state.credentials()?;
    let explanation = session::run_explanation(&state.gateway, &creds, &req.text, level)
        .await
        .map_err(gateway_err)?;
    let history_id = match state
        .history()
        .append(req.text.trim(), &explanation.body, level)
    {
        Ok(entry) => Some(entry.id),
        Err(err) => {
            telemetry::log_error("server.history", &format!("{:#}", err));
            None
        }
    };
    Ok(Json(ExplainResponse {
        explanation,
        history_id,
    }))
}

async fn flashcards(
    State(state): State<AppState>,
    Json(req): Json<ArtifactRequest>,
) -> Result<Json<FlashcardsResponse>, ApiError> {
    let creds = state.credentials()?;
    let cards = session::run_flashcards(&state.gateway, &creds, &req.text)
        .await
        .map_err(gateway_err)?;
    Ok(Json(FlashcardsResponse { cards }))
}

async fn learning_path(
    State(state): State<AppState>,
    Json(req): Json<ArtifactRequest>,
) -> Result<Json<LearningPathResponse>, ApiError> {
    let creds = state.credentials()?;
    let topic = if req.text.trim().is_empty() {
        req.fallback.unwrap_or_default()
    } else {
        req.text
    };
    let steps = session::run_learning_path(&state.gateway, &creds, &topic)
        .await
        .map_err(gateway_err)?;
    Ok(Json(LearningPathResponse { steps }))
}

async fn list_history(
    State(state): State<AppState>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    let entries = state
        .history()
        .recent(q.limit.unwrap_or(HISTORY_LIMIT))
        .map_err(internal_err)?;
    Ok(Json(entries))
}

async fn delete_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state.history().delete(id).map_err(internal_err)?;
    if !deleted {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("history entry {} not found", id),
        ));
    }
    Ok(Json(serde_json::json!({ "deleted": id })))
}

/**
 * \brief 健康检查：报告当前生效的 Provider 与密钥来源，不发起外部请求。
 */
async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let creds = state.credentials()?;
    match state.gateway.resolve_credential(&creds) {
        Ok(resolved) => Ok(Json(serde_json::json!({
            "ok": true,
            "provider": resolved.provider_id,
            "using_fallback": state.gateway.is_using_fallback(&creds),
        }))),
        Err(e) => Ok(Json(serde_json::json!({
            "ok": false,
            "provider": creds.selected_provider(),
            "error": e.to_string(),
        }))),
    }
}

fn internal_err<E: std::fmt::Display>(e: E) -> ApiError {
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", e.to_string())
}

fn gateway_err(e: GatewayError) -> ApiError {
    let status = match &e {
        GatewayError::InvalidProvider(_)
        | GatewayError::InvalidLevel(_)
        | GatewayError::EmptyInput(_) => StatusCode::BAD_REQUEST,
        GatewayError::NoCredential => StatusCode::UNAUTHORIZED,
        GatewayError::ProviderHttp { .. } | GatewayError::Transport(_) => StatusCode::BAD_GATEWAY,
        GatewayError::InvalidArtifactFormat(_) => StatusCode::UNPROCESSABLE_ENTITY,
        GatewayError::ProviderFormat(_) | GatewayError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    api_error(status, e.code(), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::FallbackCredential;
    use crate::db::MemoryStore;
    use crate::providers::{ProviderDescriptor, ProviderRegistry, GROQ};
    use serde_json::{json, Value};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    /** \brief 模拟上游：始终返回同一条 chat-completions 响应。 */
    async fn upstream(content: &'static str) -> String {
        let app = Router::new().fallback(move || async move {
            Json(json!({"choices": [{"message": {"content": content}}]}))
        });
        serve(app).await
    }

    async fn api(upstream_base: &str, fallback: FallbackCredential) -> String {
        let registry = ProviderRegistry::builder()
            .register(ProviderDescriptor::new(
                GROQ,
                "Groq",
                WireFamily::ChatCompletions,
                &format!("{}/chat/completions", upstream_base),
                "m",
                "gsk_",
                "",
            ))
            .register(ProviderDescriptor::new(
                "openai",
                "OpenAI",
                WireFamily::ChatCompletions,
                &format!("{}/chat/completions", upstream_base),
                "m",
                "sk-",
                "",
            ))
            .build()
            .unwrap();
        let gateway = Gateway::new(registry, fallback).unwrap();
        serve(router(AppState::new(gateway, Arc::new(MemoryStore::new())))).await
    }

    #[tokio::test]
    async fn test_explain_endpoint_and_history() {
        let up = upstream("Body text\n---\n**Want to learn more?**\n1. [What is X?]\n2. [How does Y work?]\n3. [Why Z?]").await;
        let base = api(&up, FallbackCredential::new("gsk_builtin", GROQ)).await;
        let client = reqwest::Client::new();

        let resp: Value = client
            .post(format!("{}/api/explain", base))
            .json(&json!({"text": "X", "level": 1}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resp["body"], "Body text");
        assert_eq!(resp["follow_ups"], json!(["What is X?", "How does Y work?", "Why Z?"]));
        let id = resp["history_id"].as_i64().unwrap();

        let history: Value = client
            .get(format!("{}/api/history", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(history[0]["query"], "X");
        assert_eq!(history[0]["level"], 1);

        let status = client
            .delete(format!("{}/api/history/{}", base, id))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, StatusCode::OK);
        let status = client
            .delete(format!("{}/api/history/{}", base, id))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_no_credential_maps_to_401() {
        let up = upstream("unused").await;
        let base = api(&up, FallbackCredential::none(GROQ)).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/api/explain", base))
            .json(&json!({"text": "anything"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "NO_API_KEY");
        assert_eq!(body["message"], GatewayError::NoCredential.to_string());
    }

    #[tokio::test]
    async fn test_error_bodies_carry_codes() {
        let up = upstream("unused").await;
        let base = api(&up, FallbackCredential::new("gsk_builtin", GROQ)).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/api/explain", base))
            .json(&json!({"text": "X", "level": 7}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "INVALID_LEVEL");

        let resp = client
            .post(format!("{}/api/flashcards", base))
            .json(&json!({"text": "   "}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "EMPTY_INPUT");

        let resp = client
            .delete(format!("{}/api/history/42", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_invalid_flashcards_map_to_422() {
        let up = upstream("definitely not json").await;
        let base = api(&up, FallbackCredential::new("gsk_builtin", GROQ)).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/api/flashcards", base))
            .json(&json!({"text": "Some explanation"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_provider_selection_and_credential_flow() {
        let up = upstream("unused").await;
        let base = api(&up, FallbackCredential::new("gsk_builtin", GROQ)).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/api/providers/nope/select", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let state: Value = client
            .post(format!("{}/api/providers/openai/select", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(state["selected_provider"], "openai");
        assert_eq!(state["using_fallback"], true);

        let health: Value = client
            .get(format!("{}/api/health", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["provider"], GROQ);

        let state: Value = client
            .put(format!("{}/api/credential", base))
            .json(&json!({"api_key": "gsk_wrong_prefix_for_openai"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(state["using_fallback"], false);
        assert!(state["key_warning"].is_string());
        assert_eq!(state["user_key"], "gsk_…enai");

        let state: Value = client
            .delete(format!("{}/api/credential", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(state["user_key"], Value::Null);
        assert_eq!(state["has_credential"], true);
    }
}
