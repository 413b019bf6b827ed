use std::sync::Arc;

use serde::Serialize;

use crate::credentials::CredentialState;
use crate::db::KvStore;
use crate::error::{GatewayError, GatewayResult};
use crate::extract::{self, Explanation};
use crate::history::HistoryStore;
use crate::llm::Gateway;
use crate::models::{Flashcard, HistoryEntry, LearningStep, Message};
use crate::prompts;
use crate::telemetry;

/**
 * \brief 主解释流程状态。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Requesting,
}

/**
 * \brief 闪卡/学习路径各自独立的生成状态。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationPhase {
    Idle,
    Generating,
}

/**
 * \brief 发起一次主解释请求并拆出追问。
 */
pub async fn run_explanation(
    gateway: &Gateway,
    credentials: &CredentialState,
    input: &str,
    level: u8,
) -> GatewayResult<Explanation> {
    let input = input.trim();
    if input.is_empty() {
        return Err(GatewayError::EmptyInput("Please enter some text to explain."));
    }
    let system = prompts::explanation_prompt(level)?;
    let raw = gateway
        .complete(credentials, &[Message::user(input)], &system)
        .await?;
    Ok(extract::extract_follow_ups(&raw))
}

/**
 * \brief 以解释正文为输入生成闪卡。
 */
pub async fn run_flashcards(
    gateway: &Gateway,
    credentials: &CredentialState,
    body: &str,
) -> GatewayResult<Vec<Flashcard>> {
    if body.trim().is_empty() {
        return Err(GatewayError::EmptyInput(
            "Generate an explanation before creating flashcards.",
        ));
    }
    let raw = gateway
        .complete(credentials, &[Message::user(body)], prompts::flashcard_prompt())
        .await?;
    extract::extract_flashcards(&raw)
}

/**
 * \brief 为主题生成学习路径。
 */
pub async fn run_learning_path(
    gateway: &Gateway,
    credentials: &CredentialState,
    topic: &str,
) -> GatewayResult<Vec<LearningStep>> {
    if topic.trim().is_empty() {
        return Err(GatewayError::EmptyInput(
            "Enter a topic or generate an explanation first.",
        ));
    }
    let raw = gateway
        .complete(
            credentials,
            &[Message::user(topic.trim())],
            prompts::learning_path_prompt(),
        )
        .await?;
    extract::extract_learning_path(&raw)
}

/**
 * \brief 单个用户的解释会话，持有当前展示的全部状态。
 * \details 失败只影响正在生成的那一项，其余已展示内容保持不变。
 */
pub struct ExplainSession {
    gateway: Gateway,
    store: Arc<dyn KvStore>,
    history: HistoryStore,
    credentials: CredentialState,
    level: u8,
    input: String,
    explanation: Explanation,
    flashcards: Vec<Flashcard>,
    learning_path: Vec<LearningStep>,
    error: Option<String>,
    phase: Phase,
    flashcard_phase: GenerationPhase,
    path_phase: GenerationPhase,
}

impl ExplainSession {
    /**
     * \brief 从存储加载凭据状态并创建会话。
     */
    pub fn new(gateway: Gateway, store: Arc<dyn KvStore>) -> anyhow::Result<Self> {
        let credentials = CredentialState::load(store.as_ref(), gateway.registry())?;
        let history = HistoryStore::new(store.clone());
        Ok(Self {
            gateway,
            store,
            history,
            credentials,
            level: prompts::DEFAULT_LEVEL,
            input: String::new(),
            explanation: Explanation::default(),
            flashcards: Vec::new(),
            learning_path: Vec::new(),
            error: None,
            phase: Phase::Idle,
            flashcard_phase: GenerationPhase::Idle,
            path_phase: GenerationPhase::Idle,
        })
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn credentials(&self) -> &CredentialState {
        &self.credentials
    }

    pub fn has_credential(&self) -> bool {
        self.gateway.has_credential(&self.credentials)
    }

    pub fn is_using_fallback(&self) -> bool {
        self.gateway.is_using_fallback(&self.credentials)
    }

    pub fn select_provider(&mut self, id: &str) -> GatewayResult<()> {
        self.credentials
            .select_provider(self.store.as_ref(), self.gateway.registry(), id)
    }

    pub fn save_credential(&mut self, key: &str) -> GatewayResult<()> {
        Ok(self
            .credentials
            .save_user_credential(self.store.as_ref(), key)?)
    }

    pub fn clear_credential(&mut self) -> GatewayResult<()> {
        Ok(self.credentials.clear_user_credential(self.store.as_ref())?)
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn explanation(&self) -> &Explanation {
        &self.explanation
    }

    pub fn flashcards(&self) -> &[Flashcard] {
        &self.flashcards
    }

    pub fn learning_path(&self) -> &[LearningStep] {
        &self.learning_path
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn flashcard_phase(&self) -> GenerationPhase {
        self.flashcard_phase
    }

    pub fn path_phase(&self) -> GenerationPhase {
        self.path_phase
    }

    /**
     * \brief 主解释：成功时替换正文与追问并写入历史；不清空已有学习路径与闪卡。
     */
    pub async fn explain(&mut self, input: &str, level: u8) -> GatewayResult<&Explanation> {
        self.phase = Phase::Requesting;
        let result = run_explanation(&self.gateway, &self.credentials, input, level).await;
        self.phase = Phase::Idle;

        match result {
            Ok(explanation) => {
                self.input = input.trim().to_string();
                self.level = level;
                if let Err(err) = self.history.append(&self.input, &explanation.body, level) {
                    telemetry::log_error("session.history", &format!("{:#}", err));
                }
                self.explanation = explanation;
                self.error = None;
                Ok(&self.explanation)
            }
            Err(err) => {
                self.error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /**
     * \brief 以选中的追问作为新输入，沿用当前等级。
     */
    pub async fn ask_follow_up(&mut self, index: usize) -> GatewayResult<&Explanation> {
        let question = self
            .explanation
            .follow_ups
            .get(index)
            .cloned()
            .ok_or(GatewayError::EmptyInput("No such follow-up question."))?;
        let level = self.level;
        self.explain(&question, level).await
    }

    /**
     * \brief 以学习路径中某一步的标题作为新输入，沿用当前等级；学习路径本身保持不变。
     */
    pub async fn explain_step(&mut self, index: usize) -> GatewayResult<&Explanation> {
        let title = self
            .learning_path
            .get(index)
            .map(|step| step.title.clone())
            .ok_or(GatewayError::EmptyInput("No such learning path step."))?;
        let level = self.level;
        self.explain(&title, level).await
    }

    /**
     * \brief 基于当前正文生成闪卡。成功整体替换；格式错误时清空卡组。
     */
    pub async fn generate_flashcards(&mut self) -> GatewayResult<&[Flashcard]> {
        self.flashcard_phase = GenerationPhase::Generating;
        let result = run_flashcards(&self.gateway, &self.credentials, &self.explanation.body).await;
        self.flashcard_phase = GenerationPhase::Idle;

        match result {
            Ok(cards) => {
                self.flashcards = cards;
                self.error = None;
                Ok(&self.flashcards)
            }
            Err(err) => {
                if matches!(err, GatewayError::InvalidArtifactFormat(_)) {
                    self.flashcards.clear();
                }
                self.error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /**
     * \brief 生成学习路径；主题为空时使用当前正文。
     */
    pub async fn generate_learning_path(&mut self, topic: &str) -> GatewayResult<&[LearningStep]> {
        let topic = if topic.trim().is_empty() {
            self.explanation.body.clone()
        } else {
            topic.to_string()
        };

        self.path_phase = GenerationPhase::Generating;
        let result = run_learning_path(&self.gateway, &self.credentials, &topic).await;
        self.path_phase = GenerationPhase::Idle;

        match result {
            Ok(steps) => {
                self.learning_path = steps;
                self.error = None;
                Ok(&self.learning_path)
            }
            Err(err) => {
                if matches!(err, GatewayError::InvalidArtifactFormat(_)) {
                    self.learning_path.clear();
                }
                self.error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /**
     * \brief 恢复一条历史记录到展示状态。
     */
    pub fn load_history_entry(&mut self, entry: &HistoryEntry) {
        self.input = entry.query.clone();
        self.level = entry.level;
        self.explanation = extract::extract_follow_ups(&entry.response);
        self.error = None;
    }

    pub fn clear(&mut self) {
        self.input.clear();
        self.explanation = Explanation::default();
        self.error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::FallbackCredential;
    use crate::db::MemoryStore;
    use crate::providers::{ProviderDescriptor, ProviderRegistry, WireFamily, GROQ};
    use axum::{http::StatusCode, Json, Router};
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /** \brief 按顺序返回预置响应的模拟服务。 */
    async fn spawn_script(replies: Vec<(StatusCode, String)>) -> (String, Arc<Mutex<Vec<Value>>>) {
        let queue = Arc::new(Mutex::new(VecDeque::from(replies)));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_sink = seen.clone();
        let app = Router::new().fallback(move |Json(body): Json<Value>| {
            let queue = queue.clone();
            let seen = seen_sink.clone();
            async move {
                seen.lock().unwrap().push(body);
                queue
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or((StatusCode::INTERNAL_SERVER_ERROR, "{}".to_string()))
            }
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), seen)
    }

    fn chat(content: &str) -> (StatusCode, String) {
        (
            StatusCode::OK,
            json!({"choices": [{"message": {"content": content}}]}).to_string(),
        )
    }

    fn session(base: &str) -> ExplainSession {
        let registry = ProviderRegistry::builder()
            .register(ProviderDescriptor::new(
                GROQ,
                "Groq",
                WireFamily::ChatCompletions,
                &format!("{}/chat/completions", base),
                "m",
                "gsk_",
                "",
            ))
            .build()
            .unwrap();
        let gateway = Gateway::new(registry, FallbackCredential::new("gsk_builtin", GROQ)).unwrap();
        ExplainSession::new(gateway, Arc::new(MemoryStore::new())).unwrap()
    }

    const EXPLAINED: &str = "Photosynthesis turns light into sugar.\n---\n**Want to learn more?**\n1. [What is chlorophyll?]\n2. [Why are leaves green?]\n3. [How do plants breathe?]";

    #[tokio::test]
    async fn test_explain_success_updates_state_and_history() {
        let (base, seen) = spawn_script(vec![chat(EXPLAINED)]).await;
        let mut s = session(&base);
        assert!(s.is_using_fallback());

        let out = s.explain("  photosynthesis ", 1).await.unwrap().clone();
        assert_eq!(out.body, "Photosynthesis turns light into sugar.");
        assert_eq!(out.follow_ups.len(), 3);
        assert_eq!(s.phase(), Phase::Idle);
        assert_eq!(s.level(), 1);
        assert_eq!(s.input(), "photosynthesis");

        let history = s.history().all().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].query, "photosynthesis");
        assert_eq!(history[0].response, out.body);

        let body = seen.lock().unwrap()[0].clone();
        assert_eq!(body["messages"][1]["content"], "photosynthesis");
        assert!(body["messages"][0]["content"]
            .as_str()
            .unwrap()
            .contains(prompts::LEVELS[1].instruction));
    }

    #[tokio::test]
    async fn test_failed_explain_keeps_previous_content() {
        let (base, _) = spawn_script(vec![
            chat(EXPLAINED),
            (
                StatusCode::TOO_MANY_REQUESTS,
                r#"{"error":{"message":"slow down"}}"#.to_string(),
            ),
        ])
        .await;
        let mut s = session(&base);
        s.explain("photosynthesis", 2).await.unwrap();

        let err = s.explain("mitochondria", 4).await.unwrap_err();
        assert!(matches!(err, GatewayError::ProviderHttp { status: 429, .. }));
        assert_eq!(s.error(), Some("slow down"));
        assert_eq!(s.explanation().body, "Photosynthesis turns light into sugar.");
        assert_eq!(s.level(), 2);
        assert_eq!(s.history().all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_input_is_rejected_without_request() {
        let (base, seen) = spawn_script(vec![]).await;
        let mut s = session(&base);
        let err = s.explain("   ", 2).await.unwrap_err();
        assert!(matches!(err, GatewayError::EmptyInput(_)));
        assert!(seen.lock().unwrap().is_empty());
        assert!(s.generate_flashcards().await.is_err());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_flashcards_replace_then_invalid_format_empties_deck() {
        let (base, seen) = spawn_script(vec![
            chat(EXPLAINED),
            chat("```json\n[{\"q\":\"Q1\",\"a\":\"A1\"},{\"q\":\"Q2\",\"a\":\"A2\"}]\n```"),
            chat("[{\"q\":\"Q3\",\"a\":\"A3\"}]"),
            chat("Sorry, I cannot do that."),
        ])
        .await;
        let mut s = session(&base);
        s.explain("photosynthesis", 2).await.unwrap();

        assert_eq!(s.generate_flashcards().await.unwrap().len(), 2);
        let deck = s.generate_flashcards().await.unwrap();
        assert_eq!(deck, &[Flashcard { q: "Q3".into(), a: "A3".into() }]);

        let err = s.generate_flashcards().await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidArtifactFormat(_)));
        assert!(s.flashcards().is_empty());
        assert!(s.error().is_some());
        assert_eq!(s.explanation().follow_ups.len(), 3);
        assert_eq!(s.flashcard_phase(), GenerationPhase::Idle);

        let request = seen.lock().unwrap()[1].clone();
        assert_eq!(
            request["messages"][1]["content"],
            "Photosynthesis turns light into sugar."
        );
    }

    #[tokio::test]
    async fn test_learning_path_survives_new_explanation() {
        let (base, seen) = spawn_script(vec![
            chat(EXPLAINED),
            chat(r#"[{"title":"Light","description":"Photons"},{"title":"Sugar","description":"Glucose"}]"#),
            chat("Cells are small.\n---\n**Want to learn more?**\n1. [What is a nucleus?]"),
        ])
        .await;
        let mut s = session(&base);
        s.explain("photosynthesis", 2).await.unwrap();

        let steps = s.generate_learning_path("").await.unwrap();
        assert_eq!(steps.len(), 2);
        let request = seen.lock().unwrap()[1].clone();
        assert_eq!(
            request["messages"][1]["content"],
            "Photosynthesis turns light into sugar."
        );

        s.ask_follow_up(0).await.unwrap();
        assert_eq!(s.input(), "What is chlorophyll?");
        assert_eq!(s.explanation().body, "Cells are small.");
        assert_eq!(s.learning_path().len(), 2);
    }

    #[tokio::test]
    async fn test_explain_step_keeps_roadmap() {
        let (base, seen) = spawn_script(vec![
            chat(EXPLAINED),
            chat(r#"[{"title":"Light reactions","description":"Photons"},{"title":"Calvin cycle","description":"Carbon fixation"}]"#),
            chat("The Calvin cycle fixes carbon.\n---\n**Want to learn more?**\n1. [What is RuBisCO?]"),
        ])
        .await;
        let mut s = session(&base);
        s.explain("photosynthesis", 3).await.unwrap();
        s.generate_learning_path("photosynthesis").await.unwrap();

        let out = s.explain_step(1).await.unwrap().clone();
        assert_eq!(out.body, "The Calvin cycle fixes carbon.");
        assert_eq!(s.input(), "Calvin cycle");
        assert_eq!(s.level(), 3);
        assert_eq!(s.learning_path().len(), 2);
        assert_eq!(s.learning_path()[0].title, "Light reactions");

        let request = seen.lock().unwrap()[2].clone();
        assert_eq!(request["messages"][1]["content"], "Calvin cycle");
        assert!(request["messages"][0]["content"]
            .as_str()
            .unwrap()
            .contains(prompts::LEVELS[3].instruction));

        let err = s.explain_step(5).await.unwrap_err();
        assert!(matches!(err, GatewayError::EmptyInput(_)));
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_provider_selection_and_history_restore() {
        let (base, _) = spawn_script(vec![chat(EXPLAINED)]).await;
        let mut s = session(&base);
        assert!(matches!(
            s.select_provider("openai"),
            Err(GatewayError::InvalidProvider(_))
        ));
        s.save_credential("gsk_mine").unwrap();
        assert!(!s.is_using_fallback());

        s.explain("photosynthesis", 3).await.unwrap();
        let entry = s.history().latest().unwrap().unwrap();
        s.clear();
        assert!(s.explanation().body.is_empty());

        s.load_history_entry(&entry);
        assert_eq!(s.level(), 3);
        assert_eq!(s.explanation().body, "Photosynthesis turns light into sugar.");

        s.clear_credential().unwrap();
        assert!(s.is_using_fallback());
    }
}
