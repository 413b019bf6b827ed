use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};

use crate::credentials::{self, CredentialState, FallbackCredential, ResolvedCredential};
use crate::error::{GatewayError, GatewayResult};
use crate::models::{Message, Role};
use crate::providers::{ProviderDescriptor, ProviderRegistry, WireFamily};
use crate::telemetry;

/** \brief 响应中取不到正文时返回的占位文本。 */
pub const NO_CONTENT: &str = "No response generated.";

const TEMPERATURE: f64 = 0.7;
const MAX_TOKENS: u32 = 4096;

/**
 * \brief 已按线协议族编码、待发送的请求。
 */
#[derive(Debug)]
struct WireRequest {
    url: String,
    bearer: Option<String>,
    query_key: Option<String>,
    body: Value,
}

type BuildFn = fn(&ProviderDescriptor, &str, &[Message], &str) -> WireRequest;
type ParseFn = fn(&Value) -> GatewayResult<String>;

/**
 * \brief 某一线协议族的请求构造与响应解析函数对。
 */
struct WireCodec {
    build: BuildFn,
    parse: ParseFn,
}

fn codec(family: WireFamily) -> WireCodec {
    match family {
        WireFamily::ChatCompletions => WireCodec {
            build: build_chat_completions,
            parse: extract_chat_completions_content,
        },
        WireFamily::GenerativeContent => WireCodec {
            build: build_generative_content,
            parse: extract_generative_content,
        },
    }
}

/**
 * \brief 多 Provider 统一调用入口。
 * \details 自身无可变状态：凭据状态由调用方按次注入，可并发调用。不重试、不缓存。
 */
#[derive(Debug, Clone)]
pub struct Gateway {
    client: reqwest::Client,
    registry: ProviderRegistry,
    fallback: FallbackCredential,
}

impl Gateway {
    pub fn new(registry: ProviderRegistry, fallback: FallbackCredential) -> GatewayResult<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            registry,
            fallback,
        })
    }

    /**
     * \brief 使用内置注册表与环境中的兜底密钥构建。
     */
    pub fn from_env() -> GatewayResult<Self> {
        Self::new(
            ProviderRegistry::builtin().clone(),
            FallbackCredential::from_env(),
        )
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn fallback(&self) -> &FallbackCredential {
        &self.fallback
    }

    pub fn has_credential(&self, state: &CredentialState) -> bool {
        credentials::has_credential(state, &self.fallback)
    }

    pub fn is_using_fallback(&self, state: &CredentialState) -> bool {
        credentials::is_using_fallback(state, &self.fallback)
    }

    pub fn resolve_credential(&self, state: &CredentialState) -> GatewayResult<ResolvedCredential> {
        credentials::resolve_credential(state, &self.fallback)
    }

    /**
     * \brief 非流式调用，返回模型正文。
     * \param state 调用时刻的凭据状态
     * \param messages 按会话顺序排列的消息
     * \param system_instruction 系统指令
     */
    pub async fn complete(
        &self,
        state: &CredentialState,
        messages: &[Message],
        system_instruction: &str,
    ) -> GatewayResult<String> {
        let resolved = self.resolve_credential(state)?;
        let provider = self.registry.require(&resolved.provider_id)?;
        let wire = codec(provider.family);
        let request = (wire.build)(provider, &resolved.api_key, messages, system_instruction);

        telemetry::log_event(
            "gateway.complete",
            &format!(
                "provider={} family={:?} model={} messages={} source={:?}",
                provider.id,
                provider.family,
                provider.default_model,
                messages.len(),
                resolved.source
            ),
        );

        let mut builder = self
            .client
            .post(&request.url)
            .header(CONTENT_TYPE, "application/json");
        if let Some(token) = &request.bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        if let Some(key) = &request.query_key {
            builder = builder.query(&[("key", key.as_str())]);
        }

        let resp = builder.json(&request.body).send().await.map_err(|e| {
            telemetry::log_error("gateway.complete", &format!("provider={} transport", provider.id));
            GatewayError::Transport(e.without_url())
        })?;

        let status = resp.status();
        if !status.is_success() {
            // 错误响应体读不完整时仍按状态码报告
            let message = resp
                .text()
                .await
                .ok()
                .as_deref()
                .and_then(extract_error_message)
                .unwrap_or_else(|| format!("API Error: {}", status.as_u16()));
            telemetry::log_error(
                "gateway.complete",
                &format!("provider={} status={}", provider.id, status.as_u16()),
            );
            return Err(GatewayError::ProviderHttp {
                status: status.as_u16(),
                message,
            });
        }

        let text = resp
            .text()
            .await
            .map_err(|e| GatewayError::Transport(e.without_url()))?;

        let parsed = serde_json::from_str::<Value>(&text)
            .map_err(|e| GatewayError::ProviderFormat(e.to_string()))
            .and_then(|v| (wire.parse)(&v));
        match parsed {
            Ok(content) => Ok(content),
            Err(err) => {
                telemetry::log_error(
                    "gateway.complete",
                    &format!("provider={} {} bytes={}", provider.id, err, text.len()),
                );
                Ok(NO_CONTENT.to_string())
            }
        }
    }
}

fn build_chat_completions(
    provider: &ProviderDescriptor,
    api_key: &str,
    messages: &[Message],
    system_instruction: &str,
) -> WireRequest {
    let mut payload = Vec::with_capacity(messages.len() + 1);
    payload.push(json!({"role": "system", "content": system_instruction}));
    payload.extend(
        messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content})),
    );
    WireRequest {
        url: provider.endpoint(&provider.default_model),
        bearer: Some(api_key.to_string()),
        query_key: None,
        body: json!({
            "model": provider.default_model,
            "messages": payload,
            "temperature": TEMPERATURE,
            "max_tokens": MAX_TOKENS,
        }),
    }
}

fn build_generative_content(
    provider: &ProviderDescriptor,
    api_key: &str,
    messages: &[Message],
    system_instruction: &str,
) -> WireRequest {
    let contents: Vec<Value> = messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::Assistant => "model",
                Role::User => "user",
            };
            json!({"role": role, "parts": [{"text": m.content}]})
        })
        .collect();
    WireRequest {
        url: provider.endpoint(&provider.default_model),
        bearer: None,
        query_key: Some(api_key.to_string()),
        body: json!({
            "contents": contents,
            "systemInstruction": {"parts": [{"text": system_instruction}]},
            "generationConfig": {
                "temperature": TEMPERATURE,
                "maxOutputTokens": MAX_TOKENS,
            },
        }),
    }
}

fn non_empty(text: Option<&str>, what: &str) -> GatewayResult<String> {
    match text {
        Some(t) if !t.is_empty() => Ok(t.to_string()),
        _ => Err(GatewayError::ProviderFormat(format!("missing {}", what))),
    }
}

fn extract_chat_completions_content(v: &Value) -> GatewayResult<String> {
    let text = v
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str());
    non_empty(text, "choices[0].message.content")
}

fn extract_generative_content(v: &Value) -> GatewayResult<String> {
    let text = v
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.get(0))
        .and_then(|p| p.get("text"))
        .and_then(|t| t.as_str());
    non_empty(text, "candidates[0].content.parts[0].text")
}

/**
 * \brief 从错误响应体中取可读信息，支持 `{error:{message}}` 及其数组包装。
 */
fn extract_error_message(body: &str) -> Option<String> {
    let v: Value = serde_json::from_str(body).ok()?;
    let root = match v.as_array() {
        Some(arr) => arr.first()?.clone(),
        None => v,
    };
    let error = root.get("error")?;
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .or_else(|| error.as_str())?;
    if message.trim().is_empty() {
        None
    } else {
        Some(message.to_string())
    }
}
