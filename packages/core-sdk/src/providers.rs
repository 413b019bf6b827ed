use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use serde::Serialize;

use crate::error::{GatewayError, GatewayResult};

/**
 * \brief 线协议族。多个 Provider 可共用同一族，分发只按族进行。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WireFamily {
    /** \brief OpenAI 风格 `/chat/completions`，Bearer 头鉴权 */
    ChatCompletions,
    /** \brief Gemini 风格 `:generateContent`，密钥走 query 参数 */
    GenerativeContent,
}

/**
 * \brief Provider 描述，进程启动时确定，之后只读。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderDescriptor {
    pub id: String,
    pub display_name: String,
    pub family: WireFamily,
    /** \brief 端点模板，`{model}` 会被替换为模型名 */
    pub endpoint_template: String,
    pub default_model: String,
    /** \brief 密钥前缀提示，仅供展示，不做校验 */
    pub credential_prefix_hint: String,
    pub signup_url: String,
}

impl ProviderDescriptor {
    pub fn new(
        id: &str,
        display_name: &str,
        family: WireFamily,
        endpoint_template: &str,
        default_model: &str,
        credential_prefix_hint: &str,
        signup_url: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            family,
            endpoint_template: endpoint_template.to_string(),
            default_model: default_model.to_string(),
            credential_prefix_hint: credential_prefix_hint.to_string(),
            signup_url: signup_url.to_string(),
        }
    }

    /**
     * \brief 代入模型名后的实际端点。
     */
    pub fn endpoint(&self, model: &str) -> String {
        self.endpoint_template.replace("{model}", model)
    }

    pub fn key_looks_valid(&self, key: &str) -> bool {
        self.credential_prefix_hint.is_empty() || key.starts_with(&self.credential_prefix_hint)
    }
}

pub const GROQ: &str = "groq";
pub const GEMINI: &str = "gemini";
pub const OPENAI: &str = "openai";

static BUILTIN: Lazy<ProviderRegistry> = Lazy::new(|| {
    ProviderRegistry::builder()
        .register(ProviderDescriptor::new(
            GROQ,
            "Groq",
            WireFamily::ChatCompletions,
            "https://api.groq.com/openai/v1/chat/completions",
            "llama-3.3-70b-versatile",
            "gsk_",
            "https://console.groq.com/keys",
        ))
        .register(ProviderDescriptor::new(
            GEMINI,
            "Google Gemini",
            WireFamily::GenerativeContent,
            "https://generativelanguage.googleapis.com/v1beta/models/{model}:generateContent",
            "gemini-2.0-flash",
            "AIza",
            "https://aistudio.google.com/apikey",
        ))
        .register(ProviderDescriptor::new(
            OPENAI,
            "OpenAI",
            WireFamily::ChatCompletions,
            "https://api.openai.com/v1/chat/completions",
            "gpt-4o-mini",
            "sk-",
            "https://platform.openai.com/api-keys",
        ))
        .build()
        .unwrap_or_else(|_| unreachable!("built-in registry has entries"))
});

/**
 * \brief Provider 注册表。保留注册顺序，首个条目为默认 Provider。
 */
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    entries: Vec<ProviderDescriptor>,
}

impl ProviderRegistry {
    /**
     * \brief 内置的三家 Provider。
     */
    pub fn builtin() -> &'static ProviderRegistry {
        &BUILTIN
    }

    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder::default()
    }

    /**
     * \brief id 到描述的只读映射，永不为空。
     */
    pub fn list(&self) -> BTreeMap<&str, &ProviderDescriptor> {
        self.entries.iter().map(|p| (p.id.as_str(), p)).collect()
    }

    /**
     * \brief 按注册顺序遍历。
     */
    pub fn iter(&self) -> impl Iterator<Item = &ProviderDescriptor> {
        self.entries.iter()
    }

    pub fn get(&self, id: &str) -> Option<&ProviderDescriptor> {
        self.entries.iter().find(|p| p.id == id)
    }

    pub fn require(&self, id: &str) -> GatewayResult<&ProviderDescriptor> {
        self.get(id)
            .ok_or_else(|| GatewayError::InvalidProvider(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn default_id(&self) -> &str {
        &self.entries[0].id
    }
}

#[derive(Debug, Default)]
pub struct ProviderRegistryBuilder {
    entries: Vec<ProviderDescriptor>,
}

impl ProviderRegistryBuilder {
    /**
     * \brief 注册 Provider；同 id 的后注册者覆盖先前条目并保留原位置。
     */
    pub fn register(mut self, descriptor: ProviderDescriptor) -> Self {
        if let Some(slot) = self.entries.iter_mut().find(|p| p.id == descriptor.id) {
            *slot = descriptor;
        } else {
            self.entries.push(descriptor);
        }
        self
    }

    pub fn build(self) -> anyhow::Result<ProviderRegistry> {
        if self.entries.is_empty() {
            anyhow::bail!("provider registry must contain at least one provider");
        }
        Ok(ProviderRegistry {
            entries: self.entries,
        })
    }
}
