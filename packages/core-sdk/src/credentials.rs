use std::fmt;

use anyhow::Result;

use crate::db::{KvStore, KEY_PROVIDER, KEY_USER_API_KEY};
use crate::error::{GatewayError, GatewayResult};
use crate::providers::{ProviderRegistry, GROQ};

pub const FALLBACK_ENV: &str = "NIX_GROQ_API_KEY";
pub const FALLBACK_PLACEHOLDER: &str = "gsk_YOUR_GROQ_API_KEY_HERE";

/**
 * \brief 内置兜底密钥，只对一个固定 Provider 有效。
 */
#[derive(Clone)]
pub struct FallbackCredential {
    key: Option<String>,
    provider_id: String,
}

impl FallbackCredential {
    /**
     * \brief 空串与占位符都视为未配置。
     */
    pub fn new(key: impl Into<String>, provider_id: impl Into<String>) -> Self {
        let key = key.into().trim().to_string();
        let key = if key.is_empty() || key == FALLBACK_PLACEHOLDER {
            None
        } else {
            Some(key)
        };
        Self {
            key,
            provider_id: provider_id.into(),
        }
    }

    pub fn none(provider_id: impl Into<String>) -> Self {
        Self::new("", provider_id)
    }

    /**
     * \brief 进程启动时读取：运行时环境变量优先，其次编译期注入值。
     */
    pub fn from_env() -> Self {
        let key = std::env::var(FALLBACK_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| option_env!("NIX_GROQ_API_KEY").map(str::to_string))
            .unwrap_or_else(|| FALLBACK_PLACEHOLDER.to_string());
        Self::new(key, GROQ)
    }

    pub fn is_configured(&self) -> bool {
        self.key.is_some()
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }
}

impl fmt::Debug for FallbackCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackCredential")
            .field("configured", &self.is_configured())
            .field("provider_id", &self.provider_id)
            .finish()
    }
}

/**
 * \brief 持久化的凭据状态：用户密钥与所选 Provider。
 * \details 由前端持有，按调用注入网关；只通过显式的保存/清除动作修改。
 */
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialState {
    user_credential: String,
    selected_provider: String,
}

impl CredentialState {
    /**
     * \brief 仅供 crate 内部构造；外部只能经 `load` 获得，保证所选 Provider 在注册表中。
     */
    pub(crate) fn new(
        user_credential: impl Into<String>,
        selected_provider: impl Into<String>,
    ) -> Self {
        Self {
            user_credential: user_credential.into().trim().to_string(),
            selected_provider: selected_provider.into(),
        }
    }

    /**
     * \brief 从存储读取；已不在注册表中的 Provider 回落为默认项。
     */
    pub fn load(store: &dyn KvStore, registry: &ProviderRegistry) -> Result<Self> {
        let user_credential = store.get(KEY_USER_API_KEY)?.unwrap_or_default();
        let selected_provider = store
            .get(KEY_PROVIDER)?
            .filter(|id| registry.contains(id))
            .unwrap_or_else(|| registry.default_id().to_string());
        Ok(Self::new(user_credential, selected_provider))
    }

    pub fn selected_provider(&self) -> &str {
        &self.selected_provider
    }

    /**
     * \brief 切换 Provider；未知 id 返回 InvalidProvider 且保持原选择。
     */
    pub fn select_provider(
        &mut self,
        store: &dyn KvStore,
        registry: &ProviderRegistry,
        id: &str,
    ) -> GatewayResult<()> {
        registry.require(id)?;
        store.set(KEY_PROVIDER, id)?;
        self.selected_provider = id.to_string();
        Ok(())
    }

    pub fn user_credential(&self) -> Option<&str> {
        if self.user_credential.is_empty() {
            None
        } else {
            Some(&self.user_credential)
        }
    }

    /**
     * \brief 保存用户密钥，空串等同于清除。
     */
    pub fn save_user_credential(&mut self, store: &dyn KvStore, key: &str) -> Result<()> {
        let key = key.trim();
        if key.is_empty() {
            return self.clear_user_credential(store);
        }
        store.set(KEY_USER_API_KEY, key)?;
        self.user_credential = key.to_string();
        Ok(())
    }

    pub fn clear_user_credential(&mut self, store: &dyn KvStore) -> Result<()> {
        store.remove(KEY_USER_API_KEY)?;
        self.user_credential.clear();
        Ok(())
    }

    /**
     * \brief 用于展示的脱敏密钥，如 `gsk_…wxyz`。
     */
    pub fn masked_credential(&self) -> Option<String> {
        self.user_credential().map(mask)
    }
}

impl fmt::Debug for CredentialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialState")
            .field("user_credential", &self.masked_credential())
            .field("selected_provider", &self.selected_provider)
            .finish()
    }
}

fn mask(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    User,
    Fallback,
}

/**
 * \brief 一次调用实际使用的密钥与 Provider。
 */
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedCredential {
    pub api_key: String,
    pub provider_id: String,
    pub source: CredentialSource,
}

impl fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("api_key", &mask(&self.api_key))
            .field("provider_id", &self.provider_id)
            .field("source", &self.source)
            .finish()
    }
}

/**
 * \brief 密钥选择规则：用户密钥配合用户所选 Provider；否则使用兜底密钥及其绑定的 Provider。
 * \details 兜底密钥永远不会被发往用户所选的其他 Provider。用户密钥不做格式校验。
 */
pub fn resolve_credential(
    state: &CredentialState,
    fallback: &FallbackCredential,
) -> GatewayResult<ResolvedCredential> {
    if let Some(key) = state.user_credential() {
        return Ok(ResolvedCredential {
            api_key: key.to_string(),
            provider_id: state.selected_provider.clone(),
            source: CredentialSource::User,
        });
    }
    if let Some(key) = fallback.key.as_deref() {
        return Ok(ResolvedCredential {
            api_key: key.to_string(),
            provider_id: fallback.provider_id.clone(),
            source: CredentialSource::Fallback,
        });
    }
    Err(GatewayError::NoCredential)
}

pub fn has_credential(state: &CredentialState, fallback: &FallbackCredential) -> bool {
    resolve_credential(state, fallback).is_ok()
}

pub fn is_using_fallback(state: &CredentialState, fallback: &FallbackCredential) -> bool {
    matches!(
        resolve_credential(state, fallback),
        Ok(ResolvedCredential {
            source: CredentialSource::Fallback,
            ..
        })
    )
}
