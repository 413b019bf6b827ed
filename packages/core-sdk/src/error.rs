use thiserror::Error;

/**
 * \brief 网关对外暴露的错误类型，展示字符串可直接呈现给用户。
 */
#[derive(Debug, Error)]
pub enum GatewayError {
    /** \brief 选择了注册表之外的 Provider。 */
    #[error("unknown provider: {0}")]
    InvalidProvider(String),
    /** \brief 调用时既无用户密钥也无可用的内置密钥。 */
    #[error("no API key configured; add your own key or configure the built-in key")]
    NoCredential,
    /** \brief 服务端返回非 2xx 状态。 */
    #[error("{message}")]
    ProviderHttp { status: u16, message: String },
    /** \brief 2xx 响应无法映射为文本。 */
    #[error("unexpected response shape: {0}")]
    ProviderFormat(String),
    /** \brief 闪卡或学习路径的 JSON 无法解析。 */
    #[error("the model returned an invalid format: {0}")]
    InvalidArtifactFormat(String),
    #[error("complexity level must be between 0 and 4, got {0}")]
    InvalidLevel(u8),
    /** \brief 缺少可供解释的输入文本。 */
    #[error("{0}")]
    EmptyInput(&'static str),
    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("storage error: {0}")]
    Storage(String),
}

impl GatewayError {
    /**
     * \brief 稳定的错误码，供前端区分处理。
     */
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidProvider(_) => "INVALID_PROVIDER",
            Self::NoCredential => "NO_API_KEY",
            Self::ProviderHttp { .. } => "PROVIDER_HTTP",
            Self::ProviderFormat(_) => "PROVIDER_FORMAT",
            Self::InvalidArtifactFormat(_) => "INVALID_FORMAT",
            Self::InvalidLevel(_) => "INVALID_LEVEL",
            Self::EmptyInput(_) => "EMPTY_INPUT",
            Self::Transport(_) => "TRANSPORT",
            Self::Storage(_) => "STORAGE",
        }
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(format!("{:#}", err))
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
