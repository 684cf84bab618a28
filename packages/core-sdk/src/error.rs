/**
 * \brief 对话核心的统一错误类型。
 * \details 配置类错误在发出任何网络请求前同步返回；传输类错误在流内以 `Error` 事件出现。
 */
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("provider {0} does not support chat requests")]
    UnsupportedProvider(String),

    #[error("credential missing for provider {0}")]
    MissingCredential(String),

    #[error("credential for provider {0} is not a valid header value")]
    InvalidCredential(String),

    #[error("no model selected for provider {0}")]
    MissingModel(String),

    #[error("message is empty")]
    EmptyInput,

    #[error("a turn is already in flight")]
    Busy,

    #[error("message {0} not found")]
    MessageNotFound(String),

    #[error("message {0} is finalized and can no longer change")]
    MessageFrozen(String),

    #[error("update to message {0} does not extend its current content")]
    NonContiguousUpdate(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl ChatError {
    /** \brief 是否为配置类错误（不重试、不发请求）。 */
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ChatError::UnknownProvider(_)
                | ChatError::UnsupportedProvider(_)
                | ChatError::MissingCredential(_)
                | ChatError::InvalidCredential(_)
                | ChatError::MissingModel(_)
        )
    }
}

pub type Result<T, E = ChatError> = std::result::Result<T, E>;
