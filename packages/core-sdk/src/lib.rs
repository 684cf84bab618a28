pub mod credentials;
pub mod db;
pub mod error;
pub mod llm;
pub mod models;
pub mod parser;
pub mod providers;
pub mod server;
pub mod session;
pub mod settings;
pub mod store;
pub mod telemetry;
pub mod workspace;

#[cfg(test)]
mod test_support;

pub use error::{ChatError, Result};

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::credentials::{CredentialStore, EnvCredentials, MemoryCredentials};
    pub use crate::error::ChatError;
    pub use crate::llm::{ChatStream, StreamingEngine};
    pub use crate::models::{
        ChatRequest, GenerationParams, Message, MessageStatus, NormalizedEvent, Role, WireFormat,
    };
    pub use crate::providers::ProviderRegistry;
    pub use crate::session::{ChatSession, SessionEvent, Settlement, TurnConfig, TurnState};
    pub use crate::settings::Settings;
    pub use crate::store::ConversationStore;
    pub use crate::{db, server, telemetry};
}
