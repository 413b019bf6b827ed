pub mod credentials;
pub mod db;
pub mod error;
pub mod extract;
pub mod history;
pub mod llm;
pub mod models;
pub mod prompts;
pub mod providers;
pub mod server;
pub mod session;
pub mod telemetry;

pub use error::{GatewayError, GatewayResult};

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::credentials;
    pub use crate::db;
    pub use crate::extract;
    pub use crate::history;
    pub use crate::llm;
    pub use crate::models;
    pub use crate::prompts;
    pub use crate::providers;
    pub use crate::server;
    pub use crate::session;
    pub use crate::telemetry;
}
