pub mod config;
pub mod error;
pub mod scope;
pub mod user_config;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use scope::{ChatScope, ChatType, DerivedKeys};
pub use user_config::{ImageProviderKind, ProviderKind, UserConfig};
