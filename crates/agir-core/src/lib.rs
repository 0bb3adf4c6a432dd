pub mod config;
pub mod error;
pub mod event;
pub mod process;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{AgirError, ErrorKind, Result};
pub use event::EventBus;
pub use process::ProcessDefinition;
pub use types::*;
