pub mod providers;
pub mod registry;
pub mod retry;
pub mod streaming;

pub use providers::anthropic::AnthropicClient;
pub use providers::dummy::DummyProvider;
pub use providers::openai::OpenAiClient;
pub use registry::{ProviderKind, ProviderRegistry};
pub use retry::RetryingProvider;
