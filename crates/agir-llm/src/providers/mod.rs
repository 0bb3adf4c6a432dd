pub mod anthropic;
pub mod dummy;
pub mod openai;
pub mod presets;

pub use anthropic::AnthropicClient;
pub use dummy::DummyProvider;
pub use openai::OpenAiClient;
