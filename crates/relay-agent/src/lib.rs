pub mod anthropic;
pub mod openai;
pub mod provider;
pub mod registry;
pub mod stream;
pub mod workers;

pub use provider::{
    ChatProvider, CompletionRequest, GeneratedImage, ImageProvider, ProviderError, StreamChunk,
};
pub use registry::ProviderRegistry;
