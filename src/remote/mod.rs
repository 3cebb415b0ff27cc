//! Remote completion API: contract and OpenAI-compatible client

pub mod api;
pub mod openai;

pub use api::{
    ChatMessage, CompletionRequest, CompletionResponse, ImageResponse, RemoteCompletionApi,
    RemoteError,
};
pub use openai::OpenAiClient;
