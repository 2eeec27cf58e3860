use std::pin::Pin;

use tokio_stream::Stream;

/// Events emitted during streaming LLM completion.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(String),
    Done(Usage),
    Error(String),
}

/// A streaming text producer (OpenAI-compatible endpoint, echo, ...).
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Model identifier (e.g. "qwen-plus").
    fn id(&self) -> &str;

    /// Stream a completion, yielding delta events followed by exactly one
    /// `Done` or `Error`.
    fn stream(
        &self,
        messages: Vec<serde_json::Value>,
    ) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + '_>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}
