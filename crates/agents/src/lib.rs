//! Text producers for the relay: the `LlmProvider` abstraction, concrete
//! providers, and the helpers that shape a request and its final answer.

pub mod answer;
pub mod model;
pub mod prompt;
pub mod providers;

pub use {
    answer::extract_answer,
    model::{LlmProvider, StreamEvent, Usage},
    prompt::{ChatOption, build_capability_prompt, build_messages},
    providers::build_provider,
};
