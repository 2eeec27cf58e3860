use std::{pin::Pin, time::Duration};

use tokio_stream::Stream;

use crate::model::{LlmProvider, StreamEvent, Usage};

/// Offline provider that streams the last user message back, one word per
/// delta. Useful for local runs without an API key.
#[derive(Debug, Default)]
pub struct EchoProvider {
    delay: Duration,
}

impl EchoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause between deltas, to make streaming visible in a client.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

fn last_user_text(messages: &[serde_json::Value]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m["role"] == "user")
        .and_then(|m| m["content"].as_str())
        .unwrap_or_default()
        .to_string()
}

impl LlmProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    fn id(&self) -> &str {
        "echo"
    }

    fn stream(
        &self,
        messages: Vec<serde_json::Value>,
    ) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + '_>> {
        let text = last_user_text(&messages);
        let delay = self.delay;
        Box::pin(async_stream::stream! {
            let mut words = 0u32;
            for piece in text.split_inclusive(' ') {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                words += 1;
                yield StreamEvent::Delta(piece.to_string());
            }
            yield StreamEvent::Done(Usage {
                input_tokens: words,
                output_tokens: words,
            });
        })
    }
}
