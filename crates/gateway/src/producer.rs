//! Request submission and the background producer task.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Instant};

use {
    chatrelay_agents::{
        ChatOption, StreamEvent, build_capability_prompt, build_messages, extract_answer,
    },
    chatrelay_sessions::ChatMessage,
    futures::{FutureExt, StreamExt},
    serde::{Deserialize, Serialize},
    tracing::{info, warn},
};

use crate::{error::RelayError, relay::ChannelSender, state::GatewayState};

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub query: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub options: Vec<ChatOption>,
}

/// Returned once the producer has been started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitAccepted {
    pub status: String,
    pub session_id: String,
    pub message: String,
}

/// Start processing a request in the background.
///
/// Returns as soon as the session's channel is open and the producer task is
/// spawned; results are read with `RelayRegistry::drain`.
pub async fn submit(
    state: &Arc<GatewayState>,
    request: ChatRequest,
) -> Result<SubmitAccepted, RelayError> {
    if request.query.trim().is_empty() {
        return Err(RelayError::Validation("query must not be empty".into()));
    }
    let session_id = request
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .unwrap_or(state.config.relay.default_session_id.as_str())
        .to_string();

    let sender = state.relay.open(&session_id)?;
    state
        .sessions
        .append(&session_id, ChatMessage::user(request.query.as_str()))
        .await;

    info!(
        session_id = %session_id,
        query_len = request.query.chars().count(),
        options = request.options.len(),
        "chat request accepted"
    );

    tokio::spawn(run_producer(Arc::clone(state), sender, request));

    Ok(SubmitAccepted {
        status: "processing".into(),
        session_id,
        message: "Request accepted, processing started".into(),
    })
}

/// Drive one request to exactly one terminal event.
async fn run_producer(state: Arc<GatewayState>, mut sender: ChannelSender, request: ChatRequest) {
    let started = Instant::now();
    let session_id = sender.session_id().to_string();

    let outcome = AssertUnwindSafe(produce(&state, &mut sender, &request))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            Err(RelayError::Producer(format!(
                "producer panicked: {}",
                panic_message(payload.as_ref())
            )))
        });

    let result = match outcome {
        Ok(cumulative) => {
            if !cumulative.is_empty() {
                state
                    .sessions
                    .append(&session_id, ChatMessage::assistant(cumulative.as_str()))
                    .await;
            }
            let answer = extract_answer(&cumulative, &state.config.chat.answer_marker);
            info!(
                session_id = %session_id,
                chars = cumulative.chars().count(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "chat request completed"
            );
            sender.complete(answer).await
        },
        Err(e) => {
            warn!(
                session_id = %session_id,
                error = %e,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "chat request failed"
            );
            sender.fail(e.to_string()).await
        },
    };

    if let Err(e) = result {
        warn!(session_id = %session_id, error = %e, "terminal event not delivered");
    }
}

/// Stream the provider's output into the channel. Returns the full text.
async fn produce(
    state: &GatewayState,
    sender: &mut ChannelSender,
    request: &ChatRequest,
) -> Result<String, RelayError> {
    let chat = &state.config.chat;
    let capability_prompt = build_capability_prompt(&request.options, &state.config.capabilities);
    let history = if chat.include_history {
        state.sessions.context_messages(sender.session_id()).await
    } else {
        Vec::new()
    };
    let messages = build_messages(
        chat.system_prompt.as_deref(),
        capability_prompt.as_deref(),
        &history,
        &request.query,
    );

    let cancel = sender.cancellation();
    let mut stream = state.provider.stream(messages);
    let mut cumulative = String::new();

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            event = stream.next() => event,
        };
        match event {
            Some(StreamEvent::Delta(delta)) => {
                cumulative.push_str(&delta);
                sender.push_cumulative(&cumulative).await?;
            },
            Some(StreamEvent::Done(_)) | None => return Ok(cumulative),
            Some(StreamEvent::Error(msg)) => return Err(RelayError::Producer(msg)),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
