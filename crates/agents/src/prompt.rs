use {
    chatrelay_config::CapabilitiesConfig,
    serde::{Deserialize, Serialize},
    tracing::warn,
};

/// A client-supplied switch for one named capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatOption {
    pub name: String,
    pub enabled: bool,
}

/// Build the capability preamble for the enabled options.
///
/// Each enabled option that names a configured capability contributes its
/// prompt line, in request order. Returns `None` when nothing is enabled.
pub fn build_capability_prompt(
    options: &[ChatOption],
    capabilities: &CapabilitiesConfig,
) -> Option<String> {
    let mut lines = Vec::new();
    for option in options.iter().filter(|o| o.enabled) {
        match capabilities.get(&option.name) {
            Some(entry) => lines.push(entry.prompt.as_str()),
            None => warn!(option = %option.name, "ignoring unknown capability option"),
        }
    }
    if lines.is_empty() {
        return None;
    }

    let mut prompt = String::from("## Available Capabilities\n\n");
    for line in lines {
        prompt.push_str("- ");
        prompt.push_str(line);
        prompt.push('\n');
    }
    Some(prompt)
}

/// Assemble the message list sent to the provider.
///
/// The system prompt and capability preamble are merged into a single
/// system message; `history` holds earlier `{role, content}` messages.
pub fn build_messages(
    system_prompt: Option<&str>,
    capability_prompt: Option<&str>,
    history: &[serde_json::Value],
    query: &str,
) -> Vec<serde_json::Value> {
    let mut messages = Vec::with_capacity(history.len() + 2);

    let system: Vec<&str> = [system_prompt, capability_prompt]
        .into_iter()
        .flatten()
        .filter(|s| !s.trim().is_empty())
        .collect();
    if !system.is_empty() {
        messages.push(serde_json::json!({
            "role": "system",
            "content": system.join("\n\n"),
        }));
    }

    messages.extend(history.iter().cloned());
    messages.push(serde_json::json!({
        "role": "user",
        "content": query,
    }));
    messages
}
