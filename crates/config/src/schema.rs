//! Config schema types (server, relay, provider, chat, capabilities).

use std::{collections::BTreeMap, time::Duration};

use {secrecy::Secret, serde::Deserialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChatRelayConfig {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub provider: ProviderConfig,
    pub chat: ChatConfig,
    pub capabilities: CapabilitiesConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 10800,
        }
    }
}

/// Streaming relay tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Seconds a drain waits for the next event before sending a heartbeat.
    pub heartbeat_secs: u64,
    /// Capacity of each session's hand-off channel.
    pub channel_capacity: usize,
    /// Channels with no attached consumer for this long are evicted.
    pub idle_ttl_secs: u64,
    /// How often the eviction sweeper runs.
    pub sweep_interval_secs: u64,
    /// Session id used when a submit request omits one.
    pub default_session_id: String,
    /// Sent as the `complete` content when the final answer is empty.
    pub completion_fallback: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 10,
            channel_capacity: 256,
            idle_ttl_secs: 600,
            sweep_interval_secs: 30,
            default_session_id: "default".into(),
            completion_fallback: "Task processing completed.".into(),
        }
    }
}

impl RelayConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Which text producer backs the relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Any OpenAI-compatible chat completions endpoint.
    #[default]
    Openai,
    /// Offline provider that streams the prompt back.
    Echo,
}

/// LLM provider configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,

    /// Model identifier sent to the endpoint.
    pub model: String,

    /// API base URL, without the `/chat/completions` suffix.
    pub base_url: String,

    /// API key. `CHATRELAY_API_KEY` takes precedence when set.
    pub api_key: Option<Secret<String>>,

    pub temperature: Option<f32>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            model: "qwen-plus".into(),
            base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1".into(),
            api_key: None,
            temperature: None,
        }
    }
}

/// Conversation assembly settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Prepended as a system message to every request.
    pub system_prompt: Option<String>,
    /// Send the session's earlier messages along with the new query.
    pub include_history: bool,
    /// The final answer is the text after the last occurrence of this marker.
    pub answer_marker: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            include_history: false,
            answer_marker: "[ANSWER]".into(),
        }
    }
}

/// Named capabilities a client can switch on through request `options`.
#[derive(Debug, Clone, Deserialize)]
pub struct CapabilitiesConfig {
    #[serde(flatten)]
    pub entries: BTreeMap<String, CapabilityEntry>,
}

/// One capability: the prompt line added when the option is enabled.
#[derive(Debug, Clone, Deserialize)]
pub struct CapabilityEntry {
    pub prompt: String,
}

impl Default for CapabilitiesConfig {
    fn default() -> Self {
        let entries = [
            ("amap-maps", "You can use the map tools."),
            ("blender", "You can use the Blender tools."),
            ("filesystem", "You can use the filesystem tools."),
            ("memory", "You can use the memory tools."),
        ]
        .into_iter()
        .map(|(name, prompt)| {
            (name.to_string(), CapabilityEntry {
                prompt: prompt.to_string(),
            })
        })
        .collect();
        Self { entries }
    }
}

impl CapabilitiesConfig {
    pub fn get(&self, name: &str) -> Option<&CapabilityEntry> {
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}
