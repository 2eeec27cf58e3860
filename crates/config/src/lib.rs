//! Configuration: schema, discovery and loading.
//!
//! Config files are looked up as `chatrelay.{toml,yaml,yml,json}` in the
//! working directory, then in `~/.config/chatrelay/`. `${ENV_VAR}`
//! placeholders are substituted before parsing.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{clear_config_dir, config_dir, discover_and_load, load_config, set_config_dir},
    schema::{
        CapabilitiesConfig, CapabilityEntry, ChatConfig, ChatRelayConfig, ProviderConfig,
        ProviderKind, RelayConfig, ServerConfig,
    },
};
