//! Slash-command subsystem.
//!
//! Adapters hand the command text here after demultiplexing their own
//! webhook shapes. Commands that change configuration write through the
//! config store, so the next `process_message` on the same config observes
//! the new value.

use courier_protocol::ChannelConfig;
use courier_protocol::ModelRef;
use courier_protocol::NormalizedMessage;
use serde_json::Value;
use tracing::info;

use crate::engine::Engine;
use crate::error::Result;
use crate::store::ConfigPatch;
use crate::store::ConfigStore as _;

#[derive(Debug, Clone, PartialEq)]
pub enum SlashCommand {
    /// Show or set the pinned model (`model`, `model provider/model`).
    Model(Option<String>),
    /// Show or set the named agent (`agent`, `agent researcher`).
    Agent(Option<String>),
    Status,
    NewSession,
    Help,
}

pub fn parse(input: &str) -> SlashCommand {
    let input = input.trim().trim_start_matches('/');
    let mut words = input.split_whitespace();
    let command = words.next().unwrap_or_default();
    let argument = words.next().map(str::to_string);
    match command {
        "model" => SlashCommand::Model(argument),
        "agent" => SlashCommand::Agent(argument),
        "status" => SlashCommand::Status,
        "new" | "reset" => SlashCommand::NewSession,
        _ => SlashCommand::Help,
    }
}

/// Execute a command and return the reply text for the adapter to deliver.
pub async fn handle(
    engine: &Engine,
    config: &ChannelConfig,
    message: &NormalizedMessage,
    command: SlashCommand,
) -> Result<String> {
    match command {
        SlashCommand::Model(None) => {
            let current = config
                .pinned_model()
                .map(|m| m.to_string())
                .unwrap_or_else(|| "default".to_string());
            let providers = engine.agent_client().list_providers().await?;
            let names: Vec<String> = providers.iter().filter_map(entry_name).collect();
            Ok(format!(
                "Current model: {current}\nProviders: {}\nUse `model provider/model` to switch.",
                if names.is_empty() {
                    "(none reported)".to_string()
                } else {
                    names.join(", ")
                }
            ))
        }
        SlashCommand::Model(Some(spec)) => {
            let Some(model) = ModelRef::parse(&spec) else {
                return Ok(format!(
                    "`{spec}` is not a valid model; expected `provider/model`."
                ));
            };
            let mut metadata = config.metadata.clone();
            metadata.insert("model".to_string(), serde_json::to_value(&model)?);
            engine
                .store()
                .update(
                    &config.id,
                    ConfigPatch {
                        metadata: Some(metadata),
                        ..Default::default()
                    },
                )
                .await?;
            info!(config_id = %config.id, model = %model, "pinned model changed");
            Ok(format!("Model set to {model}."))
        }
        SlashCommand::Agent(None) => {
            let agents = engine.agent_client().list_agents().await?;
            let names: Vec<String> = agents.iter().filter_map(entry_name).collect();
            let current = config.agent_name.as_deref().unwrap_or("(default)");
            Ok(format!(
                "Current agent: {current}\nAgents: {}\nUse `agent <name>` to switch.",
                if names.is_empty() {
                    "(none reported)".to_string()
                } else {
                    names.join(", ")
                }
            ))
        }
        SlashCommand::Agent(Some(name)) => {
            engine
                .store()
                .update(
                    &config.id,
                    ConfigPatch {
                        agent_name: Some(Some(name.clone())),
                        ..Default::default()
                    },
                )
                .await?;
            info!(config_id = %config.id, agent = %name, "agent changed");
            Ok(format!("Agent set to {name}."))
        }
        SlashCommand::Status => {
            match engine
                .sessions()
                .active_session_id(&config.id, &message.user.id)
            {
                Some(active) => Ok(format!(
                    "Active session {} (started {}s ago). Model: {}.",
                    active.session_id,
                    active.age.as_secs(),
                    config
                        .pinned_model()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| "default".to_string()),
                )),
                None => Ok("No active session. Send a message to start one.".to_string()),
            }
        }
        SlashCommand::NewSession => {
            engine
                .sessions()
                .invalidate(&config.id, config.session_strategy, message);
            Ok("Started a new session; the next message gets a fresh one.".to_string())
        }
        SlashCommand::Help => Ok(concat!(
            "Commands:\n",
            "`model` / `model provider/model` - show or pin the model\n",
            "`agent` / `agent <name>` - show or pick the agent\n",
            "`status` - show the active session\n",
            "`new` - start a fresh session",
        )
        .to_string()),
    }
}

fn entry_name(entry: &Value) -> Option<String> {
    entry
        .get("id")
        .or_else(|| entry.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| entry.as_str().map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_known_commands() {
        assert_eq!(parse("/model"), SlashCommand::Model(None));
        assert_eq!(
            parse("model openai/gpt-5"),
            SlashCommand::Model(Some("openai/gpt-5".to_string()))
        );
        assert_eq!(
            parse("  /agent researcher "),
            SlashCommand::Agent(Some("researcher".to_string()))
        );
        assert_eq!(parse("/status"), SlashCommand::Status);
        assert_eq!(parse("new"), SlashCommand::NewSession);
        assert_eq!(parse("reset"), SlashCommand::NewSession);
    }

    #[test]
    fn anything_else_is_help() {
        assert_eq!(parse(""), SlashCommand::Help);
        assert_eq!(parse("/dance"), SlashCommand::Help);
    }

    #[test]
    fn entry_name_accepts_objects_and_strings() {
        assert_eq!(
            entry_name(&serde_json::json!({"id": "openai"})),
            Some("openai".to_string())
        );
        assert_eq!(
            entry_name(&serde_json::json!({"name": "researcher"})),
            Some("researcher".to_string())
        );
        assert_eq!(
            entry_name(&serde_json::json!("plain")),
            Some("plain".to_string())
        );
        assert_eq!(entry_name(&serde_json::json!(42)), None);
    }
}
