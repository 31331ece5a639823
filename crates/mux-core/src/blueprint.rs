// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use mux_model::capabilities::builtin_capabilities;
use mux_model::ModelCapability;

/// What the executor does with a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlueprintKind {
    /// Chat tool backed by a provider adapter.
    Chat,
    /// Delegation to a subprocess coding agent.
    CliAgent,
    /// Dispatched directly by the executor, no provider call.
    LocalService,
}

/// Static per-model (or per-service) record exposing a tool to the host.
#[derive(Debug, Clone)]
pub struct Blueprint {
    pub tool_name: String,
    pub kind: BlueprintKind,
    /// Backing model id, for `Chat` blueprints.
    pub model: Option<String>,
    pub timeout: Duration,
    pub context_window: u32,
    /// Companion terminal CLI, when the backing model has one.
    pub cli_name: Option<String>,
    pub description: String,
}

/// `gpt-5` → `chat_with_gpt_5`, `gemini-2.5-flash` → `chat_with_gemini_2_5_flash`.
fn chat_tool_name(model: &str) -> String {
    let slug: String = model
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("chat_with_{}", slug.trim_matches('_'))
}

fn default_timeout_for(capability: &ModelCapability) -> Duration {
    // Background-only reasoners get a long leash; everything else a
    // conventional five minutes.
    if capability.force_background || !capability.supports_streaming {
        Duration::from_secs(1800)
    } else {
        Duration::from_secs(300)
    }
}

/// The registry of every tool exposed to the host.
pub struct BlueprintRegistry {
    blueprints: Vec<Blueprint>,
}

impl BlueprintRegistry {
    /// Build from the static capability table plus the local services.
    pub fn with_builtin_blueprints() -> Self {
        let mut blueprints: Vec<Blueprint> = builtin_capabilities()
            .iter()
            .map(|cap| Blueprint {
                tool_name: chat_tool_name(&cap.model),
                kind: BlueprintKind::Chat,
                model: Some(cap.model.clone()),
                timeout: default_timeout_for(cap),
                context_window: cap.context_window,
                cli_name: cap.cli_name.clone(),
                description: cap.description.clone(),
            })
            .collect();

        blueprints.push(Blueprint {
            tool_name: "work_with".into(),
            kind: BlueprintKind::CliAgent,
            model: None,
            timeout: Duration::from_secs(600),
            context_window: 0,
            cli_name: None,
            description: "Delegate a task to a local coding-agent CLI".into(),
        });
        blueprints.push(Blueprint {
            tool_name: "list_sessions".into(),
            kind: BlueprintKind::LocalService,
            model: None,
            timeout: Duration::from_secs(30),
            context_window: 0,
            cli_name: None,
            description: "List stored sessions for this project".into(),
        });
        blueprints.push(Blueprint {
            tool_name: "describe_session".into(),
            kind: BlueprintKind::LocalService,
            model: None,
            timeout: Duration::from_secs(300),
            context_window: 0,
            cli_name: None,
            description: "Summarize a stored session".into(),
        });

        Self { blueprints }
    }

    /// Register or replace a blueprint (tests, dynamic Ollama discovery).
    pub fn register(&mut self, blueprint: Blueprint) {
        self.blueprints
            .retain(|b| b.tool_name != blueprint.tool_name);
        self.blueprints.push(blueprint);
    }

    /// Register chat blueprints for dynamically discovered models.
    pub fn register_discovered(&mut self, capabilities: &[ModelCapability]) {
        for cap in capabilities {
            self.register(Blueprint {
                tool_name: chat_tool_name(&cap.model),
                kind: BlueprintKind::Chat,
                model: Some(cap.model.clone()),
                timeout: default_timeout_for(cap),
                context_window: cap.context_window,
                cli_name: cap.cli_name.clone(),
                description: cap.description.clone(),
            });
        }
    }

    pub fn get(&self, tool_name: &str) -> Option<&Blueprint> {
        self.blueprints.iter().find(|b| b.tool_name == tool_name)
    }

    pub fn all(&self) -> &[Blueprint] {
        &self.blueprints
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_tool_names_are_slugged() {
        assert_eq!(chat_tool_name("gpt-5"), "chat_with_gpt_5");
        assert_eq!(chat_tool_name("gemini-2.5-flash"), "chat_with_gemini_2_5_flash");
        assert_eq!(chat_tool_name("llama3:latest"), "chat_with_llama3_latest");
    }

    #[test]
    fn registry_exposes_chat_and_service_tools() {
        let registry = BlueprintRegistry::with_builtin_blueprints();
        assert!(registry.get("chat_with_gpt_5").is_some());
        assert!(registry.get("chat_with_grok_4").is_some());
        assert_eq!(
            registry.get("work_with").unwrap().kind,
            BlueprintKind::CliAgent
        );
        assert_eq!(
            registry.get("list_sessions").unwrap().kind,
            BlueprintKind::LocalService
        );
        assert_eq!(
            registry.get("describe_session").unwrap().kind,
            BlueprintKind::LocalService
        );
    }

    #[test]
    fn background_models_get_longer_timeouts() {
        let registry = BlueprintRegistry::with_builtin_blueprints();
        let deep = registry.get("chat_with_o3_deep_research").unwrap();
        let fast = registry.get("chat_with_gemini_2_5_flash").unwrap();
        assert!(deep.timeout > fast.timeout);
    }

    #[test]
    fn register_replaces_by_tool_name() {
        let mut registry = BlueprintRegistry::with_builtin_blueprints();
        let before = registry.all().len();
        let existing = registry.get("chat_with_gpt_5").unwrap().clone();
        registry.register(Blueprint {
            description: "replaced".into(),
            ..existing
        });
        assert_eq!(registry.all().len(), before);
        assert_eq!(registry.get("chat_with_gpt_5").unwrap().description, "replaced");
    }
}
