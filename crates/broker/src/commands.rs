//! Slash command registry.
//!
//! Two layers: built-in commands (never removed) and dynamic commands
//! (cleared and reseeded from every backend init). Lookup prefers built-in.
//! Three categories decide how a command is answered:
//!
//! - consumer-local: answered entirely inside the broker (`/help`, `/clear`)
//! - relay: rendered from session state (`/model`, `/status`, ...)
//! - passthrough: forwarded to the backend; its next user echo is rewritten
//!   into a `slash_command_result`

use bc_protocol::SessionState;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCategory {
    ConsumerLocal,
    Relay,
    Passthrough,
}

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: String,
    pub description: String,
    pub category: CommandCategory,
}

pub struct CommandRegistry {
    builtin: Vec<CommandSpec>,
    dynamic: Vec<CommandSpec>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn builtin(name: &str, description: &str, category: CommandCategory) -> CommandSpec {
    CommandSpec {
        name: name.into(),
        description: description.into(),
        category,
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            builtin: vec![
                builtin("/help", "List available commands", CommandCategory::ConsumerLocal),
                builtin("/clear", "Clear the conversation view", CommandCategory::ConsumerLocal),
                builtin("/model", "Show the current model", CommandCategory::Relay),
                builtin("/status", "Show session status", CommandCategory::Relay),
                builtin("/config", "Show session configuration", CommandCategory::Relay),
                builtin("/cost", "Show token usage and cost", CommandCategory::Relay),
                builtin(
                    "/context",
                    "Summarize context window usage",
                    CommandCategory::Passthrough,
                ),
                builtin("/compact", "Compact the conversation", CommandCategory::Passthrough),
                builtin("/files", "List files touched this session", CommandCategory::Passthrough),
                builtin("/release-notes", "Show release notes", CommandCategory::Passthrough),
            ],
            dynamic: Vec::new(),
        }
    }

    /// Reseed the dynamic layer from an init's `slash_commands` + skills.
    /// Built-ins are preserved; names colliding with a built-in are skipped.
    pub fn reseed<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.dynamic.clear();
        for name in names {
            let name = normalize(name.as_ref());
            if name.len() <= 1 || self.builtin.iter().any(|c| c.name == name) {
                continue;
            }
            if self.dynamic.iter().any(|c| c.name == name) {
                continue;
            }
            self.dynamic.push(CommandSpec {
                name,
                description: String::new(),
                category: CommandCategory::Passthrough,
            });
        }
    }

    /// Enrich descriptions in place from backend capability metadata
    /// (`[{name, description}, ...]`).
    pub fn enrich(&mut self, commands: &[Value]) {
        for entry in commands {
            let Some(name) = entry.get("name").and_then(Value::as_str) else {
                continue;
            };
            let Some(description) = entry.get("description").and_then(Value::as_str) else {
                continue;
            };
            let name = normalize(name);
            for spec in self.builtin.iter_mut().chain(self.dynamic.iter_mut()) {
                if spec.name == name {
                    spec.description = description.to_owned();
                }
            }
        }
    }

    /// Built-in first, then dynamic.
    pub fn lookup(&self, name: &str) -> Option<&CommandSpec> {
        let name = normalize(name);
        self.builtin
            .iter()
            .find(|c| c.name == name)
            .or_else(|| self.dynamic.iter().find(|c| c.name == name))
    }

    pub fn dynamic_len(&self) -> usize {
        self.dynamic.len()
    }

    /// The `/help` listing, reflecting current registry contents.
    pub fn help_text(&self) -> String {
        let mut out = String::from("Available commands:\n");
        let sections: [(&str, CommandCategory); 3] = [
            ("Built-in", CommandCategory::ConsumerLocal),
            ("Session", CommandCategory::Relay),
            ("Backend", CommandCategory::Passthrough),
        ];
        for (title, category) in sections {
            let specs: Vec<&CommandSpec> = self
                .builtin
                .iter()
                .chain(self.dynamic.iter())
                .filter(|c| c.category == category)
                .collect();
            if specs.is_empty() {
                continue;
            }
            out.push_str("\n");
            out.push_str(title);
            out.push_str(":\n");
            for spec in specs {
                if spec.description.is_empty() {
                    out.push_str(&format!("  {}\n", spec.name));
                } else {
                    out.push_str(&format!("  {} - {}\n", spec.name, spec.description));
                }
            }
        }
        out
    }

    /// Render a relay command from the current session state.
    pub fn render_relay(&self, name: &str, state: &SessionState) -> Option<String> {
        let name = normalize(name);
        match name.as_str() {
            "/model" => Some(format!(
                "Model: {}",
                state.model.as_deref().unwrap_or("(not reported)")
            )),
            "/status" => {
                let status = state
                    .status
                    .map(|s| format!("{s:?}").to_lowercase())
                    .unwrap_or_else(|| "unknown".into());
                Some(format!(
                    "Status: {status}\nModel: {}\nPermission mode: {:?}",
                    state.model.as_deref().unwrap_or("(not reported)"),
                    state.permission_mode,
                ))
            }
            "/config" => Some(format!(
                "Model: {}\nPermission mode: {:?}\nCwd: {}\nTools: {}",
                state.model.as_deref().unwrap_or("(not reported)"),
                state.permission_mode,
                state.cwd.as_deref().unwrap_or("(unknown)"),
                if state.tools.is_empty() {
                    "(none reported)".to_string()
                } else {
                    state.tools.join(", ")
                },
            )),
            "/cost" => Some(format!(
                "Cost: ${:.4}\nInput tokens: {}\nOutput tokens: {}\nTurns: {}",
                state.usage.total_cost_usd,
                state.usage.input_tokens,
                state.usage.output_tokens,
                state.usage.num_turns,
            )),
            _ => None,
        }
    }
}

fn normalize(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.starts_with('/') {
        trimmed.to_owned()
    } else {
        format!("/{trimmed}")
    }
}
