use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::core::llm::{ChatMessage, LlmBackend};
use crate::core::memory::ConversationMemory;
use crate::core::memory::types::Role;

/// What the router should do with a processed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Nothing to send (asleep, or nothing to answer).
    Silent,
    /// Acknowledge, then restart the process.
    Restart,
    Text(String),
}

/// Identity of the author of a message, as resolved by the router.
#[derive(Debug, Clone, Copy)]
pub struct Caller<'a> {
    /// Key of the conversation history (conversation-level).
    pub memory_key: &'a str,
    /// Identity matched against the admin fragment.
    pub admin_subject: &'a str,
}

/// Process-wide command state, shared by every chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandState {
    pub active_model: String,
    pub system_prompt: String,
    pub sleeping: bool,
    pub model_cache: Vec<String>,
}

pub struct CommandProcessor {
    bot_name: String,
    admin_id: String,
    state: CommandState,
    llm: Arc<dyn LlmBackend>,
    memory: Arc<Mutex<ConversationMemory>>,
    query_timeout: Duration,
}

/// Strip an ASCII `prefix` case-insensitively, keeping the rest verbatim.
fn strip_prefix_ci<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        text.get(prefix.len()..)
    } else {
        None
    }
}

/// Last `/`-separated segment of a model id.
pub fn short_model_name(model: &str) -> &str {
    model.rsplit('/').next().unwrap_or(model)
}

impl CommandProcessor {
    pub fn new(
        config: &Config,
        llm: Arc<dyn LlmBackend>,
        memory: Arc<Mutex<ConversationMemory>>,
    ) -> Self {
        Self {
            bot_name: config.bot_name.clone(),
            admin_id: config.admin_id.clone(),
            state: CommandState {
                active_model: config.llm.default_model.clone(),
                system_prompt: config.llm.system_prompt.clone(),
                sleeping: false,
                model_cache: Vec::new(),
            },
            llm,
            memory,
            query_timeout: config.llm.query_timeout(),
        }
    }

    pub fn state(&self) -> &CommandState {
        &self.state
    }

    fn is_admin(&self, caller: &Caller<'_>) -> bool {
        !self.admin_id.is_empty() && caller.admin_subject.contains(&self.admin_id)
    }

    pub async fn process(&mut self, caller: Caller<'_>, text: &str) -> Reply {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Reply::Silent;
        }
        info!("[Parser] Processing from {}: \"{}\"", caller.admin_subject, trimmed);
        let cmd = trimmed.to_lowercase();

        if self.state.sleeping {
            match cmd.as_str() {
                "/wakeup" => {
                    self.state.sleeping = false;
                    return Reply::Text(format!("{} is now awake and ready to assist.", self.bot_name));
                }
                "/restart" => return self.restart(&caller),
                "/help" => {}
                _ => return Reply::Silent,
            }
        }

        match cmd.as_str() {
            "/sleep" => {
                self.state.sleeping = true;
                return Reply::Text(format!(
                    "{} is going to sleep. Send /wakeup to resume.",
                    self.bot_name
                ));
            }
            "/restart" => return self.restart(&caller),
            "/help" => return Reply::Text(self.help_text()),
            "/models" => return self.list_models().await,
            "/systemprompt" => {
                return Reply::Text(format!(
                    "Current system prompt:\n{}",
                    self.state.system_prompt
                ));
            }
            _ => {}
        }

        if let Some(token) = strip_prefix_ci(trimmed, "/model/") {
            return self.select_model(token.trim()).await;
        }

        if let Some(prompt) = strip_prefix_ci(trimmed, "/systemprompt/") {
            let prompt = prompt.trim();
            if prompt.is_empty() {
                return Reply::Text(
                    "Please provide a valid system prompt. Example: /systemprompt/You are a pirate"
                        .to_string(),
                );
            }
            self.state.system_prompt = prompt.to_string();
            info!("[Parser] System prompt updated");
            return Reply::Text("System prompt updated successfully.".to_string());
        }

        self.query(&caller, trimmed).await
    }

    fn restart(&self, caller: &Caller<'_>) -> Reply {
        if self.is_admin(caller) {
            Reply::Restart
        } else {
            warn!("[Parser] Restart denied for {}", caller.admin_subject);
            Reply::Text("Sorry, only the operator is allowed to restart me! 🔒".to_string())
        }
    }

    fn help_text(&self) -> String {
        format!(
            "🛠️ *{} Commands:*\n\
             /models - List available free LLMs\n\
             /model/[number] - Switch LLM by number from list\n\
             /systemprompt - Show the current system prompt\n\
             /systemprompt/[prompt] - Change the AI's behavior\n\
             /sleep - Put the AI into sleep mode (ignores messages)\n\
             /wakeup - Wake up the AI from sleep mode\n\
             /restart - Restart the AI services\n\
             /help - Show this help message",
            self.bot_name
        )
    }

    /// Bounded by the query timeout; the router is blocked while this runs.
    async fn refresh_models(&mut self) -> Result<(), String> {
        match tokio::time::timeout(self.query_timeout, self.llm.free_models()).await {
            Ok(Ok(models)) => {
                self.state.model_cache = models;
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("[Parser] Model list fetch failed: {}", e);
                Err(e.to_string())
            }
            Err(_) => {
                warn!("[Parser] Model list fetch timed out after {:?}", self.query_timeout);
                Err(format!("timed out after {}s", self.query_timeout.as_secs()))
            }
        }
    }

    async fn list_models(&mut self) -> Reply {
        if let Err(e) = self.refresh_models().await {
            return Reply::Text(format!("⚠️ Could not fetch the model list. ({})", e));
        }
        let numbered = self
            .state
            .model_cache
            .iter()
            .enumerate()
            .map(|(i, m)| format!("{}. {}", i + 1, m))
            .collect::<Vec<_>>()
            .join("\n");
        Reply::Text(format!(
            "*Available Free LLMs:*\n{}\n\nUse /model/[number] to switch\nCurrent: {}",
            numbered, self.state.active_model
        ))
    }

    async fn select_model(&mut self, requested: &str) -> Reply {
        if self.state.model_cache.is_empty()
            && let Err(e) = self.refresh_models().await
        {
            return Reply::Text(format!("⚠️ Could not fetch the model list. ({})", e));
        }

        let by_position = requested
            .parse::<usize>()
            .ok()
            .filter(|n| (1..=self.state.model_cache.len()).contains(n))
            .map(|n| self.state.model_cache[n - 1].clone());

        let needle = requested.to_lowercase();
        let chosen = by_position.or_else(|| {
            if needle.is_empty() {
                return None;
            }
            self.state
                .model_cache
                .iter()
                .find(|m| m.to_lowercase().contains(&needle))
                .cloned()
        });

        match chosen {
            Some(model) => {
                info!("[Parser] Switching model to {}", model);
                self.state.active_model = model;
                Reply::Text(format!("✅ Switched to model: {}", self.state.active_model))
            }
            None => Reply::Text(format!(
                "❌ No model matching \"{}\". Use /models to see the numbered list.",
                requested
            )),
        }
    }

    async fn query(&mut self, caller: &Caller<'_>, text: &str) -> Reply {
        let model = self.state.active_model.clone();
        let history = self.memory.lock().await.history(caller.memory_key);

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::new("system", self.state.system_prompt.clone()));
        messages.extend(history);
        messages.push(ChatMessage::new("user", text));

        match tokio::time::timeout(self.query_timeout, self.llm.complete(&model, &messages)).await
        {
            Err(_) => {
                warn!("[Parser] {} timed out after {:?}", model, self.query_timeout);
                Reply::Text(format!(
                    "⏳ {} took too long to respond. Please try again or switch models with /models.",
                    short_model_name(&model)
                ))
            }
            Ok(Err(e)) => Reply::Text(format!("⚠️ Error: Could not reach AI backend. ({})", e)),
            Ok(Ok(completion)) => {
                {
                    let mut memory = self.memory.lock().await;
                    memory.add_message(caller.memory_key, Role::User, text);
                    memory.add_message(caller.memory_key, Role::Assistant, &completion.text);
                }
                let secs = completion.elapsed.as_secs_f64().round() as u64;
                Reply::Text(format!(
                    "{}\n\n{} | {}s | {}",
                    completion.text,
                    short_model_name(&model),
                    secs,
                    chrono::Local::now().format("%H:%M")
                ))
            }
        }
    }
}
