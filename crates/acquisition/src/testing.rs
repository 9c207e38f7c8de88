//! In-memory generators and fixtures shared by the unit tests.

use async_trait::async_trait;
use omni_core::{Error, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::gateway::{AttemptFailure, AttemptObserver, TextGenerator};

pub const GREET_PLAN_JSON: &str = r#"{
  "CapabilityPurpose": "To allow omni to greet a user.",
  "ProposedFunctions/Classes": [
    {
      "name": "greet_user",
      "role": "Constructs a greeting message.",
      "parameters": [{"name": "user_name", "type": "str"}],
      "returns": {"type": "str"}
    }
  ],
  "CLIIntegration": {
    "command": "omni greet <name>",
    "arguments": [{"name": "name", "description": "The name of the user to greet."}]
  },
  "ModificationsToOmniPy": [
    "Add 'greet' subparser to main ArgumentParser.",
    "Update command dispatcher to call a new 'handle_greet_command' function."
  ],
  "RequiredLibraries": [],
  "BasicErrorHandling": ["Handle missing name argument."],
  "StorageConsiderations": [],
  "SecurityConsiderations": [],
  "TestingSuggestions": ["Test with name, without name."]
}"#;

pub const GREET_CODE: &str = "```rhai\nfn greet_user(user_name) {\n    `Hello, ${user_name}!`\n}\n```";

pub const GREET_SCENARIOS: &str = r#"[{"function": "greet_user", "args": ["Ann"], "expected": "Hello, Ann!"}]"#;

/// Returns queued responses in order; errors once the queue is empty.
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Provider("script exhausted".to_string()))
    }
}

/// Answers based on the prompt: plan prompts get the greet plan, code prompts
/// get `code`, scenario prompts get the greet scenarios.
pub struct PromptRouter {
    pub plan: String,
    pub code: String,
    pub scenarios: String,
    pub delay: Option<Duration>,
    calls: AtomicUsize,
}

impl PromptRouter {
    pub fn greet() -> Self {
        Self {
            plan: GREET_PLAN_JSON.to_string(),
            code: GREET_CODE.to_string(),
            scenarios: GREET_SCENARIOS.to_string(),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.code = code.to_string();
        self
    }

    pub fn with_scenarios(mut self, scenarios: &str) -> Self {
        self.scenarios = scenarios.to_string();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextGenerator for PromptRouter {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if prompt.contains("test scenarios") {
            Ok(self.scenarios.clone())
        } else if prompt.contains("Rhai function") {
            Ok(self.code.clone())
        } else {
            Ok(self.plan.clone())
        }
    }
}

pub struct FailingGenerator;

#[async_trait]
impl TextGenerator for FailingGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String> {
        Err(Error::Provider("connection refused".to_string()))
    }
}

pub struct SlowGenerator {
    delay: Duration,
    response: String,
}

impl SlowGenerator {
    pub fn new(delay: Duration, response: &str) -> Self {
        Self {
            delay,
            response: response.to_string(),
        }
    }
}

#[async_trait]
impl TextGenerator for SlowGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String> {
        tokio::time::sleep(self.delay).await;
        Ok(self.response.clone())
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    failures: Mutex<Vec<AttemptFailure>>,
}

impl RecordingObserver {
    pub fn failures(&self) -> Vec<AttemptFailure> {
        self.failures.lock().unwrap().clone()
    }
}

impl AttemptObserver for RecordingObserver {
    fn attempt_failed(&self, failure: &AttemptFailure) -> Result<()> {
        self.failures.lock().unwrap().push(failure.clone());
        Ok(())
    }
}
