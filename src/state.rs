//! Research state threaded through the pipeline
//!
//! One [`ResearchState`] lives for exactly one invocation. Stages never
//! mutate it directly; they return a typed [`StateUpdate`] that the runner
//! merges with [`ResearchState::apply`].

use serde::{Deserialize, Serialize};

/// Who authored a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    Human,
    Assistant,
}

/// A single role-tagged text turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn human(content: impl Into<String>) -> Self {
        Self { role: Role::Human, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// The mutable record threaded through plan → research → compose
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchState {
    /// Append-only; element 0 is the topic as a human turn
    pub messages: Vec<Message>,

    /// Set once by the planning stage
    pub research_plan: Vec<String>,

    /// One `Goal: ...\nResult: ...` entry per research step
    pub collected_data: Vec<String>,

    pub steps_taken: usize,
}

impl ResearchState {
    /// Fresh state for a topic
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::human(topic)],
            research_plan: Vec::new(),
            collected_data: Vec::new(),
            steps_taken: 0,
        }
    }

    /// The original topic.
    pub fn topic(&self) -> &str {
        self.messages.first().map(|m| m.content.as_str()).unwrap_or_default()
    }

    /// Content of the composed report, once the compose stage has run.
    pub fn report(&self) -> Option<&str> {
        self.messages
            .iter()
            .skip(1)
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }

    /// Merge a stage's partial update into the state.
    pub fn apply(&mut self, update: StateUpdate) {
        match update {
            StateUpdate::Plan { research_plan, steps_taken } => {
                self.research_plan = research_plan;
                self.steps_taken = steps_taken;
            }
            StateUpdate::Research { collected_data, steps_taken } => {
                self.collected_data.extend(collected_data);
                self.steps_taken = steps_taken;
            }
            StateUpdate::Compose { messages } => {
                self.messages.extend(messages);
            }
        }
    }
}

/// Partial state produced by one stage execution.
///
/// Serialized untagged, so on the wire an update looks like the subset of
/// [`ResearchState`] fields the stage touched, e.g.
/// `{"research_plan": [...], "steps_taken": 0}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateUpdate {
    /// Replaces the plan and resets the counter
    Plan {
        research_plan: Vec<String>,
        steps_taken: usize,
    },
    /// Appends collected entries and advances the counter
    Research {
        collected_data: Vec<String>,
        steps_taken: usize,
    },
    /// Appends turns
    Compose { messages: Vec<Message> },
}
