//! # Agent Module
//!
//! The runner that drives the stage graph. It exposes two modes over the
//! same single-step executor:
//! - [`ResearchAgent::run`]: execute to completion, return the final state
//! - [`ResearchAgent::steps`] / [`ResearchAgent::stream`]: a lazy stream
//!   yielding one item per stage execution
//!
//! Because both modes go through [`Execution::advance`], capability port
//! calls happen in the same order either way.

use std::sync::Arc;

use futures::stream::{self, Stream};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use crate::config::Config;
use crate::llm::{MockCompletion, RigCompletion, TextCompletion};
use crate::stages::{self, Stage};
use crate::state::{ResearchState, StateUpdate};
use crate::tools::{MockSearch, TavilySearch, WebSearch};

// =============================================================================
// CAPABILITIES
// =============================================================================
/// The capability ports handed to the runner.
///
/// # Rust Concept: Trait Objects behind Arc
///
/// `Arc<dyn Trait>` lets live and mock providers be swapped at runtime and
/// shared cheaply between concurrent sessions.
#[derive(Clone)]
pub struct Capabilities {
    pub completion: Arc<dyn TextCompletion>,
    pub search: Arc<dyn WebSearch>,

    /// Results requested per search
    pub max_results: usize,

    /// Whether a live provider backs each port
    pub live_completion: bool,
    pub live_search: bool,
}

impl Capabilities {
    pub fn new(
        completion: Arc<dyn TextCompletion>,
        search: Arc<dyn WebSearch>,
        max_results: usize,
    ) -> Self {
        Self {
            completion,
            search,
            max_results,
            live_completion: false,
            live_search: false,
        }
    }

    /// Offline ports only
    pub fn mock() -> Self {
        Self::new(Arc::new(MockCompletion::new()), Arc::new(MockSearch::new()), 3)
    }

    /// Pick a live port for every capability whose key is configured.
    pub fn from_config(config: &Config) -> Self {
        let completion: Arc<dyn TextCompletion> = match &config.openai_api_key {
            Some(key) => Arc::new(
                RigCompletion::new(key.clone(), config.model.clone())
                    .with_temperature(config.temperature)
                    .with_timeout(config.provider_timeout),
            ),
            None => Arc::new(MockCompletion::new()),
        };

        let search: Arc<dyn WebSearch> = match &config.tavily_api_key {
            Some(key) => Arc::new(TavilySearch::new(key.clone()).with_timeout(config.provider_timeout)),
            None => Arc::new(MockSearch::new()),
        };

        info!(
            completion = completion.name(),
            search = search.name(),
            "Capability ports selected"
        );

        Self {
            live_completion: config.live_completion(),
            live_search: config.live_search(),
            ..Self::new(completion, search, config.max_search_results)
        }
    }
}

// =============================================================================
// STREAM ITEMS
// =============================================================================
/// One stage execution and the partial state it produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageStep {
    pub stage: Stage,
    pub update: StateUpdate,
}

impl StageStep {
    /// Wire form: `{"<stage>": <partial state>}`
    pub fn to_message(&self) -> Value {
        json!({ self.stage.as_str(): self.update })
    }
}

/// Items of [`ResearchAgent::stream`]: every stage, then exactly one final.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Stage(StageStep),
    Final(ResearchState),
}

impl StreamEvent {
    /// Wire form of the event.
    ///
    /// The final event carries the report when one was composed, the whole
    /// state otherwise.
    pub fn to_message(&self) -> Value {
        match self {
            StreamEvent::Stage(step) => step.to_message(),
            StreamEvent::Final(state) => json!({ "final": RunOutcome::from(state.clone()) }),
        }
    }
}

/// What a completed run hands back to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RunOutcome {
    Report(String),
    State(ResearchState),
}

impl From<ResearchState> for RunOutcome {
    fn from(state: ResearchState) -> Self {
        match state.report() {
            Some(report) => RunOutcome::Report(report.to_string()),
            None => RunOutcome::State(state),
        }
    }
}

// =============================================================================
// EXECUTION
// =============================================================================
/// A single walk through the graph.
///
/// Owns the state for one invocation; `next` is the stage to run on the
/// following call to [`advance`](Self::advance).
pub struct Execution {
    caps: Capabilities,
    state: ResearchState,
    next: Option<Stage>,
}

impl Execution {
    pub fn new(caps: Capabilities, topic: impl Into<String>) -> Self {
        Self {
            caps,
            state: ResearchState::new(topic),
            next: Some(Stage::Plan),
        }
    }

    /// Run the pending stage, merge its update and follow the outgoing edge.
    /// Returns `None` once the graph has finished.
    pub async fn advance(&mut self) -> Option<StageStep> {
        let stage = self.next?;

        let update = match stage {
            Stage::Plan => stages::plan(&self.state, self.caps.completion.as_ref()).await,
            Stage::Research => {
                stages::research(&self.state, self.caps.search.as_ref(), self.caps.max_results).await
            }
            Stage::Compose => stages::compose(&self.state, self.caps.completion.as_ref()).await,
        };

        self.state.apply(update.clone());
        self.next = stage.next(&self.state);

        Some(StageStep { stage, update })
    }

    pub fn state(&self) -> &ResearchState {
        &self.state
    }

    pub fn is_finished(&self) -> bool {
        self.next.is_none()
    }

    pub fn into_state(self) -> ResearchState {
        self.state
    }
}

// =============================================================================
// RESEARCH AGENT
// =============================================================================
/// The research pipeline runner.
///
/// Cheap to clone: it only holds the shared capability ports.
#[derive(Clone)]
pub struct ResearchAgent {
    caps: Capabilities,
}

impl ResearchAgent {
    pub fn new(caps: Capabilities) -> Self {
        Self { caps }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    /// Run the whole graph and return the final state.
    pub async fn run(&self, topic: &str) -> ResearchState {
        info!(topic = %topic, "Starting research run");

        let mut execution = Execution::new(self.caps.clone(), topic);
        while let Some(step) = execution.advance().await {
            info!(stage = %step.stage, "Stage complete");
        }

        execution.into_state()
    }

    /// Lazy, finite sequence of stage executions:
    /// `plan, research × N, compose`.
    ///
    /// Nothing runs until the stream is polled, and each stage runs only
    /// when the next item is requested.
    pub fn steps(&self, topic: &str) -> impl Stream<Item = StageStep> + Send + 'static {
        let execution = Execution::new(self.caps.clone(), topic);

        stream::unfold(execution, |mut execution| async move {
            let step = execution.advance().await?;
            Some((step, execution))
        })
    }

    /// [`steps`](Self::steps) followed by one [`StreamEvent::Final`]
    /// carrying the final state.
    pub fn stream(&self, topic: &str) -> impl Stream<Item = StreamEvent> + Send + 'static {
        let execution = Execution::new(self.caps.clone(), topic);

        stream::unfold(Some(execution), |slot| async move {
            let mut execution = slot?;
            match execution.advance().await {
                Some(step) => Some((StreamEvent::Stage(step), Some(execution))),
                None => Some((StreamEvent::Final(execution.into_state()), None)),
            }
        })
    }
}
