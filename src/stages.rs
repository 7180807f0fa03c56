//! Stage functions of the research graph
//!
//! ```text
//!   PLAN ──▶ RESEARCH ──route──▶ COMPOSE
//!               ▲          │
//!               └──────────┘  (steps_taken < plan length)
//! ```
//!
//! Each stage reads the state and returns a [`StateUpdate`]; none of them
//! mutate the state or fail. The loop bound is the plan length, fixed before
//! the first research step.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::llm::TextCompletion;
use crate::state::{Message, ResearchState, StateUpdate};
use crate::tools::WebSearch;

/// Number of goals the planner asks for, and the size of the fallback plan
pub const PLAN_SIZE: usize = 3;

/// Entry recorded when the research stage runs without a plan
pub const NO_PLAN: &str = "[no plan]";

/// Separator between collected entries in the writer's context
const CONTEXT_SEPARATOR: &str = "\n---\n";

const PLANNER_PREAMBLE: &str = "You are a Technical Researcher.";

/// A node of the research graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Plan,
    Research,
    Compose,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Plan => "plan",
            Stage::Research => "research",
            Stage::Compose => "compose",
        }
    }

    /// Outgoing edge, evaluated against the state after this stage ran.
    /// `None` means the graph has finished.
    pub fn next(&self, state: &ResearchState) -> Option<Stage> {
        match self {
            Stage::Plan => Some(Stage::Research),
            Stage::Research => Some(route(state)),
            Stage::Compose => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// PLAN
// =============================================================================
/// Ask the model for [`PLAN_SIZE`] research goals and parse them.
pub async fn plan(state: &ResearchState, llm: &dyn TextCompletion) -> StateUpdate {
    let topic = state.topic();
    let prompt = format!(
        "Break this into {} specific research goals: {}. Output only a numbered list.",
        PLAN_SIZE, topic
    );

    let response = llm
        .complete(&[Message::system(PLANNER_PREAMBLE), Message::human(prompt)])
        .await;

    let mut goals = parse_plan(&response);
    if goals.is_empty() {
        warn!(topic = %topic, "Planner output had no numbered goals, using fallback plan");
        goals = fallback_plan(topic);
    }

    info!(topic = %topic, goals = goals.len(), "Research plan ready");

    StateUpdate::Plan {
        research_plan: goals,
        steps_taken: 0,
    }
}

/// Extract numbered goals from model output.
///
/// A goal is a line made of optional blanks, one or more ASCII digits, a
/// period, optional blanks and the goal text. Text is trimmed, empty goals
/// are skipped, and at most [`PLAN_SIZE`] goals are kept in order.
pub fn parse_plan(text: &str) -> Vec<String> {
    static LINE: OnceLock<Regex> = OnceLock::new();
    let line = LINE.get_or_init(|| {
        Regex::new(r"(?m)^[ \t]*[0-9]+\.[ \t]*(.*)$").expect("plan line pattern is valid")
    });

    line.captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|goal| !goal.is_empty())
        .take(PLAN_SIZE)
        .map(str::to_string)
        .collect()
}

/// Deterministic plan used when nothing could be parsed.
pub fn fallback_plan(topic: &str) -> Vec<String> {
    (1..=PLAN_SIZE)
        .map(|i| format!("Investigate: {} - part {}", topic, i))
        .collect()
}

// =============================================================================
// RESEARCH
// =============================================================================
/// Search for the goal at `steps_taken` and append one collected entry.
pub async fn research(
    state: &ResearchState,
    search: &dyn WebSearch,
    max_results: usize,
) -> StateUpdate {
    let idx = state.steps_taken;

    if state.research_plan.is_empty() {
        warn!(step = idx, "Research stage reached with an empty plan");
        return StateUpdate::Research {
            collected_data: vec![NO_PLAN.to_string()],
            steps_taken: idx + 1,
        };
    }

    let task = &state.research_plan[idx % state.research_plan.len()];
    debug!(step = idx, task = %task, "Researching goal");

    let results = search.search(task, max_results).await;

    StateUpdate::Research {
        collected_data: vec![format!("Goal: {}\nResult: {}", task, results)],
        steps_taken: idx + 1,
    }
}

/// Loop while goals remain, then hand over to the writer.
pub fn route(state: &ResearchState) -> Stage {
    if state.steps_taken < state.research_plan.len() {
        Stage::Research
    } else {
        Stage::Compose
    }
}

// =============================================================================
// COMPOSE
// =============================================================================
/// Ask the model for the report and append it as an assistant turn.
pub async fn compose(state: &ResearchState, llm: &dyn TextCompletion) -> StateUpdate {
    let context = state.collected_data.join(CONTEXT_SEPARATOR);
    let prompt = format!(
        "Write a deep technical report based on: {} for: {}",
        context,
        state.topic()
    );

    let report = llm.complete(&[Message::human(prompt)]).await;
    info!(report_len = report.len(), "Report composed");

    StateUpdate::Compose {
        messages: vec![Message::assistant(report)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockCompletion;
    use crate::tools::MockSearch;
    use async_trait::async_trait;

    /// Completion that always answers with the same text
    struct Canned(&'static str);

    #[async_trait]
    impl TextCompletion for Canned {
        async fn complete(&self, _turns: &[Message]) -> String {
            self.0.to_string()
        }

        fn name(&self) -> &str {
            "canned"
        }
    }

    fn planned(goals: &[&str]) -> ResearchState {
        let mut state = ResearchState::new("X");
        state.apply(StateUpdate::Plan {
            research_plan: goals.iter().map(|g| g.to_string()).collect(),
            steps_taken: 0,
        });
        state
    }

    #[test]
    fn test_parse_plan_numbered_list() {
        let text = "Here you go:\n1. Memory model\n2.   Scheduler design \n3.Async IO\n4. Extra";
        assert_eq!(parse_plan(text), vec!["Memory model", "Scheduler design", "Async IO"]);
    }

    #[test]
    fn test_parse_plan_requires_leading_number() {
        assert!(parse_plan("Step 1. not a goal\nsee item 2. too").is_empty());
        assert_eq!(parse_plan("  10. indented goal\r\n"), vec!["indented goal"]);
    }

    #[test]
    fn test_parse_plan_skips_empty_goals() {
        assert_eq!(parse_plan("1.\n2. real goal\n3.   "), vec!["real goal"]);
    }

    #[test]
    fn test_fallback_plan() {
        assert_eq!(
            fallback_plan("X"),
            vec![
                "Investigate: X - part 1",
                "Investigate: X - part 2",
                "Investigate: X - part 3"
            ]
        );
    }

    #[tokio::test]
    async fn test_plan_falls_back_on_unparsable_output() {
        let update = plan(&ResearchState::new("X"), &MockCompletion::new()).await;

        assert_eq!(
            update,
            StateUpdate::Plan {
                research_plan: fallback_plan("X"),
                steps_taken: 0
            }
        );
    }

    #[tokio::test]
    async fn test_plan_parses_model_list() {
        let llm = Canned("1. First\n2. Second\n3. Third\n4. Fourth");
        let update = plan(&ResearchState::new("X"), &llm).await;

        match update {
            StateUpdate::Plan { research_plan, steps_taken } => {
                assert_eq!(research_plan, vec!["First", "Second", "Third"]);
                assert_eq!(steps_taken, 0);
            }
            other => panic!("unexpected update: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_plan_always_yields_plan_size_goals() {
        for topic in ["", "X", "1. looks numbered", "multi\nline\ntopic"] {
            let update = plan(&ResearchState::new(topic), &MockCompletion::new()).await;
            let StateUpdate::Plan { research_plan, .. } = update else {
                panic!("plan must return a plan update");
            };
            assert_eq!(research_plan.len(), PLAN_SIZE, "topic {:?}", topic);
            assert!(research_plan.iter().all(|g| !g.is_empty()));
        }
    }

    #[tokio::test]
    async fn test_research_appends_one_entry_per_step() {
        let mut state = planned(&["A", "B", "C"]);
        let search = MockSearch::new();

        for _ in 0..3 {
            let update = research(&state, &search, 3).await;
            state.apply(update);
            assert_eq!(state.collected_data.len(), state.steps_taken);
        }

        assert_eq!(state.steps_taken, 3);
        assert_eq!(state.collected_data[1], "Goal: B\nResult: [mock search results for 'B']");
        assert!(state.collected_data.iter().all(|e| e.starts_with("Goal: ")));
    }

    #[tokio::test]
    async fn test_research_without_plan_terminates() {
        let state = ResearchState::new("X");
        let update = research(&state, &MockSearch::new(), 3).await;

        assert_eq!(
            update,
            StateUpdate::Research {
                collected_data: vec![NO_PLAN.to_string()],
                steps_taken: 1
            }
        );

        let mut state = state;
        state.apply(update);
        assert_eq!(route(&state), Stage::Compose);
    }

    #[tokio::test]
    async fn test_research_wraps_index() {
        let mut state = planned(&["A", "B"]);
        state.steps_taken = 3;

        let update = research(&state, &MockSearch::new(), 3).await;
        let StateUpdate::Research { collected_data, steps_taken } = update else {
            panic!("research must return a research update");
        };
        assert!(collected_data[0].starts_with("Goal: B\n"));
        assert_eq!(steps_taken, 4);
    }

    #[test]
    fn test_route_over_all_counters() {
        let mut state = planned(&["A", "B", "C"]);
        for steps in 0..=3 {
            state.steps_taken = steps;
            let expected = if steps < 3 { Stage::Research } else { Stage::Compose };
            assert_eq!(route(&state), expected, "steps_taken = {}", steps);
        }
    }

    #[test]
    fn test_stage_edges() {
        let state = planned(&["A"]);
        assert_eq!(Stage::Plan.next(&state), Some(Stage::Research));
        assert_eq!(Stage::Research.next(&state), Some(Stage::Research));
        assert_eq!(Stage::Compose.next(&state), None);
    }

    #[tokio::test]
    async fn test_compose_joins_context() {
        let mut state = planned(&["A", "B"]);
        state.apply(StateUpdate::Research {
            collected_data: vec!["Goal: A\nResult: a".into(), "Goal: B\nResult: b".into()],
            steps_taken: 2,
        });

        let update = compose(&state, &MockCompletion::new()).await;
        let StateUpdate::Compose { messages } = update else {
            panic!("compose must return a compose update");
        };

        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].content,
            "[mock response] Processed: Write a deep technical report based on: \
             Goal: A\nResult: a\n---\nGoal: B\nResult: b for: X"
        );
    }
}
