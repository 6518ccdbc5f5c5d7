//! # LLM Stratum
//!
//! The only place the model writes code: slot bodies inside service
//! skeletons, plus the free-form README. Every emission goes through slot
//! validation; a rejected emission gets one retry with a reminder prompt
//! and then falls back to the deterministic guarded body. Prompts are
//! prepended with up to `max_patterns_per_prompt` high-severity
//! anti-patterns from the learning store, which is how Run N's failures
//! become Run N+1's warnings.

use super::slots::{self, SlotConstraints};
use crate::icbr::FlowBehavior;
use crate::ir::ApplicationIr;
use crate::learning::LearningStore;
use crate::llm::{LlmClient, LlmRequest};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const SLOT_SYSTEM_PROMPT: &str = "\
You write Python method bodies for a FastAPI/SQLAlchemy service. Respond \
with the body statements only: no def line, no imports, no class \
definitions, no markdown fences. The body must end with a return or raise \
statement and must use only `self.session` for persistence.";

/// Result of one slot fill, with its manifest accounting.
#[derive(Debug, Clone)]
pub struct SlotFill {
    pub body: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub model: Option<String>,
    /// True when the emission fell back to the guarded empty body
    pub fallback: bool,
}

/// Slot-restricted emission driver.
pub struct LlmStratum {
    llm: Arc<dyn LlmClient>,
    deadline: Duration,
}

impl LlmStratum {
    pub fn new(llm: Arc<dyn LlmClient>, deadline: Duration) -> Self {
        LlmStratum { llm, deadline }
    }

    /// Collect the prompt warning blocks for a flow from the learning
    /// store.
    pub fn pattern_warnings(
        store: Option<&LearningStore>,
        ir: &ApplicationIr,
        flow_name: &str,
        min_occurrences: u64,
        limit: usize,
        strict_mode: bool,
    ) -> Vec<String> {
        let Some(store) = store else {
            return Vec::new();
        };
        store
            .patterns_for_flow(flow_name, min_occurrences, limit)
            .into_iter()
            // Under strict_mode, patterns that reference endpoints the
            // (unenriched) API model does not declare are filtered out.
            .filter(|p| {
                !strict_mode || ir.api.declares_path(&p.endpoint_pattern)
            })
            .map(|p| p.prompt_block())
            .collect()
    }

    fn slot_prompt(behavior: &FlowBehavior, warnings: &[String], reminder: Option<&str>) -> String {
        let mut prompt = String::new();
        for warning in warnings {
            prompt.push_str(warning);
            prompt.push_str("\n\n");
        }
        prompt.push_str(&format!(
            "Implement the body of `{flow}(self, subject_id)`.\n",
            flow = behavior.flow
        ));
        if !behavior.preconditions.is_empty() {
            prompt.push_str("Preconditions:\n");
            for p in &behavior.preconditions {
                prompt.push_str(&format!("- {}\n", p.source));
            }
        }
        if !behavior.postconditions.is_empty() {
            prompt.push_str("Postconditions:\n");
            for p in &behavior.postconditions {
                prompt.push_str(&format!("- {}\n", p.source));
            }
        }
        if !behavior.invariants.is_empty() {
            prompt.push_str("Invariants:\n");
            for p in &behavior.invariants {
                prompt.push_str(&format!("- {}\n", p.source));
            }
        }
        if !behavior.operations.is_empty() {
            prompt.push_str(&format!(
                "Atomic operations: {}\n",
                serde_json::to_string(&behavior.operations).unwrap_or_default()
            ));
        }
        if let Some(reminder) = reminder {
            prompt.push_str(&format!("\nREMINDER: {reminder}\n"));
        }
        prompt
    }

    /// Fill one slot. The emission is validated against the slot's typed
    /// constraints; one retry with a reminder, then the guarded fallback.
    pub async fn fill_slot(
        &self,
        slot: &slots::Slot,
        behavior: &FlowBehavior,
        warnings: &[String],
        constraints: &SlotConstraints,
    ) -> SlotFill {
        let mut tokens_in = 0u32;
        let mut tokens_out = 0u32;
        let mut model = None;

        for attempt in 0..2 {
            let reminder = (attempt > 0).then_some(
                "your previous body violated the slot constraints; emit only plain \
                 statements ending with a return",
            );
            let mut request = LlmRequest::new(
                SLOT_SYSTEM_PROMPT,
                Self::slot_prompt(behavior, warnings, reminder),
            );
            request.deadline = self.deadline;

            match self.llm.complete(request).await {
                Ok(response) => {
                    tokens_in += response.tokens_in;
                    tokens_out += response.tokens_out;
                    model = Some(response.model.clone());
                    let body = strip_fences(&response.text);
                    match slots::validate_body(slot, &body, constraints) {
                        Ok(()) => {
                            return SlotFill {
                                body,
                                tokens_in,
                                tokens_out,
                                model,
                                fallback: false,
                            }
                        }
                        Err(violation) => {
                            warn!(slot = %slot.name, error = %violation, "slot emission rejected");
                        }
                    }
                }
                Err(e) => {
                    warn!(slot = %slot.name, error = %e, "LLM slot call failed");
                }
            }
        }

        debug!(slot = %slot.name, "falling back to guarded empty body");
        SlotFill {
            body: slots::guarded_empty_body(),
            tokens_in,
            tokens_out,
            model,
            fallback: true,
        }
    }

    /// Free-form README. Falls back to a deterministic stub on failure.
    pub async fn readme(&self, ir: &ApplicationIr) -> SlotFill {
        let endpoints: Vec<String> = ir
            .api
            .endpoints
            .iter()
            .map(|e| format!("- {} {}", e.method, e.path))
            .collect();
        let mut request = LlmRequest::new(
            "You write concise project READMEs in Markdown.",
            format!(
                "Write a README for the {} service. Endpoints:\n{}",
                ir.app_name,
                endpoints.join("\n")
            ),
        );
        request.deadline = self.deadline;

        match self.llm.complete(request).await {
            Ok(response) => SlotFill {
                body: response.text,
                tokens_in: response.tokens_in,
                tokens_out: response.tokens_out,
                model: Some(response.model),
                fallback: false,
            },
            Err(e) => {
                warn!(error = %e, "README generation failed, using stub");
                SlotFill {
                    body: deterministic_readme(ir),
                    tokens_in: 0,
                    tokens_out: 0,
                    model: None,
                    fallback: true,
                }
            }
        }
    }
}

/// The README used by SAFE mode and by fallback.
pub fn deterministic_readme(ir: &ApplicationIr) -> String {
    let mut out = format!("# {}\n\nGenerated service.\n\n## Endpoints\n\n", ir.app_name);
    for ep in &ir.api.endpoints {
        out.push_str(&format!("- `{} {}`\n", ep.method, ep.path));
    }
    out.push_str("\n## Running\n\n```bash\ndocker compose up --build\n```\n");
    out
}

fn strip_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let rest = rest.strip_prefix("python").unwrap_or(rest);
    let rest = rest.trim_start_matches(['\r', '\n']);
    rest.strip_suffix("```").map_or(rest, str::trim_end).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    fn behavior() -> FlowBehavior {
        FlowBehavior {
            flow: "pay_order".to_string(),
            guards: vec![],
            preconditions: vec![],
            postconditions: vec![],
            invariants: vec![],
            operations: vec![],
            transitions: vec![],
            mutating: false,
        }
    }

    fn slot() -> slots::Slot {
        slots::Slot {
            name: "pay_order".to_string(),
            start_line: 0,
            end_line: 1,
            indent: "        ".to_string(),
        }
    }

    #[tokio::test]
    async fn test_valid_emission_accepted() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            "order = self.session.get(Order, subject_id)\nreturn order".to_string(),
        ]));
        let stratum = LlmStratum::new(llm, Duration::from_secs(5));
        let fill = stratum
            .fill_slot(&slot(), &behavior(), &[], &SlotConstraints::default())
            .await;
        assert!(!fill.fallback);
        assert!(fill.body.ends_with("return order"));
    }

    #[tokio::test]
    async fn test_two_rejections_fall_back_to_guarded_body() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            "import os\nreturn None".to_string(),
            "x = 1".to_string(),
        ]));
        let stratum = LlmStratum::new(llm, Duration::from_secs(5));
        let fill = stratum
            .fill_slot(&slot(), &behavior(), &[], &SlotConstraints::default())
            .await;
        assert!(fill.fallback);
        assert!(fill.body.contains("return None"));
    }

    #[tokio::test]
    async fn test_retry_carries_reminder() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            "x = 1".to_string(),
            "return None".to_string(),
        ]));
        let stratum = LlmStratum::new(Arc::clone(&llm) as Arc<dyn crate::llm::LlmClient>, Duration::from_secs(5));
        let fill = stratum
            .fill_slot(&slot(), &behavior(), &[], &SlotConstraints::default())
            .await;
        assert!(!fill.fallback);
        let prompts = llm.seen_prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("REMINDER"));
    }
}
