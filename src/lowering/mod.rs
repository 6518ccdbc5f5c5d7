//! # Spec Lowering
//!
//! Turns a Markdown spec string into a validated `ApplicationIr` with
//! canonical identifiers. Natural-language understanding is delegated to the
//! LLM behind the `LlmClient` seam, but nothing the model says is trusted:
//! the completion must parse as IR JSON and pass `ApplicationIr::validate`
//! before acceptance. One bounded retry (with the validation error quoted
//! back) is allowed; a second failure is fatal. There is no partial IR.
//!
//! Specs that already parse as IR JSON skip the model entirely and go
//! straight through validation; the same gate applies either way.

pub mod cache;
pub mod normalize;

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::PipelineError;
use crate::ir::ApplicationIr;
use crate::ir::IR_SCHEMA_VERSION;
use crate::llm::{LlmClient, LlmRequest};
use cache::IrCache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Output contract given to the model. The schema is described by example
/// rather than by JSON Schema text; the validator is the real gate.
const LOWERING_SYSTEM_PROMPT: &str = "\
You translate application specifications into a strict JSON intermediate \
representation. Respond with a single JSON object and nothing else. The \
object has keys: app_name (PascalCase string), schema_version (integer), \
spec_digest (empty string), domain {entities: [{name, fields: [{name, \
semantic_type, nullable, default, sql_default, constraints: [{kind, \
value}], foreign_key, enum_values}]}]}, api {endpoints: [...], schemas: \
[...]}, behavior {flows: [...]}, validation {rules: [...]}, infrastructure \
{database, runtime, ports, health_path, metrics_path}. Use snake_case for \
field and flow names, PascalCase for entity names, English verbs \
(create/update/delete/list/get/process/cancel/pay). Paths use {id} \
placeholders. Omit nothing you can infer from the text; invent nothing it \
does not state.";

/// Spec → IR front-end. Checks the cache, falls back to the model, and
/// always validates before returning.
pub struct SpecLowering {
    llm: Arc<dyn LlmClient>,
    cache: Arc<IrCache>,
    llm_deadline: Duration,
}

impl SpecLowering {
    pub fn new(llm: Arc<dyn LlmClient>, cache: Arc<IrCache>) -> Self {
        SpecLowering {
            llm,
            cache,
            llm_deadline: crate::llm::DEFAULT_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.llm_deadline = deadline;
        self
    }

    /// Lower a spec to a validated IR. Cache tiers are consulted first; a
    /// miss regenerates through the model.
    pub async fn lower(
        &self,
        spec: &str,
        config: &Config,
        cancel: &CancelToken,
    ) -> Result<ApplicationIr, PipelineError> {
        cancel.check().map_err(|_| PipelineError::Cancelled)?;

        let canonical = normalize::canonicalize_spec(spec);
        let digest = cache::spec_digest(&canonical);
        let key = IrCache::key(&canonical, &config.enrichment_fingerprint());

        if let Some(ir) = self.cache.get(&key)? {
            info!(digest = %digest, "IR cache hit");
            return Ok(ir);
        }

        let mut ir = if let Some(pre_lowered) = Self::try_parse_ir(&canonical) {
            debug!("spec is pre-lowered IR JSON; skipping the model");
            pre_lowered
        } else {
            self.lower_with_llm(&canonical, cancel).await?
        };

        normalize_ir(&mut ir);
        ir.schema_version = IR_SCHEMA_VERSION;
        ir.spec_digest = digest;
        ir.validate()?;

        if let Err(e) = self.cache.put(&key, &ir) {
            warn!(error = %e, "failed to store IR in cache");
        }
        Ok(ir)
    }

    async fn lower_with_llm(
        &self,
        canonical: &str,
        cancel: &CancelToken,
    ) -> Result<ApplicationIr, PipelineError> {
        cancel.check().map_err(|_| PipelineError::Cancelled)?;

        let mut request = LlmRequest::new(LOWERING_SYSTEM_PROMPT, canonical).with_max_tokens(8192);
        request.deadline = self.llm_deadline;
        let response = self.llm.complete(request).await?;

        match Self::parse_and_check(&response.text) {
            Ok(ir) => Ok(ir),
            Err(first_error) => {
                warn!(error = %first_error, "lowering output rejected, retrying once");
                cancel.check().map_err(|_| PipelineError::Cancelled)?;

                let retry_prompt = format!(
                    "{canonical}\n\nYour previous output was rejected: {first_error}. \
                     Return corrected JSON only.",
                );
                let mut retry =
                    LlmRequest::new(LOWERING_SYSTEM_PROMPT, retry_prompt).with_max_tokens(8192);
                retry.deadline = self.llm_deadline;
                let response = self.llm.complete(retry).await?;

                Self::parse_and_check(&response.text).map_err(|reason| {
                    PipelineError::LoweringFailed {
                        reason: format!("schema validation failed after retry: {reason}"),
                    }
                })
            }
        }
    }

    /// Parse model output into an IR and run it through the canonical
    /// normalizer and validator. Returns a description of the first failure.
    fn parse_and_check(text: &str) -> Result<ApplicationIr, String> {
        let stripped = strip_code_fences(text);
        let mut ir: ApplicationIr =
            serde_json::from_str(stripped).map_err(|e| format!("not valid IR JSON: {e}"))?;
        normalize_ir(&mut ir);
        ir.schema_version = IR_SCHEMA_VERSION;
        ir.validate().map_err(|e| e.to_string())?;
        Ok(ir)
    }

    /// Pre-lowered specs: the file already contains IR JSON.
    fn try_parse_ir(canonical: &str) -> Option<ApplicationIr> {
        if !canonical.trim_start().starts_with('{') {
            return None;
        }
        serde_json::from_str(canonical).ok()
    }
}

/// Apply the semantic normalizer across every identifier and constraint in
/// the IR. Identifier references (FKs, flow entities, endpoint entities) are
/// rewritten with the same rules so cross-references stay intact.
pub fn normalize_ir(ir: &mut ApplicationIr) {
    ir.app_name = normalize::to_pascal_case(&ir.app_name);

    for entity in &mut ir.domain.entities {
        entity.name = normalize::to_pascal_case(&entity.name);
        for field in &mut entity.fields {
            field.name = normalize::to_snake_case(&field.name);
            if let Some(fk) = &mut field.foreign_key {
                fk.entity = normalize::to_pascal_case(&fk.entity);
                fk.field = normalize::to_snake_case(&fk.field);
            }
            field.constraints = field
                .constraints
                .drain(..)
                .map(normalize::normalize_constraint)
                .collect();
        }
    }

    for ep in &mut ir.api.endpoints {
        ep.operation_id = normalize::normalize_operation(&ep.operation_id);
        ep.entity = normalize::to_pascal_case(&ep.entity);
    }

    for flow in &mut ir.behavior.flows {
        flow.name = normalize::normalize_operation(&flow.name);
        for opt in [
            &mut flow.source_entity,
            &mut flow.target_entity,
            &mut flow.creates_entity,
        ] {
            if let Some(name) = opt {
                *name = normalize::to_pascal_case(name);
            }
        }
        for step in &mut flow.steps {
            step.entity = normalize::to_pascal_case(&step.entity);
            if let Some(field) = &mut step.field {
                *field = normalize::to_snake_case(field);
            }
        }
        for tr in &mut flow.status_transitions {
            tr.entity = normalize::to_pascal_case(&tr.entity);
            tr.field = normalize::to_snake_case(&tr.field);
        }
    }

    for rule in &mut ir.validation.rules {
        rule.entity = normalize::to_pascal_case(&rule.entity);
        rule.field = normalize::to_snake_case(&rule.field);
        rule.constraint = normalize::normalize_constraint(rule.constraint.clone());
        rule.confidence = rule.confidence.clamp(0.0, 1.0);
    }
    let advisories = ir.validation.normalize();
    for advisory in advisories {
        debug!(advisory = %advisory, "constraint conflict resolved");
    }
}

/// Strip a leading/trailing markdown code fence, if the model added one.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start_matches(['\r', '\n']);
    rest.strip_suffix("```").map_or(rest, str::trim_end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    fn minimal_ir_json() -> String {
        serde_json::to_string(&ApplicationIr::new("Shop")).expect("serialize")
    }

    fn lowering_with(responses: Vec<String>) -> (SpecLowering, tempfile::TempDir) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cache = Arc::new(IrCache::new(tmp.path(), 3600));
        let llm = Arc::new(ScriptedLlmClient::new(responses));
        (SpecLowering::new(llm, cache), tmp)
    }

    #[tokio::test]
    async fn test_valid_output_accepted_first_try() {
        let (lowering, _tmp) = lowering_with(vec![minimal_ir_json()]);
        let ir = lowering
            .lower("Build a shop.", &Config::default(), &CancelToken::unbounded())
            .await
            .expect("lowering");
        assert_eq!(ir.app_name, "Shop");
        assert!(!ir.spec_digest.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_then_valid_uses_retry() {
        let (lowering, _tmp) = lowering_with(vec!["not json".to_string(), minimal_ir_json()]);
        let ir = lowering
            .lower("Build a shop.", &Config::default(), &CancelToken::unbounded())
            .await
            .expect("lowering should succeed on retry");
        assert_eq!(ir.app_name, "Shop");
    }

    #[tokio::test]
    async fn test_two_failures_are_fatal() {
        let (lowering, _tmp) =
            lowering_with(vec!["not json".to_string(), "still not json".to_string()]);
        let err = lowering
            .lower("Build a shop.", &Config::default(), &CancelToken::unbounded())
            .await
            .expect_err("lowering must fail");
        assert!(matches!(err, PipelineError::LoweringFailed { .. }));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_model() {
        let (lowering, tmp) = lowering_with(vec![minimal_ir_json()]);
        let config = Config::default();
        let cancel = CancelToken::unbounded();
        let first = lowering
            .lower("Build a shop.", &config, &cancel)
            .await
            .expect("first lowering");

        // Second lowering has no scripted responses left; only the cache
        // can satisfy it.
        let cache = Arc::new(IrCache::new(tmp.path(), 3600));
        let llm = Arc::new(ScriptedLlmClient::default());
        let cached = SpecLowering::new(llm, cache)
            .lower("Build a shop.", &config, &cancel)
            .await
            .expect("cached lowering");
        assert_eq!(first, cached);
    }

    #[test]
    fn test_fence_stripping() {
        assert_eq!(strip_code_fences("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("{}"), "{}");
    }
}
