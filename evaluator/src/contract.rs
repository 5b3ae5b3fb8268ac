//! Structured output contract for the model's final answer.
//!
//! The same schema is handed to the model provider to constrain generation and
//! used here to validate whatever comes back. Validation runs in three layers:
//! JSON Schema, typed deserialization, then [`crate::core::invariants`].

use anyhow::{Context, Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde_json::Value;
use tracing::debug;

use crate::core::invariants::validate_answer;
use crate::core::types::ModelAnswer;

const ANALYSIS_SCHEMA: &str = include_str!("../schemas/analysis.schema.json");

/// Compiled final-answer schema.
pub struct OutputContract {
    schema: Value,
    validator: Validator,
}

impl OutputContract {
    pub fn new() -> Result<Self> {
        let (schema, validator) = compile_schema("analysis", ANALYSIS_SCHEMA)?;
        Ok(Self { schema, validator })
    }

    /// Raw schema, as sent to the model provider.
    pub fn schema(&self) -> &Value {
        &self.schema
    }

    /// Parse and validate a final answer.
    ///
    /// Returns a human-readable violation message on failure; the message
    /// becomes the explanation of the resulting `error` verdict.
    pub fn parse_answer(&self, raw: &str) -> Result<ModelAnswer, String> {
        let body = strip_code_fence(raw);
        let value: Value = serde_json::from_str(body)
            .map_err(|err| format!("final answer is not valid JSON: {err}"))?;

        let errors = schema_errors(&self.validator, &value);
        if !errors.is_empty() {
            return Err(format!(
                "final answer failed schema validation: {}",
                errors.join("; ")
            ));
        }

        let answer: ModelAnswer = serde_json::from_value(value)
            .map_err(|err| format!("final answer has an unexpected shape: {err}"))?;

        let errors = validate_answer(&answer);
        if !errors.is_empty() {
            return Err(format!(
                "final answer violates analysis invariants: {}",
                errors.join("; ")
            ));
        }

        debug!(
            status = answer.status.as_str(),
            evidence = answer.evidence().len(),
            "parsed final answer"
        );
        Ok(answer)
    }
}

/// Parse and compile an embedded JSON Schema.
pub(crate) fn compile_schema(name: &str, raw: &str) -> Result<(Value, Validator)> {
    let schema: Value =
        serde_json::from_str(raw).with_context(|| format!("parse {name} schema"))?;
    let validator =
        validator_for(&schema).map_err(|err| anyhow!("invalid {name} schema: {err}"))?;
    Ok((schema, validator))
}

/// Collect every schema violation message.
pub(crate) fn schema_errors(validator: &Validator, instance: &Value) -> Vec<String> {
    if validator.is_valid(instance) {
        return Vec::new();
    }
    validator
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect()
}

/// Models sometimes wrap JSON in a Markdown code fence despite instructions.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(rest) = rest.strip_suffix("```") else {
        return trimmed;
    };
    match rest.split_once('\n') {
        Some((_language, body)) => body.trim(),
        None => rest.trim(),
    }
}
