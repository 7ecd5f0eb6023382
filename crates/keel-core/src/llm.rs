//! LLM gateway contract and the structured output schemas the kernel
//! consumes.
//!
//! The gateway must honor the supplied JSON schema or error; retries and
//! provider fallbacks are its responsibility, not the kernel's.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

/// A structured-output request.
#[derive(Debug, Clone)]
pub struct StructuredRequest {
    pub prompt: String,
    pub system_prompt: String,
    /// JSON schema the response must satisfy.
    pub output_schema: serde_json::Value,
}

/// Gateway to a model provider.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    /// Produce a JSON value conforming to the request's schema.
    async fn structured_output(&self, request: StructuredRequest) -> KernelResult<serde_json::Value>;
}

/// One hypothesis about why a workflow is stuck.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hypothesis {
    pub statement: String,
    /// Subjective likelihood in [0, 1].
    pub likelihood: f64,
}

/// One recommended corrective action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub description: String,
    pub priority: String,
}

/// Root-cause analysis of a stuck workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticAnalysis {
    pub root_cause: String,
    #[serde(default)]
    pub hypotheses: Vec<Hypothesis>,
    #[serde(default)]
    pub recommendations: Vec<Recommendation>,
}

/// Validator verdict shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub feedback: String,
    #[serde(default)]
    pub blocking_reasons: Vec<String>,
    /// Completeness estimate in [0, 1].
    pub completeness_score: f64,
    #[serde(default)]
    pub missing_artifacts: Vec<String>,
}

/// Memory-type classification of an execution summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryClassification {
    pub memory_type: String,
    pub confidence: f64,
    pub reasoning: String,
}

/// Success/failure indicator extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternExtraction {
    #[serde(default)]
    pub success_indicators: Vec<String>,
    #[serde(default)]
    pub failure_indicators: Vec<String>,
}

/// Request a [`DiagnosticAnalysis`] from the gateway.
pub async fn diagnose(
    gateway: &dyn LlmGateway,
    prompt: String,
    system_prompt: String,
) -> KernelResult<DiagnosticAnalysis> {
    let value = gateway
        .structured_output(StructuredRequest {
            prompt,
            system_prompt,
            output_schema: diagnostic_analysis_schema(),
        })
        .await?;
    serde_json::from_value(value)
        .map_err(|e| KernelError::validation(format!("gateway returned non-conforming analysis: {e}")))
}

/// Request a [`MemoryClassification`] from the gateway.
pub async fn classify_memory(
    gateway: &dyn LlmGateway,
    prompt: String,
    system_prompt: String,
) -> KernelResult<MemoryClassification> {
    let value = gateway
        .structured_output(StructuredRequest {
            prompt,
            system_prompt,
            output_schema: memory_classification_schema(),
        })
        .await?;
    serde_json::from_value(value).map_err(|e| {
        KernelError::validation(format!("gateway returned non-conforming classification: {e}"))
    })
}

/// JSON schema for [`DiagnosticAnalysis`].
pub fn diagnostic_analysis_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "required": ["root_cause"],
        "properties": {
            "root_cause": {"type": "string"},
            "hypotheses": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["statement", "likelihood"],
                    "properties": {
                        "statement": {"type": "string"},
                        "likelihood": {"type": "number", "minimum": 0.0, "maximum": 1.0}
                    }
                }
            },
            "recommendations": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["description", "priority"],
                    "properties": {
                        "description": {"type": "string"},
                        "priority": {"type": "string"}
                    }
                }
            }
        }
    })
}

/// JSON schema for [`MemoryClassification`].
pub fn memory_classification_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "required": ["memory_type", "confidence", "reasoning"],
        "properties": {
            "memory_type": {
                "type": "string",
                "enum": ["error_fix", "decision", "learning", "warning",
                         "codebase_knowledge", "discovery"]
            },
            "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0},
            "reasoning": {"type": "string"}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analysis_deserializes_without_optionals() {
        let value = serde_json::json!({"root_cause": "worker never reported"});
        let analysis: DiagnosticAnalysis =
            serde_json::from_value(value).expect("should deserialize");
        assert!(analysis.hypotheses.is_empty());
        assert!(analysis.recommendations.is_empty());
    }

    #[test]
    fn validation_result_roundtrip() {
        let result = ValidationResult {
            passed: false,
            feedback: "missing tests".into(),
            blocking_reasons: vec!["no coverage".into()],
            completeness_score: 0.4,
            missing_artifacts: vec!["tests/".into()],
        };
        let value = serde_json::to_value(&result).expect("serialize");
        let back: ValidationResult = serde_json::from_value(value).expect("deserialize");
        assert!(!back.passed);
        assert_eq!(back.blocking_reasons.len(), 1);
    }
}
