//! Executor phase: capture a completed task's execution as a memory row.

use std::collections::BTreeSet;
use std::sync::Arc;

use sqlx::PgPool;

use keel_db::models::{MemoryType, Task, TaskMemory};
use keel_db::queries::memories::{self, NewTaskMemory};

use crate::embedding::Embedder;
use crate::error::KernelResult;
use crate::llm::{self, LlmGateway};

/// Result of the Executor phase.
#[derive(Debug, Clone)]
pub struct ExecutorResult {
    pub memory: TaskMemory,
    pub files_linked: Vec<String>,
    pub tags: Vec<String>,
}

/// Tool names whose arguments carry file paths.
const FILE_TOOLS: [&str; 6] = [
    "file_read",
    "file_edit",
    "file_create",
    "read_file",
    "write_file",
    "edit_file",
];

/// Argument keys that may hold the path, in precedence order.
const PATH_KEYS: [&str; 3] = ["path", "file_path", "file"];

/// Executor phase of the ACE pipeline.
pub struct Executor {
    pool: PgPool,
    embedder: Arc<dyn Embedder>,
    gateway: Option<Arc<dyn LlmGateway>>,
}

impl Executor {
    pub fn new(
        pool: PgPool,
        embedder: Arc<dyn Embedder>,
        gateway: Option<Arc<dyn LlmGateway>>,
    ) -> Self {
        Self {
            pool,
            embedder,
            gateway,
        }
    }

    /// Build and persist the execution record for a completed task.
    pub async fn execute(
        &self,
        task: &Task,
        goal: &str,
        result: &str,
        tool_usage: &[serde_json::Value],
        feedback: Option<&str>,
        success: bool,
    ) -> KernelResult<ExecutorResult> {
        let files_linked = extract_file_paths(tool_usage);

        let summary = format!("{goal}\n\nResult: {result}");
        let memory_type = self
            .classify_memory_type(&summary, &task.description)
            .await;

        let mut content = summary.clone();
        if let Some(feedback) = feedback {
            content.push_str("\n\nFeedback: ");
            content.push_str(feedback);
        }

        let embedding = self.embedder.embed(&content).await?;

        let tool_blob = serde_json::json!({ "tools": tool_usage });
        let memory = memories::insert_memory(
            &self.pool,
            &NewTaskMemory {
                task_id: task.id,
                execution_summary: &content,
                memory_type,
                context_embedding: &embedding,
                success,
                error_patterns: None,
                goal: Some(goal),
                result: Some(result),
                feedback,
                tool_usage: Some(&tool_blob),
            },
        )
        .await?;

        let tags = extract_tags(goal, result);

        Ok(ExecutorResult {
            memory,
            files_linked,
            tags,
        })
    }

    /// Classify the memory type: gateway-backed when available, rule-based
    /// otherwise (and as the fallback when the gateway misbehaves).
    async fn classify_memory_type(&self, summary: &str, task_description: &str) -> MemoryType {
        if let Some(gateway) = &self.gateway {
            let prompt =
                format!("Execution summary: {summary}\nTask description: {task_description}");
            let system_prompt = "Classify the task execution summary into one memory type: \
                                 error_fix, decision, learning, warning, codebase_knowledge, \
                                 or discovery. Provide a confidence score and brief reasoning."
                .to_owned();
            match llm::classify_memory(gateway.as_ref(), prompt, system_prompt).await {
                Ok(classification) => {
                    if let Ok(memory_type) = classification.memory_type.parse() {
                        return memory_type;
                    }
                    tracing::warn!(
                        memory_type = %classification.memory_type,
                        "gateway returned unknown memory type, using rules"
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "memory classification via gateway failed, using rules");
                }
            }
        }
        classify_by_rules(summary, task_description)
    }
}

/// Rule-based memory classification for the synchronous path.
pub fn classify_by_rules(summary: &str, task_description: &str) -> MemoryType {
    let text = format!("{} {}", summary.to_lowercase(), task_description.to_lowercase());

    let any = |keywords: &[&str]| keywords.iter().any(|k| text.contains(k));

    if any(&["fix", "error", "bug", "issue"]) {
        MemoryType::ErrorFix
    } else if any(&["chose", "choice", "decided", "decision", "selected"]) {
        MemoryType::Decision
    } else if any(&["warning", "gotcha", "caution", "careful"]) {
        MemoryType::Warning
    } else if any(&["architecture", "structure", "pattern", "design"]) {
        MemoryType::CodebaseKnowledge
    } else if any(&["discovered", "learned", "realized", "found that"]) {
        MemoryType::Learning
    } else {
        MemoryType::Discovery
    }
}

/// Pull file paths out of tool-usage records across the known tool
/// vocabulary. Paths are deduplicated and sorted.
pub fn extract_file_paths(tool_usage: &[serde_json::Value]) -> Vec<String> {
    let mut files = BTreeSet::new();

    for tool in tool_usage {
        let name = tool
            .get("tool_name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_lowercase();
        if !FILE_TOOLS.contains(&name.as_str()) {
            continue;
        }
        let Some(arguments) = tool.get("arguments") else {
            continue;
        };
        for key in PATH_KEYS {
            if let Some(path) = arguments.get(key).and_then(|v| v.as_str()) {
                files.insert(path.to_owned());
                break;
            }
        }
    }

    files.into_iter().collect()
}

/// Keyword-based tag extraction from goal and result text.
pub fn extract_tags(goal: &str, result: &str) -> Vec<String> {
    let text = format!("{} {}", goal.to_lowercase(), result.to_lowercase());

    let tag_keywords: [(&str, &[&str]); 6] = [
        ("authentication", &["auth", "login", "jwt", "oauth"]),
        ("database", &["db", "sql", "postgres", "database"]),
        ("api", &["api", "endpoint", "rest", "graphql"]),
        ("testing", &["test", "unit", "integration"]),
        ("frontend", &["react", "vue", "ui", "frontend"]),
        ("backend", &["backend", "server"]),
    ];

    tag_keywords
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|k| text.contains(k)))
        .map(|(tag, _)| (*tag).to_owned())
        .collect()
}
