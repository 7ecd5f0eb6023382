//! Worker result submission: markdown deliverables for tasks and
//! workflows.
//!
//! Result files are UTF-8 Markdown capped at 100 KiB. Paths are validated
//! before any read: traversal components and non-`.md` extensions are
//! rejected outright.

use std::path::{Component, Path};
use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use keel_db::models::{AgentResult, WorkflowResult};
use keel_db::queries::results as db;

use crate::error::{KernelError, KernelResult};
use crate::events::{EventBus, SystemEvent};

/// Maximum size of a result file.
pub const MAX_RESULT_BYTES: u64 = 100 * 1024;

/// Validate a result file path: must end in `.md` and contain no parent
/// traversal.
pub fn validate_result_path(path: &Path) -> KernelResult<()> {
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(KernelError::validation(format!(
            "result path {} contains parent traversal",
            path.display()
        )));
    }

    let is_markdown = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("md"));
    if !is_markdown {
        return Err(KernelError::validation(format!(
            "result path {} must have a .md extension",
            path.display()
        )));
    }

    Ok(())
}

/// Load a validated result file: UTF-8 markdown within the size cap.
pub async fn load_result_markdown(path: &Path) -> KernelResult<String> {
    validate_result_path(path)?;

    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| KernelError::validation(format!("cannot stat {}: {e}", path.display())))?;
    if metadata.len() > MAX_RESULT_BYTES {
        return Err(KernelError::validation(format!(
            "result file {} is {} bytes, limit is {MAX_RESULT_BYTES}",
            path.display(),
            metadata.len()
        )));
    }

    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| KernelError::validation(format!("cannot read {}: {e}", path.display())))?;
    String::from_utf8(bytes)
        .map_err(|_| KernelError::validation(format!("result file {} is not UTF-8", path.display())))
}

/// Persists result submissions.
pub struct ResultSubmitter {
    pool: PgPool,
    bus: Arc<EventBus>,
}

impl ResultSubmitter {
    pub fn new(pool: PgPool, bus: Arc<EventBus>) -> Self {
        Self { pool, bus }
    }

    /// Load and record a per-task deliverable.
    pub async fn submit_task_result(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
        path: &Path,
    ) -> KernelResult<AgentResult> {
        let markdown = load_result_markdown(path).await?;
        let result = db::insert_agent_result(&self.pool, task_id, agent_id, &markdown).await?;

        self.bus
            .publish(SystemEvent::new(
                "task.status.changed",
                "task",
                task_id,
                serde_json::json!({
                    "agent_result_id": result.id,
                    "markdown_bytes": markdown.len(),
                }),
            ))
            .await;

        Ok(result)
    }

    /// Validate and record a workflow-level deliverable. The file stays on
    /// disk; only its path is persisted.
    pub async fn submit_workflow_result(
        &self,
        workflow_id: Uuid,
        path: &Path,
        summary: Option<&str>,
        submitted_by: Option<Uuid>,
    ) -> KernelResult<WorkflowResult> {
        // Load to validate; content is not persisted at workflow scope.
        load_result_markdown(path).await?;

        let result = db::insert_workflow_result(
            &self.pool,
            workflow_id,
            Some(&path.to_string_lossy()),
            summary,
            submitted_by,
        )
        .await?;

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn rejects_parent_traversal() {
        assert!(validate_result_path(Path::new("../etc/passwd.md")).is_err());
        assert!(validate_result_path(Path::new("results/../../secret.md")).is_err());
    }

    #[test]
    fn rejects_non_markdown() {
        assert!(validate_result_path(Path::new("result.txt")).is_err());
        assert!(validate_result_path(Path::new("result")).is_err());
    }

    #[test]
    fn accepts_plain_markdown_paths() {
        assert!(validate_result_path(Path::new("results/task-1.md")).is_ok());
        assert!(validate_result_path(Path::new("REPORT.MD")).is_ok());
    }

    #[tokio::test]
    async fn loads_small_markdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("result.md");
        std::fs::write(&path, "# Done\n\nAll tests pass.\n").expect("write");

        let content = load_result_markdown(&path).await.expect("load");
        assert!(content.starts_with("# Done"));
    }

    #[tokio::test]
    async fn rejects_oversized_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("huge.md");
        let mut file = std::fs::File::create(&path).expect("create");
        let chunk = [b'x'; 1024];
        for _ in 0..101 {
            file.write_all(&chunk).expect("write");
        }
        drop(file);

        assert!(load_result_markdown(&path).await.is_err());
    }

    #[tokio::test]
    async fn rejects_invalid_utf8() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("binary.md");
        std::fs::write(&path, [0xff, 0xfe, 0x00, 0x01]).expect("write");

        assert!(load_result_markdown(&path).await.is_err());
    }
}
