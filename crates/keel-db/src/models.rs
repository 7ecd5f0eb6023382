use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a ticket -- the aggregate workflow unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    InProgress,
    Done,
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

impl FromStr for TicketStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            other => Err(StatusParseError::new("ticket status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a task.
///
/// `Completed` and `Failed` are terminal: once reached, a task's status
/// never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claiming,
    Assigned,
    Running,
    UnderReview,
    ValidationInProgress,
    NeedsWork,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Statuses that count as "active" for stuck-workflow detection.
    pub const ACTIVE: [TaskStatus; 6] = [
        Self::Pending,
        Self::Claiming,
        Self::Assigned,
        Self::Running,
        Self::UnderReview,
        Self::ValidationInProgress,
    ];

    /// Whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Claiming => "claiming",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::UnderReview => "under_review",
            Self::ValidationInProgress => "validation_in_progress",
            Self::NeedsWork => "needs_work",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "claiming" => Ok(Self::Claiming),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "under_review" => Ok(Self::UnderReview),
            "validation_in_progress" => Ok(Self::ValidationInProgress),
            "needs_work" => Ok(Self::NeedsWork),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StatusParseError::new("task status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Priority band of a task or ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    /// Normalized weight used by the scorer.
    pub fn weight(self) -> f64 {
        match self {
            Self::Low => 0.25,
            Self::Medium => 0.5,
            Self::High => 0.75,
            Self::Critical => 1.0,
        }
    }

    /// The next band up. Used by discovery priority boosting.
    pub fn boosted(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskPriority {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(StatusParseError::new("task priority", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Taxonomy of task memories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    ErrorFix,
    Decision,
    Learning,
    Warning,
    CodebaseKnowledge,
    Discovery,
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ErrorFix => "error_fix",
            Self::Decision => "decision",
            Self::Learning => "learning",
            Self::Warning => "warning",
            Self::CodebaseKnowledge => "codebase_knowledge",
            Self::Discovery => "discovery",
        };
        f.write_str(s)
    }
}

impl FromStr for MemoryType {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error_fix" => Ok(Self::ErrorFix),
            "decision" => Ok(Self::Decision),
            "learning" => Ok(Self::Learning),
            "warning" => Ok(Self::Warning),
            "codebase_knowledge" => Ok(Self::CodebaseKnowledge),
            "discovery" => Ok(Self::Discovery),
            other => Err(StatusParseError::new("memory type", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Kind of learned pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Success,
    Failure,
    Optimization,
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Optimization => "optimization",
        };
        f.write_str(s)
    }
}

impl FromStr for PatternType {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "optimization" => Ok(Self::Optimization),
            other => Err(StatusParseError::new("pattern type", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Category of a playbook entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlaybookCategory {
    Patterns,
    Gotchas,
    BestPractices,
    General,
}

impl fmt::Display for PlaybookCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Patterns => "patterns",
            Self::Gotchas => "gotchas",
            Self::BestPractices => "best_practices",
            Self::General => "general",
        };
        f.write_str(s)
    }
}

impl FromStr for PlaybookCategory {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patterns" => Ok(Self::Patterns),
            "gotchas" => Ok(Self::Gotchas),
            "best_practices" => Ok(Self::BestPractices),
            "general" => Ok(Self::General),
            other => Err(StatusParseError::new("playbook category", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Resolution status of a recorded discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Open,
    InProgress,
    Resolved,
    Invalid,
}

impl fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Resolved => "resolved",
            Self::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

impl FromStr for ResolutionStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "resolved" => Ok(Self::Resolved),
            "invalid" => Ok(Self::Invalid),
            other => Err(StatusParseError::new("resolution status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a diagnostic run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticRunStatus {
    Running,
    Completed,
    Skipped,
    Failed,
}

impl fmt::Display for DiagnosticRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for DiagnosticRunStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            other => Err(StatusParseError::new("diagnostic run status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a workflow-level result submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkflowResultStatus {
    Submitted,
    Validated,
    Rejected,
}

impl fmt::Display for WorkflowResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Submitted => "submitted",
            Self::Validated => "validated",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkflowResultStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(Self::Submitted),
            "validated" => Ok(Self::Validated),
            "rejected" => Ok(Self::Rejected),
            other => Err(StatusParseError::new("workflow result status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Kind of agent registered with the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Worker,
    Validator,
    Diagnostic,
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Worker => "worker",
            Self::Validator => "validator",
            Self::Diagnostic => "diagnostic",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentKind {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "worker" => Ok(Self::Worker),
            "validator" => Ok(Self::Validator),
            "diagnostic" => Ok(Self::Diagnostic),
            other => Err(StatusParseError::new("agent kind", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Error returned when parsing an invalid enum string.
#[derive(Debug, Clone)]
pub struct StatusParseError {
    kind: &'static str,
    value: String,
}

impl StatusParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_owned(),
        }
    }
}

impl fmt::Display for StatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for StatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A ticket -- the aggregate workflow unit. Owns its tasks.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Ticket {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub phase_id: String,
    pub status: TicketStatus,
    pub priority: TaskPriority,
    pub project_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A task -- the unit of work dispatched to agents.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub phase_id: String,
    pub task_type: String,
    pub description: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub assigned_agent_id: Option<Uuid>,
    pub sandbox_id: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub deadline_at: Option<DateTime<Utc>>,
    pub score: f64,
    pub validation_enabled: bool,
    pub validation_iteration: i32,
    pub review_done: bool,
    pub last_validation_feedback: Option<String>,
    pub owned_files: Option<Vec<String>>,
    pub content_hash: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// An edge in the task dependency DAG.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskDependency {
    pub task_id: Uuid,
    pub depends_on: Uuid,
}

/// Append-only execution record captured by the ACE pipeline.
///
/// Never mutated after insert except for `reused_count`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskMemory {
    pub id: Uuid,
    pub task_id: Uuid,
    pub execution_summary: String,
    pub memory_type: MemoryType,
    pub context_embedding: Vec<f32>,
    pub success: bool,
    pub error_patterns: Option<Vec<String>>,
    pub goal: Option<String>,
    pub result: Option<String>,
    pub feedback: Option<String>,
    pub tool_usage: Option<serde_json::Value>,
    pub reused_count: i32,
    pub learned_at: DateTime<Utc>,
}

/// Aggregated success/failure signature across task executions.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LearnedPattern {
    pub id: Uuid,
    pub pattern_type: PatternType,
    pub task_type_pattern: String,
    pub success_indicators: Vec<String>,
    pub failure_indicators: Vec<String>,
    pub embedding: Option<Vec<f32>>,
    pub confidence_score: f64,
    pub usage_count: i32,
    pub created_at: DateTime<Utc>,
}

/// Curated knowledge bullet for a ticket. Soft-deleted via `is_active`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlaybookEntry {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub content: String,
    pub category: PlaybookCategory,
    pub tags: Option<Vec<String>>,
    pub embedding: Option<Vec<f32>>,
    pub supporting_memory_ids: Vec<Uuid>,
    pub created_by: Option<Uuid>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit trail of a curator delta.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlaybookChange {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub operation: String,
    pub new_content: Option<String>,
    pub delta: serde_json::Value,
    pub reason: Option<String>,
    pub related_memory_id: Option<Uuid>,
    pub changed_by: Option<Uuid>,
    pub changed_at: DateTime<Utc>,
}

/// An edge in the workflow-branching graph: a finding that spawned tasks.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskDiscovery {
    pub id: Uuid,
    pub source_task_id: Uuid,
    pub discovery_type: String,
    pub description: String,
    pub spawned_task_ids: Vec<Uuid>,
    pub priority_boost: bool,
    pub resolution_status: ResolutionStatus,
    pub discovered_at: DateTime<Utc>,
}

/// One stuck-workflow analysis attempt.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DiagnosticRun {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub triggered_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_tasks_at_trigger: i32,
    pub done_tasks_at_trigger: i32,
    pub failed_tasks_at_trigger: i32,
    pub time_since_last_task_seconds: i64,
    pub workflow_goal: Option<String>,
    pub phases_analyzed: Option<serde_json::Value>,
    pub agents_reviewed: Option<serde_json::Value>,
    pub diagnosis: Option<String>,
    pub tasks_created_count: i32,
    pub tasks_created_ids: Option<Vec<Uuid>>,
    pub status: DiagnosticRunStatus,
}

/// One validator review of a task iteration. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ValidationReview {
    pub id: Uuid,
    pub task_id: Uuid,
    pub validator_agent_id: Uuid,
    pub iteration_number: i32,
    pub validation_passed: bool,
    pub feedback: String,
    pub evidence: Option<serde_json::Value>,
    pub recommendations: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
}

/// Workflow-level deliverable submission.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowResult {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub status: WorkflowResultStatus,
    pub markdown_file_path: Option<String>,
    pub summary: Option<String>,
    pub submitted_by: Option<Uuid>,
    pub submitted_at: DateTime<Utc>,
    pub validated_at: Option<DateTime<Utc>>,
}

/// Per-task deliverable receipt.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentResult {
    pub id: Uuid,
    pub task_id: Uuid,
    pub agent_id: Uuid,
    pub markdown_content: String,
    pub submitted_at: DateTime<Utc>,
}

/// Detected anomaly record from the monitoring surface.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MonitorAnomaly {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub anomaly_type: String,
    pub details: Option<serde_json::Value>,
    pub detected_at: DateTime<Utc>,
}

/// A named lock with an owner, released by flipping `released_at`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ResourceLock {
    pub id: Uuid,
    pub resource_name: String,
    pub owner_agent_id: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

/// An agent registered with the kernel.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Agent {
    pub id: Uuid,
    pub agent_type: AgentKind,
    pub phase_id: String,
    pub capabilities: Vec<String>,
    pub tags: Vec<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A project a ticket can link to. Needed by the clone-readiness chain.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Option<Uuid>,
    pub github_repo: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A user account owning projects.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub github_access_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
