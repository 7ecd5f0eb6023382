//! Sandbox / agent spawning contract.
//!
//! Provisioning a sandbox and launching an agent process is an external
//! concern. The kernel only needs a handle back and a way to deliver
//! out-of-band messages.

use async_trait::async_trait;
use uuid::Uuid;

use keel_db::models::AgentKind;

use crate::error::KernelResult;

/// Handle to a spawned agent.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    pub id: Uuid,
    pub agent_type: AgentKind,
    pub phase_id: String,
}

/// Kind of out-of-band message delivered to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Validator feedback injected into the worker's message stream.
    ValidationFeedback,
    /// Notification that recovery tasks were spawned for the workflow.
    RecoveryNotice,
    /// Operator intervention.
    Intervention,
}

/// Contract for spawning agents and reaching them out-of-band.
#[async_trait]
pub trait AgentSpawner: Send + Sync {
    /// Provision and register an agent of the given type for a phase.
    async fn spawn_agent(
        &self,
        agent_type: AgentKind,
        phase_id: &str,
        capabilities: &[String],
        tags: &[String],
    ) -> KernelResult<AgentHandle>;

    /// Deliver a message to a live agent.
    async fn send_message(
        &self,
        target_id: Uuid,
        message: &str,
        kind: MessageKind,
    ) -> KernelResult<()>;
}
