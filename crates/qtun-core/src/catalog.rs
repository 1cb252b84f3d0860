//! Catalog adapter: the read-only seam between the tunnel core and the
//! persistent configuration store.
//!
//! The store itself (relational schema, admin CRUD, operator auth) lives
//! outside this workspace; the core only consumes the operations below.
//! `qtun-test-utils` ships an in-memory implementation for tests.

use async_trait::async_trait;

use crate::Result;
use crate::forward::{AgentId, Forward, ForwardId};

/// An agent row as resolved by token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRecord {
    pub id: AgentId,
    pub name: String,
    pub enabled: bool,
}

/// One append-only traffic row flushed by the meter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficRecord {
    pub forward_id: ForwardId,
    /// Bytes flowing from the entering user toward the destination service.
    pub bytes_in: u64,
    /// Bytes flowing back from the destination to the user.
    pub bytes_out: u64,
    /// Milliseconds since the Unix epoch at snapshot time.
    pub timestamp_ms: u64,
}

/// Operations the core requires from the configuration catalog.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Resolve an auth token to an enabled agent. Disabled agents resolve
    /// to `None`.
    async fn agent_by_token(&self, token: &str) -> Result<Option<AgentRecord>>;

    /// Enabled forwards owned by the agent, any direction or transport.
    async fn forwards_by_agent(&self, agent_id: AgentId) -> Result<Vec<Forward>>;

    /// Whether `remote_port` is free among enabled forwards whose direction
    /// binds the server. `exclude` skips one forward id (used when editing).
    async fn remote_port_available(
        &self,
        remote_port: u16,
        exclude: Option<ForwardId>,
    ) -> Result<bool>;

    /// Append traffic deltas to the catalog's traffic log.
    async fn append_traffic(&self, records: &[TrafficRecord]) -> Result<()>;
}
