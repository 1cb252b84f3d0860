//! Mutex-guarded in-memory catalog implementation.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use qtun_core::Result;
use qtun_core::catalog::{AgentRecord, Catalog, TrafficRecord};
use qtun_core::forward::{AgentId, Forward, ForwardId};

#[derive(Default)]
struct State {
    agents: HashMap<String, AgentRecord>,
    forwards: Vec<Forward>,
    traffic: Vec<TrafficRecord>,
}

/// In-memory [`Catalog`] with mutation helpers for tests. Mutations take
/// effect on the next catalog read, mirroring how the real store behaves
/// behind the admin surface.
#[derive(Default)]
pub struct MemoryCatalog {
    inner: Mutex<State>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_agent(&self, token: &str, id: i64, name: &str, enabled: bool) {
        let mut state = self.inner.lock().expect("catalog mutex poisoned");
        state.agents.insert(
            token.to_string(),
            AgentRecord {
                id: AgentId(id),
                name: name.to_string(),
                enabled,
            },
        );
    }

    pub fn insert_forward(&self, forward: Forward) {
        let mut state = self.inner.lock().expect("catalog mutex poisoned");
        state.forwards.retain(|f| f.id != forward.id);
        state.forwards.push(forward);
    }

    pub fn set_forward_enabled(&self, id: ForwardId, enabled: bool) {
        let mut state = self.inner.lock().expect("catalog mutex poisoned");
        if let Some(f) = state.forwards.iter_mut().find(|f| f.id == id) {
            f.enabled = enabled;
        }
    }

    pub fn remove_forward(&self, id: ForwardId) {
        let mut state = self.inner.lock().expect("catalog mutex poisoned");
        state.forwards.retain(|f| f.id != id);
    }

    pub fn set_agent_enabled(&self, token: &str, enabled: bool) {
        let mut state = self.inner.lock().expect("catalog mutex poisoned");
        if let Some(record) = state.agents.get_mut(token) {
            record.enabled = enabled;
        }
    }

    /// Traffic rows appended so far.
    pub fn traffic(&self) -> Vec<TrafficRecord> {
        let state = self.inner.lock().expect("catalog mutex poisoned");
        state.traffic.clone()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn agent_by_token(&self, token: &str) -> Result<Option<AgentRecord>> {
        let state = self.inner.lock().expect("catalog mutex poisoned");
        Ok(state.agents.get(token).filter(|a| a.enabled).cloned())
    }

    async fn forwards_by_agent(&self, agent_id: AgentId) -> Result<Vec<Forward>> {
        let state = self.inner.lock().expect("catalog mutex poisoned");
        Ok(state
            .forwards
            .iter()
            .filter(|f| f.agent_id == agent_id && f.enabled)
            .cloned()
            .collect())
    }

    async fn remote_port_available(
        &self,
        remote_port: u16,
        exclude: Option<ForwardId>,
    ) -> Result<bool> {
        let state = self.inner.lock().expect("catalog mutex poisoned");
        Ok(!state.forwards.iter().any(|f| {
            f.enabled
                && f.direction.binds_server()
                && f.remote_port == remote_port
                && Some(f.id) != exclude
        }))
    }

    async fn append_traffic(&self, records: &[TrafficRecord]) -> Result<()> {
        let mut state = self.inner.lock().expect("catalog mutex poisoned");
        state.traffic.extend_from_slice(records);
        Ok(())
    }
}
