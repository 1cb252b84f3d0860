//! Per-session shared state on the agent.

use std::sync::Arc;

use tokio::sync::mpsc;

use qtun_core::protocol::Message;
use qtun_core::{Error, Result};

use crate::config::AgentConfig;
use crate::forwards::ForwardMap;
use crate::reverse::WaiterTable;
use crate::udp::UdpSessionMap;

/// State shared by the dispatch loop, listeners and connection tasks of
/// one control session. A fresh context is built per (re)connect, so
/// stale waiters and UDP sessions die with the connection they belonged
/// to.
pub(crate) struct AgentContext {
    pub config: AgentConfig,
    outbox: mpsc::Sender<Message>,
    pub forwards: ForwardMap,
    pub waiters: WaiterTable,
    pub udp: UdpSessionMap,
}

impl AgentContext {
    pub fn new(config: AgentConfig, outbox: mpsc::Sender<Message>) -> Arc<Self> {
        Arc::new(Self {
            config,
            outbox,
            forwards: ForwardMap::new(),
            waiters: WaiterTable::new(),
            udp: UdpSessionMap::new(),
        })
    }

    /// Queue a frame for the control writer task.
    pub async fn send(&self, msg: Message) -> Result<()> {
        self.outbox
            .send(msg)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// A sender for long-lived pump tasks that outlive a single call.
    pub fn outbox(&self) -> mpsc::Sender<Message> {
        self.outbox.clone()
    }
}
