//! Shared server state handed to every task.

use std::sync::Arc;

use qtun_core::TrafficCounters;
use qtun_core::catalog::Catalog;

use crate::config::ServerConfig;
use crate::listeners::ListenerManager;
use crate::pending::PendingTable;
use crate::registry::AgentRegistry;
use crate::udp::UdpRouteTable;

/// Everything a session, listener or engine task needs, behind one `Arc`.
pub(crate) struct ServerContext {
    pub config: ServerConfig,
    pub catalog: Arc<dyn Catalog>,
    pub registry: AgentRegistry,
    pub pending: PendingTable,
    pub listeners: ListenerManager,
    pub counters: TrafficCounters,
    pub udp_routes: UdpRouteTable,
}

impl ServerContext {
    pub fn new(config: ServerConfig, catalog: Arc<dyn Catalog>) -> Arc<Self> {
        Arc::new(Self {
            config,
            catalog,
            registry: AgentRegistry::new(),
            pending: PendingTable::new(),
            listeners: ListenerManager::new(),
            counters: TrafficCounters::new(),
            udp_routes: UdpRouteTable::new(),
        })
    }
}
