//! Agent-side view of the configured forwards.
//!
//! Keeps the authoritative name → forward map pushed by the server and
//! reconciles local listeners for the reverse directions: close what
//! disappeared or changed, then bind what is new. A `config_update`
//! carrying the current set is a no-op for listener topology.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use qtun_core::forward::{Direction, PortForward};

use crate::context::AgentContext;
use crate::reverse;

struct LocalListener {
    forward: PortForward,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LocalListener {
    fn close(self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
    }
}

#[derive(Default)]
struct State {
    by_name: HashMap<String, PortForward>,
    listeners: HashMap<String, LocalListener>,
}

/// Forward map plus the reverse listeners derived from it.
#[derive(Default)]
pub(crate) struct ForwardMap {
    inner: Mutex<State>,
}

impl ForwardMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a forward by its wire name.
    pub fn get(&self, name: &str) -> Option<PortForward> {
        let state = self.inner.lock().expect("forward mutex poisoned");
        state.by_name.get(name).cloned()
    }

    /// Apply a new authoritative forward list.
    ///
    /// Reconciliation only runs on the dispatch loop, so the diff below is
    /// single-threaded; the mutex just guards lookups from connection
    /// tasks.
    pub async fn reconcile(&self, ctx: &Arc<AgentContext>, forwards: &[PortForward]) {
        let desired_listeners: HashMap<String, PortForward> = forwards
            .iter()
            .filter(|f| matches!(f.direction, Direction::Reverse | Direction::ReverseDynamic))
            .map(|f| (f.name.clone(), f.clone()))
            .collect();

        // Swap in the new name map and pull out listeners to close.
        let to_close: Vec<LocalListener> = {
            let mut state = self.inner.lock().expect("forward mutex poisoned");
            state.by_name = forwards.iter().map(|f| (f.name.clone(), f.clone())).collect();

            let names: Vec<String> = state
                .listeners
                .iter()
                .filter(|(name, local)| {
                    desired_listeners
                        .get(*name)
                        .map(|want| want != &local.forward)
                        .unwrap_or(true)
                })
                .map(|(name, _)| name.clone())
                .collect();
            names
                .into_iter()
                .filter_map(|n| state.listeners.remove(&n))
                .collect()
        };
        for local in to_close {
            info!(name = %local.forward.name, "Closing reverse listener");
            local.close();
        }

        // Bind the missing ones.
        for (name, fwd) in desired_listeners {
            if self.has_listener(&name) {
                continue;
            }

            let addr = format!("{}:{}", fwd.local_ip, fwd.local_port);
            let listener = match TcpListener::bind(&addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(name = %name, %addr, error = %e, "Reverse listener bind failed");
                    continue;
                }
            };
            info!(name = %name, %addr, direction = ?fwd.direction, "Reverse listener bound");

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let task = tokio::spawn(reverse::run_listener(
                ctx.clone(),
                fwd.clone(),
                listener,
                shutdown_rx,
            ));

            let mut state = self.inner.lock().expect("forward mutex poisoned");
            state.listeners.insert(
                name,
                LocalListener {
                    forward: fwd,
                    shutdown: shutdown_tx,
                    task,
                },
            );
        }
    }

    fn has_listener(&self, name: &str) -> bool {
        let state = self.inner.lock().expect("forward mutex poisoned");
        state.listeners.contains_key(name)
    }

    /// Tear down every listener (session end).
    pub fn close_all(&self) {
        let closing: Vec<LocalListener> = {
            let mut state = self.inner.lock().expect("forward mutex poisoned");
            state.listeners.drain().map(|(_, l)| l).collect()
        };
        for local in closing {
            debug!(name = %local.forward.name, "Closing reverse listener with session");
            local.close();
        }
    }
}
