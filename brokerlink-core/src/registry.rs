//! Per-protocol registry of role connections.
//!
//! Each protocol owns one registry mapping a [`Role`] to at most one live
//! connection handle plus the listeners started on it. The registry lock is
//! held for a whole connect, disconnect or subscribe sequence, so two calls for
//! the same protocol never interleave and a replaced handle is always torn
//! down before the new one becomes visible.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};

use brokerlink_common::{Protocol, Role};

use crate::listener::ListenerHandle;

/// Releases the broker resources held by a connection handle.
#[async_trait]
pub trait Teardown: Send + Sync + 'static {
    /// Close everything the handle owns. Errors are logged, never returned.
    async fn teardown(self);
}

/// State of one role on one protocol.
#[derive(Debug)]
pub struct RoleConnectionState<H> {
    handle: Option<H>,
    listeners: Vec<ListenerHandle>,
}

impl<H> Default for RoleConnectionState<H> {
    fn default() -> Self {
        Self {
            handle: None,
            listeners: Vec::new(),
        }
    }
}

impl<H> RoleConnectionState<H> {
    pub fn handle(&self) -> Option<&H> {
        self.handle.as_ref()
    }

    pub fn listeners(&self) -> &[ListenerHandle] {
        &self.listeners
    }
}

/// Role connections of one protocol.
#[derive(Debug)]
pub struct ConnectionRegistry<H> {
    protocol: Protocol,
    roles: Mutex<HashMap<Role, RoleConnectionState<H>>>,
}

impl<H: Teardown> ConnectionRegistry<H> {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            roles: Mutex::new(HashMap::new()),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Acquire exclusive access to the registry.
    pub async fn lock(&self) -> RegistryGuard<'_, H> {
        RegistryGuard {
            protocol: self.protocol,
            roles: self.roles.lock().await,
        }
    }
}

/// Exclusive access to a [`ConnectionRegistry`].
pub struct RegistryGuard<'a, H> {
    protocol: Protocol,
    roles: MutexGuard<'a, HashMap<Role, RoleConnectionState<H>>>,
}

impl<H: Teardown> RegistryGuard<'_, H> {
    /// State of `role`, created empty on first use.
    pub fn ensure_state(&mut self, role: Role) -> &mut RoleConnectionState<H> {
        self.roles.entry(role).or_default()
    }

    /// Live handle of `role`, if any.
    pub fn handle(&self, role: Role) -> Option<&H> {
        self.roles.get(&role).and_then(RoleConnectionState::handle)
    }

    /// Install `handle` for `role`, tearing down whatever was there first.
    pub async fn replace(&mut self, role: Role, handle: H) {
        if self.clear(role).await {
            tracing::debug!(protocol = %self.protocol, role = %role, "Replaced existing connection");
        }
        self.ensure_state(role).handle = Some(handle);
    }

    /// Stop the listeners of `role` and tear down its handle.
    ///
    /// Returns whether a handle was present.
    pub async fn clear(&mut self, role: Role) -> bool {
        let Some(state) = self.roles.get_mut(&role) else {
            return false;
        };
        let listeners = std::mem::take(&mut state.listeners);
        let handle = state.handle.take();

        for listener in listeners {
            listener.stop().await;
        }
        match handle {
            Some(handle) => {
                handle.teardown().await;
                true
            }
            None => false,
        }
    }

    /// Clear every role.
    pub async fn clear_all(&mut self) {
        for role in Role::ALL {
            self.clear(role).await;
        }
    }

    /// Track a listener started on `role`'s connection.
    pub fn add_listener(&mut self, role: Role, listener: ListenerHandle) {
        let state = self.ensure_state(role);
        state.listeners.retain(|l| !l.is_finished());
        state.listeners.push(listener);
    }

    /// Stop the listeners of `role` consuming `topic`. Returns how many stopped.
    pub async fn stop_listeners(&mut self, role: Role, topic: &str) -> usize {
        let Some(state) = self.roles.get_mut(&role) else {
            return 0;
        };
        let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut state.listeners)
            .into_iter()
            .partition(|l| l.topic() == topic);
        state.listeners = rest;

        let count = matching.len();
        for listener in matching {
            listener.stop().await;
        }
        count
    }

    /// Number of registered listeners that are still running.
    pub fn listener_count(&self) -> usize {
        self.roles
            .values()
            .flat_map(|state| state.listeners.iter())
            .filter(|l| !l.is_finished())
            .count()
    }
}
