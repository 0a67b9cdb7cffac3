//! Websocket gateway: lets remote clients join realtime topics on the hub.

pub mod connection;
pub mod session;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use nest_realtime::Hub;

/// Shared gateway state handed to every connection.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    hub: Hub,
    connections: AtomicUsize,
}

impl Gateway {
    pub fn new(hub: Hub) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                hub,
                connections: AtomicUsize::new(0),
            }),
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    /// Currently connected websocket clients.
    pub fn connections(&self) -> usize {
        self.inner.connections.load(Ordering::Relaxed)
    }

    pub(crate) fn connected(&self) -> usize {
        self.inner.connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn disconnected(&self) -> usize {
        self.inner.connections.fetch_sub(1, Ordering::Relaxed).saturating_sub(1)
    }
}
