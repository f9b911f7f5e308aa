//! Registry of active connections, owned by the event loop.
//!
//! The registry is the one place that can enumerate and shut down every
//! live connection; components that need that ability get a reference to
//! it rather than reaching for global state.

use std::time::Duration;

use log::{debug, warn};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::timeout;

pub struct ConnectionRegistry {
    connections: JoinSet<()>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        ConnectionRegistry {
            connections: JoinSet::new(),
            shutdown_tx,
        }
    }

    /// Shutdown receiver to hand to a new connection task.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn spawn<F>(&mut self, conn: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.connections.spawn(conn);
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Collect finished connection tasks without blocking.
    pub fn reap(&mut self) {
        while let Some(result) = self.connections.try_join_next() {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    warn!("connection task failed: {}", e);
                }
            }
        }
    }

    /// Ask every connection to drain and wait for them, aborting whatever
    /// is still alive once the grace period expires.
    pub async fn shutdown(&mut self, grace: Duration) {
        if self.connections.is_empty() {
            return;
        }
        debug!("shutting down {} active connection(s)", self.connections.len());
        let _ = self.shutdown_tx.send(());
        let drain = async {
            while self.connections.join_next().await.is_some() {}
        };
        let drained = timeout(grace, drain).await.is_ok();
        if !drained {
            warn!(
                "{} connection(s) still active after shutdown timeout, aborting",
                self.connections.len()
            );
            self.connections.shutdown().await;
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_signals_and_drains() {
        let mut registry = ConnectionRegistry::new();
        let mut rx = registry.subscribe();
        registry.spawn(async move {
            let _ = rx.recv().await;
        });
        assert_eq!(registry.len(), 1);
        registry.shutdown(Duration::from_secs(1)).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn shutdown_aborts_stuck_connections() {
        let mut registry = ConnectionRegistry::new();
        registry.spawn(async {
            std::future::pending::<()>().await;
        });
        registry.shutdown(Duration::from_millis(50)).await;
        assert!(registry.is_empty());
    }
}
