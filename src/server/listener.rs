//! Accept loop and server lifecycle.
//!
//! Each configured address gets an accept task feeding new sockets into
//! one channel; the server loop spawns a connection task per socket and
//! owns the registry, the signal handlers and configuration reloads.
//! SIGHUP re-reads the configuration and rebinds listeners without
//! touching in-flight connections; SIGTERM/SIGINT drain and exit.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

use crate::configuration::{parse_listen_address, parse_relay_host, Config};
use crate::connection::stream::BoxedStream;
use crate::connection::task::{serve_connection, ConnectionContext};
use crate::error_handling::types::{ConfigError, ServerError};
use crate::eventlog::{EventLog, JsonEventLog};
use crate::eventlog::types::NullEventLog;
use crate::iolog::store::{IoLogStore, IoLogStoreOptions};
use crate::relay::forwarder::{RelaySettings, RelayTarget};
use crate::server::registry::ConnectionRegistry;
use crate::server::tls::{self, TlsMaterial};

struct NewConnection {
    sock: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
}

pub struct Server {
    config: Config,
    config_path: Option<PathBuf>,
    registry: ConnectionRegistry,
}

impl Server {
    /// `config_path` is kept for SIGHUP reloads; pass `None` to pin the
    /// initial configuration.
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Self {
        Server {
            config,
            config_path,
            registry: ConnectionRegistry::new(),
        }
    }

    pub async fn run(&mut self) -> Result<(), ServerError> {
        let mut ctx = build_context(&self.config)?;
        let (conn_tx, mut conn_rx) = mpsc::channel::<NewConnection>(128);
        let mut listeners = spawn_listeners(&self.config, conn_tx.clone()).await?;

        let mut sigterm = signal(SignalKind::terminate()).map_err(ServerError::SignalError)?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(ServerError::SignalError)?;
        let mut sighup = signal(SignalKind::hangup()).map_err(ServerError::SignalError)?;

        loop {
            tokio::select! {
                Some(conn) = conn_rx.recv() => {
                    self.registry.reap();
                    self.spawn_connection(conn, Arc::clone(&ctx));
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, shutting down");
                    break;
                }
                _ = sighup.recv() => {
                    info!("received SIGHUP, reloading configuration");
                    match self.reload(&conn_tx, listeners).await {
                        Ok((new_listeners, new_ctx)) => {
                            listeners = new_listeners;
                            ctx = new_ctx;
                        }
                        Err((old_listeners, e)) => {
                            error!("configuration reload failed: {}", e);
                            listeners = old_listeners;
                        }
                    }
                }
            }
        }

        for handle in listeners {
            handle.abort();
        }
        self.registry.shutdown(self.config.shutdown_grace()).await;
        info!("server exiting");
        Ok(())
    }

    fn spawn_connection(&mut self, conn: NewConnection, ctx: Arc<ConnectionContext>) {
        let shutdown = self.registry.subscribe();
        let handshake_timeout = ctx.sock_timeout;
        self.registry.spawn(async move {
            let peer = conn.peer.to_string();
            let stream: BoxedStream = match conn.tls {
                Some(acceptor) => {
                    match timeout(handshake_timeout, acceptor.accept(conn.sock)).await {
                        Ok(Ok(stream)) => Box::new(stream),
                        Ok(Err(e)) => {
                            warn!("TLS handshake with {} failed: {}", peer, e);
                            return;
                        }
                        Err(_) => {
                            warn!("TLS handshake with {} timed out", peer);
                            return;
                        }
                    }
                }
                None => Box::new(conn.sock),
            };
            serve_connection(stream, peer, ctx, shutdown).await;
        });
    }

    /// Re-read the configuration and swap listeners and context. On any
    /// failure the old listeners are handed back untouched.
    async fn reload(
        &mut self,
        conn_tx: &mpsc::Sender<NewConnection>,
        old_listeners: Vec<JoinHandle<()>>,
    ) -> Result<(Vec<JoinHandle<()>>, Arc<ConnectionContext>), (Vec<JoinHandle<()>>, ServerError)>
    {
        let path = match &self.config_path {
            Some(path) => path.clone(),
            None => return Err((old_listeners, ServerError::ConfigError(ConfigError::IoError(
                std::io::Error::other("no configuration file to reload"),
            )))),
        };
        let new_config = match Config::from_file(&path) {
            Ok(config) => config,
            Err(e) => return Err((old_listeners, ServerError::ConfigError(e))),
        };
        let new_ctx = match build_context(&new_config) {
            Ok(ctx) => ctx,
            Err(e) => return Err((old_listeners, e)),
        };
        // The old sockets must be fully released before rebinding the
        // same addresses.
        for handle in old_listeners {
            handle.abort();
            let _ = handle.await;
        }
        let new_listeners = spawn_listeners(&new_config, conn_tx.clone())
            .await
            .map_err(|e| (Vec::new(), e))?;
        self.config = new_config;
        Ok((new_listeners, new_ctx))
    }
}

async fn spawn_listeners(
    config: &Config,
    tx: mpsc::Sender<NewConnection>,
) -> Result<Vec<JoinHandle<()>>, ServerError> {
    let addresses: Vec<_> = config
        .server
        .listen_address
        .iter()
        .map(|entry| parse_listen_address(entry))
        .collect::<Result<_, _>>()
        .map_err(ServerError::ConfigError)?;

    let acceptor = if addresses.iter().any(|a| a.tls) {
        Some(tls::build_acceptor(&TlsMaterial {
            cert: config.server.tls_cert.clone(),
            key: config.server.tls_key.clone(),
            ca: config.server.tls_cacert.clone(),
            verify: config.server.tls_verify,
        })?)
    } else {
        None
    };

    let mut handles = Vec::new();
    for address in addresses {
        let listener = TcpListener::bind(&address.addr)
            .await
            .map_err(ServerError::BindError)?;
        info!(
            "listening on {}{}",
            address.addr,
            if address.tls { " (TLS)" } else { "" }
        );
        let tls = if address.tls { acceptor.clone() } else { None };
        handles.push(tokio::spawn(accept_loop(listener, tls, tx.clone())));
    }
    Ok(handles)
}

async fn accept_loop(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    tx: mpsc::Sender<NewConnection>,
) {
    loop {
        match listener.accept().await {
            Ok((sock, peer)) => {
                let _ = sock.set_nodelay(true);
                let conn = NewConnection {
                    sock,
                    peer,
                    tls: tls.clone(),
                };
                if tx.send(conn).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                // Transient resource exhaustion; back off instead of
                // spinning on the error.
                warn!("accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn build_context(config: &Config) -> Result<Arc<ConnectionContext>, ServerError> {
    let store = Arc::new(IoLogStore::new(IoLogStoreOptions {
        root: config.iolog.iolog_dir.clone(),
        pattern: config.iolog.iolog_file.clone(),
        file_mode: config.iolog.iolog_mode,
        compress: config.iolog.compress,
        maxseq: config.iolog.maxseq,
    }));

    let event_log: Arc<dyn EventLog> = match &config.eventlog.json_file {
        Some(path) => Arc::new(JsonEventLog::open(path).map_err(ServerError::EventLogError)?),
        None => Arc::new(NullEventLog),
    };

    let relay = if config.relay.relay_host.is_empty() {
        None
    } else {
        let targets: Vec<RelayTarget> = config
            .relay
            .relay_host
            .iter()
            .map(|entry| parse_relay_host(entry))
            .collect::<Result<_, _>>()
            .map_err(ServerError::ConfigError)?;
        let connector = if config.relay.relay_tls {
            Some(tls::build_connector(&TlsMaterial {
                cert: config.server.tls_cert.clone(),
                key: config.server.tls_key.clone(),
                ca: config.server.tls_cacert.clone(),
                verify: config.relay.relay_tls_verify,
            })?)
        } else {
            None
        };
        info!("relay mode: forwarding sessions to {:?}", config.relay.relay_host);
        Some(Arc::new(RelaySettings {
            targets: targets.into(),
            connector,
            connect_timeout: config.connect_timeout(),
            write_timeout: config.sock_timeout(),
            client_id: config.server.server_id.clone(),
        }))
    };

    if config.iolog.random_drop > 0.0 {
        warn!(
            "random_drop is enabled ({}), connections will be dropped on purpose",
            config.iolog.random_drop
        );
    }

    Ok(Arc::new(ConnectionContext {
        server_id: config.server.server_id.clone(),
        store,
        event_log,
        relay,
        sock_timeout: config.sock_timeout(),
        commit_interval: config.ack_frequency(),
        shutdown_grace: config.shutdown_grace(),
        drop_probability: config.iolog.random_drop,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(root: &TempDir) -> Config {
        let mut config = Config::default();
        config.server.listen_address = vec!["127.0.0.1:0".into()];
        config.iolog.iolog_dir = root.path().to_path_buf();
        config
    }

    #[tokio::test]
    async fn accept_loop_forwards_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let handle = tokio::spawn(accept_loop(listener, None, tx));

        let client = TcpStream::connect(addr).await.unwrap();
        let conn = rx.recv().await.unwrap();
        assert_eq!(conn.peer.ip(), client.local_addr().unwrap().ip());
        assert!(conn.tls.is_none());
        handle.abort();
    }

    #[tokio::test]
    async fn context_is_local_mode_without_relay_hosts() {
        let root = TempDir::new().unwrap();
        let ctx = build_context(&test_config(&root)).unwrap();
        assert!(ctx.relay.is_none());
        assert_eq!(ctx.commit_interval, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn context_builds_relay_settings() {
        let root = TempDir::new().unwrap();
        let mut config = test_config(&root);
        config.relay.relay_host = vec!["logs.example.com".into(), "fallback:30999".into()];
        let ctx = build_context(&config).unwrap();
        let relay = ctx.relay.as_ref().unwrap();
        assert_eq!(relay.targets.len(), 2);
        assert_eq!(relay.targets[1].port, 30999);
    }

    #[tokio::test]
    async fn listeners_bind_configured_addresses() {
        let root = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let handles = spawn_listeners(&test_config(&root), tx).await.unwrap();
        assert_eq!(handles.len(), 1);
        for handle in handles {
            handle.abort();
        }
    }
}
