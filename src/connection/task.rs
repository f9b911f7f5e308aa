//! Async driver: wires one accepted socket to its state machine.
//!
//! The driver owns the read half, a writer task draining the outbound
//! queue, the commit-point timer and the optional relay link, and feeds
//! decoded frames to [`ConnectionClosure`] strictly in arrival order.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::io::ReadHalf;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use uuid::Uuid;

use crate::connection::closure::{ClosureOptions, ConnectionClosure, ConnectionState};
use crate::connection::stream::{spawn_frame_writer, BoxedStream};
use crate::error_handling::types::{ConnectionError, RelayError};
use crate::eventlog::EventLog;
use crate::iolog::store::IoLogStore;
use crate::protocol::codec::{decode_client, encode_frame, FrameReader};
use crate::protocol::messages::ServerMessage;
use crate::relay::forwarder::{RelayLink, RelaySettings};

/// Server-wide state shared by every connection. Connections hold an
/// `Arc` snapshot, so a configuration reload never disturbs them.
pub struct ConnectionContext {
    pub server_id: String,
    pub store: Arc<IoLogStore>,
    pub event_log: Arc<dyn EventLog>,
    pub relay: Option<Arc<RelaySettings>>,
    pub sock_timeout: Duration,
    pub commit_interval: Duration,
    pub shutdown_grace: Duration,
    pub drop_probability: f64,
}

/// Run one client connection to completion.
pub async fn serve_connection(
    stream: BoxedStream,
    peer: String,
    ctx: Arc<ConnectionContext>,
    shutdown: broadcast::Receiver<()>,
) {
    let id = Uuid::new_v4();
    info!("[{}] connection from {}", id, peer);
    match run(id, stream, peer, ctx, shutdown).await {
        Ok(()) => debug!("[{}] connection closed", id),
        Err(e) => warn!("[{}] connection closed: {}", id, e),
    }
}

async fn run(
    id: Uuid,
    stream: BoxedStream,
    peer: String,
    ctx: Arc<ConnectionContext>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ConnectionError> {
    let (rd, wr) = tokio::io::split(stream);
    let mut reader = FrameReader::new(rd);
    let (tx, rx) = mpsc::channel::<Bytes>(64);
    let mut writer = spawn_frame_writer(wr, rx, ctx.sock_timeout);

    let mut closure = ConnectionClosure::new(ClosureOptions {
        id,
        peer,
        server_id: ctx.server_id.clone(),
        relay_hosts: ctx.relay.as_ref().map(|r| r.hosts()),
        store: Arc::clone(&ctx.store),
        event_log: Arc::clone(&ctx.event_log),
        drop_probability: ctx.drop_probability,
    });

    // Relay mode: the upstream link is established, with connect-time
    // failover, before anything is said to the client.
    let mut relay_link = match &ctx.relay {
        Some(settings) => match RelayLink::connect(settings).await {
            Ok(link) => {
                closure.set_relay_host(link.host().to_string());
                Some(link)
            }
            Err(e) => {
                closure.fail("unable to connect to relay host".to_string());
                let _ = flush_client(&mut closure, &tx).await;
                finish(closure, None, tx, &mut writer, ctx.shutdown_grace).await;
                return Err(e.into());
            }
        },
        None => None,
    };

    let result = drive(&mut closure, &mut reader, &mut relay_link, &tx, &mut shutdown, &ctx).await;

    let result = match result {
        Err(ConnectionError::DebugDrop) => {
            // Synthetic crash: no farewell frame, just vanish.
            writer.abort();
            if let Err(e) = closure.close_session() {
                warn!("[{}] closing I/O log failed: {}", id, e);
            }
            return Err(ConnectionError::DebugDrop);
        }
        Err(e) => {
            // Best-effort error frame; suppressed if one was already sent.
            closure.fail(e.to_string());
            let _ = flush_client(&mut closure, &tx).await;
            Err(e)
        }
        Ok(()) => Ok(()),
    };

    finish(closure, relay_link, tx, &mut writer, ctx.shutdown_grace).await;
    result
}

async fn drive(
    closure: &mut ConnectionClosure,
    reader: &mut FrameReader<ReadHalf<BoxedStream>>,
    relay_link: &mut Option<RelayLink>,
    tx: &mpsc::Sender<Bytes>,
    shutdown: &mut broadcast::Receiver<()>,
    ctx: &ConnectionContext,
) -> Result<(), ConnectionError> {
    let mut client_open = true;
    let mut relay_open = relay_link.is_some();
    let mut shutdown_armed = true;
    let mut commit_deadline: Option<Instant> = None;

    loop {
        flush_client(closure, tx).await?;
        if let Some(link) = relay_link.as_ref() {
            for msg in closure.take_relay_outbound() {
                link.send(&msg).await?;
            }
        }
        if closure.immediate_commit() {
            closure.emit_commit_point()?;
            commit_deadline = None;
            continue;
        }
        if closure.state().is_terminal() || closure.state() == ConnectionState::Shutdown {
            return Ok(());
        }
        if closure.commit_needed() && commit_deadline.is_none() {
            commit_deadline = Some(Instant::now() + ctx.commit_interval);
        }
        if !client_open {
            // Peer disappeared mid-conversation; the log stays restartable.
            warn!(
                "[{}] unexpected EOF from client in state {}",
                closure.id(),
                closure.state().name()
            );
            return Ok(());
        }

        let deadline = commit_deadline;
        tokio::select! {
            res = shutdown.recv(), if shutdown_armed => {
                match res {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => closure.begin_shutdown(),
                    Err(broadcast::error::RecvError::Closed) => shutdown_armed = false,
                }
            }
            frame = reader.next_frame() => {
                match frame? {
                    Some(body) => closure.handle_client_message(decode_client(&body)?)?,
                    None => client_open = false,
                }
            }
            msg = next_relay(relay_link), if relay_open => {
                match msg? {
                    Some(m) => closure.handle_server_message(m)?,
                    None => {
                        relay_open = false;
                        if closure.state() != ConnectionState::Finished {
                            return Err(ConnectionError::Relay(RelayError::UnexpectedEof));
                        }
                    }
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                closure.emit_commit_point()?;
                commit_deadline = None;
            }
            _ = sleep(ctx.sock_timeout) => {
                return Err(ConnectionError::Timeout);
            }
        }
    }
}

async fn next_relay(link: &mut Option<RelayLink>) -> Result<Option<ServerMessage>, RelayError> {
    match link.as_mut() {
        Some(link) => link.next_message().await,
        None => std::future::pending().await,
    }
}

async fn flush_client(
    closure: &mut ConnectionClosure,
    tx: &mpsc::Sender<Bytes>,
) -> Result<(), ConnectionError> {
    for msg in closure.take_outbound() {
        let frame = encode_frame(&msg)?;
        tx.send(frame)
            .await
            .map_err(|_| ConnectionError::WriteQueueClosed)?;
    }
    Ok(())
}

/// Tear the connection down: close the log, drain the relay and client
/// write queues, and give up after the shutdown grace period.
async fn finish(
    mut closure: ConnectionClosure,
    relay_link: Option<RelayLink>,
    tx: mpsc::Sender<Bytes>,
    writer: &mut JoinHandle<Result<(), std::io::Error>>,
    grace: Duration,
) {
    if let Err(e) = closure.close_session() {
        warn!("[{}] closing I/O log failed: {}", closure.id(), e);
    }
    if let Some(link) = relay_link {
        let _ = timeout(grace, link.shutdown()).await;
    }
    drop(tx);
    let drained = timeout(grace, &mut *writer).await.is_ok();
    if !drained {
        warn!(
            "[{}] write queue did not drain within the shutdown timeout",
            closure.id()
        );
        writer.abort();
    }
}
