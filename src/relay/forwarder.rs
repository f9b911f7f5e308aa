//! Upstream relay link with connect-time failover.
//!
//! Candidates are walked strictly in order; only the initial connect phase
//! fails over. Once a session is running, any upstream failure is fatal to
//! the client connection.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, warn};
use rustls_pki_types::ServerName;
use tokio::io::ReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::connection::stream::{spawn_frame_writer, BoxedStream};
use crate::error_handling::types::RelayError;
use crate::protocol::codec::{decode_server, encode_frame, FrameReader};
use crate::protocol::messages::{client_message, ClientHello, ClientMessage, ServerMessage};

/// One upstream candidate host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTarget {
    pub host: String,
    pub port: u16,
}

impl RelayTarget {
    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Shared relay configuration. The candidate list is frozen for the
/// lifetime of every connection that references it.
pub struct RelaySettings {
    pub targets: Arc<[RelayTarget]>,
    /// TLS for the upstream hop, independent of the listener's TLS.
    pub connector: Option<TlsConnector>,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    /// Sent in the per-socket hello before any client frame.
    pub client_id: String,
}

impl RelaySettings {
    pub fn hosts(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.host.clone()).collect()
    }
}

/// An established connection to one upstream server.
pub struct RelayLink {
    host: String,
    reader: FrameReader<ReadHalf<BoxedStream>>,
    tx: mpsc::Sender<Bytes>,
    writer: JoinHandle<Result<(), std::io::Error>>,
}

impl RelayLink {
    /// Try each candidate in order and speak the per-socket hello on the
    /// first one that connects. Returns `CandidatesExhausted` when the
    /// whole list has been walked.
    pub async fn connect(settings: &RelaySettings) -> Result<RelayLink, RelayError> {
        for target in settings.targets.iter() {
            match Self::connect_one(target, settings).await {
                Ok(link) => return Ok(link),
                Err(e) => warn!("relay candidate {} failed: {}", target.addr(), e),
            }
        }
        Err(RelayError::CandidatesExhausted)
    }

    async fn connect_one(
        target: &RelayTarget,
        settings: &RelaySettings,
    ) -> Result<RelayLink, RelayError> {
        let addr = target.addr();
        let sock = match timeout(settings.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(sock)) => sock,
            Ok(Err(e)) => return Err(RelayError::ConnectFailed(addr, e)),
            Err(_) => return Err(RelayError::ConnectTimeout(addr)),
        };
        let _ = sock.set_nodelay(true);

        let stream: BoxedStream = match &settings.connector {
            Some(connector) => {
                let name = ServerName::try_from(target.host.clone())
                    .map_err(|e| RelayError::TlsError(e.to_string()))?;
                let tls = match timeout(settings.connect_timeout, connector.connect(name, sock)).await
                {
                    Ok(Ok(tls)) => tls,
                    Ok(Err(e)) => return Err(RelayError::TlsError(e.to_string())),
                    Err(_) => return Err(RelayError::ConnectTimeout(addr)),
                };
                Box::new(tls)
            }
            None => Box::new(sock),
        };
        debug!("connected to relay {}", addr);

        let (rd, wr) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(64);
        let writer = spawn_frame_writer(wr, rx, settings.write_timeout);
        let link = RelayLink {
            host: target.host.clone(),
            reader: FrameReader::new(rd),
            tx,
            writer,
        };
        link.send(&ClientMessage {
            msg: Some(client_message::Msg::HelloMsg(ClientHello {
                client_id: settings.client_id.clone(),
            })),
        })
        .await?;
        Ok(link)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Queue one re-framed client message for the upstream server.
    pub async fn send(&self, msg: &ClientMessage) -> Result<(), RelayError> {
        let frame = encode_frame(msg)?;
        self.tx
            .send(frame)
            .await
            .map_err(|_| RelayError::UnexpectedEof)
    }

    /// Next message from the upstream server; `None` on EOF. Safe to call
    /// from `select!`.
    pub async fn next_message(&mut self) -> Result<Option<ServerMessage>, RelayError> {
        match self.reader.next_frame().await? {
            Some(body) => Ok(Some(decode_server(&body)?)),
            None => Ok(None),
        }
    }

    /// Drain the write queue and close the upstream socket.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.writer.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::decode_client;
    use crate::protocol::messages::{server_message, ServerMessage};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn settings(targets: Vec<RelayTarget>) -> RelaySettings {
        RelaySettings {
            targets: targets.into(),
            connector: None,
            connect_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(2),
            client_id: "test relay".into(),
        }
    }

    async fn refused_target() -> RelayTarget {
        // Bind then drop to get a port that refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        RelayTarget {
            host: "127.0.0.1".into(),
            port,
        }
    }

    /// A minimal upstream: accepts one socket, expects the ClientHello and
    /// answers with a ServerHello carrying `server_id`.
    async fn spawn_upstream(server_id: &'static str) -> RelayTarget {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (rd, mut wr) = sock.into_split();
            let mut reader = FrameReader::new(rd);
            let body = reader.next_frame().await.unwrap().unwrap();
            let hello = decode_client(&body).unwrap();
            assert!(matches!(
                hello.msg,
                Some(client_message::Msg::HelloMsg(_))
            ));
            let reply = encode_frame(&ServerMessage::hello(server_id)).unwrap();
            wr.write_all(&reply).await.unwrap();
        });
        RelayTarget {
            host: "127.0.0.1".into(),
            port,
        }
    }

    #[tokio::test]
    async fn failover_walks_candidates_in_order() {
        let first = refused_target().await;
        let second = refused_target().await;
        let third = spawn_upstream("third upstream").await;

        let settings = settings(vec![first, second, third]);
        let mut link = RelayLink::connect(&settings).await.unwrap();

        // Only the reachable candidate answered; its hello arrives first.
        let msg = link.next_message().await.unwrap().unwrap();
        match msg.msg {
            Some(server_message::Msg::Hello(h)) => assert_eq!(h.server_id, "third upstream"),
            other => panic!("expected ServerHello, got {:?}", other),
        }
        link.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_candidates_is_an_error() {
        let first = refused_target().await;
        let second = refused_target().await;
        let settings = settings(vec![first, second]);
        assert!(matches!(
            RelayLink::connect(&settings).await,
            Err(RelayError::CandidatesExhausted)
        ));
    }
}
