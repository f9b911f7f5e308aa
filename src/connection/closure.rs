//! Per-connection protocol state machine.
//!
//! `ConnectionClosure` is synchronous: the async driver feeds it decoded
//! messages and drains the queued replies. That keeps every transition
//! unit-testable without sockets.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use uuid::Uuid;

use crate::error_handling::types::ConnectionError;
use crate::eventlog::{EventKind, EventLog, LoggedEvent};
use crate::iolog::info::LogInfo;
use crate::iolog::store::{IoLogSession, IoLogStore};
use crate::iolog::timing::IoStream;
use crate::protocol::messages::{
    client_message, server_message, AcceptMessage, AlertMessage, ChangeWindowSize, ClientHello,
    ClientMessage, CommandSuspend, ExitMessage, IoBuffer, RejectMessage, RestartMessage,
    ServerHello, ServerMessage, TimeSpec,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Relay mode only: upstream connection not yet established.
    Connecting,
    /// Waiting for the first event message.
    Initial,
    /// I/O buffers are expected.
    Running,
    /// Command exited, awaiting the final commit point.
    Exited,
    /// Conversation over; close once the write queue drains.
    Finished,
    /// An error frame has been queued; no further frames are sent.
    Error,
    /// Server is quitting; flush a final commit point and drain.
    Shutdown,
}

impl ConnectionState {
    pub fn name(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Initial => "INITIAL",
            ConnectionState::Running => "RUNNING",
            ConnectionState::Exited => "EXITED",
            ConnectionState::Finished => "FINISHED",
            ConnectionState::Error => "ERROR",
            ConnectionState::Shutdown => "SHUTDOWN",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Finished | ConnectionState::Error)
    }
}

pub struct ClosureOptions {
    pub id: Uuid,
    pub peer: String,
    pub server_id: String,
    /// `Some` puts the closure in relay mode; the list holds every
    /// configured candidate host name, used for log-id transcoding.
    pub relay_hosts: Option<Vec<String>>,
    pub store: Arc<IoLogStore>,
    pub event_log: Arc<dyn EventLog>,
    /// Debug-only: probability of synthetically dropping the connection
    /// after an I/O buffer has been persisted.
    pub drop_probability: f64,
}

pub struct ConnectionClosure {
    id: Uuid,
    peer: String,
    server_id: String,
    state: ConnectionState,
    log_io: bool,
    store: Arc<IoLogStore>,
    event_log: Arc<dyn EventLog>,
    session: Option<IoLogSession>,
    relay_hosts: Option<Vec<String>>,
    /// Host actually connected by the relay forwarder.
    relay_host: Option<String>,
    outbox: VecDeque<ServerMessage>,
    relay_outbox: VecDeque<ClientMessage>,
    error_str: Option<String>,
    commit_needed: bool,
    immediate_commit: bool,
    drop_probability: f64,
}

impl ConnectionClosure {
    pub fn new(opts: ClosureOptions) -> Self {
        let relay = opts.relay_hosts.is_some();
        let mut closure = ConnectionClosure {
            id: opts.id,
            peer: opts.peer,
            server_id: opts.server_id,
            state: if relay {
                ConnectionState::Connecting
            } else {
                ConnectionState::Initial
            },
            log_io: false,
            store: opts.store,
            event_log: opts.event_log,
            session: None,
            relay_hosts: opts.relay_hosts,
            relay_host: None,
            outbox: VecDeque::new(),
            relay_outbox: VecDeque::new(),
            error_str: None,
            commit_needed: false,
            immediate_commit: false,
            drop_probability: opts.drop_probability,
        };
        // Without a relay the server speaks first.
        if !relay {
            closure.push_hello();
        }
        closure
    }

    fn push_hello(&mut self) {
        let server_id = self.server_id.clone();
        self.outbox.push_back(ServerMessage::hello(&server_id));
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn log_io(&self) -> bool {
        self.log_io
    }

    pub fn is_relay(&self) -> bool {
        self.relay_hosts.is_some()
    }

    pub fn error_str(&self) -> Option<&str> {
        self.error_str.as_deref()
    }

    /// Called by the driver once the relay forwarder has a socket.
    pub fn set_relay_host(&mut self, host: String) {
        self.relay_host = Some(host);
    }

    /// True when a commit point has been requested for immediate delivery.
    pub fn immediate_commit(&self) -> bool {
        self.immediate_commit
    }

    /// True when I/O has been stored since the last commit point.
    pub fn commit_needed(&self) -> bool {
        self.commit_needed
    }

    pub fn take_outbound(&mut self) -> Vec<ServerMessage> {
        self.outbox.drain(..).collect()
    }

    pub fn take_relay_outbound(&mut self) -> Vec<ClientMessage> {
        self.relay_outbox.drain(..).collect()
    }

    fn state_error(&mut self, message: &'static str) -> ConnectionError {
        self.error_str = Some("state machine error".to_string());
        ConnectionError::StateMachine {
            state: self.state.name(),
            message,
        }
    }

    /// Dispatch one decoded client message.
    pub fn handle_client_message(&mut self, msg: ClientMessage) -> Result<(), ConnectionError> {
        let msg = msg
            .msg
            .ok_or_else(|| ConnectionError::InvalidMessage("empty ClientMessage".into()))?;
        debug!("[{}] received {}", self.id, msg.name());
        if self.is_relay() {
            return self.forward_client_message(msg);
        }
        match msg {
            client_message::Msg::AcceptMsg(m) => self.handle_accept(m),
            client_message::Msg::RejectMsg(m) => self.handle_reject(m),
            client_message::Msg::ExitMsg(m) => self.handle_exit(m),
            client_message::Msg::RestartMsg(m) => self.handle_restart(m),
            client_message::Msg::AlertMsg(m) => self.handle_alert(m),
            client_message::Msg::TtyinBuf(m) => self.handle_iobuf(IoStream::Ttyin, m),
            client_message::Msg::TtyoutBuf(m) => self.handle_iobuf(IoStream::Ttyout, m),
            client_message::Msg::StdinBuf(m) => self.handle_iobuf(IoStream::Stdin, m),
            client_message::Msg::StdoutBuf(m) => self.handle_iobuf(IoStream::Stdout, m),
            client_message::Msg::StderrBuf(m) => self.handle_iobuf(IoStream::Stderr, m),
            client_message::Msg::WinsizeEvent(m) => self.handle_winsize(m),
            client_message::Msg::SuspendEvent(m) => self.handle_suspend(m),
            client_message::Msg::HelloMsg(m) => self.handle_client_hello(m),
        }
    }

    fn submit_time(ts: Option<TimeSpec>) -> Result<i64, ConnectionError> {
        ts.map(|t| t.tv_sec)
            .ok_or_else(|| ConnectionError::InvalidMessage("missing submit_time".into()))
    }

    fn delay(ts: Option<TimeSpec>) -> Result<Duration, ConnectionError> {
        ts.and_then(TimeSpec::to_duration)
            .ok_or_else(|| ConnectionError::InvalidMessage("missing or negative delay".into()))
    }

    fn handle_accept(&mut self, msg: AcceptMessage) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Initial {
            return Err(self.state_error("AcceptMessage"));
        }
        let submit_time = Self::submit_time(msg.submit_time)?;
        self.event_log.log(
            &LoggedEvent::new(EventKind::Accept, submit_time, self.peer.clone())
                .with_info_msgs(&msg.info_msgs),
        )?;

        if !msg.expect_iobufs {
            // Single-event connection, nothing further expected.
            self.state = ConnectionState::Finished;
            return Ok(());
        }

        let log_info = LogInfo::from_info_msgs(submit_time, &msg.info_msgs)?;
        let session = self.store.create(&log_info)?;
        info!(
            "[{}] accepted command {} for {}, logging to {}",
            self.id, log_info.command, log_info.submit_user, session.log_id()
        );
        // Send the log ID so the client can restart the connection later.
        self.outbox
            .push_back(ServerMessage::log_id(session.log_id()));
        self.session = Some(session);
        self.log_io = true;
        self.state = ConnectionState::Running;
        Ok(())
    }

    fn handle_reject(&mut self, msg: RejectMessage) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Initial {
            return Err(self.state_error("RejectMessage"));
        }
        let submit_time = Self::submit_time(msg.submit_time)?;
        self.event_log.log(
            &LoggedEvent::new(EventKind::Reject, submit_time, self.peer.clone())
                .with_reason(&msg.reason)
                .with_info_msgs(&msg.info_msgs),
        )?;
        info!("[{}] command rejected: {}", self.id, msg.reason);
        self.state = ConnectionState::Finished;
        Ok(())
    }

    fn handle_exit(&mut self, msg: ExitMessage) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Running {
            return Err(self.state_error("ExitMessage"));
        }
        if !msg.signal.is_empty() {
            info!(
                "[{}] command was killed by SIG{}{}",
                self.id,
                msg.signal,
                if msg.dumped_core { " (core dumped)" } else { "" }
            );
        } else {
            info!("[{}] command exited with {}", self.id, msg.exit_value);
        }
        if self.log_io {
            // No more I/O, just the final commit point.
            self.state = ConnectionState::Exited;
            self.immediate_commit = true;
        } else {
            self.state = ConnectionState::Finished;
        }
        Ok(())
    }

    fn handle_restart(&mut self, msg: RestartMessage) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Initial {
            return Err(self.state_error("RestartMessage"));
        }
        let resume = Self::delay(msg.resume_point)?;
        match self.store.restart(&msg.log_id, resume) {
            Ok(session) => {
                info!("[{}] restarted log {}", self.id, session.log_id());
                self.session = Some(session);
                self.log_io = true;
                self.state = ConnectionState::Running;
                Ok(())
            }
            Err(e) => {
                // Not fatal to the conversation: queue an error frame so the
                // client can see why, then close once it drains.
                warn!("[{}] unable to restart log {}: {}", self.id, msg.log_id, e);
                let reason = e.to_string();
                self.error_str = Some(reason.clone());
                self.outbox.push_back(ServerMessage::error(reason));
                self.state = ConnectionState::Error;
                Ok(())
            }
        }
    }

    fn handle_alert(&mut self, msg: AlertMessage) -> Result<(), ConnectionError> {
        if !matches!(self.state, ConnectionState::Initial | ConnectionState::Running) {
            return Err(self.state_error("AlertMessage"));
        }
        let alert_time = Self::submit_time(msg.alert_time)?;
        self.event_log.log(
            &LoggedEvent::new(EventKind::Alert, alert_time, self.peer.clone())
                .with_reason(&msg.reason)
                .with_info_msgs(&msg.info_msgs),
        )?;
        Ok(())
    }

    fn handle_iobuf(&mut self, stream: IoStream, msg: IoBuffer) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Running || !self.log_io {
            return Err(self.state_error("IoBuffer"));
        }
        let delay = Self::delay(msg.delay)?;
        if let Some(session) = self.session.as_mut() {
            session.append_io(stream, delay, &msg.data)?;
        }
        self.commit_needed = true;
        if self.drop_probability > 0.0 && rand::random::<f64>() < self.drop_probability {
            warn!("[{}] dropping connection after stored IoBuffer", self.id);
            return Err(ConnectionError::DebugDrop);
        }
        Ok(())
    }

    fn handle_winsize(&mut self, msg: ChangeWindowSize) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Running || !self.log_io {
            return Err(self.state_error("ChangeWindowSize"));
        }
        let delay = Self::delay(msg.delay)?;
        if msg.rows <= 0 || msg.cols <= 0 {
            return Err(ConnectionError::InvalidMessage(format!(
                "window size {}x{} out of range",
                msg.rows, msg.cols
            )));
        }
        if let Some(session) = self.session.as_mut() {
            session.append_winsize(delay, msg.rows as u32, msg.cols as u32)?;
        }
        self.commit_needed = true;
        Ok(())
    }

    fn handle_suspend(&mut self, msg: CommandSuspend) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Running || !self.log_io {
            return Err(self.state_error("CommandSuspend"));
        }
        let delay = Self::delay(msg.delay)?;
        if msg.signal.is_empty() {
            return Err(ConnectionError::InvalidMessage("empty suspend signal".into()));
        }
        if let Some(session) = self.session.as_mut() {
            session.append_suspend(delay, &msg.signal)?;
        }
        self.commit_needed = true;
        Ok(())
    }

    fn handle_client_hello(&mut self, msg: ClientHello) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Initial {
            return Err(self.state_error("ClientHello"));
        }
        debug!("[{}] client identifies as {:?}", self.id, msg.client_id);
        Ok(())
    }

    /// Flush the session and queue a commit-point acknowledgement carrying
    /// the elapsed time committed so far.
    pub fn emit_commit_point(&mut self) -> Result<(), ConnectionError> {
        self.commit_needed = false;
        self.immediate_commit = false;
        let elapsed = match self.session.as_mut() {
            Some(session) => {
                session.flush()?;
                session.elapsed()
            }
            None => return Ok(()),
        };
        debug!(
            "[{}] sending commit point [{}.{:09}]",
            self.id,
            elapsed.as_secs(),
            elapsed.subsec_nanos()
        );
        self.outbox.push_back(ServerMessage::commit_point(elapsed));
        if self.state == ConnectionState::Exited {
            self.state = ConnectionState::Finished;
        }
        Ok(())
    }

    /// Server is quitting: schedule the final commit point and stop
    /// accepting frames.
    pub fn begin_shutdown(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        info!("[{}] shutting down in state {}", self.id, self.state.name());
        self.state = ConnectionState::Shutdown;
        if self.log_io && self.session.is_some() {
            self.immediate_commit = true;
        }
    }

    /// Record a fatal error and queue a best-effort error frame unless one
    /// was already sent.
    pub fn fail(&mut self, reason: String) {
        if self.state == ConnectionState::Error {
            return;
        }
        self.error_str.get_or_insert_with(|| reason.clone());
        self.outbox.push_back(ServerMessage::error(reason));
        self.state = ConnectionState::Error;
    }

    /// Close the I/O log, marking it complete when the conversation
    /// finished normally.
    pub fn close_session(&mut self) -> Result<(), ConnectionError> {
        if let Some(session) = self.session.take() {
            let complete = self.state == ConnectionState::Finished;
            session.close(complete)?;
        }
        Ok(())
    }

    // Relay mode -----------------------------------------------------------

    /// Re-frame a client message toward the upstream relay, translating
    /// fields that are namespaced per hop.
    fn forward_client_message(&mut self, msg: client_message::Msg) -> Result<(), ConnectionError> {
        use client_message::Msg;
        let forwarded = match msg {
            Msg::AcceptMsg(m) => {
                if self.state != ConnectionState::Initial {
                    return Err(self.state_error("AcceptMessage"));
                }
                if m.expect_iobufs {
                    self.log_io = true;
                }
                self.state = ConnectionState::Running;
                Msg::AcceptMsg(m)
            }
            Msg::RejectMsg(m) => {
                if self.state != ConnectionState::Initial {
                    return Err(self.state_error("RejectMessage"));
                }
                self.state = ConnectionState::Finished;
                Msg::RejectMsg(m)
            }
            Msg::ExitMsg(m) => {
                if self.state != ConnectionState::Running {
                    return Err(self.state_error("ExitMessage"));
                }
                self.state = if self.log_io {
                    ConnectionState::Exited
                } else {
                    ConnectionState::Finished
                };
                Msg::ExitMsg(m)
            }
            Msg::RestartMsg(mut m) => {
                if self.state != ConnectionState::Initial {
                    return Err(self.state_error("RestartMessage"));
                }
                m.log_id = self.strip_relay_suffix(&m.log_id);
                self.log_io = true;
                self.state = ConnectionState::Running;
                Msg::RestartMsg(m)
            }
            Msg::AlertMsg(m) => {
                if !matches!(self.state, ConnectionState::Initial | ConnectionState::Running) {
                    return Err(self.state_error("AlertMessage"));
                }
                Msg::AlertMsg(m)
            }
            Msg::HelloMsg(m) => {
                if self.state != ConnectionState::Initial {
                    return Err(self.state_error("ClientHello"));
                }
                debug!("[{}] client identifies as {:?}", self.id, m.client_id);
                return Ok(());
            }
            other => {
                // The five I/O buffer kinds plus winsize/suspend.
                if self.state != ConnectionState::Running || !self.log_io {
                    return Err(self.state_error(other.name()));
                }
                other
            }
        };
        self.relay_outbox.push_back(ClientMessage {
            msg: Some(forwarded),
        });
        Ok(())
    }

    /// The log ID handed to the client had `"/<relayhost>"` appended; take
    /// that component back off before forwarding a restart upstream.
    fn strip_relay_suffix(&self, log_id: &str) -> String {
        if let Some((prefix, last)) = log_id.rsplit_once('/') {
            let known = self
                .relay_hosts
                .as_ref()
                .map(|hosts| hosts.iter().any(|h| h == last))
                .unwrap_or(false);
            if known {
                return prefix.to_string();
            }
        }
        log_id.to_string()
    }

    /// Dispatch one message received from the upstream relay.
    pub fn handle_server_message(&mut self, msg: ServerMessage) -> Result<(), ConnectionError> {
        let msg = msg
            .msg
            .ok_or_else(|| ConnectionError::InvalidMessage("empty ServerMessage".into()))?;
        match msg {
            server_message::Msg::Hello(m) => self.handle_relay_hello(m),
            server_message::Msg::CommitPoint(ts) => self.handle_relay_commit(ts),
            server_message::Msg::LogId(id) => {
                // Tag the ID with the relay host so a later restart routes
                // back through the same chain.
                let tagged = match &self.relay_host {
                    Some(host) => format!("{}/{}", id, host),
                    None => id,
                };
                self.outbox.push_back(ServerMessage::log_id(tagged));
                Ok(())
            }
            server_message::Msg::Error(e) => {
                warn!("[{}] error from relay: {}", self.id, e);
                self.error_str = Some(e.clone());
                self.outbox
                    .push_back(ServerMessage { msg: Some(server_message::Msg::Error(e)) });
                self.state = ConnectionState::Error;
                Ok(())
            }
            server_message::Msg::Abort(e) => {
                warn!("[{}] abort from relay: {}", self.id, e);
                self.error_str = Some(e.clone());
                self.outbox
                    .push_back(ServerMessage { msg: Some(server_message::Msg::Abort(e)) });
                self.state = ConnectionState::Error;
                Ok(())
            }
        }
    }

    fn handle_relay_hello(&mut self, msg: ServerHello) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Connecting {
            return Err(self.state_error("ServerHello"));
        }
        if msg.server_id.is_empty() {
            return Err(ConnectionError::Relay(
                crate::error_handling::types::RelayError::Protocol(
                    "invalid ServerHello, missing server_id".into(),
                ),
            ));
        }
        debug!(
            "[{}] relay {} identifies as {:?}",
            self.id,
            self.relay_host.as_deref().unwrap_or("?"),
            msg.server_id
        );
        // Upstream is ready; now greet the actual client.
        self.state = ConnectionState::Initial;
        self.push_hello();
        Ok(())
    }

    fn handle_relay_commit(&mut self, ts: TimeSpec) -> Result<(), ConnectionError> {
        if !matches!(
            self.state,
            ConnectionState::Running | ConnectionState::Exited | ConnectionState::Shutdown
        ) {
            return Err(self.state_error("CommitPoint"));
        }
        self.outbox.push_back(ServerMessage {
            msg: Some(server_message::Msg::CommitPoint(ts)),
        });
        if self.state == ConnectionState::Exited {
            self.state = ConnectionState::Finished;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    #[cfg(test)]
    pub(crate) fn session(&self) -> Option<&IoLogSession> {
        self.session.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventlog::types::NullEventLog;
    use crate::iolog::store::{read_stream, IoLogStoreOptions};
    use crate::protocol::messages::info_message::{StringList, Value};
    use crate::protocol::messages::InfoMessage;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct MemEventLog {
        events: Mutex<Vec<LoggedEvent>>,
    }

    impl MemEventLog {
        fn new() -> Self {
            MemEventLog {
                events: Mutex::new(Vec::new()),
            }
        }
    }

    impl EventLog for MemEventLog {
        fn log(&self, event: &LoggedEvent) -> Result<(), crate::error_handling::types::EventLogError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn closure_with(
        root: &TempDir,
        event_log: Arc<dyn EventLog>,
        relay_hosts: Option<Vec<String>>,
    ) -> ConnectionClosure {
        let store = Arc::new(IoLogStore::new(IoLogStoreOptions {
            root: root.path().to_path_buf(),
            ..Default::default()
        }));
        ConnectionClosure::new(ClosureOptions {
            id: Uuid::new_v4(),
            peer: "192.0.2.1:40000".into(),
            server_id: "test server".into(),
            relay_hosts,
            store,
            event_log,
            drop_probability: 0.0,
        })
    }

    fn info(key: &str, value: Value) -> InfoMessage {
        InfoMessage {
            key: key.to_string(),
            value: Some(value),
        }
    }

    fn accept_msg(expect_iobufs: bool) -> client_message::Msg {
        client_message::Msg::AcceptMsg(AcceptMessage {
            submit_time: Some(TimeSpec::new(1_700_000_000, 0)),
            info_msgs: vec![
                info("submituser", Value::Strval("alice".into())),
                info("submithost", Value::Strval("buildbox".into())),
                info("command", Value::Strval("/bin/ls".into())),
                info(
                    "runargv",
                    Value::Strlistval(StringList {
                        strings: vec!["/bin/ls".into()],
                    }),
                ),
            ],
            expect_iobufs,
        })
    }

    fn stdout_buf(millis: u64, data: &[u8]) -> client_message::Msg {
        client_message::Msg::StdoutBuf(IoBuffer {
            delay: Some(TimeSpec::from(Duration::from_millis(millis))),
            data: data.to_vec(),
        })
    }

    fn exit_msg() -> client_message::Msg {
        client_message::Msg::ExitMsg(ExitMessage {
            run_time: Some(TimeSpec::new(1, 0)),
            exit_value: 0,
            dumped_core: false,
            signal: String::new(),
            error: String::new(),
        })
    }

    fn wrap(msg: client_message::Msg) -> ClientMessage {
        ClientMessage { msg: Some(msg) }
    }

    fn commit_points(msgs: &[ServerMessage]) -> Vec<Duration> {
        msgs.iter()
            .filter_map(|m| match &m.msg {
                Some(server_message::Msg::CommitPoint(ts)) => ts.to_duration(),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn fresh_accept_io_exit_scenario() {
        let root = TempDir::new().unwrap();
        let events = Arc::new(MemEventLog::new());
        let mut closure = closure_with(&root, events.clone(), None);

        // Server speaks first.
        let hello = closure.take_outbound();
        assert!(matches!(
            hello[0].msg,
            Some(server_message::Msg::Hello(_))
        ));

        closure.handle_client_message(wrap(accept_msg(true))).unwrap();
        assert_eq!(closure.state(), ConnectionState::Running);
        let replies = closure.take_outbound();
        assert!(matches!(
            &replies[0].msg,
            Some(server_message::Msg::LogId(id)) if id == "aa/aa/aa"
        ));

        for (millis, data) in [
            (100, &b"1234567890"[..]),
            (200, &b"abcdefghijklmnop"[..]),
            (300, &b"0123456789ABCDEF"[..]),
        ] {
            closure.handle_client_message(wrap(stdout_buf(millis, data))).unwrap();
        }
        closure.handle_client_message(wrap(exit_msg())).unwrap();
        assert_eq!(closure.state(), ConnectionState::Exited);
        assert!(closure.immediate_commit());

        closure.emit_commit_point().unwrap();
        assert_eq!(closure.state(), ConnectionState::Finished);
        let acks = commit_points(&closure.take_outbound());
        assert_eq!(acks, vec![Duration::from_millis(600)]);

        // One session directory, 42 stdout bytes, three timing records.
        let dir = root.path().join("aa/aa/aa");
        assert_eq!(read_stream(&dir, IoStream::Stdout).unwrap().len(), 42);
        let timing = std::fs::read_to_string(dir.join("timing")).unwrap();
        assert_eq!(timing.lines().count(), 3);
        assert!(!root.path().join("aa/aa/ab").exists());

        closure.close_session().unwrap();
        // Completed log cannot be restarted.
        let mut closure = closure_with(&root, events, None);
        closure
            .handle_client_message(wrap(client_message::Msg::RestartMsg(RestartMessage {
                log_id: "aa/aa/aa".into(),
                resume_point: Some(TimeSpec::new(0, 0)),
            })))
            .unwrap();
        assert_eq!(closure.state(), ConnectionState::Error);
    }

    #[test]
    fn reject_without_io_scenario() {
        let root = TempDir::new().unwrap();
        let events = Arc::new(MemEventLog::new());
        let mut closure = closure_with(&root, events.clone(), None);
        closure.take_outbound();

        closure
            .handle_client_message(wrap(client_message::Msg::RejectMsg(RejectMessage {
                submit_time: Some(TimeSpec::new(1_700_000_000, 0)),
                reason: "not permitted".into(),
                info_msgs: vec![info("submituser", Value::Strval("mallory".into()))],
            })))
            .unwrap();

        assert_eq!(closure.state(), ConnectionState::Finished);
        // Event handed to the logging collaborator, no commit point, no dir.
        let logged = events.events.lock().unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].kind, EventKind::Reject);
        assert!(commit_points(&closure.take_outbound()).is_empty());
        assert!(std::fs::read_dir(root.path()).unwrap().next().is_none());
    }

    #[test]
    fn accept_without_iobufs_finishes_immediately() {
        let root = TempDir::new().unwrap();
        let mut closure = closure_with(&root, Arc::new(NullEventLog), None);
        closure.take_outbound();
        closure.handle_client_message(wrap(accept_msg(false))).unwrap();
        assert_eq!(closure.state(), ConnectionState::Finished);
        assert!(closure.take_outbound().is_empty());
        assert!(std::fs::read_dir(root.path()).unwrap().next().is_none());
    }

    #[test]
    fn restart_mismatch_scenario() {
        let root = TempDir::new().unwrap();
        let events = Arc::new(MemEventLog::new());
        let mut closure = closure_with(&root, events.clone(), None);
        closure.take_outbound();
        closure.handle_client_message(wrap(accept_msg(true))).unwrap();
        closure.handle_client_message(wrap(stdout_buf(50_000, b"x"))).unwrap();
        closure.handle_client_message(wrap(exit_msg())).unwrap();
        closure.emit_commit_point().unwrap();
        closure.take_outbound();
        // Leave the log restartable.
        closure.set_state(ConnectionState::Shutdown);
        closure.close_session().unwrap();

        let timing_before =
            std::fs::read_to_string(root.path().join("aa/aa/aa/timing")).unwrap();

        let mut closure = closure_with(&root, events, None);
        closure.take_outbound();
        closure
            .handle_client_message(wrap(client_message::Msg::RestartMsg(RestartMessage {
                log_id: "aa/aa/aa".into(),
                resume_point: Some(TimeSpec::new(99, 0)),
            })))
            .unwrap();
        assert_eq!(closure.state(), ConnectionState::Error);
        let replies = closure.take_outbound();
        assert!(matches!(
            &replies[0].msg,
            Some(server_message::Msg::Error(_))
        ));
        // Nothing was written.
        let timing_after =
            std::fs::read_to_string(root.path().join("aa/aa/aa/timing")).unwrap();
        assert_eq!(timing_before, timing_after);
    }

    #[test]
    fn invalid_state_message_pairs_set_error_and_do_not_mutate() {
        let root = TempDir::new().unwrap();

        let all_messages = || -> Vec<client_message::Msg> {
            let iobuf = IoBuffer {
                delay: Some(TimeSpec::new(0, 0)),
                data: b"x".to_vec(),
            };
            vec![
                accept_msg(true),
                client_message::Msg::RejectMsg(RejectMessage {
                    submit_time: Some(TimeSpec::new(0, 0)),
                    reason: "no".into(),
                    info_msgs: vec![],
                }),
                exit_msg(),
                client_message::Msg::RestartMsg(RestartMessage {
                    log_id: "aa/aa/aa".into(),
                    resume_point: Some(TimeSpec::new(0, 0)),
                }),
                client_message::Msg::AlertMsg(AlertMessage {
                    alert_time: Some(TimeSpec::new(0, 0)),
                    reason: "alert".into(),
                    info_msgs: vec![],
                }),
                client_message::Msg::TtyinBuf(iobuf.clone()),
                client_message::Msg::TtyoutBuf(iobuf.clone()),
                client_message::Msg::StdinBuf(iobuf.clone()),
                client_message::Msg::StdoutBuf(iobuf.clone()),
                client_message::Msg::StderrBuf(iobuf),
                client_message::Msg::WinsizeEvent(ChangeWindowSize {
                    delay: Some(TimeSpec::new(0, 0)),
                    rows: 24,
                    cols: 80,
                }),
                client_message::Msg::SuspendEvent(CommandSuspend {
                    delay: Some(TimeSpec::new(0, 0)),
                    signal: "TSTP".into(),
                }),
                client_message::Msg::HelloMsg(ClientHello {
                    client_id: "c".into(),
                }),
            ]
        };

        let valid = |state: ConnectionState, msg: &client_message::Msg| -> bool {
            use client_message::Msg;
            match state {
                ConnectionState::Initial => matches!(
                    msg,
                    Msg::AcceptMsg(_)
                        | Msg::RejectMsg(_)
                        | Msg::RestartMsg(_)
                        | Msg::AlertMsg(_)
                        | Msg::HelloMsg(_)
                ),
                ConnectionState::Running => matches!(
                    msg,
                    Msg::ExitMsg(_)
                        | Msg::AlertMsg(_)
                        | Msg::TtyinBuf(_)
                        | Msg::TtyoutBuf(_)
                        | Msg::StdinBuf(_)
                        | Msg::StdoutBuf(_)
                        | Msg::StderrBuf(_)
                        | Msg::WinsizeEvent(_)
                        | Msg::SuspendEvent(_)
                ),
                _ => false,
            }
        };

        for state in [
            ConnectionState::Connecting,
            ConnectionState::Initial,
            ConnectionState::Exited,
            ConnectionState::Finished,
            ConnectionState::Error,
            ConnectionState::Shutdown,
        ] {
            for msg in all_messages() {
                if valid(state, &msg) {
                    continue;
                }
                let mut closure = closure_with(&root, Arc::new(NullEventLog), None);
                closure.take_outbound();
                closure.set_state(state);
                let name = msg.name();
                let result = closure.handle_client_message(wrap(msg));
                assert!(
                    matches!(result, Err(ConnectionError::StateMachine { .. })),
                    "({:?}, {}) should be a state machine error",
                    state,
                    name
                );
                assert!(closure.session().is_none(), "({:?}, {}) touched the session", state, name);
                assert_eq!(closure.error_str(), Some("state machine error"));
            }
        }
    }

    #[test]
    fn relay_translates_log_ids() {
        let root = TempDir::new().unwrap();
        let mut closure = closure_with(
            &root,
            Arc::new(NullEventLog),
            Some(vec!["upstream1".into(), "upstream2".into()]),
        );
        assert_eq!(closure.state(), ConnectionState::Connecting);
        // Nothing is sent to the client until the relay says hello.
        assert!(closure.take_outbound().is_empty());

        closure.set_relay_host("upstream2".into());
        closure
            .handle_server_message(ServerMessage::hello("relay server"))
            .unwrap();
        assert_eq!(closure.state(), ConnectionState::Initial);
        let out = closure.take_outbound();
        assert!(matches!(out[0].msg, Some(server_message::Msg::Hello(_))));

        // Upstream log IDs get the relay host appended.
        closure
            .handle_server_message(ServerMessage::log_id("aa/bb/cc"))
            .unwrap();
        let out = closure.take_outbound();
        assert!(matches!(
            &out[0].msg,
            Some(server_message::Msg::LogId(id)) if id == "aa/bb/cc/upstream2"
        ));

        // A restart strips the relay component before forwarding.
        closure
            .handle_client_message(wrap(client_message::Msg::RestartMsg(RestartMessage {
                log_id: "aa/bb/cc/upstream1".into(),
                resume_point: Some(TimeSpec::new(10, 0)),
            })))
            .unwrap();
        let forwarded = closure.take_relay_outbound();
        assert!(matches!(
            &forwarded[0].msg,
            Some(client_message::Msg::RestartMsg(m)) if m.log_id == "aa/bb/cc"
        ));
        assert_eq!(closure.state(), ConnectionState::Running);
    }

    #[test]
    fn relay_passes_commit_points_and_errors_through() {
        let root = TempDir::new().unwrap();
        let mut closure = closure_with(&root, Arc::new(NullEventLog), Some(vec!["up".into()]));
        closure.set_relay_host("up".into());
        closure
            .handle_server_message(ServerMessage::hello("relay"))
            .unwrap();
        closure.take_outbound();

        closure.handle_client_message(wrap(accept_msg(true))).unwrap();
        assert_eq!(closure.state(), ConnectionState::Running);
        // The accept is forwarded, not stored.
        assert_eq!(closure.take_relay_outbound().len(), 1);
        assert!(closure.session().is_none());

        closure
            .handle_server_message(ServerMessage::commit_point(Duration::from_secs(3)))
            .unwrap();
        let acks = commit_points(&closure.take_outbound());
        assert_eq!(acks, vec![Duration::from_secs(3)]);

        // After exit, the relayed commit point finishes the conversation.
        closure.handle_client_message(wrap(exit_msg())).unwrap();
        assert_eq!(closure.state(), ConnectionState::Exited);
        closure
            .handle_server_message(ServerMessage::commit_point(Duration::from_secs(3)))
            .unwrap();
        assert_eq!(closure.state(), ConnectionState::Finished);

        // Upstream errors force ERROR and pass the frame through.
        let mut closure = closure_with(&root, Arc::new(NullEventLog), Some(vec!["up".into()]));
        closure.set_relay_host("up".into());
        closure
            .handle_server_message(ServerMessage::hello("relay"))
            .unwrap();
        closure.take_outbound();
        closure
            .handle_server_message(ServerMessage::error("disk full"))
            .unwrap();
        assert_eq!(closure.state(), ConnectionState::Error);
        let out = closure.take_outbound();
        assert!(matches!(
            &out[0].msg,
            Some(server_message::Msg::Error(e)) if e == "disk full"
        ));
    }

    #[test]
    fn drop_knob_fails_after_persisting() {
        let root = TempDir::new().unwrap();
        let store = Arc::new(IoLogStore::new(IoLogStoreOptions {
            root: root.path().to_path_buf(),
            ..Default::default()
        }));
        let mut closure = ConnectionClosure::new(ClosureOptions {
            id: Uuid::new_v4(),
            peer: "192.0.2.1:40000".into(),
            server_id: "test server".into(),
            relay_hosts: None,
            store: Arc::clone(&store),
            event_log: Arc::new(NullEventLog),
            drop_probability: 1.0,
        });
        closure.take_outbound();
        closure.handle_client_message(wrap(accept_msg(true))).unwrap();

        // The connection dies, but only after the buffer hit the log.
        let result = closure.handle_client_message(wrap(stdout_buf(125, b"kept")));
        assert!(matches!(result, Err(ConnectionError::DebugDrop)));
        closure.set_state(ConnectionState::Shutdown);
        closure.close_session().unwrap();
        let dir = root.path().join("aa/aa/aa");
        assert_eq!(read_stream(&dir, IoStream::Stdout).unwrap(), b"kept");

        // A restart at the persisted boundary then succeeds.
        let resumed = store.restart("aa/aa/aa", Duration::from_millis(125)).unwrap();
        assert_eq!(resumed.elapsed(), Duration::from_millis(125));
    }

    #[test]
    fn shutdown_schedules_final_commit() {
        let root = TempDir::new().unwrap();
        let mut closure = closure_with(&root, Arc::new(NullEventLog), None);
        closure.take_outbound();
        closure.handle_client_message(wrap(accept_msg(true))).unwrap();
        closure.handle_client_message(wrap(stdout_buf(500, b"data"))).unwrap();
        closure.take_outbound();

        closure.begin_shutdown();
        assert_eq!(closure.state(), ConnectionState::Shutdown);
        assert!(closure.immediate_commit());
        closure.emit_commit_point().unwrap();
        let acks = commit_points(&closure.take_outbound());
        assert_eq!(acks, vec![Duration::from_millis(500)]);
        // Shut-down logs stay restartable.
        closure.close_session().unwrap();
        let mode = std::fs::metadata(root.path().join("aa/aa/aa/timing"))
            .unwrap()
            .permissions();
        use std::os::unix::fs::PermissionsExt;
        assert_ne!(mode.mode() & 0o200, 0);
    }
}
