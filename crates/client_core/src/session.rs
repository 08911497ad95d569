//! One websocket link to the message server.
//!
//! The session object outlives its transport: `close` drops the socket but
//! keeps subscribers and the outbound queue, and a later `open` reconnects
//! and flushes whatever was queued in the meantime.

use std::{
    collections::VecDeque,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::{
    config::MessageEndpoints,
    error::SessionError,
    identity::IdentityProvider,
    subscription::{Registry, Subscription},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Event types a session dispatches. `Opened` and `Closed` carry an empty payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    Message,
    Opened,
    Closed,
}

pub type EventCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct Link {
    state: ConnectionState,
    pending: VecDeque<String>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    generation: u64,
}

pub struct ConnectionSession {
    endpoints: MessageEndpoints,
    identity: Arc<dyn IdentityProvider>,
    connect_timeout: Duration,
    link: Mutex<Link>,
    on_message: Registry<EventCallback>,
    on_opened: Registry<EventCallback>,
    on_closed: Registry<EventCallback>,
}

impl ConnectionSession {
    pub fn new(
        endpoints: MessageEndpoints,
        identity: Arc<dyn IdentityProvider>,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            endpoints,
            identity,
            connect_timeout,
            link: Mutex::new(Link {
                state: ConnectionState::Closed,
                pending: VecDeque::new(),
                outbound: None,
                reader: None,
                writer: None,
                generation: 0,
            }),
            on_message: Registry::new(),
            on_opened: Registry::new(),
            on_closed: Registry::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.link().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn pending_len(&self) -> usize {
        self.link().pending.len()
    }

    /// Connects as the current user and flushes queued payloads in FIFO order.
    pub async fn open(self: &Arc<Self>) -> Result<(), SessionError> {
        let generation = {
            let mut link = self.link();
            match link.state {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Connecting => {
                    debug!("message session already connecting");
                    return Ok(());
                }
                ConnectionState::Closed => {}
            }
            link.state = ConnectionState::Connecting;
            link.generation += 1;
            link.generation
        };

        let Some(user_id) = self.identity.current_user_id() else {
            self.abandon_connect(generation);
            return Err(SessionError::MissingIdentity);
        };
        let url = self.endpoints.message_socket_url(&user_id);

        let stream = match tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
        {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(err)) => {
                self.abandon_connect(generation);
                warn!(%url, error = %err, "message socket connect failed");
                return Err(SessionError::Transport(err));
            }
            Err(_) => {
                self.abandon_connect(generation);
                warn!(%url, timeout = ?self.connect_timeout, "message socket connect timed out");
                return Err(SessionError::ConnectTimeout(self.connect_timeout));
            }
        };
        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let flushed = {
            let mut link = self.link();
            if link.generation != generation {
                return Err(SessionError::Protocol(
                    "session closed while connecting".into(),
                ));
            }

            let flushed = link.pending.len();
            for payload in link.pending.drain(..) {
                // The receiver is alive until the writer task below exits.
                let _ = tx.send(Message::Text(payload));
            }

            let session = Arc::downgrade(self);
            link.writer = Some(tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    if let Err(err) = sink.send(frame).await {
                        warn!(error = %err, "message socket send failed");
                        if let Some(session) = session.upgrade() {
                            session.mark_closed(generation);
                        }
                        return;
                    }
                }
                let _ = sink.close().await;
            }));

            let session: Weak<Self> = Arc::downgrade(self);
            link.reader = Some(tokio::spawn(async move {
                while let Some(frame) = source.next().await {
                    match frame {
                        Ok(Message::Text(text)) => {
                            let Some(session) = session.upgrade() else {
                                return;
                            };
                            session.dispatch(SessionEvent::Message, &text);
                        }
                        Ok(Message::Binary(bytes)) => {
                            let err = SessionError::Protocol(format!(
                                "unexpected binary frame of {} bytes",
                                bytes.len()
                            ));
                            error!(error = %err, "dropping inbound message");
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(err) => {
                            warn!(error = %err, "message socket receive failed");
                            break;
                        }
                    }
                }
                if let Some(session) = session.upgrade() {
                    session.mark_closed(generation);
                }
            }));

            link.outbound = Some(tx);
            link.state = ConnectionState::Open;
            flushed
        };

        info!(%url, flushed, "message session open");
        self.dispatch(SessionEvent::Opened, "");
        Ok(())
    }

    /// Drops the transport. Queued payloads are kept for the next `open`.
    pub fn close(&self) {
        let was_open = {
            let mut link = self.link();
            let was_open = link.state == ConnectionState::Open;
            link.generation += 1;
            link.state = ConnectionState::Closed;
            // Dropping the sender lets the writer drain and send a close frame.
            link.outbound = None;
            link.writer = None;
            if let Some(reader) = link.reader.take() {
                reader.abort();
            }
            was_open
        };
        if was_open {
            info!("message session closed");
            self.dispatch(SessionEvent::Closed, "");
        }
    }

    /// Transmits now when open, otherwise queues for the next `open`.
    pub fn send(&self, payload: String) {
        let mut link = self.link();
        if link.state == ConnectionState::Open {
            if let Some(outbound) = &link.outbound {
                match outbound.send(Message::Text(payload)) {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(Message::Text(payload))) => {
                        link.pending.push_back(payload);
                        return;
                    }
                    Err(_) => return,
                }
            }
        }
        debug!(queued = link.pending.len() + 1, "message session not open; queueing payload");
        link.pending.push_back(payload);
    }

    pub fn subscribe(
        &self,
        event: SessionEvent,
        callback: impl Fn(&str) + Send + Sync + 'static,
    ) -> Subscription {
        self.registry(event).insert(Arc::new(callback))
    }

    fn registry(&self, event: SessionEvent) -> &Registry<EventCallback> {
        match event {
            SessionEvent::Message => &self.on_message,
            SessionEvent::Opened => &self.on_opened,
            SessionEvent::Closed => &self.on_closed,
        }
    }

    fn dispatch(&self, event: SessionEvent, payload: &str) {
        for callback in self.registry(event).snapshot() {
            if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
                error!(?event, "session subscriber panicked");
            }
        }
    }

    fn abandon_connect(&self, generation: u64) {
        let mut link = self.link();
        if link.generation == generation {
            link.state = ConnectionState::Closed;
        }
    }

    /// Transport-initiated close. Ignored when a newer link has replaced `generation`.
    fn mark_closed(&self, generation: u64) {
        {
            let mut link = self.link();
            if link.generation != generation || link.state != ConnectionState::Open {
                return;
            }
            link.state = ConnectionState::Closed;
            link.outbound = None;
            link.reader = None;
            link.writer = None;
        }
        info!("message socket closed by transport");
        self.dispatch(SessionEvent::Closed, "");
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        let link = self.link.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(reader) = link.reader.take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
