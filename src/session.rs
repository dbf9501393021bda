//! gatt session: lifecycle state machine and the event-routing actor

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chunk;
use crate::reassembly::WriteReassembler;
use crate::transport::{GattTransport, ServiceDefinition};
use crate::Error;

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// identifier the transport assigns to an in-flight request; prepared-write
/// fragments sharing an id belong to one transaction
pub type RequestId = u32;

/// whether the gatt service is registered and ready for connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Starting,
    Listening,
}

/// status a response frame is tagged with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    Failure,
}

/// one response frame sent back for a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattResponse {
    pub status: ResponseStatus,
    pub offset: u64,
    pub value: Bytes,
}

/// transport-originated events, funnelled onto a single channel so every
/// mutation of session state happens on one task
#[derive(Debug)]
pub enum GattEvent {
    /// the platform acknowledged service registration
    ServiceRegistered,
    /// read of the payload characteristic; every fragment goes back through
    /// the responder as its own frame, in index order
    Read {
        request_id: RequestId,
        offset: u64,
        responder: mpsc::UnboundedSender<GattResponse>,
    },
    /// write to the name characteristic; prepared fragments are buffered
    /// under `request_id` until an execute arrives
    Write {
        request_id: RequestId,
        prepared: bool,
        response_needed: bool,
        offset: u64,
        value: Vec<u8>,
        responder: oneshot::Sender<GattResponse>,
    },
    /// commit or abort signal closing a prepared-write transaction
    ExecuteWrite { request_id: RequestId, commit: bool },
}

/// configuration for one peripheral session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub local_name: String,
    pub payload: Bytes,
    pub chunk_size: usize,
}

impl SessionConfig {
    pub fn new(local_name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            local_name: local_name.into(),
            payload: payload.into(),
            chunk_size: chunk::DEFAULT_CHUNK_SIZE,
        }
    }

    /// override the fragment body size used when serving reads
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

struct Running {
    actor: JoinHandle<()>,
    advertising: bool,
}

struct Lifecycle {
    transport: Box<dyn GattTransport>,
    running: Option<Running>,
}

/// one logical peripheral instance: owns the service definition, routes
/// inbound events to the chunk codec and write reassembler, and exposes the
/// listening state and the received-names log
pub struct GattPeripheralSession {
    config: SessionConfig,
    state_tx: watch::Sender<SessionState>,
    names_tx: watch::Sender<Vec<String>>,
    lifecycle: Mutex<Lifecycle>,
}

impl GattPeripheralSession {
    /// build a session over an already-acquired transport. a host without
    /// bluetooth support fails transport construction, so a session never
    /// exists without a radio behind it.
    pub fn new(transport: Box<dyn GattTransport>, config: SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Stopped);
        let (names_tx, _) = watch::channel(Vec::new());
        Self {
            config,
            state_tx,
            names_tx,
            lifecycle: Mutex::new(Lifecycle {
                transport,
                running: None,
            }),
        }
    }

    /// observable service state; flips to `Listening` on the platform's
    /// registration acknowledgement
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn is_listening(&self) -> bool {
        *self.state_tx.borrow() == SessionState::Listening
    }

    /// append-only log of names committed by clients, in commit order
    pub fn names(&self) -> watch::Receiver<Vec<String>> {
        self.names_tx.subscribe()
    }

    /// register the service and begin broadcasting. safe to call while
    /// running: registration is never repeated, and only a previously failed
    /// advertising step is retried.
    ///
    /// broadcast and gatt serving are independent failure domains: an
    /// advertising error is returned, but the service stays registered and
    /// keeps answering requests.
    pub async fn start(&self) -> Result<(), Error> {
        let mut guard = self.lifecycle.lock().await;
        let lifecycle = &mut *guard;

        if let Some(running) = lifecycle.running.as_mut() {
            if !running.advertising {
                lifecycle
                    .transport
                    .start_advertising(&self.config.local_name)
                    .await?;
                info!("advertising started: {}", self.config.local_name);
                running.advertising = true;
            }
            return Ok(());
        }

        self.state_tx.send_replace(SessionState::Starting);
        let (events_tx, events_rx) = mpsc::channel(DEFAULT_EVENT_CAPACITY);
        if let Err(err) = lifecycle
            .transport
            .register(ServiceDefinition::courier(), events_tx)
            .await
        {
            self.state_tx.send_replace(SessionState::Stopped);
            return Err(err);
        }
        info!("gatt service registered: {}", crate::COURIER_SERVICE_UUID);

        let actor = tokio::spawn(
            SessionActor {
                payload: self.config.payload.clone(),
                chunk_size: self.config.chunk_size,
                state_tx: self.state_tx.clone(),
                reassembler: WriteReassembler::new(self.names_tx.clone()),
            }
            .run(events_rx),
        );

        let advertised = lifecycle
            .transport
            .start_advertising(&self.config.local_name)
            .await;
        lifecycle.running = Some(Running {
            actor,
            advertising: advertised.is_ok(),
        });
        if advertised.is_ok() {
            info!("advertising started: {}", self.config.local_name);
        }
        advertised
    }

    /// stop broadcasting and deregister the service. a no-op when not
    /// running.
    pub async fn stop(&self) -> Result<(), Error> {
        let mut guard = self.lifecycle.lock().await;
        let lifecycle = &mut *guard;
        let Some(running) = lifecycle.running.take() else {
            return Ok(());
        };
        if running.advertising {
            if let Err(err) = lifecycle.transport.stop_advertising().await {
                warn!("stop advertising failed: {err}");
            }
        }
        let result = lifecycle.transport.deregister().await;
        running.actor.abort();
        self.state_tx.send_replace(SessionState::Stopped);
        info!("gatt service stopped");
        result
    }
}

struct SessionActor {
    payload: Bytes,
    chunk_size: usize,
    state_tx: watch::Sender<SessionState>,
    reassembler: WriteReassembler,
}

impl SessionActor {
    async fn run(mut self, mut events: mpsc::Receiver<GattEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
        debug!("session event stream closed");
    }

    // a failure handling one event never ends the actor or touches other
    // in-flight transactions
    fn handle(&mut self, event: GattEvent) {
        match event {
            GattEvent::ServiceRegistered => {
                info!("service registration acknowledged, listening");
                self.state_tx.send_replace(SessionState::Listening);
            }
            GattEvent::Read {
                request_id,
                offset,
                responder,
            } => {
                let fragments = chunk::split(&self.payload, self.chunk_size);
                debug!("read {request_id}: sending {} fragment(s)", fragments.len());
                for fragment in fragments {
                    let response = GattResponse {
                        status: ResponseStatus::Success,
                        offset,
                        value: fragment.encode(),
                    };
                    if responder.send(response).is_err() {
                        warn!("read {request_id}: responder closed mid-stream");
                        break;
                    }
                }
            }
            GattEvent::Write {
                request_id,
                prepared,
                response_needed,
                offset: _,
                value,
                responder,
            } => {
                if prepared {
                    self.reassembler.append(request_id, &value);
                } else {
                    self.reassembler.commit_immediate(&value);
                }
                if response_needed {
                    let ack = GattResponse {
                        status: ResponseStatus::Success,
                        offset: 0,
                        value: Bytes::new(),
                    };
                    if responder.send(ack).is_err() {
                        warn!("write {request_id}: responder closed");
                    }
                }
            }
            GattEvent::ExecuteWrite { request_id, commit } => {
                self.reassembler.execute(request_id, commit);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_to_the_protocol_chunk_size() {
        let config = SessionConfig::new("courier", Bytes::from_static(b"{}"));
        assert_eq!(config.chunk_size, chunk::DEFAULT_CHUNK_SIZE);
        assert_eq!(config.chunk_size(64).chunk_size, 64);
    }
}
