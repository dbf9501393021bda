//! boundary to the host bluetooth stack

use std::time::Duration;

use async_trait::async_trait;
use ble_peripheral_rust::{
    gatt::{
        characteristic::Characteristic,
        peripheral_event::{
            PeripheralEvent, ReadRequestResponse, RequestResponse, WriteRequestResponse,
        },
        properties::{AttributePermission, CharacteristicProperty},
        service::Service,
    },
    Peripheral, PeripheralImpl,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::session::{GattEvent, RequestId, ResponseStatus};
use crate::Error;

const PLATFORM_EVENT_CAPACITY: usize = 256;
const COMMAND_CAPACITY: usize = 8;

/// gatt service shape a transport is asked to register: one service with a
/// read-only and a write-only characteristic
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    pub service_uuid: Uuid,
    pub read_characteristic: Uuid,
    pub write_characteristic: Uuid,
}

impl ServiceDefinition {
    /// the courier service with its fixed interoperability uuids
    pub fn courier() -> Self {
        Self {
            service_uuid: crate::COURIER_SERVICE_UUID,
            read_characteristic: crate::PAYLOAD_CHARACTERISTIC_UUID,
            write_characteristic: crate::NAME_CHARACTERISTIC_UUID,
        }
    }
}

/// platform collaborator that registers the service, broadcasts, and
/// delivers every transport-originated request as a [`GattEvent`] on the
/// channel handed to [`register`](GattTransport::register)
#[async_trait]
pub trait GattTransport: Send + Sync {
    async fn register(
        &mut self,
        service: ServiceDefinition,
        events: mpsc::Sender<GattEvent>,
    ) -> Result<(), Error>;

    async fn start_advertising(&mut self, local_name: &str) -> Result<(), Error>;

    async fn stop_advertising(&mut self) -> Result<(), Error>;

    async fn deregister(&mut self) -> Result<(), Error>;
}

enum Command {
    Register {
        service: ServiceDefinition,
        events: mpsc::Sender<GattEvent>,
        done: oneshot::Sender<Result<(), Error>>,
    },
    StartAdvertising {
        local_name: String,
        done: oneshot::Sender<Result<(), Error>>,
    },
    StopAdvertising {
        done: oneshot::Sender<Result<(), Error>>,
    },
    Deregister {
        done: oneshot::Sender<Result<(), Error>>,
    },
}

/// production transport over the host bluetooth stack
pub struct BlePeripheralTransport {
    commands: mpsc::Sender<Command>,
}

impl BlePeripheralTransport {
    /// acquire the host peripheral role. fails immediately when the host has
    /// no usable bluetooth stack.
    pub async fn new() -> Result<Self, Error> {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        // the platform peripheral handle is not Send, so it lives on a
        // dedicated thread with a current-thread runtime
        std::thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    let _ = ready_tx.send(Err(Error::Unavailable(err.to_string())));
                    return;
                }
            };
            runtime.block_on(drive_peripheral(commands_rx, ready_tx));
        });
        ready_rx
            .await
            .map_err(|_| Error::Unavailable("peripheral thread exited".into()))??;
        Ok(Self {
            commands: commands_tx,
        })
    }

    async fn command(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), Error>>) -> Command + Send,
    ) -> Result<(), Error> {
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(build(done_tx))
            .await
            .map_err(|_| Error::TransportClosed)?;
        done_rx.await.map_err(|_| Error::TransportClosed)?
    }
}

#[async_trait]
impl GattTransport for BlePeripheralTransport {
    async fn register(
        &mut self,
        service: ServiceDefinition,
        events: mpsc::Sender<GattEvent>,
    ) -> Result<(), Error> {
        self.command(|done| Command::Register {
            service,
            events,
            done,
        })
        .await
    }

    async fn start_advertising(&mut self, local_name: &str) -> Result<(), Error> {
        let local_name = local_name.to_string();
        self.command(|done| Command::StartAdvertising { local_name, done })
            .await
    }

    async fn stop_advertising(&mut self) -> Result<(), Error> {
        self.command(|done| Command::StopAdvertising { done }).await
    }

    async fn deregister(&mut self) -> Result<(), Error> {
        self.command(|done| Command::Deregister { done }).await
    }
}

struct RegisteredService {
    definition: ServiceDefinition,
    events: mpsc::Sender<GattEvent>,
}

/// book-keeping for the platform worker
///
/// the platform api offers no service removal call, so a service added to
/// its database once stays there. deregistering detaches the session (its
/// event sender drops, ending the actor) and a later register reattaches to
/// the existing database entry instead of adding the service a second time.
struct PlatformState {
    service_added: bool,
    registered: Option<RegisteredService>,
    advertised_name: Option<String>,
    next_request_id: RequestId,
}

impl PlatformState {
    fn new() -> Self {
        Self {
            service_added: false,
            registered: None,
            advertised_name: None,
            next_request_id: 0,
        }
    }

    fn needs_service_add(&self) -> bool {
        !self.service_added
    }

    fn attach(&mut self, service: ServiceDefinition, events: mpsc::Sender<GattEvent>) {
        self.service_added = true;
        self.registered = Some(RegisteredService {
            definition: service,
            events,
        });
    }

    fn detach(&mut self) {
        self.registered = None;
    }

    fn service_uuid(&self) -> Uuid {
        self.registered
            .as_ref()
            .map(|service| service.definition.service_uuid)
            .unwrap_or(crate::COURIER_SERVICE_UUID)
    }

    fn read_target(&self, characteristic: Uuid) -> Option<mpsc::Sender<GattEvent>> {
        self.registered
            .as_ref()
            .filter(|service| service.definition.read_characteristic == characteristic)
            .map(|service| service.events.clone())
    }

    fn write_target(&self, characteristic: Uuid) -> Option<mpsc::Sender<GattEvent>> {
        self.registered
            .as_ref()
            .filter(|service| service.definition.write_characteristic == characteristic)
            .map(|service| service.events.clone())
    }

    fn take_request_id(&mut self) -> RequestId {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        id
    }
}

async fn drive_peripheral(
    mut commands: mpsc::Receiver<Command>,
    ready: oneshot::Sender<Result<(), Error>>,
) {
    let (platform_tx, mut platform_rx) = mpsc::channel(PLATFORM_EVENT_CAPACITY);
    let mut peripheral = match Peripheral::new(platform_tx).await {
        Ok(peripheral) => peripheral,
        Err(err) => {
            let _ = ready.send(Err(Error::Unavailable(err.to_string())));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let mut state = PlatformState::new();

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    Command::Register { service, events, done } => {
                        let result = if state.needs_service_add() {
                            register_service(&mut peripheral, &service).await
                        } else {
                            debug!("service already in the platform database, reattaching");
                            Ok(())
                        };
                        if result.is_ok() {
                            let _ = events.send(GattEvent::ServiceRegistered).await;
                            state.attach(service, events);
                        }
                        let _ = done.send(result);
                    }
                    Command::StartAdvertising { local_name, done } => {
                        let result = peripheral
                            .start_advertising(&local_name, &[state.service_uuid()])
                            .await
                            .map_err(|err| Error::Advertise(err.to_string()));
                        if result.is_ok() {
                            state.advertised_name = Some(local_name);
                        }
                        let _ = done.send(result);
                    }
                    Command::StopAdvertising { done } => {
                        let result = peripheral
                            .stop_advertising()
                            .await
                            .map_err(|err| Error::Advertise(err.to_string()));
                        state.advertised_name = None;
                        let _ = done.send(result);
                    }
                    Command::Deregister { done } => {
                        state.detach();
                        let _ = done.send(Ok(()));
                    }
                }
            }
            event = platform_rx.recv() => {
                let Some(event) = event else { break };
                handle_platform_event(&mut peripheral, event, &mut state).await;
            }
        }
    }
    debug!("peripheral worker shutting down");
}

async fn register_service(
    peripheral: &mut Peripheral,
    service: &ServiceDefinition,
) -> Result<(), Error> {
    while !peripheral
        .is_powered()
        .await
        .map_err(|err| Error::Unavailable(err.to_string()))?
    {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    peripheral
        .add_service(&build_service(service))
        .await
        .map_err(|err| Error::Register(err.to_string()))
}

fn build_service(definition: &ServiceDefinition) -> Service {
    Service {
        uuid: definition.service_uuid,
        primary: true,
        characteristics: vec![
            Characteristic {
                uuid: definition.read_characteristic,
                properties: vec![CharacteristicProperty::Read],
                permissions: vec![AttributePermission::Readable],
                value: None,
                descriptors: Vec::new(),
            },
            Characteristic {
                uuid: definition.write_characteristic,
                properties: vec![CharacteristicProperty::Write],
                permissions: vec![AttributePermission::Writeable],
                value: None,
                descriptors: Vec::new(),
            },
        ],
    }
}

async fn handle_platform_event(
    peripheral: &mut Peripheral,
    event: PeripheralEvent,
    state: &mut PlatformState,
) {
    match event {
        PeripheralEvent::ReadRequest {
            request,
            offset,
            responder,
        } => {
            let Some(events) = state.read_target(request.characteristic) else {
                let _ = responder.send(ReadRequestResponse {
                    value: Vec::new(),
                    response: RequestResponse::RequestNotSupported,
                });
                debug!("read rejected: unknown characteristic");
                return;
            };
            let request_id = state.take_request_id();
            let (fragments_tx, mut fragments_rx) = mpsc::unbounded_channel();
            let event = GattEvent::Read {
                request_id,
                offset: offset as u64,
                responder: fragments_tx,
            };
            if events.send(event).await.is_err() {
                let _ = responder.send(ReadRequestResponse {
                    value: Vec::new(),
                    response: RequestResponse::UnlikelyError,
                });
                return;
            }
            // the platform takes one response per read, so the fragment
            // stream goes back as its frames concatenated in index order
            let mut value = Vec::new();
            let mut response = RequestResponse::Success;
            while let Some(fragment) = fragments_rx.recv().await {
                if fragment.status != ResponseStatus::Success {
                    response = RequestResponse::UnlikelyError;
                }
                value.extend_from_slice(&fragment.value);
            }
            let _ = responder.send(ReadRequestResponse { value, response });
            debug!("read {request_id}: served");
        }
        PeripheralEvent::WriteRequest {
            request,
            value,
            offset,
            responder,
        } => {
            let Some(events) = state.write_target(request.characteristic) else {
                let _ = responder.send(WriteRequestResponse {
                    response: RequestResponse::RequestNotSupported,
                });
                debug!("write rejected: unknown characteristic");
                return;
            };
            if offset != 0 {
                let _ = responder.send(WriteRequestResponse {
                    response: RequestResponse::InvalidOffset,
                });
                warn!("write rejected: invalid offset {offset}");
                return;
            }
            let request_id = state.take_request_id();
            let (ack_tx, ack_rx) = oneshot::channel();
            // this binding delivers writes whole, so none are marked prepared
            let event = GattEvent::Write {
                request_id,
                prepared: false,
                response_needed: true,
                offset: 0,
                value,
                responder: ack_tx,
            };
            if events.send(event).await.is_err() {
                let _ = responder.send(WriteRequestResponse {
                    response: RequestResponse::UnlikelyError,
                });
                return;
            }
            let response = match ack_rx.await {
                Ok(ack) if ack.status == ResponseStatus::Success => RequestResponse::Success,
                _ => RequestResponse::UnlikelyError,
            };
            let _ = responder.send(WriteRequestResponse { response });
            debug!("write {request_id}: acknowledged");
        }
        PeripheralEvent::CharacteristicSubscriptionUpdate { .. } => {}
        PeripheralEvent::StateUpdate { is_powered } => {
            if is_powered {
                info!("bluetooth powered on");
                if let Some(name) = state.advertised_name.clone() {
                    let _ = peripheral
                        .start_advertising(&name, &[state.service_uuid()])
                        .await;
                }
            } else {
                warn!("bluetooth powered off");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reregistering_reuses_the_platform_database_entry() {
        let (events, _keep) = mpsc::channel(1);
        let mut state = PlatformState::new();
        assert!(state.needs_service_add());

        state.attach(ServiceDefinition::courier(), events.clone());
        assert!(!state.needs_service_add());

        // a stop/start cycle detaches and reattaches without a second add
        state.detach();
        assert!(!state.needs_service_add());
        state.attach(ServiceDefinition::courier(), events);
        assert!(!state.needs_service_add());
    }

    #[test]
    fn detaching_drops_the_session_event_sender() {
        let (events, mut receiver) = mpsc::channel::<GattEvent>(1);
        let mut state = PlatformState::new();
        state.attach(ServiceDefinition::courier(), events);
        state.detach();
        assert!(matches!(
            receiver.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn request_targets_follow_the_registered_characteristics() {
        let (events, _keep) = mpsc::channel(1);
        let mut state = PlatformState::new();
        assert!(state.read_target(crate::PAYLOAD_CHARACTERISTIC_UUID).is_none());

        state.attach(ServiceDefinition::courier(), events);
        assert!(state.read_target(crate::PAYLOAD_CHARACTERISTIC_UUID).is_some());
        assert!(state.read_target(crate::NAME_CHARACTERISTIC_UUID).is_none());
        assert!(state.write_target(crate::NAME_CHARACTERISTIC_UUID).is_some());
        assert!(state.write_target(crate::PAYLOAD_CHARACTERISTIC_UUID).is_none());
    }
}
