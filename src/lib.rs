//! ble gatt peripheral serving a chunked payload and collecting written names
//!
//! advertises a single custom service with one readable and one writeable
//! characteristic. reads of the payload characteristic stream the configured
//! payload as index-prefixed fragments terminated by an `EOM` marker, so a
//! central can reassemble a document far larger than one attribute
//! transaction. writes to the name characteristic land on an append-only
//! observable log, with prepared (long) writes buffered per transaction and
//! committed atomically on execute.

pub mod chunk;
mod reassembly;
pub mod session;
pub mod transport;

use uuid::Uuid;

/// uuid the courier service is registered and advertised under
pub const COURIER_SERVICE_UUID: Uuid = Uuid::from_u128(0xE20A39F4_73F5_4BC4_A12F_17D1AD07A961);
/// read-only characteristic the chunked payload is served from
pub const PAYLOAD_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x8c380001_10bd_4fdb_ba21_1922d6cf860d);
/// write-only characteristic names are submitted to
pub const NAME_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x08590F7E_DB05_467E_8757_72F6FAEB13D4);

pub use chunk::{split, Fragment, DEFAULT_CHUNK_SIZE, END_OF_MESSAGE};
pub use session::{
    GattEvent, GattPeripheralSession, GattResponse, RequestId, ResponseStatus, SessionConfig,
    SessionState,
};
pub use transport::{BlePeripheralTransport, GattTransport, ServiceDefinition};

/// errors surfaced by session lifecycle operations and transport setup
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// the host has no usable bluetooth peripheral role
    #[error("bluetooth peripheral unavailable: {0}")]
    Unavailable(String),
    /// the platform rejected service registration
    #[error("gatt service registration failed: {0}")]
    Register(String),
    /// the platform could not start or stop broadcasting
    #[error("advertising failed: {0}")]
    Advertise(String),
    /// the transport worker is gone
    #[error("transport shut down")]
    TransportClosed,
}
