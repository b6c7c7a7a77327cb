// BTP Core: reliable byte streams over a BLE GATT link
#![allow(clippy::empty_line_after_doc_comments)]
//
// One characteristic to write, one to indicate, a 20-byte MTU on a bad day.
// Everything above this crate gets ordered, acknowledged messages.

pub mod transport;

use thiserror::Error;

pub use transport::ble::{
    BtpConfig, BtpDelegate, CapabilitiesRequest, CapabilitiesResponse, ConfigError, Connection,
    ConnectionObject, ConnectionRegistry, ConnectionState, FragmentCodec, GattDriver, Role,
    TimerKind, TimerScheduler, BTP_PROTOCOL_VERSION,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Which layer of the protocol an error came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or out-of-order fragments
    Framing,
    /// Acks outside the unacknowledged send window
    Window,
    /// Capability negotiation failures and handshake timeouts
    Handshake,
    /// The peer stopped acknowledging
    Liveness,
    /// GATT, timer and link failures reported by the platform
    Platform,
    /// API misuse; never closes a connection
    Usage,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BtpError {
    // Framing
    #[error("Invalid BTP header flags: {0:#04x}")]
    InvalidHeaderFlags(u8),
    #[error("Fragment too short: {len} bytes")]
    FragmentTooShort { len: usize },
    #[error("Fragment too long: {len} bytes (negotiated {max})")]
    FragmentTooLong { len: usize, max: u16 },
    #[error("Invalid sequence number: expected {expected}, got {received}")]
    InvalidSequenceNumber { expected: u8, received: u8 },
    #[error("Start fragment received while a message is being reassembled")]
    UnexpectedStart,
    #[error("Continuation fragment received with no message in progress")]
    UnexpectedContinuation,
    #[error("Message too large: {len} bytes (max {max})")]
    MessageTooLarge { len: usize, max: usize },
    #[error("Reassembled {received} bytes, expected {expected}")]
    ReassemblyLengthMismatch { expected: usize, received: usize },
    #[error("Reassembler in incorrect state")]
    ReassemblerIncorrectState,

    // Window
    #[error("Invalid ack {ack}: unacknowledged window is [{oldest}, {newest}]")]
    InvalidAck { ack: u8, oldest: u8, newest: u8 },
    #[error("Unexpected ack {0}: no fragments in flight")]
    UnexpectedAck(u8),

    // Handshake
    #[error("Malformed capabilities message: {0}")]
    MalformedCapabilities(&'static str),
    #[error("No common BTP protocol version")]
    IncompatibleProtocolVersions,
    #[error("Invalid negotiated fragment size: {0}")]
    InvalidFragmentSize(u16),
    #[error("Invalid negotiated window size: {0}")]
    InvalidWindowSize(u8),
    #[error("Connect timed out")]
    ConnectTimedOut,
    #[error("Timed out waiting for the initiator's handshake")]
    ReceiveConnectionTimedOut,

    // Liveness
    #[error("Timed out waiting for fragment ack")]
    AckTimedOut,

    // Platform
    #[error("GATT write rejected")]
    GattWriteFailed,
    #[error("GATT indication rejected")]
    GattIndicationFailed,
    #[error("GATT subscribe rejected")]
    GattSubscribeFailed,
    #[error("Failed to start {0} timer")]
    TimerStartFailed(TimerKind),
    #[error("Remote device disconnected")]
    RemoteDeviceDisconnected,
    #[error("Application closed the BLE connection")]
    AppClosedConnection,
    #[error("Peer unsubscribed")]
    PeerUnsubscribed,

    // Usage
    #[error("Operation not allowed in state {0}")]
    IncorrectState(ConnectionState),
    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionObject),
    #[error("Too many connections (max {max})")]
    TooManyConnections { max: usize },
    #[error("Connection {0} already exists")]
    ConnectionExists(ConnectionObject),
}

impl BtpError {
    pub fn kind(&self) -> ErrorKind {
        use BtpError::*;
        match self {
            InvalidHeaderFlags(_)
            | FragmentTooShort { .. }
            | FragmentTooLong { .. }
            | InvalidSequenceNumber { .. }
            | UnexpectedStart
            | UnexpectedContinuation
            | MessageTooLarge { .. }
            | ReassemblyLengthMismatch { .. }
            | ReassemblerIncorrectState => ErrorKind::Framing,
            InvalidAck { .. } | UnexpectedAck(_) => ErrorKind::Window,
            MalformedCapabilities(_)
            | IncompatibleProtocolVersions
            | InvalidFragmentSize(_)
            | InvalidWindowSize(_)
            | ConnectTimedOut
            | ReceiveConnectionTimedOut => ErrorKind::Handshake,
            AckTimedOut => ErrorKind::Liveness,
            GattWriteFailed
            | GattIndicationFailed
            | GattSubscribeFailed
            | TimerStartFailed(_)
            | RemoteDeviceDisconnected
            | AppClosedConnection
            | PeerUnsubscribed => ErrorKind::Platform,
            IncorrectState(_)
            | UnknownConnection(_)
            | TooManyConnections { .. }
            | ConnectionExists(_) => ErrorKind::Usage,
        }
    }

    /// Whether the platform link is already gone, so no further GATT calls
    /// may be made for it
    pub fn link_released(&self) -> bool {
        matches!(
            self,
            BtpError::RemoteDeviceDisconnected | BtpError::AppClosedConnection
        )
    }
}
