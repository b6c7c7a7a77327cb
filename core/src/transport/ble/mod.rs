/// BLE Transport Protocol (BTP)
///
/// Reliable, ordered message delivery over a BLE GATT link with a small MTU.
///
/// - **codec**: fragmentation, reassembly and the 8-bit sequence/ack window
/// - **capabilities**: handshake messages negotiating version, fragment and window size
/// - **connection**: per-link state machine driving the codec through the GATT driver
/// - **registry**: maps platform links to connections and routes platform upcalls
/// - **gatt**: service/characteristic identifiers and the platform driver trait
/// - **timer**: the five connection timers and the platform scheduler trait
/// - **config**: local limits and timer durations
///
/// Platform code (Swift/Kotlin/BlueZ glue) owns the radio, the clock and the
/// GATT server; everything here is plain state and can be tested without BLE
/// hardware.

pub mod capabilities;
pub mod codec;
pub mod config;
pub mod connection;
pub mod gatt;
pub mod registry;
pub mod timer;

// Re-export commonly used types
pub use capabilities::{
    highest_supported_version, is_capabilities_request, CapabilitiesRequest,
    CapabilitiesResponse, BTP_PROTOCOL_VERSION,
};

pub use codec::{
    FragmentCodec, FragmentHeader, FramingState, HeaderFlags, ReceivedFragment, SequenceNumber,
    DEFAULT_FRAGMENT_SIZE, MAX_WINDOW_SIZE, MIN_FRAGMENT_SIZE,
};

pub use config::{BtpConfig, ConfigError};

pub use connection::{BtpDelegate, Connection, ConnectionState, Context, Role};

pub use gatt::{
    ConnectionObject, GattCharacteristic, GattDriver, BTP_INDICATE_CHARACTERISTIC_UUID,
    BTP_SERVICE_UUID, BTP_WRITE_CHARACTERISTIC_UUID,
};

pub use registry::ConnectionRegistry;

pub use timer::{ArmedTimers, TimerKind, TimerScheduler};
