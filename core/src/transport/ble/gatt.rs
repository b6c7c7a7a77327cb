//! GATT boundary for the BLE transport protocol
//!
//! BTP runs over a single GATT service with two characteristics: the
//! initiator writes fragments to C1 and the responder indicates fragments on
//! C2. Everything below this boundary (radio, ATT, pairing) belongs to the
//! platform; this module only names the pieces and defines the driver trait
//! the connection state machine talks to.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// BTP service UUID (16-bit 0xFFF6 on the Bluetooth base UUID)
pub const BTP_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_FFF6_0000_1000_8000_0080_5F9B_34FB);

/// C1: initiator → responder, written with GATT write requests
pub const BTP_WRITE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x18EE_2EF5_263D_4559_959F_4F9C_429F_9D11);

/// C2: responder → initiator, sent as GATT indications
pub const BTP_INDICATE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x18EE_2EF5_263D_4559_959F_4F9C_429F_9D12);

/// ATT header bytes that eat into every GATT payload
pub const ATT_HEADER_SIZE: u16 = 3;

/// Opaque handle of one platform BLE link.
///
/// The platform chooses the value; this layer only compares and hashes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionObject(pub u64);

impl fmt::Display for ConnectionObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ble#{}", self.0)
    }
}

/// BTP characteristic types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GattCharacteristic {
    /// C1, carries initiator fragments
    Write,
    /// C2, carries responder fragments
    Indicate,
}

impl GattCharacteristic {
    /// Get the characteristic UUID
    pub fn uuid(&self) -> Uuid {
        match self {
            GattCharacteristic::Write => BTP_WRITE_CHARACTERISTIC_UUID,
            GattCharacteristic::Indicate => BTP_INDICATE_CHARACTERISTIC_UUID,
        }
    }

    /// Resolve a (service, characteristic) pair reported by the platform.
    ///
    /// Returns `None` for anything that is not part of the BTP service, so the
    /// caller can tell the platform the event was not ours.
    pub fn from_ids(service: &Uuid, characteristic: &Uuid) -> Option<Self> {
        if *service != BTP_SERVICE_UUID {
            return None;
        }
        if *characteristic == BTP_WRITE_CHARACTERISTIC_UUID {
            Some(GattCharacteristic::Write)
        } else if *characteristic == BTP_INDICATE_CHARACTERISTIC_UUID {
            Some(GattCharacteristic::Indicate)
        } else {
            None
        }
    }
}

/// Platform GATT driver.
///
/// Every method is a request: `true` means the platform accepted it and will
/// report completion later through the registry's `handle_*` upcalls.
#[cfg_attr(test, mockall::automock)]
pub trait GattDriver: Send {
    /// Subscribe to indications on a characteristic (initiator only)
    fn subscribe(
        &mut self,
        connection: ConnectionObject,
        service: &Uuid,
        characteristic: &Uuid,
    ) -> bool;

    /// Remove a subscription (initiator only)
    fn unsubscribe(
        &mut self,
        connection: ConnectionObject,
        service: &Uuid,
        characteristic: &Uuid,
    ) -> bool;

    /// Write a fragment to a characteristic (initiator only)
    fn send_write(
        &mut self,
        connection: ConnectionObject,
        service: &Uuid,
        characteristic: &Uuid,
        data: &[u8],
    ) -> bool;

    /// Indicate a fragment on a characteristic (responder only)
    fn send_indication(
        &mut self,
        connection: ConnectionObject,
        service: &Uuid,
        characteristic: &Uuid,
        data: &[u8],
    ) -> bool;

    /// Negotiated ATT MTU of the link, 0 when unknown
    fn get_mtu(&self, connection: ConnectionObject) -> u16;

    /// Release the underlying link once BTP is done with it
    fn close_connection(&mut self, connection: ConnectionObject) -> bool;
}
