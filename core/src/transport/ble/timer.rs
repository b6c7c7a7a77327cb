//! Connection timers
//!
//! A connection arms up to five independent one-shot timers. The platform
//! scheduler owns the clock; when a timer fires it re-enters the stack through
//! `ConnectionRegistry::handle_timer_expired` on the same serialized context
//! that delivers GATT events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::gatt::ConnectionObject;

/// The five timers a connection can arm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerKind {
    /// Bounds the initiator's whole handshake
    Connect,
    /// Bounds how long a responder waits for the rest of the handshake
    ReceiveConnection,
    /// Fires when the peer stops acknowledging fragments
    AckReceived,
    /// Forces out a standalone ack when no data fragment can carry it
    SendAck,
    /// Bounds graceful teardown while an unsubscribe is outstanding
    Unsubscribe,
}

impl TimerKind {
    pub const ALL: [TimerKind; 5] = [
        TimerKind::Connect,
        TimerKind::ReceiveConnection,
        TimerKind::AckReceived,
        TimerKind::SendAck,
        TimerKind::Unsubscribe,
    ];
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerKind::Connect => write!(f, "connect"),
            TimerKind::ReceiveConnection => write!(f, "receive-connection"),
            TimerKind::AckReceived => write!(f, "ack-received"),
            TimerKind::SendAck => write!(f, "send-ack"),
            TimerKind::Unsubscribe => write!(f, "unsubscribe"),
        }
    }
}

/// Which timers are currently armed for one connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArmedTimers {
    pub connect: bool,
    pub receive_connection: bool,
    pub ack_received: bool,
    pub send_ack: bool,
    pub unsubscribe: bool,
}

impl ArmedTimers {
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        match kind {
            TimerKind::Connect => self.connect,
            TimerKind::ReceiveConnection => self.receive_connection,
            TimerKind::AckReceived => self.ack_received,
            TimerKind::SendAck => self.send_ack,
            TimerKind::Unsubscribe => self.unsubscribe,
        }
    }

    pub fn set(&mut self, kind: TimerKind, armed: bool) {
        let slot = match kind {
            TimerKind::Connect => &mut self.connect,
            TimerKind::ReceiveConnection => &mut self.receive_connection,
            TimerKind::AckReceived => &mut self.ack_received,
            TimerKind::SendAck => &mut self.send_ack,
            TimerKind::Unsubscribe => &mut self.unsubscribe,
        };
        *slot = armed;
    }

    /// Iterate over the armed timers
    pub fn armed(&self) -> impl Iterator<Item = TimerKind> + '_ {
        TimerKind::ALL.into_iter().filter(|kind| self.is_armed(*kind))
    }
}

/// Platform timer service
pub trait TimerScheduler: Send {
    /// Arm a one-shot timer. Re-arming a running timer restarts it.
    fn start_timer(
        &mut self,
        connection: ConnectionObject,
        timer: TimerKind,
        after: Duration,
    ) -> bool;

    /// Cancel a timer; cancelling an idle timer is a no-op
    fn cancel_timer(&mut self, connection: ConnectionObject, timer: TimerKind);
}
