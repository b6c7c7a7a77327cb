// Simulated BLE link for integration tests
//
// Two registries, one initiator and one responder, joined by an in-memory
// GATT link. Every GATT request lands in the sender's outbox; `pump` delivers
// them to the other side together with the matching confirmation. Timers
// never fire on their own: tests fire them explicitly.

#![allow(dead_code)]

use btp_core::transport::ble::{
    BTP_INDICATE_CHARACTERISTIC_UUID, BTP_SERVICE_UUID, BTP_WRITE_CHARACTERISTIC_UUID,
};
use btp_core::{
    BtpConfig, BtpDelegate, BtpError, ConnectionObject, ConnectionRegistry, ConnectionState,
    GattDriver, TimerKind, TimerScheduler,
};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const INITIATOR_LINK: ConnectionObject = ConnectionObject(1);
pub const RESPONDER_LINK: ConnectionObject = ConnectionObject(2);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// One GATT request issued by a side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattOp {
    Write(Vec<u8>),
    Indicate(Vec<u8>),
    Subscribe,
    Unsubscribe,
    Close,
}

#[derive(Debug, Default)]
pub struct GattState {
    pub mtu: u16,
    pub reject_sends: bool,
    pub outbox: VecDeque<GattOp>,
    /// Every fragment this side handed to the platform
    pub sent: Vec<Vec<u8>>,
}

pub struct SimGatt(Arc<Mutex<GattState>>);

impl SimGatt {
    fn push(&mut self, op: GattOp) -> bool {
        self.0.lock().outbox.push_back(op);
        true
    }

    fn send(&mut self, data: &[u8], op: GattOp) -> bool {
        let mut state = self.0.lock();
        if state.reject_sends {
            return false;
        }
        state.sent.push(data.to_vec());
        state.outbox.push_back(op);
        true
    }
}

impl GattDriver for SimGatt {
    fn subscribe(&mut self, _: ConnectionObject, _: &Uuid, _: &Uuid) -> bool {
        self.push(GattOp::Subscribe)
    }

    fn unsubscribe(&mut self, _: ConnectionObject, _: &Uuid, _: &Uuid) -> bool {
        self.push(GattOp::Unsubscribe)
    }

    fn send_write(&mut self, _: ConnectionObject, _: &Uuid, _: &Uuid, data: &[u8]) -> bool {
        self.send(data, GattOp::Write(data.to_vec()))
    }

    fn send_indication(&mut self, _: ConnectionObject, _: &Uuid, _: &Uuid, data: &[u8]) -> bool {
        self.send(data, GattOp::Indicate(data.to_vec()))
    }

    fn get_mtu(&self, _: ConnectionObject) -> u16 {
        self.0.lock().mtu
    }

    fn close_connection(&mut self, _: ConnectionObject) -> bool {
        self.push(GattOp::Close)
    }
}

#[derive(Debug, Default)]
pub struct TimerState {
    pub armed: HashSet<(ConnectionObject, TimerKind)>,
    pub started: Vec<(TimerKind, Duration)>,
}

pub struct SimTimers(Arc<Mutex<TimerState>>);

impl TimerScheduler for SimTimers {
    fn start_timer(&mut self, connection: ConnectionObject, timer: TimerKind, after: Duration) -> bool {
        let mut state = self.0.lock();
        state.armed.insert((connection, timer));
        state.started.push((timer, after));
        true
    }

    fn cancel_timer(&mut self, connection: ConnectionObject, timer: TimerKind) {
        self.0.lock().armed.remove(&(connection, timer));
    }
}

#[derive(Debug, Default)]
pub struct DelegateLog {
    pub completions: Vec<Result<(), BtpError>>,
    pub messages: Vec<Vec<u8>>,
    pub closes: Vec<Result<(), BtpError>>,
}

pub struct RecordingDelegate(Arc<Mutex<DelegateLog>>);

impl BtpDelegate for RecordingDelegate {
    fn on_connection_complete(&mut self, _: ConnectionObject, result: Result<(), BtpError>) {
        self.0.lock().completions.push(result);
    }

    fn on_message_received(&mut self, _: ConnectionObject, message: Vec<u8>) {
        self.0.lock().messages.push(message);
    }

    fn on_connection_closed(&mut self, _: ConnectionObject, result: Result<(), BtpError>) {
        self.0.lock().closes.push(result);
    }
}

/// One side of the link: a registry plus handles on its fakes
pub struct Endpoint {
    pub registry: ConnectionRegistry,
    pub link: ConnectionObject,
    pub gatt: Arc<Mutex<GattState>>,
    pub timers: Arc<Mutex<TimerState>>,
    pub log: Arc<Mutex<DelegateLog>>,
}

impl Endpoint {
    pub fn new(config: BtpConfig, link: ConnectionObject, mtu: u16) -> Self {
        let gatt = Arc::new(Mutex::new(GattState {
            mtu,
            ..GattState::default()
        }));
        let timers = Arc::new(Mutex::new(TimerState::default()));
        let log = Arc::new(Mutex::new(DelegateLog::default()));
        let registry = ConnectionRegistry::new(
            config,
            Box::new(SimGatt(gatt.clone())),
            Box::new(SimTimers(timers.clone())),
            Box::new(RecordingDelegate(log.clone())),
        )
        .expect("valid config");

        Self {
            registry,
            link,
            gatt,
            timers,
            log,
        }
    }

    pub fn state(&self) -> Option<ConnectionState> {
        self.registry.connection_state(self.link)
    }

    pub fn is_armed(&self, timer: TimerKind) -> bool {
        self.timers.lock().armed.contains(&(self.link, timer))
    }

    /// Fire a timer if it is armed; returns whether it fired
    pub fn fire(&mut self, timer: TimerKind) -> bool {
        if !self.timers.lock().armed.remove(&(self.link, timer)) {
            return false;
        }
        self.registry.handle_timer_expired(self.link, timer);
        true
    }

    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.log.lock().messages.clone()
    }

    pub fn completions(&self) -> Vec<Result<(), BtpError>> {
        self.log.lock().completions.clone()
    }

    pub fn closes(&self) -> Vec<Result<(), BtpError>> {
        self.log.lock().closes.clone()
    }

    fn next_op(&self) -> Option<GattOp> {
        self.gatt.lock().outbox.pop_front()
    }
}

pub struct SimLink {
    pub initiator: Endpoint,
    pub responder: Endpoint,
    /// Initiator traffic is confirmed locally but never reaches the responder
    pub drop_initiator_traffic: bool,
}

impl SimLink {
    pub fn new(initiator_config: BtpConfig, responder_config: BtpConfig, mtu: u16) -> Self {
        Self {
            initiator: Endpoint::new(initiator_config, INITIATOR_LINK, mtu),
            responder: Endpoint::new(responder_config, RESPONDER_LINK, mtu),
            drop_initiator_traffic: false,
        }
    }

    /// Run the handshake to completion
    pub fn connected(initiator_config: BtpConfig, responder_config: BtpConfig, mtu: u16) -> Self {
        let mut link = Self::new(initiator_config, responder_config, mtu);
        link.initiator
            .registry
            .connect(INITIATOR_LINK)
            .expect("connect");
        link.pump();
        assert_eq!(link.initiator.state(), Some(ConnectionState::Connected));
        assert_eq!(link.responder.state(), Some(ConnectionState::Connected));
        link
    }

    /// Deliver queued GATT traffic in both directions until the link is quiet.
    /// Returns the number of operations delivered.
    pub fn pump(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            let mut progressed = false;
            while let Some(op) = self.initiator.next_op() {
                self.deliver_from_initiator(op);
                delivered += 1;
                progressed = true;
            }
            while let Some(op) = self.responder.next_op() {
                self.deliver_from_responder(op);
                delivered += 1;
                progressed = true;
            }
            if !progressed {
                return delivered;
            }
        }
    }

    fn deliver_from_initiator(&mut self, op: GattOp) {
        let svc = &BTP_SERVICE_UUID;
        let c1 = &BTP_WRITE_CHARACTERISTIC_UUID;
        let c2 = &BTP_INDICATE_CHARACTERISTIC_UUID;
        let responder = &mut self.responder.registry;
        let initiator = &mut self.initiator.registry;
        let dropped = self.drop_initiator_traffic;

        match op {
            GattOp::Write(data) => {
                if !dropped {
                    assert!(responder.handle_write_received(RESPONDER_LINK, svc, c1, &data));
                }
                assert!(initiator.handle_write_confirmation(INITIATOR_LINK, svc, c1));
            }
            GattOp::Subscribe => {
                if !dropped {
                    assert!(responder.handle_subscribe_received(RESPONDER_LINK, svc, c2));
                }
                assert!(initiator.handle_subscribe_complete(INITIATOR_LINK, svc, c2));
            }
            GattOp::Unsubscribe => {
                if !dropped {
                    assert!(responder.handle_unsubscribe_received(RESPONDER_LINK, svc, c2));
                }
                assert!(initiator.handle_unsubscribe_complete(INITIATOR_LINK, svc, c2));
            }
            GattOp::Close => {
                responder.handle_connection_error(
                    RESPONDER_LINK,
                    BtpError::RemoteDeviceDisconnected,
                );
            }
            GattOp::Indicate(_) => panic!("initiator never indicates"),
        }
    }

    fn deliver_from_responder(&mut self, op: GattOp) {
        let svc = &BTP_SERVICE_UUID;
        let c2 = &BTP_INDICATE_CHARACTERISTIC_UUID;
        let responder = &mut self.responder.registry;
        let initiator = &mut self.initiator.registry;

        match op {
            GattOp::Indicate(data) => {
                assert!(initiator.handle_indication_received(INITIATOR_LINK, svc, c2, &data));
                assert!(responder.handle_indication_confirmation(RESPONDER_LINK, svc, c2));
            }
            GattOp::Close => {
                initiator.handle_connection_error(
                    INITIATOR_LINK,
                    BtpError::RemoteDeviceDisconnected,
                );
            }
            other => panic!("responder never issues {other:?}"),
        }
    }

    /// Fire every armed send-ack timer once; returns whether any fired
    pub fn fire_send_ack_timers(&mut self) -> bool {
        let initiator = self.initiator.fire(TimerKind::SendAck);
        let responder = self.responder.fire(TimerKind::SendAck);
        initiator || responder
    }

    /// Pump traffic and fire send-ack timers until `done` holds, or until
    /// nothing moves any more
    pub fn run_until(&mut self, done: impl Fn(&SimLink) -> bool) -> bool {
        for _ in 0..100_000 {
            self.pump();
            if done(self) {
                return true;
            }
            if !self.fire_send_ack_timers() {
                self.pump();
                return done(self);
            }
        }
        false
    }
}

/// Deterministic test payload
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
