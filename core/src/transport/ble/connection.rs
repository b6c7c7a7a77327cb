//! BTP connection state machine
//!
//! One [`Connection`] per platform link. It runs the capabilities handshake,
//! feeds the fragment codec, and keeps at most one GATT operation in flight.
//!
//! ```text
//!            start_connect / first subscribe or request
//!   Ready ──────────────────────────────────────────────▶ Connecting
//!                                                            │ handshake ok
//!                                                            ▼
//!   Closed ◀──── drained (+ unsubscribe) ──── Closing ◀── Connected
//!      ▲                                                     │
//!      └──────────────── Aborting ◀──── any error ───────────┘
//! ```
//!
//! The connection never blocks and never locks. The registry hands it a
//! [`Context`] with the platform collaborators for the duration of each
//! dispatched event.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::capabilities::{
    highest_supported_version, CapabilitiesRequest, CapabilitiesResponse, MAX_SUPPORTED_VERSION,
    MIN_SUPPORTED_VERSION,
};
use super::codec::{
    FragmentCodec, DEFAULT_FRAGMENT_SIZE, MIN_FRAGMENT_SIZE, STANDALONE_ACK_HEADER_SIZE,
};
use super::config::BtpConfig;
use super::gatt::{
    ConnectionObject, GattCharacteristic, GattDriver, ATT_HEADER_SIZE, BTP_SERVICE_UUID,
};
use super::timer::{ArmedTimers, TimerKind, TimerScheduler};
use crate::BtpError;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Ready,
    Connecting,
    Connected,
    Closing,
    Aborting,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Ready => write!(f, "ready"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::Aborting => write!(f, "aborting"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Which side of the link this connection plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// GATT client: writes C1, subscribes to C2
    Initiator,
    /// GATT server: receives writes on C1, indicates on C2
    Responder,
}

impl Role {
    /// Characteristic this role sends fragments on
    pub fn send_characteristic(self) -> GattCharacteristic {
        match self {
            Role::Initiator => GattCharacteristic::Write,
            Role::Responder => GattCharacteristic::Indicate,
        }
    }

    /// Characteristic this role receives fragments on
    pub fn receive_characteristic(self) -> GattCharacteristic {
        match self {
            Role::Initiator => GattCharacteristic::Indicate,
            Role::Responder => GattCharacteristic::Write,
        }
    }

    fn send_error(self) -> BtpError {
        match self {
            Role::Initiator => BtpError::GattWriteFailed,
            Role::Responder => BtpError::GattIndicationFailed,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

/// Upper-layer callbacks.
///
/// Each connection makes exactly one terminal report: `on_connection_complete`
/// with an error if the handshake never finished, otherwise
/// `on_connection_closed`. Local aborts and app-closed links report nothing.
pub trait BtpDelegate: Send {
    fn on_connection_complete(&mut self, connection: ConnectionObject, result: Result<(), BtpError>);
    fn on_message_received(&mut self, connection: ConnectionObject, message: Vec<u8>);
    fn on_connection_closed(&mut self, connection: ConnectionObject, result: Result<(), BtpError>);
}

/// Platform collaborators borrowed for one dispatched event
pub struct Context<'a> {
    pub gatt: &'a mut dyn GattDriver,
    pub timers: &'a mut dyn TimerScheduler,
    pub delegate: &'a mut dyn BtpDelegate,
}

/// What to do with the platform link on teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkRelease {
    /// Already gone; no GATT calls allowed
    Gone,
    Close,
    /// Graceful initiator close: unsubscribe first, close once it completes
    Unsubscribe,
}

/// Fragment size a responder offers for a link MTU
pub fn negotiated_fragment_size(mtu: u16, max_fragment_size: u16) -> u16 {
    if mtu == 0 {
        return DEFAULT_FRAGMENT_SIZE.min(max_fragment_size);
    }
    mtu.saturating_sub(ATT_HEADER_SIZE)
        .max(DEFAULT_FRAGMENT_SIZE)
        .min(max_fragment_size)
}

/// One BTP session over one platform link
#[derive(Debug)]
pub struct Connection {
    connection_object: ConnectionObject,
    role: Role,
    state: ConnectionState,
    config: BtpConfig,
    codec: FragmentCodec,
    send_queue: VecDeque<Vec<u8>>,
    timers: ArmedTimers,

    gatt_operation_in_flight: bool,
    standalone_ack_pending: bool,

    did_begin_subscribe: bool,
    subscribed: bool,
    capabilities_request_received: bool,
    capabilities_request: Option<CapabilitiesRequest>,
    handshake_failure: Option<BtpError>,
    handshake_complete: bool,

    awaiting_unsubscribe: bool,
    finalized: bool,
}

impl Connection {
    fn new(connection_object: ConnectionObject, role: Role, config: BtpConfig) -> Self {
        let codec = FragmentCodec::new(DEFAULT_FRAGMENT_SIZE, 1, config.max_message_size);
        Self {
            connection_object,
            role,
            state: ConnectionState::Ready,
            config,
            codec,
            send_queue: VecDeque::new(),
            timers: ArmedTimers::default(),
            gatt_operation_in_flight: false,
            standalone_ack_pending: false,
            did_begin_subscribe: false,
            subscribed: false,
            capabilities_request_received: false,
            capabilities_request: None,
            handshake_failure: None,
            handshake_complete: false,
            awaiting_unsubscribe: false,
            finalized: false,
        }
    }

    pub fn new_initiator(connection_object: ConnectionObject, config: BtpConfig) -> Self {
        Self::new(connection_object, Role::Initiator, config)
    }

    pub fn new_responder(connection_object: ConnectionObject, config: BtpConfig) -> Self {
        Self::new(connection_object, Role::Responder, config)
    }

    pub fn connection_object(&self) -> ConnectionObject {
        self.connection_object
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Messages accepted by `send` and not yet handed to the codec
    pub fn queued_messages(&self) -> usize {
        self.send_queue.len()
    }

    pub fn codec(&self) -> &FragmentCodec {
        &self.codec
    }

    pub fn armed_timers(&self) -> ArmedTimers {
        self.timers
    }

    pub fn is_gatt_operation_in_flight(&self) -> bool {
        self.gatt_operation_in_flight
    }

    // ========================================================================
    // UPPER-LAYER OPERATIONS
    // ========================================================================

    /// Open the session: write a capabilities request and wait for the response.
    ///
    /// On failure the connection is closed without delegate callbacks; the
    /// error is returned to the caller instead.
    pub fn start_connect(&mut self, ctx: &mut Context<'_>) -> Result<(), BtpError> {
        if self.role != Role::Initiator || self.state != ConnectionState::Ready {
            return Err(BtpError::IncorrectState(self.state));
        }

        let mtu = ctx.gatt.get_mtu(self.connection_object);
        let request = CapabilitiesRequest::new(mtu, self.config.max_window_size);

        self.state = ConnectionState::Connecting;
        let result = self.start_timer(ctx, TimerKind::Connect).and_then(|()| {
            let characteristic = GattCharacteristic::Write.uuid();
            if ctx.gatt.send_write(
                self.connection_object,
                &BTP_SERVICE_UUID,
                &characteristic,
                &request.encode(),
            ) {
                Ok(())
            } else {
                Err(BtpError::GattWriteFailed)
            }
        });

        if let Err(e) = result {
            warn!("BTP connect on {} failed: {}", self.connection_object, e);
            self.teardown(ctx, None, LinkRelease::Gone);
            return Err(e);
        }

        self.gatt_operation_in_flight = true;
        info!(
            "BTP connect started on {} (mtu {}, window {})",
            self.connection_object, mtu, self.config.max_window_size
        );
        Ok(())
    }

    /// Queue a message for delivery
    pub fn send(&mut self, ctx: &mut Context<'_>, message: Vec<u8>) -> Result<(), BtpError> {
        if self.state != ConnectionState::Connected {
            return Err(BtpError::IncorrectState(self.state));
        }
        let max = usize::from(self.config.max_message_size);
        if message.len() > max {
            return Err(BtpError::MessageTooLarge {
                len: message.len(),
                max,
            });
        }

        trace!(
            "Queued {} byte message on {} ({} ahead)",
            message.len(),
            self.connection_object,
            self.send_queue.len()
        );
        self.send_queue.push_back(message);
        self.drive_sending(ctx);
        Ok(())
    }

    /// Graceful close: finish queued messages and wait for every ack first.
    ///
    /// A connection still in its handshake is aborted instead.
    pub fn close(&mut self, ctx: &mut Context<'_>) -> Result<(), BtpError> {
        match self.state {
            ConnectionState::Connected => {
                info!(
                    "Closing BTP connection {} ({} queued)",
                    self.connection_object,
                    self.send_queue.len()
                );
                self.state = ConnectionState::Closing;
                self.finish_close_if_drained(ctx);
                Ok(())
            }
            ConnectionState::Closing => Ok(()),
            ConnectionState::Ready | ConnectionState::Connecting => {
                self.abort(ctx);
                Ok(())
            }
            ConnectionState::Aborting | ConnectionState::Closed => {
                Err(BtpError::IncorrectState(self.state))
            }
        }
    }

    /// Abrupt local close. Discards everything and reports nothing.
    pub fn abort(&mut self, ctx: &mut Context<'_>) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if self.finalized {
            self.release_link(ctx);
            return;
        }
        info!("Aborting BTP connection {}", self.connection_object);
        self.state = ConnectionState::Aborting;
        self.teardown(ctx, None, LinkRelease::Close);
    }

    // ========================================================================
    // PLATFORM UPCALLS
    // ========================================================================

    /// The initiator subscribed to C2 (responder side)
    pub fn handle_subscribe_received(&mut self, ctx: &mut Context<'_>) {
        if self.role != Role::Responder {
            return;
        }
        match self.state {
            ConnectionState::Ready => {
                if let Err(e) = self.begin_responder_handshake(ctx) {
                    self.close_with_error(ctx, e);
                    return;
                }
                self.subscribed = true;
            }
            ConnectionState::Connecting if !self.subscribed => {
                self.subscribed = true;
                if self.capabilities_request.is_some() {
                    self.send_capabilities_response(ctx);
                }
            }
            _ => debug!(
                "Ignoring subscribe on {} in state {}",
                self.connection_object, self.state
            ),
        }
    }

    /// Our subscription to C2 is in place (initiator side)
    pub fn handle_subscribe_complete(&mut self, _ctx: &mut Context<'_>) {
        if self.role == Role::Initiator && self.did_begin_subscribe {
            debug!("Subscribed to BTP indications on {}", self.connection_object);
            self.subscribed = true;
        }
    }

    /// The initiator dropped its subscription (responder side)
    pub fn handle_unsubscribe_received(&mut self, ctx: &mut Context<'_>) {
        if self.role != Role::Responder || self.state == ConnectionState::Closed {
            return;
        }
        self.subscribed = false;
        self.close_with_error(ctx, BtpError::PeerUnsubscribed);
    }

    /// Our unsubscribe finished (initiator side)
    pub fn handle_unsubscribe_complete(&mut self, ctx: &mut Context<'_>) {
        self.subscribed = false;
        if self.awaiting_unsubscribe {
            self.release_link(ctx);
        }
    }

    /// Bytes arrived on this role's receive characteristic
    pub fn receive(&mut self, ctx: &mut Context<'_>, bytes: &[u8]) {
        match (self.state, self.role) {
            (ConnectionState::Ready, Role::Responder) => {
                self.handle_capabilities_request(ctx, bytes)
            }
            (ConnectionState::Connecting, Role::Responder) => {
                if !self.capabilities_request_received {
                    self.handle_capabilities_request(ctx, bytes);
                } else if self.gatt_operation_in_flight && self.handshake_failure.is_none() {
                    // The initiator only writes data after reading our
                    // response, so this doubles as its confirmation.
                    self.complete_responder_handshake(ctx);
                    if self.state == ConnectionState::Connected {
                        self.handle_fragment(ctx, bytes);
                    }
                } else {
                    debug!(
                        "Dropping {} bytes on {} during handshake",
                        bytes.len(),
                        self.connection_object
                    );
                }
            }
            (ConnectionState::Connecting, Role::Initiator) => {
                self.handle_capabilities_response(ctx, bytes)
            }
            (ConnectionState::Connected | ConnectionState::Closing, _) if !self.finalized => {
                self.handle_fragment(ctx, bytes)
            }
            (state, _) => debug!(
                "Dropping {} bytes on {} in state {}",
                bytes.len(),
                self.connection_object,
                state
            ),
        }
    }

    /// The platform finished our last write (initiator) or indication (responder)
    pub fn handle_send_confirmation(&mut self, ctx: &mut Context<'_>) {
        if !self.gatt_operation_in_flight {
            debug!(
                "Ignoring unexpected send confirmation on {}",
                self.connection_object
            );
            return;
        }
        self.gatt_operation_in_flight = false;

        match (self.state, self.role) {
            (ConnectionState::Connecting, Role::Initiator) => {
                // Capabilities request written; the response comes back on C2
                let characteristic = GattCharacteristic::Indicate.uuid();
                if !ctx.gatt.subscribe(
                    self.connection_object,
                    &BTP_SERVICE_UUID,
                    &characteristic,
                ) {
                    self.close_with_error(ctx, BtpError::GattSubscribeFailed);
                    return;
                }
                self.did_begin_subscribe = true;
            }
            (ConnectionState::Connecting, Role::Responder) => {
                self.complete_responder_handshake(ctx);
                self.drive_sending(ctx);
            }
            (ConnectionState::Aborting, _) if !self.finalized => {
                // Our version-0 response reached the initiator
                let error = self
                    .handshake_failure
                    .take()
                    .unwrap_or(BtpError::IncompatibleProtocolVersions);
                self.close_with_error(ctx, error);
            }
            (ConnectionState::Connected | ConnectionState::Closing, _) => {
                self.drive_sending(ctx);
                self.finish_close_if_drained(ctx);
            }
            _ => {}
        }
    }

    /// The platform reports the link failed or went away
    pub fn handle_connection_error(&mut self, ctx: &mut Context<'_>, error: BtpError) {
        self.close_with_error(ctx, error);
    }

    /// The application tore the link down itself
    pub fn handle_app_closed_connection(&mut self, ctx: &mut Context<'_>) {
        self.close_with_error(ctx, BtpError::AppClosedConnection);
    }

    pub fn handle_timer_expired(&mut self, ctx: &mut Context<'_>, timer: TimerKind) {
        if !self.timers.is_armed(timer) {
            debug!("Ignoring stale {} timer on {}", timer, self.connection_object);
            return;
        }
        self.timers.set(timer, false);
        debug!("{} timer expired on {}", timer, self.connection_object);

        match timer {
            TimerKind::Connect => {
                if self.state == ConnectionState::Connecting {
                    self.close_with_error(ctx, BtpError::ConnectTimedOut);
                }
            }
            TimerKind::ReceiveConnection => {
                if matches!(
                    self.state,
                    ConnectionState::Connecting | ConnectionState::Aborting
                ) {
                    let error = self
                        .handshake_failure
                        .take()
                        .unwrap_or(BtpError::ReceiveConnectionTimedOut);
                    self.close_with_error(ctx, error);
                }
            }
            TimerKind::AckReceived => {
                if self.codec.has_unacked_data() {
                    self.close_with_error(ctx, BtpError::AckTimedOut);
                }
            }
            TimerKind::SendAck => {
                if self.is_open() && self.codec.has_unacked_rx_data() {
                    self.standalone_ack_pending = true;
                    self.drive_sending(ctx);
                }
            }
            TimerKind::Unsubscribe => {
                if self.awaiting_unsubscribe {
                    debug!(
                        "Unsubscribe on {} not confirmed, closing anyway",
                        self.connection_object
                    );
                    self.release_link(ctx);
                }
            }
        }
    }

    // ========================================================================
    // HANDSHAKE
    // ========================================================================

    fn begin_responder_handshake(&mut self, ctx: &mut Context<'_>) -> Result<(), BtpError> {
        self.state = ConnectionState::Connecting;
        self.start_timer(ctx, TimerKind::ReceiveConnection)
    }

    fn handle_capabilities_request(&mut self, ctx: &mut Context<'_>, bytes: &[u8]) {
        let request = match CapabilitiesRequest::decode(bytes) {
            Ok(request) => request,
            Err(e) => {
                self.close_with_error(ctx, e);
                return;
            }
        };
        if self.state == ConnectionState::Ready {
            if let Err(e) = self.begin_responder_handshake(ctx) {
                self.close_with_error(ctx, e);
                return;
            }
        }

        debug!(
            "Capabilities request on {}: mtu {}, window {}, versions {:?}",
            self.connection_object,
            request.mtu,
            request.window_size,
            request.supported_versions().collect::<Vec<_>>()
        );
        self.capabilities_request_received = true;
        self.capabilities_request = Some(request);
        if self.subscribed {
            self.send_capabilities_response(ctx);
        }
    }

    fn send_capabilities_response(&mut self, ctx: &mut Context<'_>) {
        let Some(request) = self.capabilities_request.take() else {
            return;
        };

        let mtu = if request.mtu > 0 {
            request.mtu
        } else {
            ctx.gatt.get_mtu(self.connection_object)
        };
        let fragment_size = negotiated_fragment_size(mtu, self.config.max_fragment_size);
        let window_size = request.window_size.min(self.config.max_window_size);
        let mut selected_version =
            highest_supported_version(&request, MIN_SUPPORTED_VERSION, MAX_SUPPORTED_VERSION);

        if selected_version == 0 {
            self.handshake_failure = Some(BtpError::IncompatibleProtocolVersions);
        } else if window_size == 0 {
            self.handshake_failure = Some(BtpError::InvalidWindowSize(0));
            selected_version = 0;
        }

        let response = CapabilitiesResponse {
            fragment_size,
            selected_version,
            window_size,
        };

        if let Some(error) = &self.handshake_failure {
            warn!(
                "Rejecting BTP handshake on {}: {}",
                self.connection_object, error
            );
            self.state = ConnectionState::Aborting;
        } else {
            self.codec = FragmentCodec::new_responder(
                fragment_size,
                window_size,
                self.config.max_message_size,
            );
            debug!(
                "Capabilities response on {}: version {}, fragment {}, window {}",
                self.connection_object, selected_version, fragment_size, window_size
            );
        }

        let characteristic = GattCharacteristic::Indicate.uuid();
        if !ctx.gatt.send_indication(
            self.connection_object,
            &BTP_SERVICE_UUID,
            &characteristic,
            &response.encode(),
        ) {
            self.close_with_error(ctx, BtpError::GattIndicationFailed);
            return;
        }
        self.gatt_operation_in_flight = true;
    }

    fn complete_responder_handshake(&mut self, ctx: &mut Context<'_>) {
        self.stop_timer(ctx, TimerKind::ReceiveConnection);
        if let Err(e) = self.start_timer(ctx, TimerKind::AckReceived) {
            self.close_with_error(ctx, e);
            return;
        }
        self.state = ConnectionState::Connected;
        self.handshake_complete = true;

        info!(
            "BTP connection {} established as responder (fragment {}, window {})",
            self.connection_object,
            self.codec.tx_fragment_size(),
            self.codec.tx_window_size()
        );
        ctx.delegate
            .on_connection_complete(self.connection_object, Ok(()));
    }

    fn validate_response(response: &CapabilitiesResponse) -> Result<(), BtpError> {
        if !(MIN_SUPPORTED_VERSION..=MAX_SUPPORTED_VERSION).contains(&response.selected_version) {
            return Err(BtpError::IncompatibleProtocolVersions);
        }
        if response.fragment_size < MIN_FRAGMENT_SIZE {
            return Err(BtpError::InvalidFragmentSize(response.fragment_size));
        }
        if response.window_size == 0 {
            return Err(BtpError::InvalidWindowSize(response.window_size));
        }
        Ok(())
    }

    fn handle_capabilities_response(&mut self, ctx: &mut Context<'_>, bytes: &[u8]) {
        let response = match CapabilitiesResponse::decode(bytes)
            .and_then(|response| Self::validate_response(&response).map(|()| response))
        {
            Ok(response) => response,
            Err(e) => {
                self.close_with_error(ctx, e);
                return;
            }
        };

        let fragment_size = response.fragment_size.min(self.config.max_fragment_size);
        let window_size = response.window_size.min(self.config.max_window_size);
        // The responder indicates with the size it offered
        self.codec =
            FragmentCodec::new_initiator(fragment_size, window_size, self.config.max_message_size)
                .with_rx_fragment_size(response.fragment_size);

        self.stop_timer(ctx, TimerKind::Connect);
        // The response itself is owed an ack
        if let Err(e) = self.start_timer(ctx, TimerKind::SendAck) {
            self.close_with_error(ctx, e);
            return;
        }
        self.state = ConnectionState::Connected;
        self.handshake_complete = true;

        info!(
            "BTP connection {} established as initiator (version {}, fragment {}, window {})",
            self.connection_object, response.selected_version, fragment_size, window_size
        );
        ctx.delegate
            .on_connection_complete(self.connection_object, Ok(()));
        self.drive_sending(ctx);
    }

    // ========================================================================
    // DATA PATH
    // ========================================================================

    fn handle_fragment(&mut self, ctx: &mut Context<'_>, bytes: &[u8]) {
        let received = match self.codec.handle_characteristic_received(bytes) {
            Ok(received) => received,
            Err(e) => {
                self.close_with_error(ctx, e);
                return;
            }
        };

        if received.did_receive_ack() {
            self.stop_timer(ctx, TimerKind::AckReceived);
            if self.codec.has_unacked_data() {
                if let Err(e) = self.start_timer(ctx, TimerKind::AckReceived) {
                    self.close_with_error(ctx, e);
                    return;
                }
            }
        }

        if let Err(e) = self.schedule_ack(ctx, received.carried_data) {
            self.close_with_error(ctx, e);
            return;
        }

        if let Some(message) = received.message {
            debug!(
                "Received {} byte message on {}",
                message.len(),
                self.connection_object
            );
            ctx.delegate
                .on_message_received(self.connection_object, message);
        }

        self.drive_sending(ctx);
        self.finish_close_if_drained(ctx);
    }

    /// Decide how the ack owed for received fragments goes out.
    ///
    /// Bare acks never trigger an immediate ack of their own, otherwise two
    /// idle peers would bounce standalone acks back and forth.
    fn schedule_ack(&mut self, ctx: &mut Context<'_>, carried_data: bool) -> Result<(), BtpError> {
        if !self.codec.has_unacked_rx_data() || self.standalone_ack_pending {
            return Ok(());
        }
        let threshold = usize::from(self.codec.tx_window_size().saturating_sub(1)).max(1);
        if carried_data && !self.can_piggyback_ack() && self.codec.rx_unacked_count() >= threshold {
            // The peer's window is about to close; don't wait for the timer
            self.standalone_ack_pending = true;
        } else if !self.timers.is_armed(TimerKind::SendAck) {
            self.start_timer(ctx, TimerKind::SendAck)?;
        }
        Ok(())
    }

    fn can_piggyback_ack(&self) -> bool {
        (!self.send_queue.is_empty() || self.codec.is_sending()) && self.codec.tx_window_open()
    }

    fn is_open(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Closing
        ) && !self.finalized
    }

    /// Send the next fragment if nothing is in flight and the window allows
    fn drive_sending(&mut self, ctx: &mut Context<'_>) {
        if self.gatt_operation_in_flight || !self.is_open() {
            return;
        }

        if self.standalone_ack_pending {
            if self.can_piggyback_ack() {
                self.standalone_ack_pending = false;
            } else {
                self.send_standalone_ack(ctx);
                return;
            }
        }

        let send_ack = self.codec.has_unacked_rx_data();
        let fragment = match self
            .codec
            .handle_characteristic_send(&mut self.send_queue, send_ack)
        {
            Ok(Some(fragment)) => fragment,
            Ok(None) => return,
            Err(e) => {
                self.close_with_error(ctx, e);
                return;
            }
        };
        if send_ack {
            self.stop_timer(ctx, TimerKind::SendAck);
        }
        self.send_fragment(ctx, &fragment);
    }

    fn send_standalone_ack(&mut self, ctx: &mut Context<'_>) {
        self.standalone_ack_pending = false;
        if !self.codec.has_unacked_rx_data() {
            return;
        }
        let mut ack = Vec::with_capacity(STANDALONE_ACK_HEADER_SIZE);
        self.codec.encode_standalone_ack(&mut ack);
        self.stop_timer(ctx, TimerKind::SendAck);
        self.send_fragment(ctx, &ack);
    }

    fn send_fragment(&mut self, ctx: &mut Context<'_>, fragment: &[u8]) {
        let characteristic = self.role.send_characteristic().uuid();
        let accepted = match self.role {
            Role::Initiator => ctx.gatt.send_write(
                self.connection_object,
                &BTP_SERVICE_UUID,
                &characteristic,
                fragment,
            ),
            Role::Responder => ctx.gatt.send_indication(
                self.connection_object,
                &BTP_SERVICE_UUID,
                &characteristic,
                fragment,
            ),
        };
        if !accepted {
            self.close_with_error(ctx, self.role.send_error());
            return;
        }
        self.gatt_operation_in_flight = true;

        if !self.timers.is_armed(TimerKind::AckReceived) {
            if let Err(e) = self.start_timer(ctx, TimerKind::AckReceived) {
                self.close_with_error(ctx, e);
            }
        }
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    fn finish_close_if_drained(&mut self, ctx: &mut Context<'_>) {
        if self.state != ConnectionState::Closing || self.finalized {
            return;
        }
        let drained = self.send_queue.is_empty()
            && !self.codec.is_sending()
            && !self.gatt_operation_in_flight
            && !self.standalone_ack_pending
            && !self.codec.has_unacked_data();
        if !drained {
            return;
        }

        info!(
            "BTP connection {} closed ({} messages sent, {} received)",
            self.connection_object,
            self.codec.tx_message_count(),
            self.codec.rx_message_count()
        );
        let release = if self.role == Role::Initiator && self.subscribed {
            LinkRelease::Unsubscribe
        } else {
            LinkRelease::Close
        };
        self.teardown(ctx, Some(Ok(())), release);
    }

    fn close_with_error(&mut self, ctx: &mut Context<'_>, error: BtpError) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if self.finalized {
            // Only the link is left to release
            if error.link_released() {
                self.awaiting_unsubscribe = false;
                self.stop_timer(ctx, TimerKind::Unsubscribe);
                self.state = ConnectionState::Closed;
            } else {
                self.release_link(ctx);
            }
            return;
        }

        warn!(
            "BTP connection {} aborted in state {}: {}",
            self.connection_object, self.state, error
        );
        self.state = ConnectionState::Aborting;
        let release = if error.link_released() {
            LinkRelease::Gone
        } else {
            LinkRelease::Close
        };
        let report = (error != BtpError::AppClosedConnection).then_some(Err(error));
        self.teardown(ctx, report, release);
    }

    /// Drop all protocol state, make the one terminal report, release the link
    fn teardown(
        &mut self,
        ctx: &mut Context<'_>,
        report: Option<Result<(), BtpError>>,
        release: LinkRelease,
    ) {
        for timer in TimerKind::ALL {
            self.stop_timer(ctx, timer);
        }
        if !self.send_queue.is_empty() {
            debug!(
                "Discarding {} queued messages on {}",
                self.send_queue.len(),
                self.connection_object
            );
        }
        self.send_queue.clear();
        self.codec.reset();
        self.standalone_ack_pending = false;
        self.capabilities_request = None;
        self.handshake_failure = None;
        self.finalized = true;

        if let Some(result) = report {
            if self.handshake_complete {
                ctx.delegate
                    .on_connection_closed(self.connection_object, result);
            } else {
                ctx.delegate
                    .on_connection_complete(self.connection_object, result);
            }
        }

        match release {
            LinkRelease::Gone => self.state = ConnectionState::Closed,
            LinkRelease::Close => self.release_link(ctx),
            LinkRelease::Unsubscribe => {
                let characteristic = GattCharacteristic::Indicate.uuid();
                let unsubscribing = ctx.gatt.unsubscribe(
                    self.connection_object,
                    &BTP_SERVICE_UUID,
                    &characteristic,
                ) && self.start_timer(ctx, TimerKind::Unsubscribe).is_ok();
                if unsubscribing {
                    self.awaiting_unsubscribe = true;
                    self.state = ConnectionState::Closing;
                } else {
                    self.release_link(ctx);
                }
            }
        }
    }

    fn release_link(&mut self, ctx: &mut Context<'_>) {
        self.awaiting_unsubscribe = false;
        self.stop_timer(ctx, TimerKind::Unsubscribe);
        if !ctx.gatt.close_connection(self.connection_object) {
            debug!(
                "Platform refused to close {}, dropping it anyway",
                self.connection_object
            );
        }
        self.state = ConnectionState::Closed;
    }

    // ========================================================================
    // TIMERS
    // ========================================================================

    fn timeout(&self, timer: TimerKind) -> Duration {
        match timer {
            TimerKind::Connect => self.config.connect_timeout(),
            TimerKind::ReceiveConnection => self.config.receive_connection_timeout(),
            TimerKind::AckReceived => self.config.ack_timeout(),
            TimerKind::SendAck => self.config.send_ack_timeout(),
            TimerKind::Unsubscribe => self.config.unsubscribe_timeout(),
        }
    }

    fn start_timer(&mut self, ctx: &mut Context<'_>, timer: TimerKind) -> Result<(), BtpError> {
        let after = self.timeout(timer);
        if !ctx
            .timers
            .start_timer(self.connection_object, timer, after)
        {
            return Err(BtpError::TimerStartFailed(timer));
        }
        self.timers.set(timer, true);
        Ok(())
    }

    fn stop_timer(&mut self, ctx: &mut Context<'_>, timer: TimerKind) {
        if self.timers.is_armed(timer) {
            ctx.timers.cancel_timer(self.connection_object, timer);
            self.timers.set(timer, false);
        }
    }
}
