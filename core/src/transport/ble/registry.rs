//! Connection registry
//!
//! Owns every live [`Connection`] plus the platform collaborators, and routes
//! GATT upcalls to the connection that owns the platform link. The platform
//! may host other services on the same GATT server, so every upcall answers
//! whether the event was BTP's.

use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::capabilities::is_capabilities_request;
use super::config::{BtpConfig, ConfigError};
use super::connection::{BtpDelegate, Connection, ConnectionState, Context};
use super::gatt::{ConnectionObject, GattCharacteristic, GattDriver};
use super::timer::{TimerKind, TimerScheduler};
use crate::BtpError;

pub struct ConnectionRegistry {
    config: BtpConfig,
    gatt: Box<dyn GattDriver>,
    timers: Box<dyn TimerScheduler>,
    delegate: Box<dyn BtpDelegate>,
    connections: HashMap<ConnectionObject, Connection>,
}

impl ConnectionRegistry {
    pub fn new(
        config: BtpConfig,
        gatt: Box<dyn GattDriver>,
        timers: Box<dyn TimerScheduler>,
        delegate: Box<dyn BtpDelegate>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            gatt,
            timers,
            delegate,
            connections: HashMap::new(),
        })
    }

    pub fn config(&self) -> &BtpConfig {
        &self.config
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_state(&self, connection: ConnectionObject) -> Option<ConnectionState> {
        self.connections.get(&connection).map(Connection::state)
    }

    pub fn connection(&self, connection: ConnectionObject) -> Option<&Connection> {
        self.connections.get(&connection)
    }

    /// Run `f` against one connection with the collaborators borrowed, then
    /// drop the connection if it ended up closed.
    fn with_connection<R>(
        &mut self,
        connection_object: ConnectionObject,
        f: impl FnOnce(&mut Connection, &mut Context<'_>) -> R,
    ) -> Option<R> {
        let connection = self.connections.get_mut(&connection_object)?;
        let mut ctx = Context {
            gatt: self.gatt.as_mut(),
            timers: self.timers.as_mut(),
            delegate: self.delegate.as_mut(),
        };
        let result = f(connection, &mut ctx);

        if connection.state() == ConnectionState::Closed {
            self.connections.remove(&connection_object);
            debug!(
                "Removed closed connection {} ({} remaining)",
                connection_object,
                self.connections.len()
            );
        }
        Some(result)
    }

    fn check_capacity(&self, connection_object: ConnectionObject) -> Result<(), BtpError> {
        if self.connections.contains_key(&connection_object) {
            return Err(BtpError::ConnectionExists(connection_object));
        }
        if self.connections.len() >= self.config.max_connections {
            return Err(BtpError::TooManyConnections {
                max: self.config.max_connections,
            });
        }
        Ok(())
    }

    /// Accept an inbound link as responder
    fn admit_responder(&mut self, connection_object: ConnectionObject) -> bool {
        if let Err(e) = self.check_capacity(connection_object) {
            warn!("Refusing BTP peer on {}: {}", connection_object, e);
            return false;
        }
        info!("New BTP responder connection on {}", connection_object);
        self.connections.insert(
            connection_object,
            Connection::new_responder(connection_object, self.config.clone()),
        );
        true
    }

    // ========================================================================
    // UPPER-LAYER OPERATIONS
    // ========================================================================

    /// Open a BTP session as initiator over an established platform link
    pub fn connect(&mut self, connection_object: ConnectionObject) -> Result<(), BtpError> {
        self.check_capacity(connection_object)?;
        self.connections.insert(
            connection_object,
            Connection::new_initiator(connection_object, self.config.clone()),
        );
        self.with_connection(connection_object, |conn, ctx| conn.start_connect(ctx))
            .unwrap_or(Err(BtpError::UnknownConnection(connection_object)))
    }

    pub fn send(
        &mut self,
        connection_object: ConnectionObject,
        message: Vec<u8>,
    ) -> Result<(), BtpError> {
        self.with_connection(connection_object, |conn, ctx| conn.send(ctx, message))
            .unwrap_or(Err(BtpError::UnknownConnection(connection_object)))
    }

    /// Graceful close once everything queued has been delivered and acknowledged
    pub fn close(&mut self, connection_object: ConnectionObject) -> Result<(), BtpError> {
        self.with_connection(connection_object, |conn, ctx| conn.close(ctx))
            .unwrap_or(Err(BtpError::UnknownConnection(connection_object)))
    }

    /// Immediate close without delegate callbacks
    pub fn abort(&mut self, connection_object: ConnectionObject) -> Result<(), BtpError> {
        self.with_connection(connection_object, |conn, ctx| conn.abort(ctx))
            .ok_or(BtpError::UnknownConnection(connection_object))
    }

    /// The application already released the platform link
    pub fn close_ble_connection(&mut self, connection_object: ConnectionObject) -> bool {
        self.with_connection(connection_object, |conn, ctx| {
            conn.handle_app_closed_connection(ctx)
        })
        .is_some()
    }

    // ========================================================================
    // PLATFORM UPCALLS
    // ========================================================================

    fn is_btp(service: &Uuid, characteristic: &Uuid, expected: GattCharacteristic) -> bool {
        GattCharacteristic::from_ids(service, characteristic) == Some(expected)
    }

    /// The initiator subscribed to our indication characteristic
    pub fn handle_subscribe_received(
        &mut self,
        connection_object: ConnectionObject,
        service: &Uuid,
        characteristic: &Uuid,
    ) -> bool {
        if !Self::is_btp(service, characteristic, GattCharacteristic::Indicate) {
            return false;
        }
        if !self.connections.contains_key(&connection_object)
            && !self.admit_responder(connection_object)
        {
            return true;
        }
        self.with_connection(connection_object, |conn, ctx| {
            conn.handle_subscribe_received(ctx)
        });
        true
    }

    pub fn handle_subscribe_complete(
        &mut self,
        connection_object: ConnectionObject,
        service: &Uuid,
        characteristic: &Uuid,
    ) -> bool {
        if !Self::is_btp(service, characteristic, GattCharacteristic::Indicate) {
            return false;
        }
        self.with_connection(connection_object, |conn, ctx| {
            conn.handle_subscribe_complete(ctx)
        });
        true
    }

    pub fn handle_unsubscribe_received(
        &mut self,
        connection_object: ConnectionObject,
        service: &Uuid,
        characteristic: &Uuid,
    ) -> bool {
        if !Self::is_btp(service, characteristic, GattCharacteristic::Indicate) {
            return false;
        }
        self.with_connection(connection_object, |conn, ctx| {
            conn.handle_unsubscribe_received(ctx)
        });
        true
    }

    pub fn handle_unsubscribe_complete(
        &mut self,
        connection_object: ConnectionObject,
        service: &Uuid,
        characteristic: &Uuid,
    ) -> bool {
        if !Self::is_btp(service, characteristic, GattCharacteristic::Indicate) {
            return false;
        }
        self.with_connection(connection_object, |conn, ctx| {
            conn.handle_unsubscribe_complete(ctx)
        });
        true
    }

    /// The initiator wrote to C1
    pub fn handle_write_received(
        &mut self,
        connection_object: ConnectionObject,
        service: &Uuid,
        characteristic: &Uuid,
        data: &[u8],
    ) -> bool {
        if !Self::is_btp(service, characteristic, GattCharacteristic::Write) {
            return false;
        }
        if !self.connections.contains_key(&connection_object) {
            if !is_capabilities_request(data) {
                debug!(
                    "Dropping {} byte write from unknown peer {}",
                    data.len(),
                    connection_object
                );
                return true;
            }
            if !self.admit_responder(connection_object) {
                return true;
            }
        }
        self.dispatch_received(connection_object, GattCharacteristic::Write, data);
        true
    }

    /// The responder indicated on C2
    pub fn handle_indication_received(
        &mut self,
        connection_object: ConnectionObject,
        service: &Uuid,
        characteristic: &Uuid,
        data: &[u8],
    ) -> bool {
        if !Self::is_btp(service, characteristic, GattCharacteristic::Indicate) {
            return false;
        }
        self.dispatch_received(connection_object, GattCharacteristic::Indicate, data);
        true
    }

    fn dispatch_received(
        &mut self,
        connection_object: ConnectionObject,
        characteristic: GattCharacteristic,
        data: &[u8],
    ) {
        let handled = self.with_connection(connection_object, |conn, ctx| {
            if conn.role().receive_characteristic() == characteristic {
                conn.receive(ctx, data);
                true
            } else {
                false
            }
        });
        if handled != Some(true) {
            debug!(
                "Ignoring {} bytes on {:?} for {}",
                data.len(),
                characteristic,
                connection_object
            );
        }
    }

    pub fn handle_write_confirmation(
        &mut self,
        connection_object: ConnectionObject,
        service: &Uuid,
        characteristic: &Uuid,
    ) -> bool {
        if !Self::is_btp(service, characteristic, GattCharacteristic::Write) {
            return false;
        }
        self.with_connection(connection_object, |conn, ctx| {
            conn.handle_send_confirmation(ctx)
        });
        true
    }

    pub fn handle_indication_confirmation(
        &mut self,
        connection_object: ConnectionObject,
        service: &Uuid,
        characteristic: &Uuid,
    ) -> bool {
        if !Self::is_btp(service, characteristic, GattCharacteristic::Indicate) {
            return false;
        }
        self.with_connection(connection_object, |conn, ctx| {
            conn.handle_send_confirmation(ctx)
        });
        true
    }

    /// The platform lost or failed the link; unclaimed when BTP doesn't own it
    pub fn handle_connection_error(
        &mut self,
        connection_object: ConnectionObject,
        error: BtpError,
    ) -> bool {
        self.with_connection(connection_object, |conn, ctx| {
            conn.handle_connection_error(ctx, error)
        })
        .is_some()
    }

    /// Scheduler re-entry point
    pub fn handle_timer_expired(&mut self, connection_object: ConnectionObject, timer: TimerKind) {
        if self
            .with_connection(connection_object, |conn, ctx| {
                conn.handle_timer_expired(ctx, timer)
            })
            .is_none()
        {
            debug!(
                "Ignoring {} timer for unknown connection {}",
                timer, connection_object
            );
        }
    }
}
