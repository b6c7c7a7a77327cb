//! BTP fragmentation, reassembly and ack windowing
//!
//! [`FragmentCodec`] holds the framing state of one connection in both
//! directions. It does no I/O: the connection hands it received fragments and
//! asks it for the next fragment to send.
//!
//! # Fragment format
//!
//! ```text
//! [flags: 1][ack: 1, if FRAGMENT_ACK][seq: 1][total_length: 2 BE, if START][payload...]
//! ```
//!
//! Every fragment, standalone acks included, consumes one 8-bit sequence
//! number. Sequence numbers wrap modulo 256 and every fragment must carry
//! exactly the next expected number.
//!
//! # Window
//!
//! ```text
//!  tx_oldest_unacked     tx_newest_unacked   tx_next
//!        │                      │               │
//!  ──────┼──────────────────────┼───────────────┼────▶ seq space (mod 256)
//!        │<──── awaiting ack ──▶│               │
//! ```
//!
//! A sender may have at most `tx_window_size` data fragments awaiting an ack.
//! Standalone acks are exempt so that two peers with full windows can always
//! acknowledge each other.

use std::collections::VecDeque;
use std::ops::BitOr;
use tracing::{trace, warn};

use crate::BtpError;

pub type SequenceNumber = u8;

/// Largest header: flags, ack, seq and the 2-byte message length
pub const MAX_HEADER_SIZE: usize = 5;

/// Largest header on a fragment that does not start a message
pub const MID_FRAGMENT_MAX_HEADER_SIZE: usize = 3;

/// flags + ack + seq
pub const STANDALONE_ACK_HEADER_SIZE: usize = 3;

/// Smallest fragment that can carry a full header and one payload byte
pub const MIN_FRAGMENT_SIZE: u16 = MAX_HEADER_SIZE as u16 + 1;

/// Minimum ATT MTU (23) minus the ATT header
pub const DEFAULT_FRAGMENT_SIZE: u16 = 20;

/// Largest send window. Standalone acks go out past the window, so the
/// in-flight range must stay well inside the 8-bit sequence space.
pub const MAX_WINDOW_SIZE: u8 = 127;

// ============================================================================
// HEADER
// ============================================================================

/// Fragment header flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderFlags(u8);

impl HeaderFlags {
    pub const START: Self = Self(0x01);
    pub const CONTINUE: Self = Self(0x02);
    pub const END: Self = Self(0x04);
    pub const FRAGMENT_ACK: Self = Self(0x08);

    const KNOWN_BITS: u8 = 0x0F;
    const DATA_BITS: u8 = 0x07;

    pub const fn empty() -> Self {
        Self(0)
    }

    /// Validate flags read off the wire
    pub fn from_bits(bits: u8) -> Result<Self, BtpError> {
        let flags = Self(bits);
        let valid = bits & !Self::KNOWN_BITS == 0
            && !(flags.contains(Self::START) && flags.contains(Self::CONTINUE))
            && (flags.carries_data() || flags.contains(Self::FRAGMENT_ACK));
        if valid {
            Ok(flags)
        } else {
            Err(BtpError::InvalidHeaderFlags(bits))
        }
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Whether the fragment carries message payload (as opposed to a bare ack)
    pub fn carries_data(self) -> bool {
        self.0 & Self::DATA_BITS != 0
    }
}

impl BitOr for HeaderFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Parsed fragment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub flags: HeaderFlags,
    /// Piggybacked ack, present iff `FRAGMENT_ACK` is set
    pub ack: Option<SequenceNumber>,
    pub seq: SequenceNumber,
    /// Total message length, present iff `START` is set
    pub total_length: Option<u16>,
}

impl FragmentHeader {
    /// Size of this header on the wire
    pub fn encoded_len(&self) -> usize {
        2 + usize::from(self.ack.is_some()) + if self.total_length.is_some() { 2 } else { 0 }
    }

    /// Parse a header, returning it with the offset of the payload
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize), BtpError> {
        let too_short = || BtpError::FragmentTooShort { len: bytes.len() };

        let (&flag_bits, rest) = bytes.split_first().ok_or_else(too_short)?;
        let flags = HeaderFlags::from_bits(flag_bits)?;

        let (ack, rest) = if flags.contains(HeaderFlags::FRAGMENT_ACK) {
            let (&ack, rest) = rest.split_first().ok_or_else(too_short)?;
            (Some(ack), rest)
        } else {
            (None, rest)
        };

        let (&seq, rest) = rest.split_first().ok_or_else(too_short)?;

        let total_length = if flags.contains(HeaderFlags::START) {
            match rest {
                [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
                _ => return Err(too_short()),
            }
        } else {
            None
        };

        let header = Self {
            flags,
            ack,
            seq,
            total_length,
        };
        Ok((header, header.encoded_len()))
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.flags.bits());
        if let Some(ack) = self.ack {
            out.push(ack);
        }
        out.push(self.seq);
        if let Some(total_length) = self.total_length {
            out.extend_from_slice(&total_length.to_be_bytes());
        }
    }
}

// ============================================================================
// CODEC
// ============================================================================

/// Framing state of one direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingState {
    Idle,
    InProgress,
    Complete,
    Error,
}

/// Outcome of feeding one fragment to the codec
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReceivedFragment {
    /// Ack carried by the fragment, already applied to the send window
    pub ack: Option<SequenceNumber>,
    /// A fully reassembled message, handed over to the caller
    pub message: Option<Vec<u8>>,
    /// The fragment carried message data rather than a bare ack
    pub carried_data: bool,
}

impl ReceivedFragment {
    pub fn did_receive_ack(&self) -> bool {
        self.ack.is_some()
    }
}

/// Fragmentation, reassembly and window state for one connection
#[derive(Debug)]
pub struct FragmentCodec {
    rx_state: FramingState,
    rx_buffer: Option<Vec<u8>>,
    rx_expected_length: usize,

    tx_state: FramingState,
    tx_buffer: Option<Vec<u8>>,
    tx_offset: usize,

    tx_fragment_size: u16,
    rx_fragment_size: u16,
    tx_window_size: u8,
    max_message_size: usize,

    tx_next_seq: SequenceNumber,
    tx_newest_unacked_seq: SequenceNumber,
    tx_oldest_unacked_seq: SequenceNumber,
    expecting_ack: bool,

    rx_next_seq: SequenceNumber,
    rx_newest_unacked_seq: SequenceNumber,
    rx_oldest_unacked_seq: SequenceNumber,

    tx_message_count: u64,
    rx_message_count: u64,
}

impl FragmentCodec {
    /// Codec with both sequence spaces starting at 0
    pub fn new(fragment_size: u16, window_size: u8, max_message_size: u16) -> Self {
        let fragment_size = fragment_size.max(MIN_FRAGMENT_SIZE);
        Self {
            rx_state: FramingState::Idle,
            rx_buffer: None,
            rx_expected_length: 0,
            tx_state: FramingState::Idle,
            tx_buffer: None,
            tx_offset: 0,
            tx_fragment_size: fragment_size,
            rx_fragment_size: fragment_size,
            tx_window_size: window_size.clamp(1, MAX_WINDOW_SIZE),
            max_message_size: usize::from(max_message_size),
            tx_next_seq: 0,
            tx_newest_unacked_seq: 0,
            tx_oldest_unacked_seq: 0,
            expecting_ack: false,
            rx_next_seq: 0,
            rx_newest_unacked_seq: 0,
            rx_oldest_unacked_seq: 0,
            tx_message_count: 0,
            rx_message_count: 0,
        }
    }

    /// Accept fragments up to `size` bytes when the peer sends with a
    /// different fragment size than this side
    pub fn with_rx_fragment_size(mut self, size: u16) -> Self {
        self.rx_fragment_size = size.max(MIN_FRAGMENT_SIZE);
        self
    }

    /// Initiator side after the handshake: the responder's capabilities
    /// response counts as received sequence number 0 and is still owed an ack.
    pub fn new_initiator(fragment_size: u16, window_size: u8, max_message_size: u16) -> Self {
        let mut codec = Self::new(fragment_size, window_size, max_message_size);
        codec.rx_next_seq = 1;
        codec
    }

    /// Responder side after the handshake: the capabilities response went out
    /// as sequence number 0 and awaits the initiator's ack.
    pub fn new_responder(fragment_size: u16, window_size: u8, max_message_size: u16) -> Self {
        let mut codec = Self::new(fragment_size, window_size, max_message_size);
        codec.get_and_increment_next_tx_seq();
        codec
    }

    // ------------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------------

    /// Produce the next fragment to send.
    ///
    /// Continues the message in progress, or starts the next message from
    /// `queue` when idle. With `send_ack` the fragment piggybacks an ack for
    /// the newest received fragment. Returns `Ok(None)` when the send window
    /// is exhausted or there is nothing to send.
    ///
    /// A queued message longer than the maximum message size is removed from
    /// the queue and reported as `MessageTooLarge`; the codec stays idle and
    /// the next call moves on to the following message.
    pub fn handle_characteristic_send(
        &mut self,
        queue: &mut VecDeque<Vec<u8>>,
        send_ack: bool,
    ) -> Result<Option<Vec<u8>>, BtpError> {
        if self.tx_state == FramingState::Complete {
            self.tx_state = FramingState::Idle;
        }
        if !self.tx_window_open() {
            trace!(
                in_flight = self.tx_in_flight(),
                window = self.tx_window_size,
                "send window exhausted"
            );
            return Ok(None);
        }

        let first = match self.tx_state {
            FramingState::Idle => {
                let Some(message) = queue.pop_front() else {
                    return Ok(None);
                };
                if message.len() > self.max_message_size {
                    warn!(
                        len = message.len(),
                        max = self.max_message_size,
                        "rejecting oversized message"
                    );
                    return Err(BtpError::MessageTooLarge {
                        len: message.len(),
                        max: self.max_message_size,
                    });
                }
                self.tx_buffer = Some(message);
                self.tx_offset = 0;
                self.tx_state = FramingState::InProgress;
                true
            }
            FramingState::InProgress => false,
            FramingState::Complete | FramingState::Error => return Ok(None),
        };

        let Some(buffer) = self.tx_buffer.take() else {
            self.tx_state = FramingState::Error;
            return Ok(None);
        };

        let mut flags = if first {
            HeaderFlags::START
        } else {
            HeaderFlags::CONTINUE
        };
        let ack = if send_ack {
            flags.insert(HeaderFlags::FRAGMENT_ACK);
            Some(self.get_and_record_rx_ack_seq())
        } else {
            None
        };
        let seq = self.get_and_increment_next_tx_seq();
        // bounded by max_message_size above
        let total_length = first.then_some(buffer.len() as u16);

        let header_len = 2 + usize::from(send_ack) + if first { 2 } else { 0 };
        let capacity = usize::from(self.tx_fragment_size) - header_len;
        let remaining = buffer.len() - self.tx_offset;
        let chunk_len = remaining.min(capacity);
        let last = remaining <= capacity;
        if last {
            flags = if first {
                flags | HeaderFlags::END
            } else {
                HeaderFlags(flags.bits() & !HeaderFlags::CONTINUE.bits()) | HeaderFlags::END
            };
        }

        let header = FragmentHeader {
            flags,
            ack,
            seq,
            total_length,
        };
        let mut fragment = Vec::with_capacity(header_len + chunk_len);
        header.encode_into(&mut fragment);
        fragment.extend_from_slice(&buffer[self.tx_offset..self.tx_offset + chunk_len]);
        self.tx_offset += chunk_len;

        if last {
            self.tx_state = FramingState::Complete;
            self.tx_message_count += 1;
        } else {
            self.tx_buffer = Some(buffer);
        }

        trace!(
            seq,
            ack = ?ack,
            flags = header.flags.bits(),
            bytes = %hex::encode(&fragment),
            "tx fragment"
        );
        Ok(Some(fragment))
    }

    /// Encode a zero-payload fragment acknowledging the newest received fragment
    pub fn encode_standalone_ack(&mut self, out: &mut Vec<u8>) {
        out.clear();
        let ack = self.get_and_record_rx_ack_seq();
        let seq = self.get_and_increment_next_tx_seq();
        FragmentHeader {
            flags: HeaderFlags::FRAGMENT_ACK,
            ack: Some(ack),
            seq,
            total_length: None,
        }
        .encode_into(out);
        trace!(seq, ack, "tx standalone ack");
    }

    /// Assign the next send sequence number and extend the unacked window
    pub fn get_and_increment_next_tx_seq(&mut self) -> SequenceNumber {
        let seq = self.tx_next_seq;
        if !self.expecting_ack {
            self.expecting_ack = true;
            self.tx_oldest_unacked_seq = seq;
        }
        self.tx_newest_unacked_seq = seq;
        self.tx_next_seq = seq.wrapping_add(1);
        seq
    }

    /// Sequence number to acknowledge next; everything received so far is
    /// considered acknowledged afterwards
    pub fn get_and_record_rx_ack_seq(&mut self) -> SequenceNumber {
        self.rx_oldest_unacked_seq = self.rx_next_seq;
        self.rx_newest_unacked_seq
    }

    // ------------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------------

    /// Validate one received fragment, apply its ack and reassemble its payload
    pub fn handle_characteristic_received(
        &mut self,
        fragment: &[u8],
    ) -> Result<ReceivedFragment, BtpError> {
        if fragment.len() > usize::from(self.rx_fragment_size) {
            return Err(self.fail_rx(BtpError::FragmentTooLong {
                len: fragment.len(),
                max: self.rx_fragment_size,
            }));
        }
        let (header, header_len) =
            FragmentHeader::parse(fragment).map_err(|e| self.fail_rx(e))?;

        let expected = self.rx_next_seq;
        if header.seq != expected {
            return Err(self.fail_rx(BtpError::InvalidSequenceNumber {
                expected,
                received: header.seq,
            }));
        }
        self.rx_newest_unacked_seq = header.seq;
        self.rx_next_seq = header.seq.wrapping_add(1);

        trace!(
            seq = header.seq,
            ack = ?header.ack,
            flags = header.flags.bits(),
            len = fragment.len(),
            "rx fragment"
        );

        if let Some(ack) = header.ack {
            self.handle_ack_received(ack)?;
        }

        if !header.flags.carries_data() {
            return Ok(ReceivedFragment {
                ack: header.ack,
                message: None,
                carried_data: false,
            });
        }

        match self.rx_state {
            FramingState::Idle => {
                let Some(total_length) = header.total_length else {
                    return Err(self.fail_rx(BtpError::UnexpectedContinuation));
                };
                let declared = usize::from(total_length);
                if declared > self.max_message_size {
                    return Err(self.fail_rx(BtpError::MessageTooLarge {
                        len: declared,
                        max: self.max_message_size,
                    }));
                }
                self.rx_buffer = Some(Vec::with_capacity(declared));
                self.rx_expected_length = declared;
                self.rx_state = FramingState::InProgress;
            }
            FramingState::InProgress => {
                if header.flags.contains(HeaderFlags::START) {
                    return Err(self.fail_rx(BtpError::UnexpectedStart));
                }
            }
            FramingState::Complete | FramingState::Error => {
                return Err(self.fail_rx(BtpError::ReassemblerIncorrectState));
            }
        }

        let expected_length = self.rx_expected_length;
        let received = match self.rx_buffer.as_mut() {
            Some(buffer) => {
                buffer.extend_from_slice(&fragment[header_len..]);
                buffer.len()
            }
            None => return Err(self.fail_rx(BtpError::ReassemblerIncorrectState)),
        };

        if !header.flags.contains(HeaderFlags::END) {
            if received > expected_length {
                return Err(self.fail_rx(BtpError::MessageTooLarge {
                    len: received,
                    max: expected_length,
                }));
            }
            return Ok(ReceivedFragment {
                ack: header.ack,
                message: None,
                carried_data: true,
            });
        }

        if received < expected_length {
            return Err(self.fail_rx(BtpError::ReassemblyLengthMismatch {
                expected: expected_length,
                received,
            }));
        }
        if let Some(buffer) = self.rx_buffer.as_mut() {
            // trailing padding past the declared length
            buffer.truncate(expected_length);
        }
        self.rx_state = FramingState::Complete;
        self.rx_message_count += 1;

        Ok(ReceivedFragment {
            ack: header.ack,
            message: self.take_rx_message(),
            carried_data: true,
        })
    }

    /// Hand the reassembled message to the caller and return to idle
    pub fn take_rx_message(&mut self) -> Option<Vec<u8>> {
        if self.rx_state != FramingState::Complete {
            return None;
        }
        self.rx_state = FramingState::Idle;
        self.rx_buffer.take()
    }

    fn fail_rx(&mut self, error: BtpError) -> BtpError {
        self.rx_state = FramingState::Error;
        self.rx_buffer = None;
        error
    }

    fn handle_ack_received(&mut self, ack: SequenceNumber) -> Result<(), BtpError> {
        if !self.expecting_ack {
            self.tx_state = FramingState::Error;
            return Err(BtpError::UnexpectedAck(ack));
        }
        if !self.is_valid_ack(ack) {
            self.tx_state = FramingState::Error;
            return Err(BtpError::InvalidAck {
                ack,
                oldest: self.tx_oldest_unacked_seq,
                newest: self.tx_newest_unacked_seq,
            });
        }

        if ack == self.tx_newest_unacked_seq {
            self.tx_oldest_unacked_seq = ack;
            self.expecting_ack = false;
        } else {
            self.tx_oldest_unacked_seq = ack.wrapping_add(1);
        }
        Ok(())
    }

    /// Whether `ack` lies in `[tx_oldest_unacked, tx_newest_unacked]` mod 256
    pub fn is_valid_ack(&self, ack: SequenceNumber) -> bool {
        if !self.expecting_ack {
            return false;
        }
        let oldest = self.tx_oldest_unacked_seq;
        let newest = self.tx_newest_unacked_seq;
        if newest >= oldest {
            ack >= oldest && ack <= newest
        } else {
            ack >= oldest || ack <= newest
        }
    }

    // ------------------------------------------------------------------------
    // Window & state queries
    // ------------------------------------------------------------------------

    /// At least one sent fragment awaits an ack
    pub fn has_unacked_data(&self) -> bool {
        self.expecting_ack
    }

    /// At least one received fragment has not been acknowledged to the peer
    pub fn has_unacked_rx_data(&self) -> bool {
        self.rx_oldest_unacked_seq != self.rx_next_seq
    }

    /// Fragments sent but not yet acknowledged
    pub fn tx_in_flight(&self) -> usize {
        if self.expecting_ack {
            usize::from(self.tx_newest_unacked_seq.wrapping_sub(self.tx_oldest_unacked_seq)) + 1
        } else {
            0
        }
    }

    /// Fragments received but not yet acknowledged
    pub fn rx_unacked_count(&self) -> usize {
        usize::from(self.rx_next_seq.wrapping_sub(self.rx_oldest_unacked_seq))
    }

    pub fn tx_window_open(&self) -> bool {
        self.tx_in_flight() < usize::from(self.tx_window_size)
    }

    /// A message is queued inside the codec and not fully fragmented yet
    pub fn is_sending(&self) -> bool {
        self.tx_state == FramingState::InProgress
    }

    /// Drop any partially sent or received message
    pub fn reset(&mut self) {
        self.tx_buffer = None;
        self.tx_offset = 0;
        self.tx_state = FramingState::Idle;
        self.rx_buffer = None;
        self.rx_expected_length = 0;
        self.rx_state = FramingState::Idle;
    }

    pub fn rx_state(&self) -> FramingState {
        self.rx_state
    }

    pub fn tx_state(&self) -> FramingState {
        self.tx_state
    }

    pub fn tx_fragment_size(&self) -> u16 {
        self.tx_fragment_size
    }

    pub fn rx_fragment_size(&self) -> u16 {
        self.rx_fragment_size
    }

    pub fn tx_window_size(&self) -> u8 {
        self.tx_window_size
    }

    pub fn tx_next_seq(&self) -> SequenceNumber {
        self.tx_next_seq
    }

    pub fn tx_oldest_unacked_seq(&self) -> SequenceNumber {
        self.tx_oldest_unacked_seq
    }

    pub fn tx_newest_unacked_seq(&self) -> SequenceNumber {
        self.tx_newest_unacked_seq
    }

    pub fn rx_next_seq(&self) -> SequenceNumber {
        self.rx_next_seq
    }

    pub fn rx_newest_unacked_seq(&self) -> SequenceNumber {
        self.rx_newest_unacked_seq
    }

    pub fn expecting_ack(&self) -> bool {
        self.expecting_ack
    }

    pub fn tx_message_count(&self) -> u64 {
        self.tx_message_count
    }

    pub fn rx_message_count(&self) -> u64 {
        self.rx_message_count
    }
}
