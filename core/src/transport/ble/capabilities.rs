//! Capabilities handshake messages
//!
//! The initiator opens every BTP session by writing a capabilities request;
//! the responder answers with a capabilities response on the indication
//! characteristic. Both start with the same two magic bytes, which can never
//! form a valid fragment header.
//!
//! ```text
//! request:  [0x65 0x6C][mtu: 2 BE][versions: 4, nibble-packed][window: 1]
//! response: [0x65 0x6C][fragment_size: 2 BE][version: 1][window: 1]
//! ```

use crate::BtpError;

pub const CAPABILITIES_MAGIC: [u8; 2] = [0x65, 0x6C];
pub const CAPABILITIES_REQUEST_LEN: usize = 9;
pub const CAPABILITIES_RESPONSE_LEN: usize = 6;
pub const NUM_SUPPORTED_VERSION_SLOTS: usize = 8;

/// The only protocol version this crate speaks
pub const BTP_PROTOCOL_VERSION: u8 = 4;
pub const MIN_SUPPORTED_VERSION: u8 = BTP_PROTOCOL_VERSION;
pub const MAX_SUPPORTED_VERSION: u8 = BTP_PROTOCOL_VERSION;

fn check_magic(bytes: &[u8], min_len: usize, what: &'static str) -> Result<(), BtpError> {
    if bytes.len() < min_len {
        return Err(BtpError::MalformedCapabilities(what));
    }
    if bytes[..2] != CAPABILITIES_MAGIC {
        return Err(BtpError::MalformedCapabilities("bad magic"));
    }
    Ok(())
}

/// Whether an opening write is a capabilities request
pub fn is_capabilities_request(bytes: &[u8]) -> bool {
    bytes.len() >= CAPABILITIES_REQUEST_LEN && bytes[..2] == CAPABILITIES_MAGIC
}

/// Highest version both sides support, or 0 when there is none
pub fn highest_supported_version(request: &CapabilitiesRequest, min: u8, max: u8) -> u8 {
    request
        .supported_versions()
        .filter(|version| (min..=max).contains(version))
        .max()
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilitiesRequest {
    /// ATT MTU as seen by the initiator, 0 when unknown
    pub mtu: u16,
    /// Candidate versions, one nibble each on the wire; 0 marks an empty slot
    pub supported_versions: [u8; NUM_SUPPORTED_VERSION_SLOTS],
    /// Receive window the initiator offers
    pub window_size: u8,
}

impl CapabilitiesRequest {
    /// Request advertising [`BTP_PROTOCOL_VERSION`] only
    pub fn new(mtu: u16, window_size: u8) -> Self {
        let mut request = Self {
            mtu,
            supported_versions: [0; NUM_SUPPORTED_VERSION_SLOTS],
            window_size,
        };
        request.set_supported_version(0, BTP_PROTOCOL_VERSION);
        request
    }

    /// Fill a version slot. Out-of-range slots are ignored and versions are
    /// truncated to a nibble.
    pub fn set_supported_version(&mut self, index: usize, version: u8) {
        if let Some(slot) = self.supported_versions.get_mut(index) {
            *slot = version & 0x0F;
        }
    }

    /// Non-empty version slots
    pub fn supported_versions(&self) -> impl Iterator<Item = u8> + '_ {
        self.supported_versions.iter().copied().filter(|v| *v != 0)
    }

    pub fn encode(&self) -> [u8; CAPABILITIES_REQUEST_LEN] {
        let mut out = [0u8; CAPABILITIES_REQUEST_LEN];
        out[..2].copy_from_slice(&CAPABILITIES_MAGIC);
        out[2..4].copy_from_slice(&self.mtu.to_be_bytes());
        for (i, version) in self.supported_versions.iter().enumerate() {
            let shift = if i % 2 == 0 { 0 } else { 4 };
            out[4 + i / 2] |= (version & 0x0F) << shift;
        }
        out[8] = self.window_size;
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BtpError> {
        check_magic(bytes, CAPABILITIES_REQUEST_LEN, "request too short")?;

        let mut supported_versions = [0u8; NUM_SUPPORTED_VERSION_SLOTS];
        for (i, slot) in supported_versions.iter_mut().enumerate() {
            let byte = bytes[4 + i / 2];
            *slot = if i % 2 == 0 { byte & 0x0F } else { byte >> 4 };
        }

        Ok(Self {
            mtu: u16::from_be_bytes([bytes[2], bytes[3]]),
            supported_versions,
            window_size: bytes[8],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilitiesResponse {
    pub fragment_size: u16,
    /// 0 when the responder found no common version
    pub selected_version: u8,
    pub window_size: u8,
}

impl CapabilitiesResponse {
    pub fn encode(&self) -> [u8; CAPABILITIES_RESPONSE_LEN] {
        let [hi, lo] = self.fragment_size.to_be_bytes();
        [
            CAPABILITIES_MAGIC[0],
            CAPABILITIES_MAGIC[1],
            hi,
            lo,
            self.selected_version,
            self.window_size,
        ]
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BtpError> {
        check_magic(bytes, CAPABILITIES_RESPONSE_LEN, "response too short")?;
        Ok(Self {
            fragment_size: u16::from_be_bytes([bytes[2], bytes[3]]),
            selected_version: bytes[4],
            window_size: bytes[5],
        })
    }
}
