//! Advertisement record parsing and the nonce-based connection filter
//!
//! Advertisement payloads are a sequence of length-prefixed AD structures:
//! one length byte, one type byte, then `length - 1` bytes of payload. The
//! parser never fails; anything it cannot make sense of ends parsing and the
//! records decoded so far are kept.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;
use uuid::Uuid;

use crate::protocol::uuid_from_u16;

// ----------------------------------------------------------------------------
// AD Types
// ----------------------------------------------------------------------------

const AD_INCOMPLETE_16BIT_UUIDS: u8 = 0x02;
const AD_COMPLETE_16BIT_UUIDS: u8 = 0x03;
const AD_INCOMPLETE_128BIT_UUIDS: u8 = 0x06;
const AD_COMPLETE_128BIT_UUIDS: u8 = 0x07;
const AD_SERVICE_DATA_16BIT: u8 = 0x16;

// ----------------------------------------------------------------------------
// Parsed Advertisement
// ----------------------------------------------------------------------------

/// One 16-bit service data record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceData {
    pub uuid: u16,
    pub data: Vec<u8>,
}

/// Result of parsing one advertisement payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedAdvertisement {
    /// Advertised service UUIDs, 16-bit entries expanded to 128 bits
    pub services: SmallVec<[Uuid; 4]>,
    /// Every service data record, in order of appearance
    pub service_data: SmallVec<[ServiceData; 1]>,
}

impl ParsedAdvertisement {
    /// Parse a raw advertisement or scan response payload
    pub fn parse(bytes: &[u8]) -> Self {
        let mut parsed = Self::default();
        let mut cursor = 0usize;

        while bytes.len() - cursor >= 2 {
            let length = bytes[cursor] as usize;
            if length == 0 || length > bytes.len() - cursor - 1 {
                break;
            }
            let ad_type = bytes[cursor + 1];
            let payload = &bytes[cursor + 2..cursor + 1 + length];
            cursor += 1 + length;

            match ad_type {
                AD_INCOMPLETE_16BIT_UUIDS | AD_COMPLETE_16BIT_UUIDS => {
                    for chunk in payload.chunks_exact(2) {
                        let short = u16::from_le_bytes([chunk[0], chunk[1]]);
                        parsed.push_service(uuid_from_u16(short));
                    }
                }
                AD_INCOMPLETE_128BIT_UUIDS | AD_COMPLETE_128BIT_UUIDS => {
                    for chunk in payload.chunks_exact(16) {
                        let mut lsb = [0u8; 8];
                        let mut msb = [0u8; 8];
                        lsb.copy_from_slice(&chunk[..8]);
                        msb.copy_from_slice(&chunk[8..]);
                        let value = ((u64::from_le_bytes(msb) as u128) << 64)
                            | u64::from_le_bytes(lsb) as u128;
                        parsed.push_service(Uuid::from_u128(value));
                    }
                }
                AD_SERVICE_DATA_16BIT if payload.len() >= 2 => {
                    parsed.service_data.push(ServiceData {
                        uuid: u16::from_le_bytes([payload[0], payload[1]]),
                        data: payload[2..].to_vec(),
                    });
                }
                _ => {}
            }
        }

        parsed
    }

    fn push_service(&mut self, uuid: Uuid) {
        if !self.services.contains(&uuid) {
            self.services.push(uuid);
        }
    }

    /// Whether the advertisement lists the given service
    pub fn advertises(&self, service: &Uuid) -> bool {
        self.services.contains(service)
    }

    /// The advertisement nonce carried in the only service data record
    ///
    /// Returns `None` unless there is exactly one service data record whose
    /// payload starts with a 4-byte big-endian integer.
    pub fn nonce(&self) -> Option<i32> {
        match self.service_data.as_slice() {
            [record] => {
                let bytes: [u8; 4] = record.data.get(..4)?.try_into().ok()?;
                Some(i32::from_be_bytes(bytes))
            }
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Nonce Filter
// ----------------------------------------------------------------------------

/// Verdict of the discovery filter for one advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanVerdict {
    /// Peer should be connected to
    Connect { nonce: i32 },
    /// Target service not advertised
    ForeignService,
    /// Service data missing, duplicated, or undecodable
    MissingNonce,
    /// Peer's nonce is not above ours; it is expected to connect to us instead
    Yield { nonce: i32 },
}

/// Decide whether a scanned advertisement should trigger a connection
///
/// Of two devices that can see each other, only the one observing the
/// strictly larger peer nonce initiates. Equal nonces connect neither way.
pub fn evaluate(parsed: &ParsedAdvertisement, service: &Uuid, local_nonce: i32) -> ScanVerdict {
    if !parsed.advertises(service) {
        return ScanVerdict::ForeignService;
    }
    match parsed.nonce() {
        None => ScanVerdict::MissingNonce,
        Some(nonce) if nonce > local_nonce => ScanVerdict::Connect { nonce },
        Some(nonce) => ScanVerdict::Yield { nonce },
    }
}

/// The nonce this device is currently advertising
///
/// Shared between the peripheral role, which rotates it, and the central,
/// which reads it on every scan result.
#[derive(Debug, Clone, Default)]
pub struct AdvertiseNonce(Arc<AtomicI32>);

impl AdvertiseNonce {
    pub fn new(value: i32) -> Self {
        Self(Arc::new(AtomicI32::new(value)))
    }

    pub fn get(&self) -> i32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, value: i32) {
        self.0.store(value, Ordering::Release);
    }
}

// ----------------------------------------------------------------------------
// Advertisement Builder
// ----------------------------------------------------------------------------

/// Encodes AD structures in the format [`ParsedAdvertisement::parse`] reads
#[derive(Debug, Clone, Default)]
pub struct AdvertisementBuilder {
    bytes: Vec<u8>,
}

impl AdvertisementBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a complete list of 16-bit service UUIDs
    pub fn service_uuids16(mut self, uuids: &[u16]) -> Self {
        let payload: Vec<u8> = uuids.iter().flat_map(|u| u.to_le_bytes()).collect();
        self.push(AD_COMPLETE_16BIT_UUIDS, &payload);
        self
    }

    /// Append a complete list of 128-bit service UUIDs
    pub fn service_uuids128(mut self, uuids: &[Uuid]) -> Self {
        let mut payload = Vec::with_capacity(uuids.len() * 16);
        for uuid in uuids {
            let value = uuid.as_u128();
            payload.extend_from_slice(&(value as u64).to_le_bytes());
            payload.extend_from_slice(&((value >> 64) as u64).to_le_bytes());
        }
        self.push(AD_COMPLETE_128BIT_UUIDS, &payload);
        self
    }

    /// Append a 16-bit service data record
    pub fn service_data(mut self, uuid: u16, data: &[u8]) -> Self {
        let mut payload = uuid.to_le_bytes().to_vec();
        payload.extend_from_slice(data);
        self.push(AD_SERVICE_DATA_16BIT, &payload);
        self
    }

    /// Append a service data record carrying an advertisement nonce
    pub fn nonce(self, uuid: u16, nonce: i32) -> Self {
        self.service_data(uuid, &nonce.to_be_bytes())
    }

    /// Append an arbitrary AD structure
    pub fn raw(mut self, ad_type: u8, payload: &[u8]) -> Self {
        self.push(ad_type, payload);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }

    fn push(&mut self, ad_type: u8, payload: &[u8]) {
        // A record longer than 254 bytes cannot be expressed; drop the tail
        let payload = &payload[..payload.len().min(254)];
        self.bytes.push(payload.len() as u8 + 1);
        self.bytes.push(ad_type);
        self.bytes.extend_from_slice(payload);
    }
}
