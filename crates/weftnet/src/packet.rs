//! Batch envelope: several typed values in one network frame.
//!
//! A packet serializes as the distinguished packet hash followed by a
//! concatenation of `(hash, value)` pairs. Receivers unwrap the envelope
//! and dispatch every pair in declaration order. Packets cannot be nested:
//! `Packet` deliberately does not implement `Serialize`, so it cannot be
//! appended to another packet, and a nested envelope arriving off the wire
//! is rejected during dispatch.

use crate::identity::NetType;
use serde::Serialize;
use std::sync::OnceLock;

/// The distinguished hash marking a frame as a packet envelope.
pub(crate) fn packet_hash() -> u64 {
    static HASH: OnceLock<u64> = OnceLock::new();
    *HASH.get_or_init(Packet::hash_code)
}

/// A batch of typed values sent through one `send_to`/`send_to_all` frame.
///
/// ```
/// use weftnet::Packet;
///
/// # fn example() -> Result<(), weftnet::SendError> {
/// let mut packet = Packet::new();
/// packet.append(&"state".to_string())?.append(&42i32)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct Packet {
    body: Vec<u8>,
    items: usize,
}

impl NetType for Packet {
    fn universal_name() -> String {
        String::from("weftnet::Packet")
    }
}

impl Packet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one typed value. Values are delivered to the receivers'
    /// listeners in append order.
    pub fn append<T: NetType + Serialize>(
        &mut self,
        value: &T,
    ) -> Result<&mut Self, crate::SendError> {
        let encoded = rmp_serde::to_vec_named(value)?;
        self.body.extend_from_slice(&T::hash_code().to_be_bytes());
        self.body.extend_from_slice(&encoded);
        self.items += 1;
        Ok(self)
    }

    /// Number of values appended so far.
    pub fn len(&self) -> usize {
        self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items == 0
    }

    /// The full wire form: envelope hash, then the `(hash, value)` pairs.
    pub(crate) fn wire_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.body.len());
        out.extend_from_slice(&packet_hash().to_be_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_form_starts_with_the_packet_hash() {
        let mut packet = Packet::new();
        packet.append(&1i32).unwrap();
        let bytes = packet.wire_bytes();
        assert_eq!(&bytes[..8], &packet_hash().to_be_bytes());
        assert_eq!(&bytes[8..16], &i32::hash_code().to_be_bytes());
    }

    #[test]
    fn append_counts_items() {
        let mut packet = Packet::new();
        assert!(packet.is_empty());
        packet
            .append(&"a".to_string())
            .unwrap()
            .append(&2u8)
            .unwrap();
        assert_eq!(packet.len(), 2);
    }

    #[test]
    fn empty_packet_is_just_the_envelope() {
        let packet = Packet::new();
        assert_eq!(packet.wire_bytes().len(), 8);
    }
}
