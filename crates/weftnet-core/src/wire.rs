//! Wire codec: frames, opcodes, handshake, and payload formats.
//!
//! # Frame Format
//!
//! Every message on the wire is one frame:
//!
//! ```text
//! +--------+--------+------------------+------------------+
//! | opcode | L0     | length bytes     | payload          |
//! | 1 byte | 1 byte | L0 bytes, MSB    | N bytes          |
//! |        |        | first            |                  |
//! +--------+--------+------------------+------------------+
//! ```
//!
//! The length prefix is self-describing: `L0` declares how many length
//! bytes follow, and the payload length `N` is reassembled from those bytes
//! big-to-little. Short messages therefore pay two bytes of framing
//! overhead, large ones up to nine.
//!
//! # Endianness Neutralization
//!
//! Multi-byte fields inside payloads (peer ids, user data) are transported
//! in 8-byte-chunked little-endian order preceded by one preamble byte
//! counting the zero bytes of padding the transform introduced. The
//! receiver undoes the chunk transform and truncates the padding. This
//! format is part of the compatibility envelope, together with the two
//! protocol magics below: change either and `IO_PROTOCOL_ID_*` must be
//! bumped.

use crate::types::PeerId;
use std::net::IpAddr;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// First protocol magic, sent big-endian as the first four bytes of every
/// connection.
pub const IO_PROTOCOL_ID_1: u32 = 755_960_664;
/// Second protocol magic, sent right after the first.
pub const IO_PROTOCOL_ID_2: u32 = 1_683_390_697;

/// On-wire size of one neutralized peer id: the preamble byte plus the
/// 16 id bytes (which never need padding).
pub const ENCODED_ID_LEN: usize = 17;

/// Errors raised while encoding or decoding wire traffic.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u32 },

    #[error("length prefix of {0} bytes exceeds the supported width")]
    LengthWidth(u8),

    #[error("unknown opcode: {0}")]
    UnknownOpcode(u8),

    #[error("protocol magic mismatch: got {got_1:#x}/{got_2:#x}")]
    BadMagic { got_1: u32, got_2: u32 },

    #[error("malformed payload: {0}")]
    Malformed(&'static str),
}

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

/// One-byte message kind. The numeric values are stable and part of the
/// wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Data for one specific peer: id-length byte, sender id, target id,
    /// then neutralized user bytes. Relayed hop by hop when no direct link
    /// to the target exists.
    SendTo = 0,
    /// Data for the whole mesh: neutralized user bytes.
    SendToAll = 1,
    /// "Bridge for me toward this peer": one peer id.
    ForwardTo = 2,
    /// "Stop bridging for me toward this peer": one peer id.
    StopForwarding = 3,
    /// "I am bridging for you": one distance byte, then the peer id.
    ForwardingTo = 4,
    /// "Establish connectivity with this peer": target port (2 bytes),
    /// id-length byte, id, then the address as UTF-8 text.
    ConnectTo = 5,
    /// "I cannot reach that peer": one peer id.
    CantConnect = 6,
    /// Distance-vector update: one distance byte, then the peer id.
    UpdateDistance = 7,
    /// "Tell me your distance to this peer": one peer id.
    RetrieveDistance = 8,
    /// "Send me your member list": empty payload.
    RetrievePeers = 9,
    /// Member list: count (2 bytes), then per peer port (2 bytes),
    /// id-length byte, id, address-length byte, address text.
    PeersList = 10,
    /// A peer left the mesh: one peer id.
    PeerDisconnection = 11,
    /// Liveness probe: empty payload.
    KeepAlive = 12,
    /// Handshake answer: the acceptor keeps the connection.
    ConnectionAccepted = 13,
    /// Handshake answer: the acceptor refuses the connection.
    ConnectionRefused = 14,
}

impl Opcode {
    /// Decodes a wire byte into an opcode.
    pub fn from_u8(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            0 => Opcode::SendTo,
            1 => Opcode::SendToAll,
            2 => Opcode::ForwardTo,
            3 => Opcode::StopForwarding,
            4 => Opcode::ForwardingTo,
            5 => Opcode::ConnectTo,
            6 => Opcode::CantConnect,
            7 => Opcode::UpdateDistance,
            8 => Opcode::RetrieveDistance,
            9 => Opcode::RetrievePeers,
            10 => Opcode::PeersList,
            11 => Opcode::PeerDisconnection,
            12 => Opcode::KeepAlive,
            13 => Opcode::ConnectionAccepted,
            14 => Opcode::ConnectionRefused,
            other => return Err(WireError::UnknownOpcode(other)),
        })
    }
}

// ---------------------------------------------------------------------------
// Endianness neutralization
// ---------------------------------------------------------------------------

const CHUNK: usize = 8;

/// Appends `data` to `out` in neutralized form: a preamble byte counting
/// the padding zeros, then the bytes in 8-byte-chunked little-endian order.
/// The final partial chunk, if any, is left-padded with zeros.
pub fn neutralize(data: &[u8], out: &mut Vec<u8>) {
    let rem = data.len() % CHUNK;
    let padding = if rem == 0 { 0 } else { CHUNK - rem };
    out.reserve(1 + data.len() + padding);
    out.push(padding as u8);

    let full = data.len() - rem;
    for chunk in data[..full].chunks_exact(CHUNK) {
        out.extend(chunk.iter().rev());
    }
    if rem != 0 {
        out.extend(std::iter::repeat(0u8).take(padding));
        out.extend(data[full..].iter().rev());
    }
}

/// Undoes [`neutralize`]: reverses each 8-byte chunk and truncates the
/// padding declared by the preamble byte.
pub fn restore(data: &[u8]) -> Result<Vec<u8>, WireError> {
    let (&padding, body) = data
        .split_first()
        .ok_or(WireError::Malformed("missing endianness preamble"))?;
    let padding = padding as usize;
    if body.len() % CHUNK != 0 || padding >= CHUNK || padding > body.len() {
        return Err(WireError::Malformed("bad neutralized block"));
    }

    let mut out = Vec::with_capacity(body.len());
    for chunk in body.chunks_exact(CHUNK) {
        out.extend(chunk.iter().rev());
    }
    out.truncate(body.len() - padding);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Big-endian field helpers
// ---------------------------------------------------------------------------

pub(crate) fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn read_u16(data: &[u8]) -> Result<u16, WireError> {
    let bytes: [u8; 2] = data
        .get(..2)
        .and_then(|s| s.try_into().ok())
        .ok_or(WireError::Malformed("truncated u16 field"))?;
    Ok(u16::from_be_bytes(bytes))
}

// ---------------------------------------------------------------------------
// Peer id codec
// ---------------------------------------------------------------------------

/// Appends the neutralized form of a peer id (always [`ENCODED_ID_LEN`]
/// bytes, since 16 id bytes need no padding).
pub fn encode_peer_id(id: &PeerId, out: &mut Vec<u8>) {
    neutralize(id.as_bytes(), out);
}

/// Decodes one neutralized peer id from the front of `data`.
pub fn decode_peer_id(data: &[u8]) -> Result<PeerId, WireError> {
    let slice = data
        .get(..ENCODED_ID_LEN)
        .ok_or(WireError::Malformed("truncated peer id"))?;
    let raw = restore(slice)?;
    let bytes: [u8; 16] = raw
        .try_into()
        .map_err(|_| WireError::Malformed("peer id is not 16 bytes"))?;
    Ok(PeerId::from_bytes(bytes))
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Encodes one frame: opcode, self-describing length prefix, payload.
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u64;
    let len_bytes = len.to_be_bytes();
    // Minimal width, at least one byte so an empty payload encodes as 0x01 0x00.
    let skip = (len.leading_zeros() as usize / 8).min(7);
    let len_bytes = &len_bytes[skip..];

    let mut frame = Vec::with_capacity(2 + len_bytes.len() + payload.len());
    frame.push(opcode as u8);
    frame.push(len_bytes.len() as u8);
    frame.extend_from_slice(len_bytes);
    frame.extend_from_slice(payload);
    frame
}

/// Reads one frame from an async reader.
///
/// The reassembly walks the same states the format implies: opcode, length
/// of the length, length bytes, payload. Partial reads are absorbed by the
/// reader's buffering. Returns `WireError::ConnectionClosed` on a clean EOF
/// at a frame boundary.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_size: u32,
) -> Result<(Opcode, Vec<u8>), WireError> {
    let mut head = [0u8; 2];
    match reader.read_exact(&mut head).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }
    let opcode = Opcode::from_u8(head[0])?;
    let width = head[1];
    if width as usize > CHUNK {
        return Err(WireError::LengthWidth(width));
    }

    let mut len_bytes = [0u8; CHUNK];
    reader.read_exact(&mut len_bytes[..width as usize]).await?;
    let length = len_bytes[..width as usize]
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
    if length > u64::from(max_frame_size) {
        return Err(WireError::FrameTooLarge {
            size: length,
            max: max_frame_size,
        });
    }

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;
    Ok((opcode, payload))
}

/// Writes one frame and flushes, so control traffic is never stuck in a
/// half-filled buffer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    opcode: Opcode,
    payload: &[u8],
) -> Result<(), WireError> {
    writer.write_all(&encode_frame(opcode, payload)).await?;
    writer.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// The identity blob both sides exchange before any opcode traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub id: PeerId,
    /// The sender's listening port (not the ephemeral port of the socket).
    pub port: u16,
}

/// Sends the protocol magics followed by the id blob:
/// blob length (1 byte), listening port (2 bytes, big-endian), then the
/// neutralized id.
pub async fn write_hello<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    hello: &Hello,
) -> Result<(), WireError> {
    let mut buf = Vec::with_capacity(8 + 1 + 2 + ENCODED_ID_LEN);
    buf.extend_from_slice(&IO_PROTOCOL_ID_1.to_be_bytes());
    buf.extend_from_slice(&IO_PROTOCOL_ID_2.to_be_bytes());
    buf.push((2 + ENCODED_ID_LEN) as u8);
    put_u16(&mut buf, hello.port);
    encode_peer_id(&hello.id, &mut buf);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads and validates the peer's magics and id blob.
pub async fn read_hello<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Hello, WireError> {
    let mut magics = [0u8; 8];
    match reader.read_exact(&mut magics).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }
    let got_1 = u32::from_be_bytes(magics[..4].try_into().unwrap());
    let got_2 = u32::from_be_bytes(magics[4..].try_into().unwrap());
    if got_1 != IO_PROTOCOL_ID_1 || got_2 != IO_PROTOCOL_ID_2 {
        return Err(WireError::BadMagic { got_1, got_2 });
    }

    let mut len = [0u8; 1];
    reader.read_exact(&mut len).await?;
    let mut blob = vec![0u8; len[0] as usize];
    reader.read_exact(&mut blob).await?;

    let port = read_u16(&blob)?;
    let id = decode_peer_id(&blob[2..])?;
    Ok(Hello { id, port })
}

// ---------------------------------------------------------------------------
// Payload formats
// ---------------------------------------------------------------------------

/// Where a peer can be reached: the triple advertised in `peers_list` and
/// `connect_to` payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub id: PeerId,
    pub address: IpAddr,
    pub port: u16,
}

/// Builds a `send_to` payload: id-length byte, sender id, target id, then
/// the neutralized user bytes.
pub fn send_to_payload(sender: &PeerId, target: &PeerId, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 2 * ENCODED_ID_LEN + 1 + data.len() + CHUNK);
    out.push(ENCODED_ID_LEN as u8);
    encode_peer_id(sender, &mut out);
    encode_peer_id(target, &mut out);
    neutralize(data, &mut out);
    out
}

/// Splits a `send_to` payload into sender, target, and the offset of the
/// (still neutralized) user bytes.
pub fn parse_send_to(payload: &[u8]) -> Result<(PeerId, PeerId, usize), WireError> {
    let (&id_len, rest) = payload
        .split_first()
        .ok_or(WireError::Malformed("empty send_to payload"))?;
    let id_len = id_len as usize;
    if id_len != ENCODED_ID_LEN || rest.len() < 2 * id_len {
        return Err(WireError::Malformed("bad send_to id block"));
    }
    let sender = decode_peer_id(rest)?;
    let target = decode_peer_id(&rest[id_len..])?;
    Ok((sender, target, 1 + 2 * id_len))
}

/// Builds a `send_to_all` payload: just the neutralized user bytes.
pub fn send_to_all_payload(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + data.len() + CHUNK);
    neutralize(data, &mut out);
    out
}

/// Builds a payload carrying a single peer id (`forward_to`,
/// `stop_forwarding`, `cant_connect`, `retrieve_distance`,
/// `peer_disconnection`).
pub fn id_payload(id: &PeerId) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENCODED_ID_LEN);
    encode_peer_id(id, &mut out);
    out
}

/// Parses a single-id payload.
pub fn parse_id_payload(payload: &[u8]) -> Result<PeerId, WireError> {
    decode_peer_id(payload)
}

/// Builds an `update_distance` / `forwarding_to` payload: one distance
/// byte, then the peer id.
pub fn distance_payload(distance: u8, id: &PeerId) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + ENCODED_ID_LEN);
    out.push(distance);
    encode_peer_id(id, &mut out);
    out
}

/// Parses an `update_distance` / `forwarding_to` payload.
pub fn parse_distance_payload(payload: &[u8]) -> Result<(u8, PeerId), WireError> {
    let (&distance, rest) = payload
        .split_first()
        .ok_or(WireError::Malformed("empty distance payload"))?;
    Ok((distance, decode_peer_id(rest)?))
}

/// Builds a `connect_to` payload: target port (2 bytes), id-length byte,
/// id, then the address as UTF-8 text.
pub fn connect_to_payload(endpoint: &PeerEndpoint) -> Vec<u8> {
    let addr = endpoint.address.to_string();
    let mut out = Vec::with_capacity(3 + ENCODED_ID_LEN + addr.len());
    put_u16(&mut out, endpoint.port);
    out.push(ENCODED_ID_LEN as u8);
    encode_peer_id(&endpoint.id, &mut out);
    out.extend_from_slice(addr.as_bytes());
    out
}

/// Parses a `connect_to` payload.
pub fn parse_connect_to(payload: &[u8]) -> Result<PeerEndpoint, WireError> {
    let port = read_u16(payload)?;
    let id_len = *payload
        .get(2)
        .ok_or(WireError::Malformed("truncated connect_to payload"))? as usize;
    if id_len != ENCODED_ID_LEN || payload.len() < 3 + id_len {
        return Err(WireError::Malformed("bad connect_to id block"));
    }
    let id = decode_peer_id(&payload[3..])?;
    let addr = std::str::from_utf8(&payload[3 + id_len..])
        .map_err(|_| WireError::Malformed("connect_to address is not UTF-8"))?;
    let address = addr
        .parse()
        .map_err(|_| WireError::Malformed("connect_to address does not parse"))?;
    Ok(PeerEndpoint { id, address, port })
}

/// Builds a `peers_list` payload from the given endpoints.
pub fn peers_list_payload<'a>(peers: impl Iterator<Item = &'a PeerEndpoint>) -> Vec<u8> {
    let mut body = Vec::new();
    let mut count: u16 = 0;
    for peer in peers {
        let addr = peer.address.to_string();
        put_u16(&mut body, peer.port);
        body.push(ENCODED_ID_LEN as u8);
        encode_peer_id(&peer.id, &mut body);
        body.push(addr.len() as u8);
        body.extend_from_slice(addr.as_bytes());
        count += 1;
    }
    let mut out = Vec::with_capacity(2 + body.len());
    put_u16(&mut out, count);
    out.extend_from_slice(&body);
    out
}

/// Parses a `peers_list` payload.
pub fn parse_peers_list(payload: &[u8]) -> Result<Vec<PeerEndpoint>, WireError> {
    let count = read_u16(payload)? as usize;
    let mut rest = &payload[2..];
    let mut peers = Vec::with_capacity(count);
    for _ in 0..count {
        let port = read_u16(rest)?;
        let id_len = *rest
            .get(2)
            .ok_or(WireError::Malformed("truncated peers_list entry"))? as usize;
        if id_len != ENCODED_ID_LEN || rest.len() < 3 + id_len + 1 {
            return Err(WireError::Malformed("bad peers_list id block"));
        }
        let id = decode_peer_id(&rest[3..])?;
        let addr_len = rest[3 + id_len] as usize;
        let addr_start = 3 + id_len + 1;
        let addr_bytes = rest
            .get(addr_start..addr_start + addr_len)
            .ok_or(WireError::Malformed("truncated peers_list address"))?;
        let addr = std::str::from_utf8(addr_bytes)
            .map_err(|_| WireError::Malformed("peers_list address is not UTF-8"))?;
        let address = addr
            .parse()
            .map_err(|_| WireError::Malformed("peers_list address does not parse"))?;
        peers.push(PeerEndpoint { id, address, port });
        rest = &rest[addr_start + addr_len..];
    }
    Ok(peers)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    #[test]
    fn neutralize_roundtrip_all_lengths() {
        for len in 0..40usize {
            let data: Vec<u8> = (0..len as u8).collect();
            let mut encoded = Vec::new();
            neutralize(&data, &mut encoded);
            // Preamble plus the data rounded up to whole chunks.
            assert_eq!(encoded.len(), 1 + len.div_ceil(8) * 8);
            assert_eq!(restore(&encoded).unwrap(), data, "length {len}");
        }
    }

    #[test]
    fn neutralize_pads_partial_chunk() {
        let mut encoded = Vec::new();
        neutralize(&[0xAA, 0xBB, 0xCC], &mut encoded);
        assert_eq!(encoded, vec![5, 0, 0, 0, 0, 0, 0xCC, 0xBB, 0xAA]);
    }

    #[test]
    fn restore_rejects_short_input() {
        assert!(restore(&[]).is_err());
        assert!(restore(&[3, 1, 2]).is_err());
    }

    #[test]
    fn peer_id_roundtrip() {
        let id = PeerId::generate();
        let mut out = Vec::new();
        encode_peer_id(&id, &mut out);
        assert_eq!(out.len(), ENCODED_ID_LEN);
        assert_eq!(out[0], 0, "a 16-byte id needs no padding");
        assert_eq!(decode_peer_id(&out).unwrap(), id);
    }

    #[test]
    fn frame_length_prefix_is_minimal() {
        // Empty payload: one length byte holding zero.
        let frame = encode_frame(Opcode::KeepAlive, &[]);
        assert_eq!(frame, vec![12, 1, 0]);

        // 300 bytes needs a two-byte length.
        let frame = encode_frame(Opcode::SendToAll, &[0u8; 300]);
        assert_eq!(&frame[..4], &[1, 2, 0x01, 0x2C]);
        assert_eq!(frame.len(), 4 + 300);
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut writer, mut reader) = tokio::io::duplex(4096);
        let payload: Vec<u8> = (0..200u8).collect();
        write_frame(&mut writer, Opcode::SendTo, &payload).await.unwrap();
        write_frame(&mut writer, Opcode::KeepAlive, &[]).await.unwrap();

        let (op, got) = read_frame(&mut reader, 1 << 20).await.unwrap();
        assert_eq!(op, Opcode::SendTo);
        assert_eq!(got, payload);
        let (op, got) = read_frame(&mut reader, 1 << 20).await.unwrap();
        assert_eq!(op, Opcode::KeepAlive);
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut writer, mut reader) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let _ = write_frame(&mut writer, Opcode::SendToAll, &[0u8; 2048]).await;
        });
        let err = read_frame(&mut reader, 1024).await.unwrap_err();
        assert!(matches!(err, WireError::FrameTooLarge { size: 2048, .. }));
    }

    #[tokio::test]
    async fn unknown_opcode_is_rejected() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        writer.write_all(&[42, 1, 0]).await.unwrap();
        let err = read_frame(&mut reader, 1024).await.unwrap_err();
        assert!(matches!(err, WireError::UnknownOpcode(42)));
    }

    #[tokio::test]
    async fn hello_roundtrip() {
        let (mut writer, mut reader) = tokio::io::duplex(128);
        let hello = Hello {
            id: PeerId::generate(),
            port: 3479,
        };
        write_hello(&mut writer, &hello).await.unwrap();
        assert_eq!(read_hello(&mut reader).await.unwrap(), hello);
    }

    #[tokio::test]
    async fn hello_rejects_bad_magic() {
        let (mut writer, mut reader) = tokio::io::duplex(128);
        writer.write_all(&[0u8; 8]).await.unwrap();
        let err = read_hello(&mut reader).await.unwrap_err();
        assert!(matches!(err, WireError::BadMagic { .. }));
    }

    #[test]
    fn send_to_payload_roundtrip() {
        let sender = PeerId::generate();
        let target = PeerId::generate();
        let data = b"user bytes";
        let payload = send_to_payload(&sender, &target, data);
        let (got_sender, got_target, offset) = parse_send_to(&payload).unwrap();
        assert_eq!(got_sender, sender);
        assert_eq!(got_target, target);
        assert_eq!(restore(&payload[offset..]).unwrap(), data);
    }

    #[test]
    fn distance_payload_roundtrip() {
        let id = PeerId::generate();
        let payload = distance_payload(3, &id);
        assert_eq!(parse_distance_payload(&payload).unwrap(), (3, id));
    }

    #[test]
    fn connect_to_roundtrip_v4_and_v6() {
        for address in [
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        ] {
            let endpoint = PeerEndpoint {
                id: PeerId::generate(),
                address,
                port: 4001,
            };
            let payload = connect_to_payload(&endpoint);
            assert_eq!(parse_connect_to(&payload).unwrap(), endpoint);
        }
    }

    #[test]
    fn peers_list_roundtrip() {
        let peers: Vec<PeerEndpoint> = (0..3)
            .map(|i| PeerEndpoint {
                id: PeerId::generate(),
                address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, i + 1)),
                port: 4000 + u16::from(i),
            })
            .collect();
        let payload = peers_list_payload(peers.iter());
        assert_eq!(parse_peers_list(&payload).unwrap(), peers);
    }

    #[test]
    fn peers_list_empty() {
        let payload = peers_list_payload([].iter());
        assert_eq!(payload, vec![0, 0]);
        assert!(parse_peers_list(&payload).unwrap().is_empty());
    }
}
