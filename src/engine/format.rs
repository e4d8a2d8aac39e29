//! On-disk frame format for the consumption journal.
//!
//! # Layout (40-byte header, little endian)
//!
//! | offset | size | field          |
//! |--------|------|----------------|
//! | 0      | 4    | magic `NJRN`   |
//! | 4      | 4    | checksum       |
//! | 8      | 4    | payload_size   |
//! | 12     | 4    | reserved       |
//! | 16     | 8    | sequence       |
//! | 24     | 16   | prev_hash      |
//!
//! The checksum is CRC32C over bytes `[8..40]` followed by the payload.
//! Frames form a hash chain: each frame carries the truncated BLAKE3 chain
//! hash of its predecessor.

/// Header size in bytes.
pub const HEADER_SIZE: usize = 40;

/// Frame magic: "NJRN".
pub const FRAME_MAGIC: [u8; 4] = *b"NJRN";

/// Upper bound on a single record. Anything larger is treated as corruption.
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// prev_hash of the first frame.
pub const GENESIS_HASH: [u8; 16] = [0u8; 16];

/// Decoded frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub checksum: u32,
    pub payload_size: u32,
    pub sequence: u64,
    pub prev_hash: [u8; 16],
}

impl FrameHeader {
    pub fn new(sequence: u64, prev_hash: [u8; 16], payload: &[u8]) -> Self {
        let mut header = FrameHeader {
            checksum: 0,
            payload_size: payload.len() as u32,
            sequence,
            prev_hash,
        };
        header.checksum = header.compute_checksum(payload);
        header
    }

    fn body_bytes(&self) -> [u8; HEADER_SIZE - 8] {
        let mut body = [0u8; HEADER_SIZE - 8];
        body[0..4].copy_from_slice(&self.payload_size.to_le_bytes());
        // 4..8 reserved
        body[8..16].copy_from_slice(&self.sequence.to_le_bytes());
        body[16..32].copy_from_slice(&self.prev_hash);
        body
    }

    pub fn compute_checksum(&self, payload: &[u8]) -> u32 {
        let crc = crc32c::crc32c(&self.body_bytes());
        crc32c::crc32c_append(crc, payload)
    }

    pub fn verify_checksum(&self, payload: &[u8]) -> bool {
        self.checksum == self.compute_checksum(payload)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&FRAME_MAGIC);
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes[8..].copy_from_slice(&self.body_bytes());
        bytes
    }

    /// Returns None if the magic does not match.
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Option<Self> {
        if bytes[0..4] != FRAME_MAGIC {
            return None;
        }
        let u32_at = |offset: usize| {
            u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
        };
        let checksum = u32_at(4);
        let payload_size = u32_at(8);

        let mut sequence = [0u8; 8];
        sequence.copy_from_slice(&bytes[16..24]);
        let mut prev_hash = [0u8; 16];
        prev_hash.copy_from_slice(&bytes[24..40]);

        Some(FrameHeader {
            checksum,
            payload_size,
            sequence: u64::from_le_bytes(sequence),
            prev_hash,
        })
    }
}

/// Encode a complete frame (header followed by payload).
pub fn encode_frame(sequence: u64, prev_hash: [u8; 16], payload: &[u8]) -> Vec<u8> {
    let header = FrameHeader::new(sequence, prev_hash, payload);
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Chain hash of a record: BLAKE3(prev_hash || sequence || payload), truncated to 16 bytes.
pub fn compute_chain_hash(prev_hash: &[u8; 16], sequence: u64, payload: &[u8]) -> [u8; 16] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(prev_hash);
    hasher.update(&sequence.to_le_bytes());
    hasher.update(payload);
    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_bytes_roundtrip() {
        let header = FrameHeader::new(7, [3u8; 16], b"payload");
        let decoded = FrameHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.verify_checksum(b"payload"));
        assert!(!decoded.verify_checksum(b"payloaD"));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = FrameHeader::new(0, GENESIS_HASH, b"").to_bytes();
        bytes[0] = b'X';
        assert!(FrameHeader::from_bytes(&bytes).is_none());
    }

    #[test]
    fn test_chain_hash_depends_on_history() {
        let a = compute_chain_hash(&GENESIS_HASH, 0, b"one");
        let b = compute_chain_hash(&a, 1, b"two");
        let b_other = compute_chain_hash(&GENESIS_HASH, 1, b"two");
        assert_ne!(b, b_other);
        assert_eq!(a, compute_chain_hash(&GENESIS_HASH, 0, b"one"));
    }
}
