//! Append-only, checksummed, hash-chained journal.
//!
//! Recovery is deterministic. Given a file, there is one outcome:
//! 1. Clean: every frame verifies.
//! 2. Tail repair: the last frame is torn (short, or its checksum fails and
//!    nothing follows it). It is truncated away.
//! 3. Fatal: a frame in the middle of the file fails verification, or the
//!    hash chain is broken. The journal refuses to open.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use thiserror::Error;
use tracing::{info, warn};

use super::format::{
    compute_chain_hash, encode_frame, FrameHeader, GENESIS_HASH, HEADER_SIZE, MAX_PAYLOAD_SIZE,
};

/// Journal failures that must stop the owning replica.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("journal corrupted at offset {offset}: {reason}")]
    Corrupted { offset: u64, reason: &'static str },

    #[error("journal hash chain broken at sequence {sequence}")]
    ChainBroken { sequence: u64 },

    #[error("journal record of {size} bytes exceeds the frame limit")]
    PayloadTooLarge { size: usize },
}

/// What recovery found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Clean { records: u64 },
    Truncated { records: u64, truncated_at: u64, discarded_bytes: u64 },
}

/// Single writer for a journal file.
#[derive(Debug)]
pub struct JournalWriter {
    file: File,
    next_sequence: u64,
    tail_hash: [u8; 16],
}

impl JournalWriter {
    /// Open (or create) a journal and replay it.
    ///
    /// Returns the writer positioned after the last valid record, the
    /// recovered record payloads in order, and the recovery outcome.
    pub fn open(path: &Path) -> Result<(Self, Vec<Vec<u8>>, RecoveryOutcome), JournalError> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let scan = scan(&bytes)?;
        let outcome = if scan.valid_len < bytes.len() as u64 {
            file.set_len(scan.valid_len)?;
            file.sync_all()?;
            let discarded = bytes.len() as u64 - scan.valid_len;
            warn!(
                path = %path.display(),
                truncated_at = scan.valid_len,
                discarded_bytes = discarded,
                "journal tail was torn, truncated"
            );
            RecoveryOutcome::Truncated {
                records: scan.records.len() as u64,
                truncated_at: scan.valid_len,
                discarded_bytes: discarded,
            }
        } else {
            RecoveryOutcome::Clean {
                records: scan.records.len() as u64,
            }
        };

        info!(path = %path.display(), records = scan.records.len(), "journal opened");

        let writer = JournalWriter {
            file,
            next_sequence: scan.records.len() as u64,
            tail_hash: scan.tail_hash,
        };
        Ok((writer, scan.records, outcome))
    }

    /// Append one record and sync it to disk before returning.
    pub fn append(&mut self, payload: &[u8]) -> Result<u64, JournalError> {
        if payload.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(JournalError::PayloadTooLarge { size: payload.len() });
        }
        let sequence = self.next_sequence;
        let frame = encode_frame(sequence, self.tail_hash, payload);
        self.file.write_all(&frame)?;
        self.file.sync_data()?;

        self.tail_hash = compute_chain_hash(&self.tail_hash, sequence, payload);
        self.next_sequence += 1;
        Ok(sequence)
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }
}

struct Scan {
    records: Vec<Vec<u8>>,
    valid_len: u64,
    tail_hash: [u8; 16],
}

fn scan(bytes: &[u8]) -> Result<Scan, JournalError> {
    let mut records = Vec::new();
    let mut offset = 0usize;
    let mut tail_hash = GENESIS_HASH;

    while offset < bytes.len() {
        let remaining = bytes.len() - offset;
        if remaining < HEADER_SIZE {
            break; // torn header
        }
        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes.copy_from_slice(&bytes[offset..offset + HEADER_SIZE]);

        let header = match FrameHeader::from_bytes(&header_bytes) {
            Some(h) => h,
            None => {
                // Garbage where a header should be. Only tolerable at the tail.
                if has_frame_after(bytes, offset + 1) {
                    return Err(JournalError::Corrupted {
                        offset: offset as u64,
                        reason: "bad frame magic",
                    });
                }
                break;
            }
        };

        if header.payload_size > MAX_PAYLOAD_SIZE {
            return Err(JournalError::Corrupted {
                offset: offset as u64,
                reason: "payload size exceeds limit",
            });
        }

        let frame_end = offset + HEADER_SIZE + header.payload_size as usize;
        if frame_end > bytes.len() {
            break; // torn payload
        }
        let payload = &bytes[offset + HEADER_SIZE..frame_end];

        if !header.verify_checksum(payload) {
            if frame_end < bytes.len() {
                return Err(JournalError::Corrupted {
                    offset: offset as u64,
                    reason: "checksum mismatch",
                });
            }
            break; // torn last frame
        }

        let expected_sequence = records.len() as u64;
        if header.sequence != expected_sequence || header.prev_hash != tail_hash {
            return Err(JournalError::ChainBroken {
                sequence: expected_sequence,
            });
        }

        tail_hash = compute_chain_hash(&tail_hash, header.sequence, payload);
        records.push(payload.to_vec());
        offset = frame_end;
    }

    Ok(Scan {
        records,
        valid_len: offset as u64,
        tail_hash,
    })
}

fn has_frame_after(bytes: &[u8], from: usize) -> bool {
    bytes
        .get(from..)
        .map(|rest| rest.windows(4).any(|w| w == super::format::FRAME_MAGIC))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_append_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consumed.journal");

        {
            let (mut writer, records, outcome) = JournalWriter::open(&path).unwrap();
            assert!(records.is_empty());
            assert_eq!(outcome, RecoveryOutcome::Clean { records: 0 });
            assert_eq!(writer.append(b"first").unwrap(), 0);
            assert_eq!(writer.append(b"second").unwrap(), 1);
        }

        let (writer, records, outcome) = JournalWriter::open(&path).unwrap();
        assert_eq!(records, vec![b"first".to_vec(), b"second".to_vec()]);
        assert_eq!(outcome, RecoveryOutcome::Clean { records: 2 });
        assert_eq!(writer.next_sequence(), 2);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consumed.journal");

        {
            let (mut writer, _, _) = JournalWriter::open(&path).unwrap();
            writer.append(b"kept").unwrap();
            writer.append(b"torn-away").unwrap();
        }

        // Chop the last few bytes off the second frame.
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();
        drop(file);

        let (mut writer, records, outcome) = JournalWriter::open(&path).unwrap();
        assert_eq!(records, vec![b"kept".to_vec()]);
        assert!(matches!(outcome, RecoveryOutcome::Truncated { records: 1, .. }));

        // The chain continues cleanly after repair.
        writer.append(b"after-repair").unwrap();
        drop(writer);
        let (_, records, outcome) = JournalWriter::open(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(outcome, RecoveryOutcome::Clean { records: 2 });
    }

    #[test]
    fn test_mid_log_corruption_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consumed.journal");

        {
            let (mut writer, _, _) = JournalWriter::open(&path).unwrap();
            writer.append(b"aaaaaaaa").unwrap();
            writer.append(b"bbbbbbbb").unwrap();
        }

        // Flip a payload byte of the first frame.
        let mut bytes = fs::read(&path).unwrap();
        bytes[HEADER_SIZE + 2] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let err = JournalWriter::open(&path).unwrap_err();
        assert!(matches!(err, JournalError::Corrupted { offset: 0, .. }));
    }
}
