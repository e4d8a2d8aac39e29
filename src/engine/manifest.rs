//! View fence: the highest view a replica has ever seen.
//!
//! A replica never processes a message from a view below `highest_view` and
//! never lowers it. With a file-backed manifest this holds across restarts,
//! so a restarted replica cannot vote twice in the same view change.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Record layout (little endian):
/// `magic "NMAN" | version u32 | highest_view u64 | last_normal_view u64 | crc32c u32 | pad`.
const MAGIC: [u8; 4] = *b"NMAN";
const VERSION: u32 = 1;
const RECORD_LEN: usize = 32;
const CRC_AT: usize = 24;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewRecord {
    pub highest_view: u64,
    /// Last view this replica spent in normal operation. Ranks its log during
    /// a view change.
    pub last_normal_view: u64,
}

impl ViewRecord {
    fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        let fields: [&[u8]; 4] = [
            &MAGIC,
            &VERSION.to_le_bytes(),
            &self.highest_view.to_le_bytes(),
            &self.last_normal_view.to_le_bytes(),
        ];
        let mut at = 0;
        for field in fields {
            out[at..at + field.len()].copy_from_slice(field);
            at += field.len();
        }
        let crc = crc32c::crc32c(&out[..CRC_AT]);
        out[CRC_AT..CRC_AT + 4].copy_from_slice(&crc.to_le_bytes());
        out
    }

    fn decode(raw: &[u8; RECORD_LEN]) -> Option<Self> {
        let word = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let long = |at: usize| (word(at) as u64) | ((word(at + 4) as u64) << 32);

        let valid = raw[..4] == MAGIC && word(4) == VERSION && word(CRC_AT) == crc32c::crc32c(&raw[..CRC_AT]);
        valid.then(|| ViewRecord {
            highest_view: long(8),
            last_normal_view: long(16),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ViewFenceError {
    #[error("message from view {msg_view} is older than view {highest_view}")]
    StaleView { msg_view: u64, highest_view: u64 },
}

/// Holds the fence, optionally mirrored to a file. Every change is written
/// to a temporary file, synced and renamed over the old one.
#[derive(Debug)]
pub struct Manifest {
    path: Option<PathBuf>,
    record: ViewRecord,
}

impl Manifest {
    pub fn in_memory() -> Self {
        Manifest {
            path: None,
            record: ViewRecord::default(),
        }
    }

    /// Load `path`, creating it in view 0 if it does not exist. A file that
    /// fails validation is an error, never silently reset.
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut manifest = Manifest {
            path: Some(path.to_path_buf()),
            record: ViewRecord::default(),
        };
        if !path.exists() {
            manifest.save()?;
            return Ok(manifest);
        }

        let mut raw = [0u8; RECORD_LEN];
        File::open(path)?.read_exact(&mut raw)?;
        manifest.record = ViewRecord::decode(&raw).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, format!("corrupt view manifest {}", path.display()))
        })?;
        Ok(manifest)
    }

    pub fn record(&self) -> ViewRecord {
        self.record
    }

    pub fn highest_view(&self) -> u64 {
        self.record.highest_view
    }

    pub fn last_normal_view(&self) -> u64 {
        self.record.last_normal_view
    }

    #[inline]
    pub fn check_view_fence(&self, msg_view: u64) -> Result<(), ViewFenceError> {
        let highest_view = self.record.highest_view;
        if msg_view < highest_view {
            return Err(ViewFenceError::StaleView { msg_view, highest_view });
        }
        Ok(())
    }

    /// Raise the fence to `view`, persisting first. Returns false when the
    /// fence is already there.
    pub fn advance_view(&mut self, view: u64) -> io::Result<bool> {
        if view <= self.record.highest_view {
            return Ok(false);
        }
        self.update(ViewRecord {
            highest_view: view,
            ..self.record
        })?;
        Ok(true)
    }

    /// Normal operation resumed in `view`.
    pub fn enter_normal_view(&mut self, view: u64) -> io::Result<()> {
        self.update(ViewRecord {
            highest_view: self.record.highest_view.max(view),
            last_normal_view: view,
        })
    }

    /// The in-memory record only changes once the file write succeeded.
    fn update(&mut self, next: ViewRecord) -> io::Result<()> {
        let previous = std::mem::replace(&mut self.record, next);
        if let Err(e) = self.save() {
            self.record = previous;
            return Err(e);
        }
        Ok(())
    }

    fn save(&self) -> io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let staging = path.with_extension("tmp");
        let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&staging)?;
        file.write_all(&self.record.encode())?;
        file.sync_data()?;
        drop(file);

        fs::rename(&staging, path)?;
        if let Some(dir) = path.parent().and_then(|p| File::open(p).ok()) {
            let _ = dir.sync_all();
        }
        Ok(())
    }
}
