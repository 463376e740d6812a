//! Per-file write-ahead log.
//!
//! Before a transaction overwrites any region of the main file, the
//! original bytes are appended here and flushed. Commit truncates the
//! log; abort (and crash recovery at open) replays entries in reverse
//! and restores the main file to its pre-transaction size, so the log
//! never needs forward replay.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::StoreError;
use crate::varint;

const WAL_MAGIC: &[u8; 8] = b"satchwal";
const WAL_HEADER: u64 = 16;
const REC_PRE_IMAGE: u8 = 1;

pub struct Wal {
    file: File,
    path: PathBuf,
    end: u64,
    sync: bool,
}

impl Wal {
    /// Open the companion log and write a fresh transaction header.
    pub fn begin(path: &Path, base_fsiz: u64, sync: bool) -> Result<Wal, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut header = [0u8; WAL_HEADER as usize];
        header[..8].copy_from_slice(WAL_MAGIC);
        LittleEndian::write_u64(&mut header[8..16], base_fsiz);
        file.write_all_at(&header, 0)?;
        file.sync_data()?;
        Ok(Wal {
            file,
            path: path.to_path_buf(),
            end: WAL_HEADER,
            sync,
        })
    }

    /// Append the pre-image of a region about to be overwritten.
    pub fn record(&mut self, off: u64, pre_image: &[u8]) -> Result<(), StoreError> {
        let mut buf = Vec::with_capacity(pre_image.len() + 12);
        buf.push(REC_PRE_IMAGE);
        varint::write(&mut buf, off);
        varint::write(&mut buf, pre_image.len() as u64);
        buf.extend_from_slice(pre_image);
        self.file.write_all_at(&buf, self.end)?;
        self.end += buf.len() as u64;
        if self.sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Commit: the main file already holds the new state; drop the log.
    pub fn commit(self) -> Result<(), StoreError> {
        self.file.set_len(0)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Abort: restore every logged region and the original file size.
    pub fn abort(self, main: &File) -> Result<(), StoreError> {
        replay_file(&self.file, main)?;
        self.file.set_len(0)?;
        self.file.sync_data()?;
        let _ = std::fs::remove_file(&self.path);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Crash recovery: if a non-empty log sits beside the main file,
/// replay it exactly as an abort would. Returns whether a replay ran.
pub fn recover(wal_path: &Path, main: &File) -> Result<bool, StoreError> {
    let mut file = match File::open(wal_path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if file.metadata()?.len() == 0 {
        let _ = std::fs::remove_file(wal_path);
        return Ok(false);
    }
    tracing::warn!(wal = %wal_path.display(), "replaying write-ahead log after unclean shutdown");
    let mut raw = Vec::new();
    file.read_to_end(&mut raw)?;
    drop(file);
    replay_bytes(&raw, main)?;
    std::fs::remove_file(wal_path)?;
    Ok(true)
}

fn replay_file(wal: &File, main: &File) -> Result<(), StoreError> {
    let len = wal.metadata()?.len();
    let mut raw = vec![0u8; len as usize];
    wal.read_exact_at(&mut raw, 0)?;
    replay_bytes(&raw, main)
}

fn replay_bytes(raw: &[u8], main: &File) -> Result<(), StoreError> {
    if raw.len() < WAL_HEADER as usize || &raw[..8] != WAL_MAGIC {
        return Err(StoreError::Corrupt("write-ahead log header".into()));
    }
    let base_fsiz = LittleEndian::read_u64(&raw[8..16]);

    let mut entries: Vec<(u64, &[u8])> = Vec::new();
    let mut at = WAL_HEADER as usize;
    while at < raw.len() {
        if raw[at] != REC_PRE_IMAGE {
            // a torn tail write; everything before it is intact
            break;
        }
        at += 1;
        let Ok((off, used)) = varint::read(&raw[at..]) else { break };
        at += used;
        let Ok((len, used)) = varint::read(&raw[at..]) else { break };
        at += used;
        let len = len as usize;
        if at + len > raw.len() {
            break;
        }
        entries.push((off, &raw[at..at + len]));
        at += len;
    }

    for (off, bytes) in entries.iter().rev() {
        main.write_all_at(bytes, *off)?;
    }
    main.set_len(base_fsiz)?;
    main.sync_data()?;
    Ok(())
}
