//! Write-ahead log for one store table.
//!
//! Entries are length-prefixed frames with a crc32 trailer over the
//! payload. Recovery reads frames until the first truncated or corrupt
//! one: a partial tail is the crash point, everything before it is kept.

use std::fs::File as StdFile;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::{EdgeError, EdgeResult};

const MAGIC: &[u8; 4] = b"SEWL";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 13;
const WAL_FILE: &str = "wal.log";

/// Append-only log file, fsynced on every append
pub struct Wal {
    path: PathBuf,
    file: tokio::fs::File,
    entries: u64,
}

impl Wal {
    /// Open or create the log inside `dir`
    pub async fn open(dir: &Path) -> EdgeResult<Self> {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| EdgeError::storage(format!("create {}: {e}", dir.display())))?;
        let path = dir.join(WAL_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| EdgeError::storage(format!("open {}: {e}", path.display())))?;
        Ok(Self {
            path,
            file,
            entries: 0,
        })
    }

    /// Append one payload frame and fsync
    pub async fn append(&mut self, payload: &[u8]) -> EdgeResult<()> {
        let header = encode_header(payload);
        self.file
            .write_all(&header)
            .await
            .map_err(|e| EdgeError::storage(format!("wal write: {e}")))?;
        self.file
            .write_all(payload)
            .await
            .map_err(|e| EdgeError::storage(format!("wal write: {e}")))?;
        self.file
            .sync_data()
            .await
            .map_err(|e| EdgeError::storage(format!("wal sync: {e}")))?;
        self.entries += 1;
        Ok(())
    }

    /// Read every intact frame; a truncated or corrupt tail frame is
    /// dropped, anything else corrupt is fatal to startup
    pub fn read_all(&self) -> EdgeResult<Vec<Vec<u8>>> {
        read_frames(&self.path)
    }

    /// Discard the log after a checkpoint made its contents redundant
    pub async fn reset(&mut self) -> EdgeResult<()> {
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .await
            .map_err(|e| EdgeError::storage(format!("truncate {}: {e}", self.path.display())))?;
        self.entries = 0;
        Ok(())
    }

    /// Frames appended since open or the last reset
    pub fn pending_entries(&self) -> u64 {
        self.entries
    }
}

fn encode_header(payload: &[u8]) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4] = VERSION;
    header[5..9].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    let mut hasher = Hasher::new();
    hasher.update(payload);
    header[9..13].copy_from_slice(&hasher.finalize().to_le_bytes());
    header
}

fn decode_header(header: &[u8; HEADER_LEN]) -> EdgeResult<(usize, u32)> {
    if &header[0..4] != MAGIC {
        return Err(EdgeError::storage("invalid WAL magic"));
    }
    if header[4] != VERSION {
        return Err(EdgeError::storage(format!(
            "unsupported WAL version {}",
            header[4]
        )));
    }
    let len = u32::from_le_bytes(header[5..9].try_into().unwrap()) as usize;
    let crc = u32::from_le_bytes(header[9..13].try_into().unwrap());
    Ok((len, crc))
}

/// Write a whole file of frames (checkpoint tables use the same framing
/// as the log)
pub(crate) async fn write_frames<I>(path: &Path, frames: I) -> EdgeResult<()>
where
    I: IntoIterator<Item = Vec<u8>>,
{
    let mut buffer = Vec::new();
    for payload in frames {
        buffer.extend_from_slice(&encode_header(&payload));
        buffer.extend_from_slice(&payload);
    }
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await
        .map_err(|e| EdgeError::storage(format!("open {}: {e}", path.display())))?;
    file.write_all(&buffer)
        .await
        .map_err(|e| EdgeError::storage(format!("write {}: {e}", path.display())))?;
    file.sync_data()
        .await
        .map_err(|e| EdgeError::storage(format!("sync {}: {e}", path.display())))?;
    Ok(())
}

pub(crate) fn read_frames(path: &Path) -> EdgeResult<Vec<Vec<u8>>> {
    let file = match StdFile::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(EdgeError::storage(format!("open {}: {e}", path.display()))),
    };
    let mut reader = BufReader::new(file);
    let mut frames = Vec::new();

    loop {
        let mut header = [0u8; HEADER_LEN];
        match read_exact_or_eof(&mut reader, &mut header) {
            Ok(false) => break, // clean EOF
            Ok(true) => {}
            Err(_) => {
                warn!(
                    "truncated WAL header in {:?} after {} frames, treating as crash point",
                    path,
                    frames.len()
                );
                break;
            }
        }
        let (len, expected_crc) = decode_header(&header)?;
        let mut payload = vec![0u8; len];
        match read_exact_or_eof(&mut reader, &mut payload) {
            Ok(true) => {}
            _ => {
                warn!("truncated WAL payload in {:?}, discarding tail frame", path);
                break;
            }
        }
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != expected_crc {
            warn!("WAL crc mismatch in {:?}, discarding tail frame", path);
            break;
        }
        frames.push(payload);
    }

    Ok(frames)
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buffer: &mut [u8]) -> EdgeResult<bool> {
    let mut offset = 0;
    while offset < buffer.len() {
        let read = reader
            .read(&mut buffer[offset..])
            .map_err(|e| EdgeError::storage(format!("wal read: {e}")))?;
        if read == 0 {
            if offset == 0 {
                return Ok(false);
            }
            return Err(EdgeError::storage("unexpected EOF"));
        }
        offset += read;
    }
    Ok(true)
}
