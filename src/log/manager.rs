//! Log Manager
//!
//! Owns the set of log files and the in-memory tail of unflushed appends.
//!
//! ## Responsibilities
//! - Discover existing log files on startup
//! - Append frames, padding to the next file when a frame does not fit
//! - Serve reads from the unflushed tail or from disk through the `FileCache`
//! - Flush/sync, roll back aborted appends, truncate a torn tail
//! - Delete or rename vacated files

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::error::{LogTreeError, Result};

use super::cache::FileCache;
use super::iterator::LoggableIterator;
use super::loggable::{decode_frame, encode_frame, FrameHeader, Loggable, LoggableType};
use super::{FRAME_OVERHEAD, HEADER_SIZE};

/// Callback invoked with the address of every newly started file
pub type NewFileListener = Box<dyn Fn(u64) + Send + Sync>;

/// How `remove_file` disposes of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveMode {
    Delete,
    /// Rename to `<name>.del`, keeping the bytes for inspection
    Rename,
}

/// The append-only log
///
/// ## Concurrency:
/// - `state`: RwLock; appends/flushes take the write side, reads the read side
/// - Disk reads go through `Arc<File>` handles and positional reads, so
///   concurrent readers never contend on a seek position
/// - Appends are serialized by the caller (one writer transaction at a time)
pub struct Log {
    /// Directory holding the log files
    dir: PathBuf,

    /// Size (and address span) of every file
    file_size: u64,

    /// Open read handles
    cache: FileCache,

    state: RwLock<LogState>,

    listeners: RwLock<Vec<NewFileListener>>,
}

struct LogState {
    /// Every file holding data, flushed or not
    files: BTreeSet<u64>,

    /// End of the last appended frame
    high_address: u64,

    /// Everything below this address has been written to the files
    flushed_address: u64,

    /// Bytes of `[flushed_address, high_address)`
    tail: Vec<u8>,

    /// Files written since the last sync
    unsynced: BTreeSet<u64>,

    /// Write handle of the file written last
    writer: Option<(u64, File)>,
}

impl Log {
    const FILE_SUFFIX: &'static str = ".log";
    const DELETED_SUFFIX: &'static str = ".del";

    /// Open or create a log in the given directory
    ///
    /// On startup:
    /// 1. Create directory if it doesn't exist
    /// 2. Discover existing log files
    /// 3. High address = last file address + its length
    pub fn open(dir: &Path, file_size: u64, cache_capacity: usize) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut files = BTreeSet::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(address) = Self::parse_file_address(&path) {
                if address % file_size != 0 {
                    return Err(LogTreeError::Corruption(format!(
                        "log file {} is not aligned to file size {}",
                        path.display(),
                        file_size
                    )));
                }
                let len = entry.metadata()?.len();
                if len > file_size {
                    return Err(LogTreeError::Corruption(format!(
                        "log file {} is {} bytes, larger than file size {}",
                        path.display(),
                        len,
                        file_size
                    )));
                }
                files.insert(address);
            }
        }

        let high_address = match files.iter().next_back() {
            Some(&last) => last + fs::metadata(Self::file_path_with_dir(dir, last))?.len(),
            None => 0,
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            file_size,
            cache: FileCache::new(cache_capacity),
            state: RwLock::new(LogState {
                files,
                high_address,
                flushed_address: high_address,
                tail: Vec::new(),
                unsynced: BTreeSet::new(),
                writer: None,
            }),
            listeners: RwLock::new(Vec::new()),
        })
    }

    // =========================================================================
    // Appending
    // =========================================================================

    /// Append a loggable, returning its address
    ///
    /// The frame stays in the in-memory tail until `flush`.
    pub fn append(
        &self,
        loggable_type: LoggableType,
        structure_id: u32,
        payload: &[u8],
    ) -> Result<u64> {
        let frame_len = (FRAME_OVERHEAD + payload.len()) as u64;
        if frame_len > self.file_size {
            return Err(LogTreeError::EntryTooLarge {
                size: frame_len as usize,
                limit: self.file_size as usize,
            });
        }
        let frame = encode_frame(loggable_type, structure_id, payload);

        let (address, new_file) = {
            let mut state = self.state.write();
            let offset = state.high_address % self.file_size;
            if offset != 0 && offset + frame_len > self.file_size {
                let padding = (self.file_size - offset) as usize;
                let new_len = state.tail.len() + padding;
                state.tail.resize(new_len, 0);
                state.high_address += padding as u64;
            }
            let address = state.high_address;
            let file_address = self.file_address_of(address);
            let new_file = state.files.insert(file_address);
            state.tail.extend_from_slice(&frame);
            state.high_address += frame_len;
            (address, new_file.then_some(file_address))
        };

        // Listeners run without the state lock: they may query the log
        if let Some(file_address) = new_file {
            for listener in self.listeners.read().iter() {
                listener(file_address);
            }
        }

        Ok(address)
    }

    /// Write the unflushed tail to the files (no fsync)
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.tail.is_empty() {
            return Ok(());
        }

        let tail = std::mem::take(&mut state.tail);
        let mut address = state.flushed_address;
        let mut pos = 0usize;
        while pos < tail.len() {
            let file_address = self.file_address_of(address);
            let in_file = address - file_address;
            let chunk = ((self.file_size - in_file) as usize).min(tail.len() - pos);

            let writer = self.writer_for(&mut state, file_address)?;
            writer.seek(SeekFrom::Start(in_file))?;
            if let Err(e) = writer.write_all(&tail[pos..pos + chunk]) {
                // Keep the unwritten bytes so a retry or rollback stays consistent
                state.tail = tail[pos..].to_vec();
                state.flushed_address = address;
                return Err(e.into());
            }
            state.unsynced.insert(file_address);
            pos += chunk;
            address += chunk as u64;
        }
        state.flushed_address = address;
        Ok(())
    }

    /// fsync every file written since the last sync
    pub fn sync(&self) -> Result<()> {
        let mut state = self.state.write();
        let unsynced = std::mem::take(&mut state.unsynced);
        for file_address in unsynced {
            if !state.files.contains(&file_address) {
                continue;
            }
            match &state.writer {
                Some((addr, file)) if *addr == file_address => file.sync_all()?,
                _ => File::open(self.file_path(file_address))?.sync_all()?,
            }
        }
        Ok(())
    }

    /// Flush the tail and fsync
    pub fn flush_and_sync(&self) -> Result<()> {
        self.flush()?;
        self.sync()
    }

    /// Discard unflushed appends at or above `address`
    pub fn rollback(&self, address: u64) -> Result<()> {
        let mut state = self.state.write();
        if address < state.flushed_address {
            return Err(LogTreeError::Integrity(format!(
                "cannot roll back to {} below flushed address {}",
                address, state.flushed_address
            )));
        }
        if address >= state.high_address {
            return Ok(());
        }
        let keep = (address - state.flushed_address) as usize;
        state.tail.truncate(keep);
        state.high_address = address;
        state.files.retain(|&f| f < address);
        Ok(())
    }

    /// Cut the log at `address`, dropping everything after it (recovery only)
    pub fn truncate_to(&self, address: u64) -> Result<()> {
        let mut state = self.state.write();
        if !state.tail.is_empty() {
            return Err(LogTreeError::Misuse(
                "truncate_to with unflushed appends".to_string(),
            ));
        }
        if address >= state.high_address {
            return Ok(());
        }
        state.writer = None;

        let doomed: Vec<u64> = state.files.range(address..).copied().collect();
        for file_address in doomed {
            self.cache.evict(file_address);
            fs::remove_file(self.file_path(file_address))?;
            state.files.remove(&file_address);
            state.unsynced.remove(&file_address);
        }

        let file_address = self.file_address_of(address);
        if file_address < address && state.files.contains(&file_address) {
            self.cache.evict(file_address);
            let file = OpenOptions::new()
                .write(true)
                .open(self.file_path(file_address))?;
            file.set_len(address - file_address)?;
            file.sync_all()?;
        }

        state.high_address = address;
        state.flushed_address = address;
        Ok(())
    }

    // =========================================================================
    // Reading
    // =========================================================================

    /// Read the loggable at `address`
    pub fn read(&self, address: u64) -> Result<Loggable> {
        self.read_frame(address)?.ok_or_else(|| {
            LogTreeError::Corruption(format!("no loggable at address {} (padding)", address))
        })
    }

    /// Length of the loggable at `address`, reading only its header
    pub fn record_length(&self, address: u64) -> Result<u64> {
        let mut header = [0u8; HEADER_SIZE];
        self.read_bytes(address, &mut header)?;
        match FrameHeader::parse(&header)? {
            Some(h) => Ok(h.frame_len() as u64),
            None => Err(LogTreeError::Corruption(format!(
                "no loggable at address {} (padding)",
                address
            ))),
        }
    }

    /// Read the frame at `address`; `None` if the bytes are file padding
    pub(crate) fn read_frame(&self, address: u64) -> Result<Option<Loggable>> {
        let in_file = address % self.file_size;
        if in_file + HEADER_SIZE as u64 > self.file_size {
            return Ok(None);
        }

        {
            let state = self.state.read();
            if address >= state.high_address {
                return Err(LogTreeError::Corruption(format!(
                    "address {} is beyond the high address {}",
                    address, state.high_address
                )));
            }
            if address >= state.flushed_address {
                let offset = (address - state.flushed_address) as usize;
                let buf = &state.tail[offset..];
                return match FrameHeader::parse(buf)? {
                    None => Ok(None),
                    Some(header) => decode_frame(address, header, buf).map(Some),
                };
            }
        }

        let mut header_bytes = [0u8; HEADER_SIZE];
        self.read_bytes(address, &mut header_bytes)?;
        let header = match FrameHeader::parse(&header_bytes)? {
            None => return Ok(None),
            Some(h) => h,
        };
        if in_file + header.frame_len() as u64 > self.file_size {
            return Err(LogTreeError::Corruption(format!(
                "loggable at {} crosses the file boundary",
                address
            )));
        }
        let mut frame = vec![0u8; header.frame_len()];
        self.read_bytes(address, &mut frame)?;
        decode_frame(address, header, &frame).map(Some)
    }

    /// Read raw bytes at `address` from the tail or the file holding it
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        {
            let state = self.state.read();
            if address + buf.len() as u64 > state.high_address {
                return Err(LogTreeError::Corruption(format!(
                    "read of {} bytes at {} runs past the high address {}",
                    buf.len(),
                    address,
                    state.high_address
                )));
            }
            if address >= state.flushed_address {
                let offset = (address - state.flushed_address) as usize;
                buf.copy_from_slice(&state.tail[offset..offset + buf.len()]);
                return Ok(());
            }
        }

        let file_address = self.file_address_of(address);
        let path = self.file_path(file_address);
        let file = self.cache.get_or_open(file_address, || File::open(&path))?;
        read_exact_at(&file, buf, address - file_address)?;
        Ok(())
    }

    /// Iterate loggables from `address` up to the high address
    pub fn loggable_iterator(&self, address: u64) -> LoggableIterator<'_> {
        LoggableIterator::new(self, address, self.high_address())
    }

    /// Iterate the loggables of one file
    pub fn file_iterator(&self, file_address: u64) -> LoggableIterator<'_> {
        let end = (file_address + self.file_size).min(self.high_address());
        LoggableIterator::new(self, file_address, end)
    }

    // =========================================================================
    // File Management
    // =========================================================================

    /// Delete or rename a vacated file
    pub fn remove_file(&self, file_address: u64, mode: RemoveMode) -> Result<()> {
        let mut state = self.state.write();
        if !state.files.contains(&file_address) {
            return Err(LogTreeError::Integrity(format!(
                "file {:016x} is not part of the log",
                file_address
            )));
        }
        if state.files.iter().next_back() == Some(&file_address) {
            return Err(LogTreeError::Misuse(format!(
                "file {:016x} holds the high address and cannot be removed",
                file_address
            )));
        }

        self.cache.evict(file_address);
        if matches!(&state.writer, Some((addr, _)) if *addr == file_address) {
            state.writer = None;
        }
        let path = self.file_path(file_address);
        match mode {
            RemoveMode::Delete => fs::remove_file(&path)?,
            RemoveMode::Rename => {
                let mut renamed = path.clone().into_os_string();
                renamed.push(Self::DELETED_SUFFIX);
                fs::rename(&path, renamed)?;
            }
        }
        state.files.remove(&file_address);
        state.unsynced.remove(&file_address);
        Ok(())
    }

    /// Register a callback for newly started files
    pub fn add_new_file_listener(&self, listener: NewFileListener) {
        self.listeners.write().push(listener);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// All file addresses, ascending
    pub fn all_file_addresses(&self) -> Vec<u64> {
        self.state.read().files.iter().copied().collect()
    }

    /// Number of bytes used in a file
    pub fn file_size(&self, file_address: u64) -> u64 {
        let high = self.high_address();
        if file_address >= high {
            0
        } else {
            (high - file_address).min(self.file_size)
        }
    }

    /// Configured size of a file
    pub fn file_length_bound(&self) -> u64 {
        self.file_size
    }

    pub fn high_address(&self) -> u64 {
        self.state.read().high_address
    }

    /// Address of the newest file, if any
    pub fn high_file_address(&self) -> Option<u64> {
        self.state.read().files.iter().next_back().copied()
    }

    /// Address of the oldest file (0 for an empty log)
    pub fn low_address(&self) -> u64 {
        self.state.read().files.iter().next().copied().unwrap_or(0)
    }

    pub fn number_of_files(&self) -> usize {
        self.state.read().files.len()
    }

    pub fn has_file(&self, file_address: u64) -> bool {
        self.state.read().files.contains(&file_address)
    }

    /// First file whose address is greater than `file_address`
    pub fn next_file_address(&self, file_address: u64) -> Option<u64> {
        self.state
            .read()
            .files
            .range(file_address + 1..)
            .next()
            .copied()
    }

    /// Address of the file containing `address`
    pub fn file_address_of(&self, address: u64) -> u64 {
        address - address % self.file_size
    }

    pub fn is_flushed(&self) -> bool {
        self.state.read().tail.is_empty()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn writer_for<'s>(&self, state: &'s mut LogState, file_address: u64) -> Result<&'s mut File> {
        let reuse = matches!(&state.writer, Some((addr, _)) if *addr == file_address);
        if !reuse {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(self.file_path(file_address))?;
            state.writer = Some((file_address, file));
        }
        match state.writer.as_mut() {
            Some((_, file)) => Ok(file),
            None => Err(LogTreeError::Integrity("log writer vanished".to_string())),
        }
    }

    fn file_path(&self, file_address: u64) -> PathBuf {
        Self::file_path_with_dir(&self.dir, file_address)
    }

    /// "0000000000800000.log" for address 0x800000
    fn file_path_with_dir(dir: &Path, file_address: u64) -> PathBuf {
        dir.join(format!("{:016x}{}", file_address, Self::FILE_SUFFIX))
    }

    /// "0000000000800000.log" → Some(0x800000)
    fn parse_file_address(path: &Path) -> Option<u64> {
        let name = path.file_name()?.to_str()?;
        let hex = name.strip_suffix(Self::FILE_SUFFIX)?;
        if hex.len() != 16 {
            return None;
        }
        u64::from_str_radix(hex, 16).ok()
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
