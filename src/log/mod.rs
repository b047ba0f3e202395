//! Log Module
//!
//! Append-only, multi-file binary log. Every record ("loggable") has a
//! monotonically increasing byte address that never changes; a record is
//! physically removed only when the whole file holding it is deleted.
//!
//! ## Responsibilities
//! - Transactional append (unflushed tail kept in memory, rolled back on abort)
//! - Random reads by address, sequential iteration from an address
//! - CRC32 checksums for corruption detection
//! - File-level delete/rename for the garbage collector
//! - New-file notifications
//!
//! ## Address Space
//! ```text
//!   file 0x0000            file 0x8000            file 0x10000
//! ┌──────────────────────┬──────────────────────┬──────────────────────┐
//! │ rec │ rec │ rec │ pad│ rec │ rec │ rec │ pad│ rec │ rec │          │
//! └──────────────────────┴──────────────────────┴──────────────────────┘
//!   address = file_address + offset           high address ──────┘
//! ```
//!
//! ## Loggable Frame
//! ```text
//! ┌─────────┬──────────────────┬─────────────┬───────────┬─────────┐
//! │ Type(1) │ StructureId (4)  │ Len (4)     │ Payload   │ CRC (4) │
//! └─────────┴──────────────────┴─────────────┴───────────┴─────────┘
//! ```
//! Type `0` marks zero padding up to the end of the file: records never
//! straddle two files.

mod cache;
mod iterator;
mod loggable;
mod manager;

pub use cache::FileCache;
pub use iterator::LoggableIterator;
pub use loggable::{
    ExpiredLoggable, Loggable, LoggableType, CRC_SIZE, FRAME_OVERHEAD, HEADER_SIZE,
    MAX_PAYLOAD_SIZE, NO_STRUCTURE_ID,
};
pub use manager::{Log, NewFileListener, RemoveMode};
