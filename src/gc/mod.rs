//! Garbage Collection Module
//!
//! Reclaims log space held by expired loggables.
//!
//! ## Responsibilities
//! - Track free bytes per file (`UtilizationProfile`)
//! - Pick the most fragmented files once free space exceeds the target
//! - Relocate the live nodes of those files inside one transaction
//! - Delete (or rename) vacated files once no reader can see them
//!
//! ## File States
//! ```text
//!   ┌──────┐  selected   ┌─────────┐  committed  ┌─────────┐  no older  ┌─────────┐
//!   │ live ├────────────►│ cleaning├────────────►│ pending ├───────────►│ deleted │
//!   └──────┘             └─────────┘             └─────────┘   reader   └─────────┘
//! ```
//! The newest files (`gc_min_file_age`) are never selected; the file
//! holding the current root record is always among them.

mod cleaner;
mod collector;
mod pending;
mod utilization;

pub use collector::{GarbageCollector, GcStats};
pub use utilization::{CandidateFiles, UtilizationProfile, UtilizationSource};
