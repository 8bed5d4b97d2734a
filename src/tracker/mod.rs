//! Tracker and peer-discovery coordination
//!
//! Per-tracker announce state machines organized into tiers, the HTTP
//! announce transport, and the merged DHT/PEX/LSD candidate queue.

pub mod announce;
pub mod discovery;
pub mod state;
pub mod tier;

// Re-export main types
pub use announce::{AnnounceParams, AnnounceResponse, HttpAnnouncer};
pub use discovery::{Candidate, CandidateQueue};
pub use state::{AnnounceEvent, Tracker, TrackerStatus};
pub use tier::TrackerSet;
