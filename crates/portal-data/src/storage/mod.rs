//! Local state: votes, recently created ETFs and the storage-tier preference.
//!
//! In-memory state is authoritative. Writes to the backing store are best
//! effort and failures are only logged.

pub mod backend;
pub mod etfs;
pub mod votes;

pub use backend::{FileStorage, MemoryStorage, StorageBackend, TieredStorage};
pub use etfs::{RecentEtf, RecentEtfs};
pub use votes::{VoteStatus, VotedProposal, VotingHistory};

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> i64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    i64::try_from(nanos / 1_000_000).unwrap_or(i64::MAX)
}

/// Render a unix-millisecond timestamp as `YYYY-MM-DD HH:MM:SS UTC`.
pub fn format_timestamp(millis: i64) -> Option<String> {
    let dt = time::OffsetDateTime::from_unix_timestamp(millis.div_euclid(1_000)).ok()?;
    let format =
        time::format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second] UTC").ok()?;
    dt.format(&format).ok()
}
