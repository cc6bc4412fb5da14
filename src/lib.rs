//! Durable, priority-aware video archiving pipeline.
//!
//! The crate takes `(url, origin-message)` submissions from a chat host and
//! guarantees that each one is either delivered to an archive channel or
//! conclusively failed, across process restarts. The host integrates through
//! the capability traits in [`archiver::adapters`]; everything else (queue,
//! persistence, monitoring, recovery, cleanup, tool orchestration) lives
//! behind [`archiver::queue::QueueManager`] and [`archiver::Processor`].

pub mod archiver;
pub(crate) mod sync_ext;

pub use archiver::Processor;
pub use archiver::adapters::{ChatAdapter, GuildComponents, GuildRegistry, VideoDownloader};
pub use archiver::archive_index::ArchiveIndex;
pub use archiver::domain::{ArchiveRecord, ItemStatus, QueueItem};
pub use archiver::error::ArchiveError;
pub use archiver::queue::QueueManager;
pub use archiver::settings::ArchiverSettings;
pub use archiver::shutdown::ShutdownSignal;

/// Install a `tracing` subscriber reading `RUST_LOG`, for hosts and tests
/// that do not bring their own.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
