//! The write-ahead log subsystem.
//!
//! Each tablet server runs one [`TabletServerLogger`]: a single shared
//! "current log" that all writers append to, a background maker that keeps
//! the *next* log pre-created so rotation never waits on file creation, and
//! coordination-service markers tracking every log's lifecycle
//! (`OPEN → CLOSED → UNREFERENCED`). Recovery reads closed logs back into
//! tablets through [`recovery`].

pub mod entry;
pub mod file;
pub mod logger;
pub mod marker;
pub mod next_log;
pub mod recovery;

pub use entry::{LogEntry, TabletLogWrite};
pub use file::WalFile;
pub use logger::{Halter, LogDefinePublisher, ProcessHalter, TabletServerLogger, WalConfig};
pub use marker::{WalMarkers, WalState};
pub use recovery::{needs_recovery, recover, RecoveryLogsResolver, ResolvedSortedLog};
