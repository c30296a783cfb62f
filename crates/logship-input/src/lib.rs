//! logship input
//!
//! Input adapters for the logship agent: the byte-accurate file tailer
//! with multi-line grouping (including the Oracle XML alert log dialect),
//! the Lumberjack listener, and the wildcard watcher.

pub mod file;
pub mod lumberjack;
pub mod multiline;
pub mod oracle_xml;
pub mod tailer;
pub mod watcher;

pub use file::FileInput;
pub use lumberjack::{LumberjackInput, LumberjackSource};
pub use multiline::MultilineGrouper;
pub use oracle_xml::OracleXmlGrouper;
pub use tailer::Tailer;
pub use watcher::PathWatcher;
