//! logship output
//!
//! Output adapters for the logship agent: the windowed Lumberjack client,
//! plain socket, file, and screen sinks. Every adapter speaks the same
//! push contract; any error means "stash and retry".

pub mod file;
pub mod lumberjack;
pub mod screen;
pub mod socket;

pub use file::FileOutput;
pub use lumberjack::LumberjackOutput;
pub use screen::ScreenOutput;
pub use socket::SocketOutput;
