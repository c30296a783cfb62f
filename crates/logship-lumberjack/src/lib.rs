//! logship lumberjack
//!
//! Lumberjack wire protocol for the logship agent: frame codec with
//! DEFLATE-compressed batches, TLS material loading, the windowed client,
//! and the acknowledging listener.

pub mod client;
pub mod frame;
pub mod server;
pub mod tls;

pub use client::LumberjackClient;
pub use frame::{Frame, FrameDecoder};
pub use server::LumberjackServer;
