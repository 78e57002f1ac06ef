//! Real-time room coordinator: members join capacity-bounded rooms that
//! share a countdown timer, exchange chat messages, and send files either
//! whole or as chunked uploads that are reassembled before being handed to
//! an external storage service.

pub mod config;
pub mod error;
pub mod files;
pub mod messages;
pub mod room;
pub mod server;
pub mod session;
pub mod upload;

pub use config::Config;
pub use server::{routes, Hub};
