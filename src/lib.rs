//! rcpd library
//!
//! Server side of the legacy rcp remote-copy protocol, confined to a single
//! root directory.

pub mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod frame_io;
pub mod logger;
pub mod path_guard;
pub mod protocol;
pub mod server;
pub mod sink;
pub mod source;

pub use config::ServerConfig;
pub use error::{RcpError, Result};
pub use server::{handle_connection, serve, Server, ServerContext};
