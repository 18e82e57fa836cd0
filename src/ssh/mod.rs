//! SSH module - session capability used by the tunnel engine
//!
//! This module provides the SSH functionality using the russh library.
//!
//! # Features
//! - Password and private key authentication
//! - Direct-tcpip channels for local port forwarding
//! - Transport liveness tracked by a single handle owner task

mod client;
mod config;
mod error;
mod handle_owner;
#[cfg(test)]
pub mod mock;
mod session;

pub use client::{ClientHandler, RusshConnector};
pub use config::{expand_home, AuthMethod, SshConfig};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController, TransportState};
pub use session::{
    AsyncReadWrite, ConnectedSession, ForwardStream, SessionEvent, SshConnector, SshSession,
};
