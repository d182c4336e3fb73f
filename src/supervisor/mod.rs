//! Debug adapter process supervision
//!
//! Spawns the adapter, watches its output for the handshake line, tracks
//! its exit and connects to the port it announces.

mod handshake;
mod process;
pub mod transport;

pub use handshake::Handshake;
pub use process::{AdapterProcess, ProcessState};
pub(crate) use process::wait_exited;
