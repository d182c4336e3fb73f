//! Debug Adapter Protocol (DAP) client
//!
//! Framing, message types and the session that correlates requests with
//! responses and delivers events.

pub mod codec;
pub mod session;
pub mod types;

pub use session::{DapSession, EventSubscription, EventWait, SessionOptions, SessionState, StartOptions};
pub use types::*;
