//! lab library: session and message types behind the `lab` binary.
//!
//! Exposed separately so integration tests can drive a session without
//! going through stdin and stdout.

pub mod message;
pub mod session;

pub use message::{
    Command, GraphView, Kill, LinkCommand, MessageError, SimulationChanged, Spawn, UserEvent,
};
pub use session::{Session, SessionStats};
