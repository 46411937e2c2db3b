//! Thin contracts to collaborators this crate does not implement: the
//! broadcast bus, the peer-discovery service, and the engine subprocess
//! command-line/HTTP surface.

pub mod bus;
pub mod discovery;
pub mod engine;

pub use bus::Bus;
pub use discovery::{Discovery, PeerInfo};
pub use engine::{build_engine_command, EngineStatus};
