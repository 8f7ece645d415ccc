//! OS-backed implementations of the core process and environment ports.

pub mod gridengine;
pub mod host;
pub mod probe;

pub use gridengine::GridEngineHost;
pub use host::TokioProcessHost;
pub use probe::SystemProbe;
