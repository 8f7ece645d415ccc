//! Data backends registered with the core `DataManager`.

pub mod local;

pub use local::LocalBackend;
