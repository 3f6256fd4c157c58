pub mod capacity;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod validate;
pub mod wal;
pub mod wire;
