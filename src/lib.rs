pub mod compactor;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod protocol;
pub mod view;
pub mod wal;
pub mod wire;
