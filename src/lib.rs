// An IAX2 stack in Rust
pub type Result<T> = std::result::Result<T, crate::error::Error>;
pub use crate::error::Error;
pub mod auth;
pub mod engine;
pub mod error;
pub mod frame;
pub mod transaction;
pub mod transport;
pub mod trunk;
pub use engine::EngineBuilder;
