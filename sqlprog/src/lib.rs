#![doc = include_str!("../README.md")]

#[macro_use]
mod macros;

pub mod batch;
pub mod concurrency;
pub mod config;
mod context;
pub mod driver;
mod error;
pub mod executor;
pub mod misc;
pub mod parameter;
pub mod program;
pub mod reader;
pub mod rng;
pub mod schema;
pub mod sync;
#[cfg(test)]
mod tests;
pub mod topology;
pub mod value;

pub use context::DbContext;
pub use error::Error;

/// Shortcut of [`core::result::Result<T, Error>`].
pub type Result<T> = core::result::Result<T, Error>;
