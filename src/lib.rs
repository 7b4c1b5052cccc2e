pub mod audio;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod error_recovery;
pub mod fetch;
pub mod logging;
pub mod models;
pub mod queue;

#[cfg(test)]
pub(crate) mod test_support;


pub use error::*;
pub use models::*;
