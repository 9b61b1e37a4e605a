pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod filter;
pub mod io;
pub mod paths;
pub mod rules;
pub mod scheduler;
pub mod types;

pub use error::{AutoReasonError, Result};
