pub mod chain;
pub mod config;
pub mod context;
pub mod error;
pub mod ids;
pub mod recorder;
pub mod sink;
pub mod span;

pub use error::{HoplineError, Result};
