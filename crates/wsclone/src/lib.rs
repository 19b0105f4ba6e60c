pub mod archive;
pub mod config;
pub mod criteria;
pub mod error;
pub mod expand;
pub mod glob;
pub mod logging;
pub mod process;
pub mod retention;
pub mod snapshot;
pub mod store;
pub mod workspace;

pub use error::{Error, Result};
