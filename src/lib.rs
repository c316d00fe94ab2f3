pub mod barrier;
pub mod config;
pub mod error;
pub mod job;
pub mod master;
pub mod partition;
pub mod proto;
pub mod shutdown;
pub mod stream;
pub mod worker;

pub use error::{DbspError, Result};
