//! Utility modules: retry, timeout, logging.

pub mod retry;
pub mod timeout;

#[cfg(feature = "cli")]
pub mod logging;
