//! Test-only helpers shared by the workspace's test binaries.

pub mod log;

pub use log::init_global_test_logging;
