//! Test helpers shared across memsync crates.

pub mod fixtures;
pub mod flaky;

pub use fixtures::{code_record, in_memory_config, phase_record};
pub use flaky::FlakyStore;
