//! One cluster per test binary.
//!
//! Every test that takes the fixture must call
//! [`SystemUnderTest::reset_chain`] before touching genesis or starting
//! nodes; the fixture never resets on its own.

use std::sync::{Mutex, MutexGuard, OnceLock};

use systest_common::HarnessResult;

use crate::system::SystemUnderTest;

/// Lazily built, lock-guarded [`SystemUnderTest`].
pub struct SuiteFixture {
    cell: OnceLock<Mutex<SystemUnderTest>>,
    init_lock: Mutex<()>,
}

impl SuiteFixture {
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
            init_lock: Mutex::new(()),
        }
    }

    /// Build the system with `init` on first use and lock it.
    ///
    /// A failed `init` leaves the fixture empty so a later test can retry.
    /// A panic in a previous holder does not poison later callers.
    pub fn acquire<F>(&self, init: F) -> HarnessResult<MutexGuard<'_, SystemUnderTest>>
    where
        F: FnOnce() -> HarnessResult<SystemUnderTest>,
    {
        let cell = match self.cell.get() {
            Some(cell) => cell,
            None => {
                let _init = self
                    .init_lock
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                match self.cell.get() {
                    Some(cell) => cell,
                    None => {
                        let system = init()?;
                        tracing::debug!(?system, "suite fixture initialized");
                        self.cell.get_or_init(|| Mutex::new(system))
                    }
                }
            }
        };
        Ok(cell.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("suite fixture lock was poisoned, recovering");
            cell.clear_poison();
            poisoned.into_inner()
        }))
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl Default for SuiteFixture {
    fn default() -> Self {
        Self::new()
    }
}
