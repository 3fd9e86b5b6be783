//! Runtime reporting
//!
//! Central place for notices the core raises while processing: operator
//! warnings, internal warnings that indicate programming errors, weird
//! notices for malformed traffic, and fatal startup conditions. Counts
//! are kept per kind so tests can assert on them.

use std::cell::Cell;

use tracing::{debug, error, warn};

use crate::errors::Error;

#[derive(Debug, Default)]
pub struct Reporter {
    warnings: Cell<u64>,
    internal_warnings: Cell<u64>,
    weirds: Cell<u64>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operator-visible warning.
    pub fn warning(&self, msg: &str) {
        self.warnings.set(self.warnings.get() + 1);
        warn!("{}", msg);
    }

    /// A condition that indicates a bug in the caller, not in the
    /// traffic.
    pub fn internal_warning(&self, msg: &str) {
        self.internal_warnings.set(self.internal_warnings.get() + 1);
        warn!("internal warning: {}", msg);
    }

    /// Malformed or surprising traffic; processing continues.
    pub fn weird(&self, name: &str, conn: Option<u64>) {
        self.weirds.set(self.weirds.get() + 1);
        match conn {
            Some(id) => debug!(conn = id, "weird: {}", name),
            None => debug!("weird: {}", name),
        }
    }

    /// Unrecoverable startup condition. Logs and hands back the error
    /// for the caller to propagate.
    pub fn fatal(&self, what: &'static str) -> Error {
        error!("fatal: missing required configuration: {}", what);
        Error::MissingConfig(what)
    }

    pub fn warning_count(&self) -> u64 {
        self.warnings.get()
    }

    pub fn internal_warning_count(&self) -> u64 {
        self.internal_warnings.get()
    }

    pub fn weird_count(&self) -> u64 {
        self.weirds.get()
    }
}
