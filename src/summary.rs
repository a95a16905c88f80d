// src/summary.rs

//! Structured per-run summary shared by all drivers
//!
//! Every driver run ends with the same shape: which packages completed,
//! which were skipped, and which failed with a reason. The process exit
//! code is non-zero exactly when something failed.

use serde::Serialize;
use std::fmt;

/// Outcome of one driver run
#[derive(Debug, Default, Serialize)]
pub struct RunSummary {
    pub completed: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<FailedPackage>,
}

#[derive(Debug, Serialize)]
pub struct FailedPackage {
    pub package: String,
    pub reason: String,
}

impl RunSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed(&mut self, package: impl Into<String>) {
        self.completed.push(package.into());
    }

    pub fn skipped(&mut self, package: impl Into<String>) {
        self.skipped.push(package.into());
    }

    pub fn failed(&mut self, package: impl Into<String>, reason: impl Into<String>) {
        self.failed.push(FailedPackage {
            package: package.into(),
            reason: reason.into(),
        });
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// 0 when everything succeeded, 2 when any package failed
    pub fn exit_code(&self) -> i32 {
        if self.is_clean() { 0 } else { 2 }
    }

    /// Fold another summary into this one
    pub fn absorb(&mut self, other: RunSummary) {
        self.completed.extend(other.completed);
        self.skipped.extend(other.skipped);
        self.failed.extend(other.failed);
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "completed: {}, skipped: {}, failed: {}",
            self.completed.len(),
            self.skipped.len(),
            self.failed.len()
        )?;
        for pkg in &self.completed {
            writeln!(f, "  ok      {pkg}")?;
        }
        for pkg in &self.skipped {
            writeln!(f, "  skipped {pkg}")?;
        }
        for failure in &self.failed {
            writeln!(f, "  FAILED  {} ({})", failure.package, failure.reason)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let mut summary = RunSummary::new();
        summary.completed("alpha-1.0");
        summary.skipped("beta-2.0");
        assert_eq!(summary.exit_code(), 0);
        assert!(summary.is_clean());

        summary.failed("gamma-3.0", "build failed");
        assert_eq!(summary.exit_code(), 2);
        assert!(!summary.is_clean());
    }

    #[test]
    fn test_display_lists_every_package() {
        let mut summary = RunSummary::new();
        summary.completed("alpha-1.0");
        summary.failed("gamma-3.0", "cycle");
        let text = summary.to_string();
        assert!(text.contains("ok      alpha-1.0"));
        assert!(text.contains("FAILED  gamma-3.0 (cycle)"));
    }

    #[test]
    fn test_absorb() {
        let mut a = RunSummary::new();
        a.completed("x-1");
        let mut b = RunSummary::new();
        b.failed("y-1", "no");
        a.absorb(b);
        assert_eq!(a.completed.len(), 1);
        assert_eq!(a.failed.len(), 1);
        assert_eq!(a.exit_code(), 2);
    }
}
