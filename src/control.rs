//! Interactive control signals.
//!
//! The interactive assert-screen handshake is filesystem based for
//! compatibility with existing runners: presence of a control file IS
//! the signal. The engine only ever needs four operations, kept behind
//! a port so the assert machinery is testable without touching disk
//! layout assumptions.

use anyhow::{Context, Result};
use std::path::PathBuf;

pub trait ControlSignals: Send {
    /// Has a human (or the runner) asked the current assertion to stop
    /// and wait for inspection?
    fn stop_present(&self) -> bool;
    /// Raise the stop signal ourselves (assertion timed out in
    /// interactive mode and wants attention).
    fn create_stop(&mut self) -> Result<()>;
    /// Has the runner told a frozen assertion to continue?
    fn continue_present(&self) -> bool;
    /// Consume the continue signal.
    fn remove_continue(&mut self) -> Result<()>;
}

/// Control files on disk; paths are configured per run.
pub struct FsControlSignals {
    stop_file: PathBuf,
    continue_file: PathBuf,
}

impl FsControlSignals {
    pub fn new(stop_file: PathBuf, continue_file: PathBuf) -> Self {
        Self { stop_file, continue_file }
    }
}

impl ControlSignals for FsControlSignals {
    fn stop_present(&self) -> bool {
        self.stop_file.exists()
    }

    fn create_stop(&mut self) -> Result<()> {
        std::fs::write(&self.stop_file, b"")
            .with_context(|| format!("failed to create {}", self.stop_file.display()))
    }

    fn continue_present(&self) -> bool {
        self.continue_file.exists()
    }

    fn remove_continue(&mut self) -> Result<()> {
        match std::fs::remove_file(&self.continue_file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| {
                format!("failed to remove {}", self.continue_file.display())
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_and_continue_signal_on_file_presence() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = FsControlSignals::new(
            dir.path().join("stop_waitforneedle"),
            dir.path().join("continue_waitforneedle"),
        );

        assert!(!ctl.stop_present());
        ctl.create_stop().unwrap();
        assert!(ctl.stop_present());

        assert!(!ctl.continue_present());
        std::fs::write(dir.path().join("continue_waitforneedle"), b"").unwrap();
        assert!(ctl.continue_present());
        ctl.remove_continue().unwrap();
        assert!(!ctl.continue_present());
        // removing an absent signal is fine
        ctl.remove_continue().unwrap();
    }
}
