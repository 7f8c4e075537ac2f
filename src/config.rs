//! Engine configuration.
//!
//! All paths the worker touches are derived from a single run directory,
//! so a crashed run leaves everything (screenshots, heartbeat, crash
//! marker, control files, video) in one place for the runner to collect.
//!
//! Environment overrides follow the runner's conventions:
//! - `SCREENSHOTINTERVAL` - seconds between framebuffer snapshots
//! - `NOVIDEO` - disable the video encoder feed
//! - `DEFAULT_TIMEOUT` - default assert/wait timeout in seconds

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for one worker run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Run directory: heartbeat, crash marker, control files, video.
    pub workdir: PathBuf,
    /// Where `shot-NNNNNNNNNN.png` frames and `last.png` land.
    pub screenshot_dir: PathBuf,
    /// Append-only serial log of the SUT.
    pub serial_file: PathBuf,
    /// Needle database directory (`<name>.json` + `<name>.png` pairs).
    pub needle_dir: PathBuf,
    /// How often to snapshot the framebuffer.
    pub screenshot_interval: Duration,
    /// How often to ask the console to refresh its framebuffer cache.
    pub update_request_interval: Duration,
    /// Default deadline for assertions and serial waits.
    pub default_timeout: Duration,
    /// Skip the video encoder entirely.
    pub novideo: bool,
    /// External encoder program; reads `R` / `E <path>` directives on stdin.
    pub encoder_program: String,
}

impl EngineConfig {
    /// Build a config rooted at `workdir` with the standard layout.
    pub fn new<P: AsRef<Path>>(workdir: P) -> Self {
        let workdir = workdir.as_ref().to_path_buf();
        Self {
            screenshot_dir: workdir.join("screenshots"),
            serial_file: workdir.join("serial0"),
            needle_dir: workdir.join("needles"),
            screenshot_interval: Duration::from_millis(500),
            update_request_interval: Duration::from_millis(250),
            default_timeout: Duration::from_secs(30),
            novideo: false,
            encoder_program: "videoencoder".to_string(),
            workdir,
        }
    }

    /// Apply environment overrides on top of the built config.
    pub fn apply_env(mut self) -> Self {
        if let Ok(v) = std::env::var("SCREENSHOTINTERVAL") {
            if let Ok(secs) = v.parse::<f64>() {
                if secs > 0.0 {
                    self.screenshot_interval = Duration::from_secs_f64(secs);
                }
            }
        }
        if let Ok(v) = std::env::var("NOVIDEO") {
            self.novideo = v != "0" && !v.is_empty();
        }
        if let Ok(v) = std::env::var("DEFAULT_TIMEOUT") {
            if let Ok(secs) = v.parse::<u64>() {
                self.default_timeout = Duration::from_secs(secs);
            }
        }
        self
    }

    /// Heartbeat file; existence is asserted by `alive()`.
    pub fn heartbeat_file(&self) -> PathBuf {
        self.workdir.join("backend.run")
    }

    /// Crash marker written when a stalled assertion aborts the worker.
    pub fn crash_file(&self) -> PathBuf {
        self.workdir.join("backend.crashed")
    }

    /// Encoder output.
    pub fn video_file(&self) -> PathBuf {
        self.workdir.join("video.ogv")
    }

    /// Control file the engine creates (and a human observes) when an
    /// interactive assertion wants attention.
    pub fn stop_waitforneedle_file(&self) -> PathBuf {
        self.workdir.join("stop_waitforneedle")
    }

    /// Control file the runner creates to let a frozen assertion continue.
    pub fn continue_waitforneedle_file(&self) -> PathBuf {
        self.workdir.join("continue_waitforneedle")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths_live_under_workdir() {
        let cfg = EngineConfig::new("/tmp/run1");
        assert_eq!(cfg.heartbeat_file(), PathBuf::from("/tmp/run1/backend.run"));
        assert_eq!(cfg.crash_file(), PathBuf::from("/tmp/run1/backend.crashed"));
        assert_eq!(cfg.serial_file, PathBuf::from("/tmp/run1/serial0"));
        assert_eq!(cfg.screenshot_dir, PathBuf::from("/tmp/run1/screenshots"));
    }

    #[test]
    fn defaults_match_runner_contract() {
        let cfg = EngineConfig::new("/tmp/run2");
        assert_eq!(cfg.screenshot_interval, Duration::from_millis(500));
        assert!(!cfg.novideo);
    }
}
