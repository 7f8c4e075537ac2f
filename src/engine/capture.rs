//! Time-driven capture loop and the screenshot pipeline.
//!
//! The loop interleaves, on one thread: periodic screen-update
//! requests, periodic framebuffer snapshots, and command dispatch off
//! the runner pipe. Exactly one command is handled per wake-up -
//! handler side effects (console switches, resets) may invalidate any
//! other readiness we observed, so readiness is never batched.
//!
//! Handlers re-enter the loop with their own timeout and cadence
//! overrides while they wait; that is safe because all loop state
//! lives on the engine.

use anyhow::{Context, Result};
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use super::Engine;
use crate::image::ImageRef;

/// A frame that changed this little vs. its predecessor is not worth a
/// new file on disk; the previous file is logically re-used.
const DEDUP_WRITE_THRESHOLD: u32 = 54;
/// A frame this similar lets the encoder repeat its previous output.
/// Slightly below the write threshold: video stays smoother than the
/// screenshot series.
const ENCODER_REPEAT_THRESHOLD: u32 = 50;
/// Canonical frame size fed to dedup, matching and the encoder.
const FRAME_W: u32 = 1024;
const FRAME_H: u32 = 768;
/// Missing frames for this many screenshot intervals during an armed
/// assertion count as a console stall.
pub(crate) const STALL_FACTOR: u32 = 20;

/// Per-invocation overrides for the capture loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopParams {
    /// Overall deadline; `None` runs until the pipe closes or stop_vm.
    pub timeout: Option<Duration>,
    pub update_request_interval: Option<Duration>,
    pub screenshot_interval: Option<Duration>,
}

impl Engine {
    /// The worker's main loop: capture and dispatch until the runner
    /// closes the command pipe or stops the VM.
    pub fn run(&mut self) -> Result<()> {
        self.run_capture_loop(LoopParams::default())
    }

    pub fn run_capture_loop(&mut self, params: LoopParams) -> Result<()> {
        let loop_started = Instant::now();
        loop {
            if self.stopping {
                return Ok(());
            }
            if let Some(t) = params.timeout {
                if loop_started.elapsed() >= t {
                    return Ok(());
                }
            }
            let update_every = params
                .update_request_interval
                .unwrap_or(self.update_request_interval);
            let shot_every = params
                .screenshot_interval
                .unwrap_or(self.screenshot_interval);

            let now = Instant::now();
            if is_due(self.last_update_request, update_every, now) {
                if let Some(console) = self.consoles.current() {
                    console.screen().request_screen_update()?;
                }
                self.last_update_request = Some(now);
            }

            // a console that stops delivering frames mid-assertion is a
            // stall; only latched once at least one check has run
            if let Some(arming) = self.arming.as_mut() {
                if arming.last_check.is_some() {
                    if let Some(last) = self.last_frame_at {
                        if now.saturating_duration_since(last) > shot_every * STALL_FACTOR {
                            arming.stall_detected = true;
                        }
                    }
                }
            }

            if is_due(self.last_capture_attempt, shot_every, now) {
                self.capture_one()?;
                self.last_capture_attempt = Some(Instant::now());
            }

            let now = Instant::now();
            let mut sleep_for = next_due(self.last_capture_attempt, shot_every, now)
                .min(next_due(self.last_update_request, update_every, now));
            if let Some(t) = params.timeout {
                sleep_for = sleep_for.min((loop_started + t).saturating_duration_since(now));
            }

            match self.commands.recv_timeout(sleep_for) {
                Ok(line) => {
                    if !self.dispatch_line(&line)? {
                        return Ok(());
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                // runner closed its end: exit cleanly, unwinding any
                // re-entered loops on the way out
                Err(RecvTimeoutError::Disconnected) => {
                    self.stopping = true;
                    return Ok(());
                }
            }
        }
    }

    /// Snapshot the current console once. Returns whether a frame was
    /// actually delivered.
    pub fn capture_one(&mut self) -> Result<bool> {
        let frame = match self.consoles.current() {
            Some(console) => console.screen().current_frame()?,
            None => return Ok(false),
        };
        match frame {
            Some(img) => {
                self.process_frame(img)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Dedup, number, write, symlink, feed the encoder.
    fn process_frame(&mut self, frame: ImageRef) -> Result<()> {
        let step_started = Instant::now();
        let img = frame.scale(FRAME_W, FRAME_H);
        self.frame_counter += 1;

        let sim = match &self.last_image {
            Some(prev) => prev.similarity(&img),
            None => 0,
        };

        if sim <= DEDUP_WRITE_THRESHOLD {
            let filename = format!("shot-{:010}.png", self.frame_counter);
            let path = self.cfg.screenshot_dir.join(&filename);
            img.write(&path)?;
            self.relink_last(&filename)?;
            self.last_screenshot_name = Some(filename);
        }
        // a dedup'd frame logically re-uses the previous file: the name
        // and symlink stay, the pixels advance
        self.last_image = Some(img);
        self.last_frame_at = Some(Instant::now());

        if self.started && !self.cfg.novideo {
            if sim > ENCODER_REPEAT_THRESHOLD {
                self.video.repeat_frame()?;
            } else if let Some(name) = &self.last_screenshot_name {
                self.video.encode_frame(&self.cfg.screenshot_dir.join(name))?;
            }
        }

        let elapsed = step_started.elapsed();
        if elapsed > self.screenshot_interval {
            eprintln!(
                "  WARN: frame {} took {:.2}s to process (interval {:.2}s)",
                self.frame_counter,
                elapsed.as_secs_f64(),
                self.screenshot_interval.as_secs_f64()
            );
        }
        Ok(())
    }

    /// Point `last.png` at the just-written frame. Unlink-then-symlink;
    /// readers tolerate the tiny race.
    fn relink_last(&self, filename: &str) -> Result<()> {
        let link = self.cfg.screenshot_dir.join("last.png");
        let _ = std::fs::remove_file(&link);
        std::os::unix::fs::symlink(filename, &link)
            .with_context(|| format!("failed to point last.png at {}", filename))
    }
}

fn is_due(last: Option<Instant>, every: Duration, now: Instant) -> bool {
    match last {
        None => true,
        Some(t) => now.saturating_duration_since(t) >= every,
    }
}

fn next_due(last: Option<Instant>, every: Duration, now: Instant) -> Duration {
    match last {
        None => Duration::ZERO,
        Some(t) => (t + every).saturating_duration_since(now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_when_never_run() {
        let now = Instant::now();
        assert!(is_due(None, Duration::from_millis(500), now));
        assert_eq!(next_due(None, Duration::from_millis(500), now), Duration::ZERO);
    }

    #[test]
    fn not_due_until_interval_elapsed() {
        let now = Instant::now();
        let every = Duration::from_millis(500);
        assert!(!is_due(Some(now), every, now));
        let later = now + Duration::from_millis(600);
        assert!(is_due(Some(now), every, later));
    }

    #[test]
    fn next_due_counts_down() {
        let now = Instant::now();
        let every = Duration::from_millis(500);
        let soon = now + Duration::from_millis(200);
        assert_eq!(next_due(Some(now), every, soon), Duration::from_millis(300));
        // overdue clamps to zero
        let late = now + Duration::from_millis(900);
        assert_eq!(next_due(Some(now), every, late), Duration::ZERO);
    }
}
