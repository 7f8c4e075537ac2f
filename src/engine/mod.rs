//! The capture-and-assert engine.
//!
//! One engine instance owns a command pipe from the test runner, a
//! response pipe back to it, the console adapters of one SUT, and all
//! mutable capture/assert state. Everything runs on a single thread of
//! control: the capture loop ticks, and command handlers run to
//! completion between ticks. Handlers that need to wait (serial
//! matches, idle periods, assertion polls) re-enter the capture loop
//! with a short timeout, which keeps the screenshot and video stream
//! alive while they block.

mod assert;
mod capture;
mod dispatch;

pub use assert::{AssertionArming, FailedMatch};
pub use capture::LoopParams;

use anyhow::{Context, Result};
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use crate::command::ResponseWriter;
use crate::config::EngineConfig;
use crate::console::ConsoleRegistry;
use crate::control::ControlSignals;
use crate::encoder::VideoSink;
use crate::image::ImageRef;
use crate::needle::NeedleSet;
use crate::qemu::Driver;
use crate::serial::SerialTail;

pub struct Engine {
    pub(crate) cfg: EngineConfig,
    pub(crate) driver: Box<dyn Driver>,
    pub(crate) consoles: ConsoleRegistry,
    pub(crate) needles: NeedleSet,
    pub(crate) control: Box<dyn ControlSignals>,
    pub(crate) video: Box<dyn VideoSink>,
    pub(crate) commands: Receiver<String>,
    pub(crate) responses: ResponseWriter,
    pub(crate) serial: SerialTail,

    pub(crate) started: bool,
    pub(crate) stopping: bool,
    pub(crate) interactive_mode: bool,

    // screenshot pipeline state
    pub(crate) frame_counter: u64,
    pub(crate) last_image: Option<ImageRef>,
    pub(crate) last_screenshot_name: Option<String>,
    pub(crate) reference_screenshot: Option<ImageRef>,

    // capture loop cadence
    pub(crate) screenshot_interval: Duration,
    pub(crate) update_request_interval: Duration,
    pub(crate) last_capture_attempt: Option<Instant>,
    /// When a frame was last actually delivered; drives stall detection.
    pub(crate) last_frame_at: Option<Instant>,
    pub(crate) last_update_request: Option<Instant>,

    pub(crate) arming: Option<AssertionArming>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: EngineConfig,
        driver: Box<dyn Driver>,
        consoles: ConsoleRegistry,
        needles: NeedleSet,
        video: Box<dyn VideoSink>,
        control: Box<dyn ControlSignals>,
        commands: Receiver<String>,
        responses: ResponseWriter,
    ) -> Result<Self> {
        std::fs::create_dir_all(&cfg.screenshot_dir).with_context(|| {
            format!("failed to create screenshot dir {}", cfg.screenshot_dir.display())
        })?;
        let serial = SerialTail::new(&cfg.serial_file);
        Ok(Self {
            screenshot_interval: cfg.screenshot_interval,
            update_request_interval: cfg.update_request_interval,
            cfg,
            driver,
            consoles,
            needles,
            control,
            video,
            commands,
            responses,
            serial,
            started: false,
            stopping: false,
            interactive_mode: false,
            frame_counter: 0,
            last_image: None,
            last_screenshot_name: None,
            reference_screenshot: None,
            last_capture_attempt: None,
            last_frame_at: None,
            last_update_request: None,
            arming: None,
        })
    }

    /// Start the SUT: heartbeat up, encoder armed, hypervisor started.
    pub fn start_vm(&mut self) -> Result<()> {
        if self.started {
            eprintln!("  WARN: start_vm: SUT is already started");
            return Ok(());
        }
        // a crash marker from a previous run must not spook the runner
        let _ = std::fs::remove_file(self.cfg.crash_file());
        std::fs::write(self.cfg.heartbeat_file(), b"").with_context(|| {
            format!("failed to create {}", self.cfg.heartbeat_file().display())
        })?;
        // marked started before the driver runs: a failed start must
        // still be stoppable by the crash hook
        self.started = true;
        if !self.cfg.novideo {
            self.video.start()?;
        }
        self.driver.do_start_vm()?;
        Ok(())
    }

    /// Stop the SUT. Every resource is released even if the SUT
    /// already exited abnormally.
    pub fn stop_vm(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        if !self.cfg.novideo {
            if let Err(e) = self.video.finish() {
                eprintln!("  WARN: closing video encoder failed: {:#}", e);
            }
        }
        let _ = std::fs::remove_file(self.cfg.heartbeat_file());
        if let Err(e) = self.driver.do_stop_vm() {
            eprintln!("  WARN: stopping SUT failed: {:#}", e);
        }
        self.started = false;
        Ok(())
    }

    /// Is the SUT alive? Requires the heartbeat file AND a live
    /// hypervisor report. A started-but-dead SUT arms a forced exit so
    /// the runner observes pipe closure even if it never sends stop_vm.
    pub fn alive(&mut self) -> bool {
        let heartbeat = self.cfg.heartbeat_file().exists();
        let hypervisor = self.driver.alive().unwrap_or(false);
        let ok = self.started && heartbeat && hypervisor;
        if !ok && self.started {
            eprintln!("  WARN: SUT reported dead, forcing worker exit in 3s");
            std::thread::spawn(|| {
                std::thread::sleep(Duration::from_secs(3));
                std::process::exit(1);
            });
        }
        ok
    }

    /// Best-effort teardown for the crash hook.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.stop_vm() {
            eprintln!("  WARN: shutdown: {:#}", e);
        }
    }

    /// Activate a console and make it current. The switch is captured
    /// immediately so it shows up in the screenshot/video stream.
    pub fn select_console(&mut self, name: &str) -> Result<Option<serde_json::Value>> {
        let signal = self.consoles.select(name)?;
        self.capture_one()?;
        Ok(signal)
    }

    /// Toggle interactive assert-screen handling.
    pub fn set_interactive(&mut self, interactive: bool) {
        self.interactive_mode = interactive;
    }

    /// Remember the current frame for later comparison.
    pub fn set_reference_screenshot(&mut self) {
        self.reference_screenshot = self.last_image.clone();
    }

    /// Similarity of the current frame to the stored reference;
    /// 0 when either side is missing.
    pub fn similarity_to_reference(&self) -> u32 {
        match (&self.reference_screenshot, &self.last_image) {
            (Some(reference), Some(last)) => reference.similarity(last),
            _ => 0,
        }
    }

    /// Is an assertion currently armed?
    pub fn armed(&self) -> bool {
        self.arming.is_some()
    }

    /// Filename of the most recently written frame.
    pub fn last_screenshot_name(&self) -> Option<&str> {
        self.last_screenshot_name.as_deref()
    }
}
