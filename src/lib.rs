//! Capture-and-assert engine for driving a virtualized system under test.
//!
//! The worker owns a command pipe from the test runner, a response pipe
//! back to it, and the SUT's console adapters. It continuously polls
//! the framebuffer, emits a deduplicated screenshot stream plus a video
//! encoder feed, and answers synchronous runner requests: wait until
//! the screen matches a needle, type a string, match a regex in the
//! serial log.
//!
//! Layout:
//! - `engine` - the capture loop, assert state machine and dispatcher
//! - `console` - console/screen capability traits and the QMP adapter
//! - `qemu` - hypervisor driver (builder + QMP client)
//! - `image` / `needle` - frames and the needle database
//! - `serial` / `encoder` / `control` - the remaining collaborators
//! - `command` - the runner wire protocol

pub mod command;
pub mod config;
pub mod console;
pub mod control;
pub mod encoder;
pub mod engine;
pub mod image;
pub mod needle;
pub mod qemu;
pub mod serial;

// Re-export commonly used items
pub use command::{spawn_command_reader, Command, MustMatch, RegexSpec, ResponseWriter};
pub use config::EngineConfig;
pub use console::{Console, ConsoleRegistry, Screen};
pub use control::{ControlSignals, FsControlSignals};
pub use encoder::{EncoderProcess, VideoSink};
pub use engine::{Engine, LoopParams};
pub use image::ImageRef;
pub use needle::{Needle, NeedleSet};
pub use qemu::{Driver, QemuBuilder, QemuDriver};
pub use serial::SerialTail;
