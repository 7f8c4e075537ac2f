//! QMP-backed framebuffer console.
//!
//! Captures the SUT's screen through QMP `screendump` (PPM into a
//! scratch file, decoded on the spot) and injects keyboard/mouse input
//! as QMP events. Activation connects the console's own QMP monitor;
//! the hypervisor driver uses a separate one.

use anyhow::{bail, Result};
use serde_json::{json, Value};
use std::path::PathBuf;

use super::{Console, Screen};
use crate::image::ImageRef;
use crate::qemu::qmp::{qcode_for_name, QmpClient};

/// QMP's absolute pointer coordinate space.
const QMP_ABS_MAX: u32 = 32767;

pub struct QmpConsole {
    socket: PathBuf,
    scratch: PathBuf,
    client: Option<QmpClient>,
    /// Last observed framebuffer size, for pointer coordinate scaling.
    screen_size: (u32, u32),
}

impl QmpConsole {
    /// `socket` is the console's QMP monitor; `scratch` is where
    /// screendumps land before decoding.
    pub fn new(socket: PathBuf, scratch: PathBuf) -> Self {
        Self {
            socket,
            scratch,
            client: None,
            screen_size: (1024, 768),
        }
    }

    fn client(&mut self) -> Result<&mut QmpClient> {
        match self.client.as_mut() {
            Some(c) => Ok(c),
            None => bail!("console is not activated"),
        }
    }

    fn to_abs(&self, v: i32, extent: u32) -> u32 {
        let v = v.clamp(0, extent.saturating_sub(1) as i32) as u64;
        (v * QMP_ABS_MAX as u64 / extent.max(1) as u64) as u32
    }
}

impl Console for QmpConsole {
    fn activate(&mut self) -> Result<Value> {
        if self.client.is_none() {
            self.client = Some(QmpClient::connect(&self.socket)?);
        }
        Ok(json!(true))
    }

    fn reset(&mut self) -> Result<()> {
        self.client = None;
        self.client = Some(QmpClient::connect(&self.socket)?);
        Ok(())
    }

    fn disable(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }

    fn screen(&mut self) -> &mut dyn Screen {
        self
    }

    fn proxy_call(&mut self, function: &str, args: &[Value]) -> Result<Value> {
        match function {
            // raw QMP escape hatch: ("execute-qmp", [command, arguments?])
            "execute-qmp" => {
                let command = args
                    .first()
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow::anyhow!("execute-qmp needs a command name"))?
                    .to_string();
                let arguments = args.get(1).cloned();
                self.client()?.execute(&command, arguments)
            }
            other => bail!("console does not implement '{}'", other),
        }
    }
}

impl Screen for QmpConsole {
    fn current_frame(&mut self) -> Result<Option<ImageRef>> {
        if self.client.is_none() {
            return Ok(None);
        }
        let scratch = self.scratch.clone();
        let client = self.client()?;
        // a failed dump means the framebuffer is not renderable right
        // now; stall detection picks it up if it persists
        if let Err(e) = client.screendump(&scratch) {
            eprintln!("  WARN: screendump failed: {:#}", e);
            return Ok(None);
        }
        match ImageRef::load(&scratch) {
            Ok(img) => {
                self.screen_size = (img.width(), img.height());
                Ok(Some(img))
            }
            Err(e) => {
                eprintln!("  WARN: could not decode screendump: {:#}", e);
                Ok(None)
            }
        }
    }

    fn request_screen_update(&mut self) -> Result<()> {
        // screendump always renders a fresh frame; nothing to refresh
        Ok(())
    }

    fn send_key(&mut self, key: &str) -> Result<()> {
        // combos arrive dash-separated, e.g. "ctrl-alt-f2"
        let qcodes: Vec<&str> = key.split('-').map(qcode_for_name).collect();
        self.client()?.send_keys(&qcodes)
    }

    fn type_string(&mut self, text: &str) -> Result<()> {
        self.client()?.send_text(text)
    }

    fn mouse_set(&mut self, x: i32, y: i32) -> Result<()> {
        let (w, h) = self.screen_size;
        let (ax, ay) = (self.to_abs(x, w), self.to_abs(y, h));
        self.client()?.mouse_move_abs(ax, ay)
    }

    fn mouse_hide(&mut self, border_offset: i32) -> Result<()> {
        // park the pointer in the bottom-right corner, optionally a few
        // pixels in so it stays visible for needles that expect it
        let (w, h) = self.screen_size;
        let x = w as i32 - 1 - border_offset.max(0);
        let y = h as i32 - 1 - border_offset.max(0);
        self.mouse_set(x.max(0), y.max(0))
    }

    fn mouse_button(&mut self, button: &str, bstate: i32) -> Result<()> {
        self.client()?.mouse_button(button, bstate != 0)
    }
}
