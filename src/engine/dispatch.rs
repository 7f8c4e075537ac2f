//! Command dispatch.
//!
//! One JSON frame in, one handler, one `{rsp}` frame out. Unknown
//! command names fail decoding and are fatal for the worker; handler
//! errors are fatal too, with the single exception of
//! `proxy_console_call`, whose failures the runner wants surfaced as
//! data, not as a dead worker.

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

use super::{Engine, LoopParams};
use crate::command::{Command, RegexSpec};

/// Cadence used when a handler re-enters the capture loop to wait.
const REENTRY_BURST: Duration = Duration::from_secs(1);
const REENTRY_UPDATE_INTERVAL: Duration = Duration::from_millis(190);

impl Engine {
    /// Handle one command line off the runner pipe. Returns `false`
    /// when the worker should exit (clean stop).
    pub(crate) fn dispatch_line(&mut self, line: &str) -> Result<bool> {
        if line.trim().is_empty() {
            return Ok(true);
        }
        let cmd = Command::decode(line)?;
        let rsp = self.handle_command(cmd)?;
        self.responses.send(&rsp)?;
        if self.stopping {
            self.responses.quit()?;
            return Ok(false);
        }
        Ok(true)
    }

    fn handle_command(&mut self, cmd: Command) -> Result<Value> {
        match cmd {
            Command::StartVm => {
                self.start_vm()?;
                Ok(json!({}))
            }
            Command::StopVm => {
                self.stop_vm()?;
                self.stopping = true;
                Ok(json!({}))
            }
            Command::Alive => Ok(json!(self.alive())),
            Command::SelectConsole { testapi_console } => {
                let signal = self.select_console(&testapi_console)?;
                Ok(json!({ "activated": signal }))
            }
            Command::ResetConsole { testapi_console } => {
                self.consoles.reset(&testapi_console)?;
                Ok(json!({}))
            }
            Command::DeactivateConsole { testapi_console } => {
                self.consoles.deactivate(&testapi_console)?;
                Ok(json!({}))
            }
            Command::SendKey { key } => {
                if let Some(console) = self.consoles.current() {
                    console.screen().send_key(&key)?;
                }
                Ok(json!({}))
            }
            Command::TypeString { text, .. } => {
                if let Some(console) = self.consoles.current() {
                    console.screen().type_string(&text)?;
                }
                Ok(json!({}))
            }
            Command::MouseSet { x, y } => {
                if let Some(console) = self.consoles.current() {
                    console.screen().mouse_set(x, y)?;
                }
                Ok(json!({}))
            }
            Command::MouseHide { border_offset } => {
                if let Some(console) = self.consoles.current() {
                    console.screen().mouse_hide(border_offset.unwrap_or(0))?;
                }
                Ok(json!({}))
            }
            Command::MouseButton { button, bstate } => {
                if let Some(console) = self.consoles.current() {
                    console.screen().mouse_button(&button, bstate)?;
                }
                Ok(json!({}))
            }
            Command::CaptureScreenshot => {
                self.capture_one()?;
                Ok(json!({}))
            }
            Command::LastScreenshotName => Ok(json!({
                "filename": self.last_screenshot_name.clone().unwrap_or_default()
            })),
            Command::SetReferenceScreenshot => {
                self.set_reference_screenshot();
                Ok(json!({}))
            }
            Command::SimiliarityToReference => {
                Ok(json!({ "sim": self.similarity_to_reference() }))
            }
            Command::SetTagsToAssert { mustmatch, timeout, reloadneedles } => {
                let tags = self.set_tags_to_assert(mustmatch, timeout, reloadneedles)?;
                Ok(json!({ "tags": tags }))
            }
            Command::CheckAssertedScreen => self.check_asserted_screen(),
            Command::InteractiveAssertScreen { interactive } => {
                self.set_interactive(interactive);
                Ok(json!({ "interactive": interactive }))
            }
            Command::StopAssertScreen => {
                self.stop_assert_screen();
                Ok(Value::Null)
            }
            Command::RetryAssertScreen { reload_needles, timeout } => {
                self.retry_assert_screen(reload_needles, timeout)?;
                Ok(json!({}))
            }
            Command::SetSerialOffset => Ok(json!(self.serial.set_offset_to_end())),
            Command::SerialText => Ok(json!(self.serial.text()?)),
            Command::WaitSerial { regexp, timeout } => self.wait_serial(regexp, timeout),
            Command::WaitIdle { timeout } => {
                let t = timeout
                    .map(|t| Duration::from_secs_f64(t.max(0.0)))
                    .unwrap_or(self.cfg.default_timeout);
                self.run_capture_loop(LoopParams {
                    timeout: Some(t),
                    update_request_interval: Some(REENTRY_UPDATE_INTERVAL),
                    screenshot_interval: None,
                })?;
                Ok(json!({}))
            }
            Command::FreezeVm => {
                self.driver.freeze()?;
                Ok(json!({}))
            }
            Command::ContVm => {
                self.driver.cont()?;
                Ok(json!({}))
            }
            Command::ProxyConsoleCall { console, function, args } => {
                match self.consoles.get(&console) {
                    Some(target) => match target.proxy_call(&function, &args) {
                        Ok(result) => Ok(json!({ "result": result })),
                        // the runner decides whether this fails the test
                        Err(e) => Ok(json!({ "exception": format!("{:#}", e) })),
                    },
                    None => Ok(json!({
                        "exception": format!("no such console '{}'", console)
                    })),
                }
            }
        }
    }

    /// Poll the serial tail for a pattern, re-entering the capture loop
    /// in one-second bursts so the screenshot and video stream stay
    /// alive while we wait. The offset advances to EOF on the way out,
    /// match or not.
    fn wait_serial(&mut self, regexp: RegexSpec, timeout: Option<f64>) -> Result<Value> {
        let patterns = regexp
            .patterns()
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("bad wait_serial pattern /{p}/")))
            .collect::<Result<Vec<Regex>>>()?;
        let timeout = timeout
            .map(|t| Duration::from_secs_f64(t.max(0.0)))
            .unwrap_or(self.cfg.default_timeout);
        let deadline = Instant::now() + timeout;

        let mut matched: Option<String> = None;
        let mut text;
        loop {
            text = self.serial.text()?;
            if let Some(pattern) = patterns.iter().find(|p| p.is_match(&text)) {
                matched = Some(pattern.as_str().to_string());
                break;
            }
            if Instant::now() >= deadline || self.stopping {
                break;
            }
            self.run_capture_loop(LoopParams {
                timeout: Some(REENTRY_BURST),
                update_request_interval: Some(REENTRY_UPDATE_INTERVAL),
                screenshot_interval: None,
            })?;
        }
        self.serial.set_offset_to_end();

        match &matched {
            Some(pattern) => eprintln!("  wait_serial: matched /{}/", pattern),
            None => eprintln!("  WARN: wait_serial: timed out"),
        }
        Ok(json!({ "matched": matched.is_some(), "string": text }))
    }
}
