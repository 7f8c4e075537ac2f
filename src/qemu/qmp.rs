//! QMP (QEMU Machine Protocol) client.
//!
//! JSON-RPC style messages over a unix socket: greeting, capability
//! negotiation, then one command per line with events interleaved.
//! The engine uses QMP for everything it cannot do through the
//! framebuffer: keystroke and mouse injection, screendumps, and
//! pausing/resuming the SUT's virtual clock.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

pub struct QmpClient {
    stream: UnixStream,
    reader: BufReader<UnixStream>,
}

/// Greeting sent by QEMU on connect. Only parsed to validate the
/// handshake; the contents are uninteresting.
#[derive(Debug, Deserialize)]
struct Greeting {
    #[serde(rename = "QMP")]
    _qmp: Value,
}

#[derive(Debug, Serialize)]
struct Request {
    execute: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Value>,
}

impl QmpClient {
    /// Connect to a QMP socket and negotiate command mode.
    pub fn connect<P: AsRef<Path>>(socket_path: P) -> Result<Self> {
        let path = socket_path.as_ref();
        let stream = UnixStream::connect(path)
            .with_context(|| format!("failed to connect to QMP socket {}", path.display()))?;
        stream.set_read_timeout(Some(Duration::from_secs(30)))?;
        stream.set_write_timeout(Some(Duration::from_secs(10)))?;
        let reader = BufReader::new(stream.try_clone()?);

        let mut client = Self { stream, reader };
        client.read_greeting()?;
        client.execute("qmp_capabilities", None)?;
        Ok(client)
    }

    fn read_greeting(&mut self) -> Result<()> {
        let mut line = String::new();
        self.reader.read_line(&mut line)?;
        let _greeting: Greeting =
            serde_json::from_str(&line).context("failed to parse QMP greeting")?;
        Ok(())
    }

    /// Execute one QMP command and return its `return` value.
    pub fn execute(&mut self, command: &str, arguments: Option<Value>) -> Result<Value> {
        let request = Request { execute: command.to_string(), arguments };
        writeln!(self.stream, "{}", serde_json::to_string(&request)?)?;
        self.stream.flush()?;

        // responses and async events share the stream; skip events
        loop {
            let mut line = String::new();
            self.reader.read_line(&mut line)?;
            let value: Value =
                serde_json::from_str(&line).context("failed to parse QMP response")?;
            if value.get("event").is_some() {
                continue;
            }
            if let Some(error) = value.get("error") {
                let class = error.get("class").and_then(|v| v.as_str()).unwrap_or("Unknown");
                let desc = error
                    .get("desc")
                    .and_then(|v| v.as_str())
                    .unwrap_or("no description");
                bail!("QMP error ({}): {}", class, desc);
            }
            return Ok(value.get("return").cloned().unwrap_or(Value::Null));
        }
    }

    /// Press one key combination, e.g. `["ctrl", "alt", "f2"]`.
    pub fn send_keys(&mut self, qcodes: &[&str]) -> Result<()> {
        let keys: Vec<Value> = qcodes
            .iter()
            .map(|k| json!({"type": "qcode", "data": k}))
            .collect();
        self.execute("send-key", Some(json!({ "keys": keys })))?;
        Ok(())
    }

    /// Type text character by character, shifting where needed.
    pub fn send_text(&mut self, text: &str) -> Result<()> {
        for ch in text.chars() {
            let key = qcode_for_char(ch)?;
            if key.shifted {
                self.send_keys(&["shift", key.code])?;
            } else {
                self.send_keys(&[key.code])?;
            }
        }
        Ok(())
    }

    /// Move the pointer to absolute coordinates in QMP's 0..32767 space.
    pub fn mouse_move_abs(&mut self, x: u32, y: u32) -> Result<()> {
        self.execute(
            "input-send-event",
            Some(json!({
                "events": [
                    {"type": "abs", "data": {"axis": "x", "value": x}},
                    {"type": "abs", "data": {"axis": "y", "value": y}}
                ]
            })),
        )?;
        Ok(())
    }

    /// Press or release a pointer button.
    pub fn mouse_button(&mut self, button: &str, down: bool) -> Result<()> {
        self.execute(
            "input-send-event",
            Some(json!({
                "events": [{"type": "btn", "data": {"button": button, "down": down}}]
            })),
        )?;
        Ok(())
    }

    /// Dump the current framebuffer to `filename` (PPM format).
    pub fn screendump(&mut self, filename: &Path) -> Result<()> {
        self.execute(
            "screendump",
            Some(json!({ "filename": filename.to_string_lossy() })),
        )?;
        Ok(())
    }

    /// Pause the SUT's virtual clock.
    pub fn stop(&mut self) -> Result<()> {
        self.execute("stop", None)?;
        Ok(())
    }

    /// Resume the SUT's virtual clock.
    pub fn cont(&mut self) -> Result<()> {
        self.execute("cont", None)?;
        Ok(())
    }

    /// Ask QEMU whether the VM is running.
    pub fn running(&mut self) -> Result<bool> {
        let status = self.execute("query-status", None)?;
        Ok(status.get("running").and_then(|v| v.as_bool()).unwrap_or(false))
    }

    /// Tell QEMU to exit.
    pub fn quit(&mut self) -> Result<()> {
        self.execute("quit", None)?;
        Ok(())
    }
}

/// A resolved key: qcode plus whether shift is held.
pub struct QKey {
    pub code: &'static str,
    pub shifted: bool,
}

/// Map a symbolic key name (testapi style, e.g. "ret", "esc", "f2",
/// "a") to its qcode. Names QEMU already understands pass through.
pub fn qcode_for_name(name: &str) -> &str {
    match name {
        "enter" => "ret",
        "escape" => "esc",
        "space" => "spc",
        "pageup" => "pgup",
        "pagedown" => "pgdn",
        "super" => "meta_l",
        other => other,
    }
}

/// Map a typed character to qcode + shift state.
pub fn qcode_for_char(ch: char) -> Result<QKey> {
    let (code, shifted): (&'static str, bool) = match ch {
        'a' => ("a", false), 'b' => ("b", false), 'c' => ("c", false),
        'd' => ("d", false), 'e' => ("e", false), 'f' => ("f", false),
        'g' => ("g", false), 'h' => ("h", false), 'i' => ("i", false),
        'j' => ("j", false), 'k' => ("k", false), 'l' => ("l", false),
        'm' => ("m", false), 'n' => ("n", false), 'o' => ("o", false),
        'p' => ("p", false), 'q' => ("q", false), 'r' => ("r", false),
        's' => ("s", false), 't' => ("t", false), 'u' => ("u", false),
        'v' => ("v", false), 'w' => ("w", false), 'x' => ("x", false),
        'y' => ("y", false), 'z' => ("z", false),
        'A' => ("a", true), 'B' => ("b", true), 'C' => ("c", true),
        'D' => ("d", true), 'E' => ("e", true), 'F' => ("f", true),
        'G' => ("g", true), 'H' => ("h", true), 'I' => ("i", true),
        'J' => ("j", true), 'K' => ("k", true), 'L' => ("l", true),
        'M' => ("m", true), 'N' => ("n", true), 'O' => ("o", true),
        'P' => ("p", true), 'Q' => ("q", true), 'R' => ("r", true),
        'S' => ("s", true), 'T' => ("t", true), 'U' => ("u", true),
        'V' => ("v", true), 'W' => ("w", true), 'X' => ("x", true),
        'Y' => ("y", true), 'Z' => ("z", true),
        '0' => ("0", false), '1' => ("1", false), '2' => ("2", false),
        '3' => ("3", false), '4' => ("4", false), '5' => ("5", false),
        '6' => ("6", false), '7' => ("7", false), '8' => ("8", false),
        '9' => ("9", false),
        ' ' => ("spc", false),
        '\n' => ("ret", false),
        '\t' => ("tab", false),
        '!' => ("1", true), '@' => ("2", true), '#' => ("3", true),
        '$' => ("4", true), '%' => ("5", true), '^' => ("6", true),
        '&' => ("7", true), '*' => ("8", true), '(' => ("9", true),
        ')' => ("0", true),
        '-' => ("minus", false), '_' => ("minus", true),
        '=' => ("equal", false), '+' => ("equal", true),
        '[' => ("bracket_left", false), '{' => ("bracket_left", true),
        ']' => ("bracket_right", false), '}' => ("bracket_right", true),
        '\\' => ("backslash", false), '|' => ("backslash", true),
        ';' => ("semicolon", false), ':' => ("semicolon", true),
        '\'' => ("apostrophe", false), '"' => ("apostrophe", true),
        ',' => ("comma", false), '<' => ("comma", true),
        '.' => ("dot", false), '>' => ("dot", true),
        '/' => ("slash", false), '?' => ("slash", true),
        '`' => ("grave_accent", false), '~' => ("grave_accent", true),
        other => bail!("cannot type character {:?}", other),
    };
    Ok(QKey { code, shifted })
}
