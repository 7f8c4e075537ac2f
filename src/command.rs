//! Wire protocol between the test runner and the engine.
//!
//! Requests arrive newline-framed as `{"cmd": <name>, "arguments": {..}}`,
//! responses go back as `{"rsp": <value>}`, and a clean shutdown ends
//! with the `{"QUIT": 1}` sentinel before the pipe closes.
//!
//! Commands decode into a closed enum; a name we do not know is a
//! decode error at the transport layer, which the dispatcher treats as
//! fatal.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Read, Write};
use std::sync::mpsc::{self, Receiver};

/// A `mustmatch` argument: one tag, or a list of tags / needle handles.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MustMatch {
    One(String),
    Many(Vec<TagOrNeedle>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TagOrNeedle {
    Tag(String),
    Needle { name: String },
}

/// One regex pattern or a list tried in order.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RegexSpec {
    One(String),
    Many(Vec<String>),
}

impl RegexSpec {
    pub fn patterns(&self) -> Vec<String> {
        match self {
            RegexSpec::One(s) => vec![s.clone()],
            RegexSpec::Many(v) => v.clone(),
        }
    }
}

/// Every request the runner may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", content = "arguments", rename_all = "snake_case")]
pub enum Command {
    StartVm,
    StopVm,
    Alive,
    SelectConsole {
        testapi_console: String,
    },
    ResetConsole {
        testapi_console: String,
    },
    DeactivateConsole {
        testapi_console: String,
    },
    SendKey {
        key: String,
    },
    TypeString {
        text: String,
        #[serde(default)]
        max_interval: Option<f64>,
    },
    MouseSet {
        x: i32,
        y: i32,
    },
    MouseHide {
        #[serde(default)]
        border_offset: Option<i32>,
    },
    MouseButton {
        button: String,
        bstate: i32,
    },
    CaptureScreenshot,
    LastScreenshotName,
    SetReferenceScreenshot,
    // the misspelling is the wire name; keep it
    SimiliarityToReference,
    SetTagsToAssert {
        mustmatch: Option<MustMatch>,
        #[serde(default)]
        timeout: Option<f64>,
        #[serde(default)]
        reloadneedles: bool,
    },
    CheckAssertedScreen,
    InteractiveAssertScreen {
        interactive: bool,
    },
    StopAssertScreen,
    RetryAssertScreen {
        #[serde(default)]
        reload_needles: bool,
        #[serde(default)]
        timeout: Option<f64>,
    },
    SetSerialOffset,
    SerialText,
    WaitSerial {
        regexp: RegexSpec,
        #[serde(default)]
        timeout: Option<f64>,
    },
    WaitIdle {
        #[serde(default)]
        timeout: Option<f64>,
    },
    FreezeVm,
    ContVm,
    ProxyConsoleCall {
        console: String,
        function: String,
        #[serde(default)]
        args: Vec<Value>,
    },
}

impl Command {
    pub fn decode(line: &str) -> Result<Command> {
        serde_json::from_str(line)
            .with_context(|| format!("unknown or malformed command: {}", line.trim()))
    }
}

/// Spawn the command-pipe reader thread. Lines arrive on the returned
/// channel; the channel disconnects when the runner closes its end.
pub fn spawn_command_reader<R: Read + Send + 'static>(pipe: R) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let reader = BufReader::new(pipe);
        for line in reader.lines().map_while(Result::ok) {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Frames responses onto the runner's response pipe.
pub struct ResponseWriter {
    pipe: Box<dyn Write + Send>,
}

impl ResponseWriter {
    pub fn new<W: Write + Send + 'static>(pipe: W) -> Self {
        Self { pipe: Box::new(pipe) }
    }

    /// Write one `{"rsp": ..}` frame. A write failure is fatal for the
    /// worker; the caller propagates it into the crash hook.
    pub fn send(&mut self, rsp: &Value) -> Result<()> {
        let frame = json!({ "rsp": rsp });
        writeln!(self.pipe, "{}", frame).context("response pipe write failed")?;
        self.pipe.flush().context("response pipe flush failed")
    }

    /// Write the shutdown sentinel.
    pub fn quit(&mut self) -> Result<()> {
        writeln!(self.pipe, "{}", json!({ "QUIT": 1 }))
            .context("response pipe write failed")?;
        self.pipe.flush().context("response pipe flush failed")
    }
}
