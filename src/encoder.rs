//! Video encoder feed.
//!
//! The encoder is an external process consuming a line-framed directive
//! stream on stdin: `R` repeats the previously encoded frame, `E <path>`
//! encodes the file at `path`. Each directive is flushed immediately;
//! closing the stream signals end-of-video.

use anyhow::{bail, Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};

/// Sink for the frame stream. The engine emits exactly one directive
/// per captured frame, in capture order.
pub trait VideoSink: Send {
    /// Bring the sink up (spawn the encoder process).
    fn start(&mut self) -> Result<()>;
    /// Encode the frame written at `path`.
    fn encode_frame(&mut self, path: &Path) -> Result<()>;
    /// Repeat the previously encoded frame.
    fn repeat_frame(&mut self) -> Result<()>;
    /// Close the stream and wait for the encoder to finish.
    fn finish(&mut self) -> Result<()>;
}

/// Encoder subprocess: `<program> <output-file>` with directives piped
/// to its stdin.
pub struct EncoderProcess {
    program: String,
    output: PathBuf,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
}

impl EncoderProcess {
    pub fn new(program: &str, output: &Path) -> Self {
        Self {
            program: program.to_string(),
            output: output.to_path_buf(),
            child: None,
            stdin: None,
        }
    }

    fn stdin(&mut self) -> Result<&mut ChildStdin> {
        match self.stdin.as_mut() {
            Some(s) => Ok(s),
            None => bail!("video encoder is not running"),
        }
    }
}

impl VideoSink for EncoderProcess {
    fn start(&mut self) -> Result<()> {
        let mut child = Command::new(&self.program)
            .arg(&self.output)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to spawn video encoder '{}'", self.program))?;
        self.stdin = child.stdin.take();
        self.child = Some(child);
        Ok(())
    }

    fn encode_frame(&mut self, path: &Path) -> Result<()> {
        let stdin = self.stdin()?;
        writeln!(stdin, "E {}", path.display()).context("encoder pipe write failed")?;
        stdin.flush().context("encoder pipe flush failed")
    }

    fn repeat_frame(&mut self) -> Result<()> {
        let stdin = self.stdin()?;
        writeln!(stdin, "R").context("encoder pipe write failed")?;
        stdin.flush().context("encoder pipe flush failed")
    }

    fn finish(&mut self) -> Result<()> {
        // dropping stdin closes the stream; the encoder exits on EOF
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.wait();
        }
        Ok(())
    }
}
