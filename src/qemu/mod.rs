//! Hypervisor driver.
//!
//! The engine core never talks to QEMU directly; it goes through the
//! narrow `Driver` trait (start, stop, alive, freeze, cont). The
//! concrete `QemuDriver` spawns `qemu-system-x86_64` via `QemuBuilder`
//! and controls it over a dedicated QMP monitor.

pub mod builder;
pub mod qmp;

pub use builder::QemuBuilder;
pub use qmp::QmpClient;

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::process::Child;
use std::time::Duration;

/// Hypervisor operations the engine needs.
pub trait Driver: Send {
    fn do_start_vm(&mut self) -> Result<()>;
    fn do_stop_vm(&mut self) -> Result<()>;
    /// Does the hypervisor report the SUT as alive?
    fn alive(&mut self) -> Result<bool>;
    /// Pause the SUT's virtual clock.
    fn freeze(&mut self) -> Result<()>;
    /// Resume the SUT's virtual clock.
    fn cont(&mut self) -> Result<()>;
}

/// Drives a QEMU child process.
pub struct QemuDriver {
    /// Deferred build: the builder config is captured up front, the
    /// process only exists between start and stop.
    make_builder: Box<dyn Fn() -> QemuBuilder + Send>,
    ctrl_socket: PathBuf,
    child: Option<Child>,
    qmp: Option<QmpClient>,
}

impl QemuDriver {
    pub fn new<F>(make_builder: F, ctrl_socket: PathBuf) -> Self
    where
        F: Fn() -> QemuBuilder + Send + 'static,
    {
        Self {
            make_builder: Box::new(make_builder),
            ctrl_socket,
            child: None,
            qmp: None,
        }
    }

    fn qmp(&mut self) -> Result<&mut QmpClient> {
        match self.qmp.as_mut() {
            Some(q) => Ok(q),
            None => bail!("SUT is not running"),
        }
    }

    /// The QMP socket appears asynchronously after spawn; retry for a
    /// few seconds before giving up.
    fn connect_qmp(&mut self) -> Result<()> {
        let mut last_err = None;
        for _ in 0..50 {
            match QmpClient::connect(&self.ctrl_socket) {
                Ok(client) => {
                    self.qmp = Some(client);
                    return Ok(());
                }
                Err(e) => {
                    last_err = Some(e);
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("QMP connect failed")))
            .context("timed out connecting to QMP control socket")
    }
}

impl Driver for QemuDriver {
    fn do_start_vm(&mut self) -> Result<()> {
        if self.child.is_some() {
            bail!("SUT is already running");
        }
        let mut cmd = (self.make_builder)().build();
        let child = cmd.spawn().context("failed to spawn qemu-system-x86_64")?;
        self.child = Some(child);
        self.connect_qmp()
    }

    fn do_stop_vm(&mut self) -> Result<()> {
        if let Some(mut qmp) = self.qmp.take() {
            // polite first; the kill below covers a wedged monitor
            let _ = qmp.quit();
        }
        if let Some(mut child) = self.child.take() {
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) if std::time::Instant::now() >= deadline => {
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                    Ok(None) => std::thread::sleep(Duration::from_millis(100)),
                    Err(_) => break,
                }
            }
        }
        Ok(())
    }

    fn alive(&mut self) -> Result<bool> {
        match self.child.as_mut() {
            Some(child) => Ok(child.try_wait()?.is_none()),
            None => Ok(false),
        }
    }

    fn freeze(&mut self) -> Result<()> {
        self.qmp()?.stop()
    }

    fn cont(&mut self) -> Result<()> {
        self.qmp()?.cont()
    }
}
