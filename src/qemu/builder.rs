//! QEMU command builder for the capture worker.
//!
//! Unlike a plain serial-console test rig, the worker needs a rendered
//! framebuffer (for screendumps and the video feed), a QMP monitor per
//! collaborator, and the serial port logged to a file the engine can
//! tail.

use std::path::PathBuf;
use std::process::{Command, Stdio};

#[derive(Default)]
pub struct QemuBuilder {
    cdrom: Option<PathBuf>,
    disk: Option<PathBuf>,
    ovmf: Option<PathBuf>,
    memory: Option<String>,
    serial_file: Option<PathBuf>,
    qmp_sockets: Vec<PathBuf>,
    vnc_display: Option<String>,
}

impl QemuBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an ISO as CD-ROM.
    pub fn cdrom(mut self, path: PathBuf) -> Self {
        self.cdrom = Some(path);
        self
    }

    /// Attach a virtio disk.
    pub fn disk(mut self, path: PathBuf) -> Self {
        self.disk = Some(path);
        self
    }

    /// Enable UEFI boot with OVMF firmware.
    pub fn uefi(mut self, ovmf_path: PathBuf) -> Self {
        self.ovmf = Some(ovmf_path);
        self
    }

    /// Guest memory, e.g. "2G".
    pub fn memory(mut self, mem: &str) -> Self {
        self.memory = Some(mem.to_string());
        self
    }

    /// Log the serial port to a file (append-only, tailed by the engine).
    pub fn serial_file(mut self, path: PathBuf) -> Self {
        self.serial_file = Some(path);
        self
    }

    /// Add a QMP monitor socket. May be called more than once; each
    /// socket gets its own monitor so collaborators don't share a
    /// connection.
    pub fn qmp_socket(mut self, path: PathBuf) -> Self {
        self.qmp_sockets.push(path);
        self
    }

    /// Expose the framebuffer on a VNC display, e.g. ":91".
    pub fn vnc_display(mut self, display: &str) -> Self {
        self.vnc_display = Some(display.to_string());
        self
    }

    /// Build the QEMU command.
    pub fn build(self) -> Command {
        let mut cmd = Command::new("qemu-system-x86_64");

        cmd.args(["-m", self.memory.as_deref().unwrap_or("2G")]);
        cmd.arg("-no-reboot");

        if let Some(ovmf) = &self.ovmf {
            cmd.args([
                "-drive",
                &format!("if=pflash,format=raw,readonly=on,file={}", ovmf.display()),
            ]);
        }
        if let Some(cdrom) = &self.cdrom {
            cmd.args([
                "-drive",
                &format!("media=cdrom,format=raw,readonly=on,file={}", cdrom.display()),
            ]);
        }
        if let Some(disk) = &self.disk {
            cmd.args([
                "-drive",
                &format!("file={},format=qcow2,if=virtio", disk.display()),
            ]);
        }
        if let Some(serial) = &self.serial_file {
            cmd.args(["-serial", &format!("file:{}", serial.display())]);
        }
        for sock in &self.qmp_sockets {
            cmd.args(["-qmp", &format!("unix:{},server,nowait", sock.display())]);
        }
        match &self.vnc_display {
            Some(display) => {
                cmd.args(["-vnc", display]);
            }
            // framebuffer must exist even without a viewer attached,
            // or screendump has nothing to render
            None => {
                cmd.args(["-display", "none"]);
            }
        }
        // pointer must report absolute coordinates for mouse_set
        cmd.args(["-device", "virtio-tablet-pci"]);

        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        cmd
    }
}
