//! Capture worker entry point.
//!
//! Wires the engine to a real QEMU SUT: spawns the hypervisor through
//! `QemuDriver`, registers the QMP framebuffer console, and serves the
//! runner protocol on a unix socket in the run directory. Any fatal
//! error funnels through a single crash hook that stops the VM and
//! closes the pipes, so the runner reliably observes pipe closure.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

use capture_engine::console::qmp::QmpConsole;
use capture_engine::{
    spawn_command_reader, ConsoleRegistry, EncoderProcess, Engine, EngineConfig,
    FsControlSignals, NeedleSet, QemuBuilder, QemuDriver, ResponseWriter,
};

#[derive(Parser)]
#[command(name = "capture-engine")]
#[command(about = "Capture-and-assert worker for a virtualized SUT")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker: boot the SUT and serve the runner protocol
    Run {
        /// Run directory (screenshots, serial log, control files, socket)
        #[arg(long, default_value = ".")]
        workdir: PathBuf,

        /// Needle database directory (default: <workdir>/needles)
        #[arg(long)]
        needles: Option<PathBuf>,

        /// ISO to attach as CD-ROM
        #[arg(long)]
        iso: Option<PathBuf>,

        /// qcow2 disk to attach
        #[arg(long)]
        disk: Option<PathBuf>,

        /// OVMF firmware for UEFI boot
        #[arg(long)]
        ovmf: Option<PathBuf>,

        /// VNC display for the framebuffer, e.g. ":91"
        #[arg(long)]
        vnc: Option<String>,

        /// Guest memory
        #[arg(long, default_value = "2G")]
        memory: String,

        /// Disable the video encoder feed
        #[arg(long)]
        novideo: bool,
    },

    /// List the needles a directory provides
    Needles {
        /// Needle database directory
        dir: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run { workdir, needles, iso, disk, ovmf, vnc, memory, novideo } => {
            run_worker(workdir, needles, iso, disk, ovmf, vnc, memory, novideo)
        }
        Commands::Needles { dir } => list_needles(&dir),
    };
    if let Err(e) = result {
        eprintln!("{} {:#}", "FATAL:".red().bold(), e);
        std::process::exit(1);
    }
}

fn list_needles(dir: &Path) -> Result<()> {
    let set = NeedleSet::load(dir)?;
    println!("{}", format!("{} needles in {}", set.len(), dir.display()).bold());
    for needle in set.iter() {
        println!("  {} [{}]", needle.name.cyan(), needle.tags.join(", "));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_worker(
    workdir: PathBuf,
    needles: Option<PathBuf>,
    iso: Option<PathBuf>,
    disk: Option<PathBuf>,
    ovmf: Option<PathBuf>,
    vnc: Option<String>,
    memory: String,
    novideo: bool,
) -> Result<()> {
    std::fs::create_dir_all(&workdir)
        .with_context(|| format!("failed to create workdir {}", workdir.display()))?;

    let mut cfg = EngineConfig::new(&workdir).apply_env();
    cfg.novideo = cfg.novideo || novideo;
    if let Some(dir) = needles {
        cfg.needle_dir = dir;
    }

    // the runner connects here; its two pipe directions share the socket
    let socket_path = workdir.join("engine.sock");
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;
    println!(
        "{} waiting for runner on {}",
        ">>>".cyan().bold(),
        socket_path.display()
    );
    let (stream, _) = listener.accept().context("runner never connected")?;
    let commands = spawn_command_reader(stream.try_clone()?);
    let responses = ResponseWriter::new(stream);

    // one QMP monitor per collaborator
    let ctrl_socket = workdir.join("qmp-ctrl.sock");
    let console_socket = workdir.join("qmp-console.sock");

    let serial_file = cfg.serial_file.clone();
    let builder_ctrl = ctrl_socket.clone();
    let builder_console = console_socket.clone();
    let make_builder = move || {
        let mut builder = QemuBuilder::new()
            .memory(&memory)
            .serial_file(serial_file.clone())
            .qmp_socket(builder_ctrl.clone())
            .qmp_socket(builder_console.clone());
        if let Some(iso) = &iso {
            builder = builder.cdrom(iso.clone());
        }
        if let Some(disk) = &disk {
            builder = builder.disk(disk.clone());
        }
        if let Some(ovmf) = &ovmf {
            builder = builder.uefi(ovmf.clone());
        }
        if let Some(vnc) = &vnc {
            builder = builder.vnc_display(vnc);
        }
        builder
    };
    let driver = QemuDriver::new(make_builder, ctrl_socket);

    let mut consoles = ConsoleRegistry::new();
    consoles.register(
        "sut",
        Box::new(QmpConsole::new(console_socket, workdir.join("screendump.ppm"))),
    );

    let needles = NeedleSet::load(&cfg.needle_dir)?;
    println!("  Needles: {} in {}", needles.len(), cfg.needle_dir.display());

    let video = EncoderProcess::new(&cfg.encoder_program, &cfg.video_file());
    let control = FsControlSignals::new(
        cfg.stop_waitforneedle_file(),
        cfg.continue_waitforneedle_file(),
    );

    let mut engine = Engine::new(
        cfg,
        Box::new(driver),
        consoles,
        needles,
        Box::new(video),
        Box::new(control),
        commands,
        responses,
    )?;

    println!("{} runner connected, engine up", ">>>".green().bold());
    let result = engine.run();
    // crash hook: whatever happened, take the SUT down and let the
    // pipes close so the runner sees a definitive end
    engine.shutdown();
    match &result {
        Ok(()) => println!("{} engine finished cleanly", ">>>".green().bold()),
        Err(e) => eprintln!("  worker failed: {:#}", e),
    }
    result
}
