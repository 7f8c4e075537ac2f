//! Shared fakes for engine integration tests: a scripted console, a
//! recording video sink and an inert driver, all observable from the
//! test through shared handles.

// not every test binary uses every fake
#![allow(dead_code)]

use anyhow::Result;
use image::{Rgb, RgbImage};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use capture_engine::{
    spawn_command_reader, Console, ConsoleRegistry, ControlSignals, Driver, Engine,
    EngineConfig, FsControlSignals, ImageRef, NeedleSet, ResponseWriter, Screen, VideoSink,
};

/// A console fed from a frame queue the test can push into.
pub struct ScriptedConsole {
    frames: Arc<Mutex<VecDeque<ImageRef>>>,
    /// When the queue drains: keep serving the last frame (a static
    /// screen) or serve nothing (a stalled console).
    repeat_last: bool,
    last: Option<ImageRef>,
    keys: Arc<Mutex<Vec<String>>>,
}

impl ScriptedConsole {
    pub fn new(
        frames: Arc<Mutex<VecDeque<ImageRef>>>,
        repeat_last: bool,
        keys: Arc<Mutex<Vec<String>>>,
    ) -> Self {
        Self { frames, repeat_last, last: None, keys }
    }
}

impl Console for ScriptedConsole {
    fn activate(&mut self) -> Result<Value> {
        Ok(json!(true))
    }
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }
    fn disable(&mut self) -> Result<()> {
        Ok(())
    }
    fn screen(&mut self) -> &mut dyn Screen {
        self
    }
    fn proxy_call(&mut self, function: &str, args: &[Value]) -> Result<Value> {
        match function {
            "echo" => Ok(json!(args)),
            other => anyhow::bail!("console does not implement '{}'", other),
        }
    }
}

impl Screen for ScriptedConsole {
    fn current_frame(&mut self) -> Result<Option<ImageRef>> {
        let next = self.frames.lock().unwrap().pop_front();
        match next {
            Some(img) => {
                self.last = Some(img.clone());
                Ok(Some(img))
            }
            None if self.repeat_last => Ok(self.last.clone()),
            None => Ok(None),
        }
    }
    fn request_screen_update(&mut self) -> Result<()> {
        Ok(())
    }
    fn send_key(&mut self, key: &str) -> Result<()> {
        self.keys.lock().unwrap().push(key.to_string());
        Ok(())
    }
    fn type_string(&mut self, text: &str) -> Result<()> {
        self.keys.lock().unwrap().push(format!("type:{text}"));
        Ok(())
    }
    fn mouse_set(&mut self, _x: i32, _y: i32) -> Result<()> {
        Ok(())
    }
    fn mouse_hide(&mut self, _border_offset: i32) -> Result<()> {
        Ok(())
    }
    fn mouse_button(&mut self, _button: &str, _bstate: i32) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct DriverState {
    pub started: usize,
    pub stopped: usize,
    pub frozen: usize,
    pub continued: usize,
}

pub struct FakeDriver(pub Arc<Mutex<DriverState>>);

impl Driver for FakeDriver {
    fn do_start_vm(&mut self) -> Result<()> {
        self.0.lock().unwrap().started += 1;
        Ok(())
    }
    fn do_stop_vm(&mut self) -> Result<()> {
        self.0.lock().unwrap().stopped += 1;
        Ok(())
    }
    fn alive(&mut self) -> Result<bool> {
        Ok(true)
    }
    fn freeze(&mut self) -> Result<()> {
        self.0.lock().unwrap().frozen += 1;
        Ok(())
    }
    fn cont(&mut self) -> Result<()> {
        self.0.lock().unwrap().continued += 1;
        Ok(())
    }
}

/// Records encoder directives instead of feeding a process.
pub struct RecordingSink(pub Arc<Mutex<Vec<String>>>);

impl VideoSink for RecordingSink {
    fn start(&mut self) -> Result<()> {
        self.0.lock().unwrap().push("start".to_string());
        Ok(())
    }
    fn encode_frame(&mut self, path: &Path) -> Result<()> {
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        self.0.lock().unwrap().push(format!("E {name}"));
        Ok(())
    }
    fn repeat_frame(&mut self) -> Result<()> {
        self.0.lock().unwrap().push("R".to_string());
        Ok(())
    }
    fn finish(&mut self) -> Result<()> {
        self.0.lock().unwrap().push("finish".to_string());
        Ok(())
    }
}

pub struct Harness {
    pub engine: Engine,
    /// Runner side of the command/response socket.
    pub runner: UnixStream,
    pub frames: Arc<Mutex<VecDeque<ImageRef>>>,
    pub keys: Arc<Mutex<Vec<String>>>,
    pub directives: Arc<Mutex<Vec<String>>>,
    pub driver_state: Arc<Mutex<DriverState>>,
    pub workdir: tempfile::TempDir,
}

impl Harness {
    pub fn screenshot_dir(&self) -> PathBuf {
        self.workdir.path().join("screenshots")
    }

    pub fn push_frame(&self, img: ImageRef) {
        self.frames.lock().unwrap().push_back(img);
    }

    /// Move the engine onto its own thread running the main loop; the
    /// fakes and the workdir stay alive with the returned handle.
    pub fn spawn(self) -> SpawnedHarness {
        let Harness { mut engine, runner, frames, keys, directives, driver_state, workdir } =
            self;
        let handle = std::thread::spawn(move || engine.run());
        SpawnedHarness { handle, runner, frames, keys, directives, driver_state, workdir }
    }
}

/// A harness whose engine is live on a background thread.
pub struct SpawnedHarness {
    pub handle: std::thread::JoinHandle<Result<()>>,
    pub runner: UnixStream,
    pub frames: Arc<Mutex<VecDeque<ImageRef>>>,
    pub keys: Arc<Mutex<Vec<String>>>,
    pub directives: Arc<Mutex<Vec<String>>>,
    pub driver_state: Arc<Mutex<DriverState>>,
    pub workdir: tempfile::TempDir,
}

/// Build an engine over fakes. `repeat_last` keeps the screen static
/// once the scripted frames run out; `setup` runs against the workdir
/// before the needle database is loaded.
pub fn build_harness_with(
    repeat_last: bool,
    setup: impl FnOnce(&Path),
) -> Harness {
    let workdir = tempfile::tempdir().unwrap();
    let mut cfg = EngineConfig::new(workdir.path());
    cfg.screenshot_interval = Duration::from_millis(25);
    cfg.default_timeout = Duration::from_secs(5);
    std::fs::create_dir_all(&cfg.needle_dir).unwrap();
    setup(workdir.path());

    let (runner, engine_side) = UnixStream::pair().unwrap();
    let commands = spawn_command_reader(engine_side.try_clone().unwrap());
    let responses = ResponseWriter::new(engine_side);

    let frames: Arc<Mutex<VecDeque<ImageRef>>> = Arc::new(Mutex::new(VecDeque::new()));
    let keys: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let directives: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let driver_state: Arc<Mutex<DriverState>> = Arc::new(Mutex::new(DriverState::default()));

    let mut consoles = ConsoleRegistry::new();
    consoles.register(
        "sut",
        Box::new(ScriptedConsole::new(frames.clone(), repeat_last, keys.clone())),
    );

    let needles = NeedleSet::load(&cfg.needle_dir).unwrap();
    let control: Box<dyn ControlSignals> = Box::new(FsControlSignals::new(
        cfg.stop_waitforneedle_file(),
        cfg.continue_waitforneedle_file(),
    ));

    let engine = Engine::new(
        cfg,
        Box::new(FakeDriver(driver_state.clone())),
        consoles,
        needles,
        Box::new(RecordingSink(directives.clone())),
        control,
        commands,
        responses,
    )
    .unwrap();

    Harness { engine, runner, frames, keys, directives, driver_state, workdir }
}

pub fn build_harness(repeat_last: bool) -> Harness {
    build_harness_with(repeat_last, |_| {})
}

/// A solid 1024x768 frame.
pub fn solid_frame(color: [u8; 3]) -> ImageRef {
    ImageRef::from(RgbImage::from_pixel(1024, 768, Rgb(color)))
}

/// A solid frame with its top `rows` rows repainted.
pub fn banded_frame(base: [u8; 3], band: [u8; 3], rows: u32) -> ImageRef {
    let mut img = RgbImage::from_pixel(1024, 768, Rgb(base));
    for y in 0..rows.min(768) {
        for x in 0..1024 {
            img.put_pixel(x, y, Rgb(band));
        }
    }
    ImageRef::from(img)
}

/// A solid frame with a rectangle repainted.
pub fn patched_frame(
    base: [u8; 3],
    patch: [u8; 3],
    (x, y, w, h): (u32, u32, u32, u32),
) -> ImageRef {
    let mut img = RgbImage::from_pixel(1024, 768, Rgb(base));
    for py in y..(y + h).min(768) {
        for px in x..(x + w).min(1024) {
            img.put_pixel(px, py, Rgb(patch));
        }
    }
    ImageRef::from(img)
}

/// Write a `<name>.json` + `<name>.png` needle pair.
pub fn write_needle(
    workdir: &Path,
    name: &str,
    tags: &[&str],
    reference: &ImageRef,
    area: (u32, u32, u32, u32),
) {
    let dir = workdir.join("needles");
    std::fs::create_dir_all(&dir).unwrap();
    let json = json!({
        "tags": tags,
        "area": [{
            "xpos": area.0,
            "ypos": area.1,
            "width": area.2,
            "height": area.3,
            "match": 96,
        }],
    });
    std::fs::write(dir.join(format!("{name}.json")), json.to_string()).unwrap();
    reference.write(dir.join(format!("{name}.png"))).unwrap();
}
