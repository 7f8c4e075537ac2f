//! Wire protocol end-to-end: a fake runner drives the engine over its
//! socket while the capture loop runs on its own thread.

mod common;

use common::{build_harness, solid_frame};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::time::Duration;

struct Runner {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
}

impl Runner {
    fn new(stream: UnixStream) -> Self {
        let reader = BufReader::new(stream.try_clone().unwrap());
        Self { writer: stream, reader }
    }

    fn send(&mut self, cmd: &Value) {
        writeln!(self.writer, "{}", cmd).unwrap();
        self.writer.flush().unwrap();
    }

    /// Send one command and wait for its `{"rsp": ..}` frame.
    fn call(&mut self, cmd: Value) -> Value {
        self.send(&cmd);
        self.read_frame()
            .get("rsp")
            .cloned()
            .expect("response frame carries rsp")
    }

    fn read_frame(&mut self) -> Value {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).unwrap();
        assert!(n > 0, "engine closed the pipe unexpectedly");
        serde_json::from_str(&line).unwrap()
    }
}

#[test]
fn lifecycle_and_input_routing() {
    let h = build_harness(true);
    h.push_frame(solid_frame([80, 80, 80]));
    let live = h.spawn();
    let mut runner = Runner::new(live.runner.try_clone().unwrap());
    let heartbeat = live.workdir.path().join("backend.run");

    assert_eq!(runner.call(json!({"cmd": "start_vm"})), json!({}));
    assert!(heartbeat.exists());
    assert_eq!(runner.call(json!({"cmd": "alive"})), Value::Bool(true));

    let rsp = runner.call(json!({
        "cmd": "select_console",
        "arguments": {"testapi_console": "sut"}
    }));
    assert_eq!(rsp["activated"], Value::Bool(true));

    runner.call(json!({"cmd": "capture_screenshot"}));
    let rsp = runner.call(json!({"cmd": "last_screenshot_name"}));
    let filename = rsp["filename"].as_str().unwrap();
    assert!(filename.starts_with("shot-"), "unexpected filename {filename}");

    runner.call(json!({"cmd": "send_key", "arguments": {"key": "ctrl-alt-f2"}}));
    runner.call(json!({"cmd": "type_string", "arguments": {"text": "ls\n"}}));
    {
        let keys = live.keys.lock().unwrap();
        assert_eq!(keys.as_slice(), ["ctrl-alt-f2".to_string(), "type:ls\n".to_string()]);
    }

    // unknown console: proxied calls recover instead of killing the worker
    let rsp = runner.call(json!({
        "cmd": "proxy_console_call",
        "arguments": {"console": "nope", "function": "echo", "args": [1]}
    }));
    assert!(rsp["exception"].as_str().unwrap().contains("nope"));
    let rsp = runner.call(json!({
        "cmd": "proxy_console_call",
        "arguments": {"console": "sut", "function": "echo", "args": [1, 2]}
    }));
    assert_eq!(rsp["result"], json!([1, 2]));

    assert_eq!(runner.call(json!({"cmd": "stop_vm"})), json!({}));
    // clean shutdown ends with the QUIT sentinel
    let quit = runner.read_frame();
    assert_eq!(quit["QUIT"], json!(1));

    assert!(live.handle.join().unwrap().is_ok());
    assert!(!heartbeat.exists());
    assert_eq!(live.driver_state.lock().unwrap().stopped, 1);
}

#[test]
fn wait_serial_matches_while_stream_stays_alive() {
    let h = build_harness(true);
    h.push_frame(solid_frame([10, 20, 30]));
    let serial_path = h.workdir.path().join("serial0");
    std::fs::write(&serial_path, b"").unwrap();
    let live = h.spawn();
    let mut runner = Runner::new(live.runner.try_clone().unwrap());

    runner.call(json!({
        "cmd": "select_console",
        "arguments": {"testapi_console": "sut"}
    }));
    assert_eq!(runner.call(json!({"cmd": "set_serial_offset"})), json!(0));

    // the match target appears while wait_serial is already polling
    runner.send(&json!({
        "cmd": "wait_serial",
        "arguments": {"regexp": "BOOT OK", "timeout": 10}
    }));
    std::thread::sleep(Duration::from_millis(300));
    {
        let mut f = std::fs::OpenOptions::new().append(true).open(&serial_path).unwrap();
        writeln!(f, "kernel up").unwrap();
        writeln!(f, "BOOT OK").unwrap();
    }
    let rsp = runner.read_frame()["rsp"].clone();
    assert_eq!(rsp["matched"], Value::Bool(true));
    assert!(rsp["string"].as_str().unwrap().contains("BOOT OK"));

    // the offset advanced to EOF on the way out
    assert_eq!(runner.call(json!({"cmd": "serial_text"})), json!(""));

    drop(runner);
    drop(live.runner);
    live.handle.join().unwrap().unwrap();
}

#[test]
fn unknown_command_is_fatal() {
    let h = build_harness(true);
    let live = h.spawn();
    let mut runner = Runner::new(live.runner.try_clone().unwrap());

    runner.send(&json!({"cmd": "fire_the_missiles"}));
    runner.writer.shutdown(Shutdown::Write).unwrap();

    // worker dies; the runner observes pipe closure
    let mut rest = String::new();
    let _ = std::io::Read::read_to_string(&mut runner.reader, &mut rest);
    assert!(live.handle.join().unwrap().is_err());
}
