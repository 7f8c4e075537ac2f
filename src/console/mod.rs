//! Console abstraction and registry.
//!
//! A console is a named, addressable endpoint on the SUT (the VNC-style
//! framebuffer, a serial terminal, an auxiliary virtio console). The
//! engine talks to consoles through two narrow capability traits:
//! `Console` for lifecycle and `Screen` for input/output. Unknown
//! operations are a contract error, not a runtime lookup.
//!
//! At most one console is current at any instant; input and capture
//! operations silently no-op while none is selected.

pub mod qmp;

use anyhow::Result;
use serde_json::Value;

use crate::image::ImageRef;

/// Lifecycle surface of a console.
pub trait Console: Send {
    /// Bring the console up. Returns the console's own activation
    /// signal for the runner.
    fn activate(&mut self) -> Result<Value>;
    /// Reset the console to a usable state (reconnect, clear caches).
    fn reset(&mut self) -> Result<()>;
    /// Tear the console down; it stays unusable until reset.
    fn disable(&mut self) -> Result<()>;
    /// The console's screen for capture and input.
    fn screen(&mut self) -> &mut dyn Screen;
    /// Execute a console-specific function by name. The default knows
    /// nothing; concrete consoles expose what they support.
    fn proxy_call(&mut self, function: &str, _args: &[Value]) -> Result<Value> {
        anyhow::bail!("console does not implement '{}'", function)
    }
}

/// Capture and input surface of a console.
pub trait Screen: Send {
    /// The current framebuffer contents, if the console can render one
    /// right now.
    fn current_frame(&mut self) -> Result<Option<ImageRef>>;
    /// Hint that the framebuffer cache should be refreshed.
    fn request_screen_update(&mut self) -> Result<()>;
    fn send_key(&mut self, key: &str) -> Result<()>;
    fn type_string(&mut self, text: &str) -> Result<()>;
    fn mouse_set(&mut self, x: i32, y: i32) -> Result<()>;
    fn mouse_hide(&mut self, border_offset: i32) -> Result<()>;
    /// `bstate` nonzero presses the button, zero releases it.
    fn mouse_button(&mut self, button: &str, bstate: i32) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsoleState {
    Inactive,
    Active,
    Disabled,
}

struct Entry {
    name: String,
    state: ConsoleState,
    console: Box<dyn Console>,
}

/// Named consoles plus the "current" selection.
#[derive(Default)]
pub struct ConsoleRegistry {
    entries: Vec<Entry>,
    current: Option<usize>,
}

impl ConsoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, console: Box<dyn Console>) {
        self.entries.push(Entry {
            name: name.to_string(),
            state: ConsoleState::Inactive,
            console,
        });
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    /// Activate `name` and make it current. Returns the console's
    /// activation signal, or `None` for an unknown console (warned,
    /// not fatal - the runner decides whether that fails the test).
    pub fn select(&mut self, name: &str) -> Result<Option<Value>> {
        let idx = match self.index_of(name) {
            Some(i) => i,
            None => {
                eprintln!("  WARN: no such console '{}'", name);
                return Ok(None);
            }
        };
        let entry = &mut self.entries[idx];
        let signal = entry.console.activate()?;
        entry.state = ConsoleState::Active;
        self.current = Some(idx);
        Ok(Some(signal))
    }

    pub fn reset(&mut self, name: &str) -> Result<()> {
        match self.index_of(name) {
            Some(idx) => {
                let entry = &mut self.entries[idx];
                entry.console.reset()?;
                if entry.state == ConsoleState::Disabled {
                    entry.state = ConsoleState::Inactive;
                }
                Ok(())
            }
            None => {
                eprintln!("  WARN: no such console '{}'", name);
                Ok(())
            }
        }
    }

    /// Disable `name`; clears the current selection iff it was current.
    pub fn deactivate(&mut self, name: &str) -> Result<()> {
        match self.index_of(name) {
            Some(idx) => {
                let entry = &mut self.entries[idx];
                entry.console.disable()?;
                entry.state = ConsoleState::Disabled;
                if self.current == Some(idx) {
                    self.current = None;
                }
                Ok(())
            }
            None => {
                eprintln!("  WARN: no such console '{}'", name);
                Ok(())
            }
        }
    }

    /// The current console, if one is selected.
    pub fn current(&mut self) -> Option<&mut dyn Console> {
        let idx = self.current?;
        Some(self.entries[idx].console.as_mut())
    }

    /// A console by name, regardless of selection.
    pub fn get(&mut self, name: &str) -> Option<&mut dyn Console> {
        let idx = self.index_of(name)?;
        Some(self.entries[idx].console.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StubConsole {
        activated: usize,
        disabled: usize,
    }

    impl StubConsole {
        fn new() -> Self {
            Self { activated: 0, disabled: 0 }
        }
    }

    impl Console for StubConsole {
        fn activate(&mut self) -> Result<Value> {
            self.activated += 1;
            Ok(json!(true))
        }
        fn reset(&mut self) -> Result<()> {
            Ok(())
        }
        fn disable(&mut self) -> Result<()> {
            self.disabled += 1;
            Ok(())
        }
        fn screen(&mut self) -> &mut dyn Screen {
            self
        }
    }

    impl Screen for StubConsole {
        fn current_frame(&mut self) -> Result<Option<ImageRef>> {
            Ok(None)
        }
        fn request_screen_update(&mut self) -> Result<()> {
            Ok(())
        }
        fn send_key(&mut self, _key: &str) -> Result<()> {
            Ok(())
        }
        fn type_string(&mut self, _text: &str) -> Result<()> {
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

    #[test]
    fn select_makes_console_current() {
        let mut reg = ConsoleRegistry::new();
        reg.register("sut", Box::new(StubConsole::new()));
        assert!(reg.current().is_none());

        let signal = reg.select("sut").unwrap();
        assert_eq!(signal, Some(json!(true)));
        assert!(reg.current().is_some());
    }

    #[test]
    fn unknown_console_is_not_fatal() {
        let mut reg = ConsoleRegistry::new();
        assert_eq!(reg.select("missing").unwrap(), None);
        reg.reset("missing").unwrap();
        reg.deactivate("missing").unwrap();
    }

    #[test]
    fn deactivate_clears_current_only_for_current() {
        let mut reg = ConsoleRegistry::new();
        reg.register("a", Box::new(StubConsole::new()));
        reg.register("b", Box::new(StubConsole::new()));

        reg.select("a").unwrap();
        reg.deactivate("b").unwrap();
        assert!(reg.current().is_some());

        reg.deactivate("a").unwrap();
        assert!(reg.current().is_none());
    }
}
