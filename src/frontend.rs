//! Outward surfaces of the loader.
//!
//! Menu rendering, modal prompts, the notification LED pattern, the
//! settings store and the IR patch stubs all live outside the core;
//! they're abstracted behind the `Frontend` trait. `Headless` is the
//! bundled implementation for environments without a screen: prompts
//! go to the log and the settings persist as JSON.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use serde_json;

/// Persisted loader configuration
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Settings {
    pub enabled: bool,
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Settings> {
        let file = File::open(path)?;

        serde_json::from_reader(file)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

pub trait Frontend {
    /// Render the plugin menu: `states` holds one on/off byte per
    /// entry and comes back with the user's choices
    fn display_menu(&mut self, nb_items: u32, states: &mut [u8]);

    /// Blocking informational prompt
    fn display_message(&mut self, title: &str, body: &str);

    /// Blocking error prompt
    fn display_error(&mut self, title: &str, body: &str, code: u32);

    /// Drive the notification LED pattern during swap transitions
    fn set_led(&mut self, on: bool);

    fn save_settings(&mut self, settings: &Settings);

    /// Refresh the loader entry of the system menu
    fn update_menu(&mut self, enabled: bool);

    /// Install the IR input redirection patch after a successful load
    fn ir_patch(&mut self);

    /// Remove the IR patch when the target goes away
    fn ir_unpatch(&mut self);
}

/// Frontend that doesn't front anything. Useful for tools and tests
/// that only exercise the container plumbing.
impl Frontend for () {
    fn display_menu(&mut self, _: u32, _: &mut [u8]) {
    }

    fn display_message(&mut self, _: &str, _: &str) {
    }

    fn display_error(&mut self, _: &str, _: &str, _: u32) {
    }

    fn set_led(&mut self, _: bool) {
    }

    fn save_settings(&mut self, _: &Settings) {
    }

    fn update_menu(&mut self, _: bool) {
    }

    fn ir_patch(&mut self) {
    }

    fn ir_unpatch(&mut self) {
    }
}

/// Screenless frontend: prompts are logged, menus answer with their
/// current states, settings go to a JSON file when one is configured.
pub struct Headless {
    settings_path: Option<PathBuf>,
}

impl Headless {
    pub fn new() -> Headless {
        Headless {
            settings_path: None,
        }
    }

    pub fn with_settings_file<P: AsRef<Path>>(path: P) -> Headless {
        Headless {
            settings_path: Some(path.as_ref().to_path_buf()),
        }
    }
}

impl Frontend for Headless {
    fn display_menu(&mut self, nb_items: u32, _states: &mut [u8]) {
        info!("menu requested with {} items, keeping current states",
              nb_items);
    }

    fn display_message(&mut self, title: &str, body: &str) {
        info!("[{}] {}", title, body);
    }

    fn display_error(&mut self, title: &str, body: &str, code: u32) {
        warn!("[{}] {} (0x{:08x})", title, body, code);
    }

    fn set_led(&mut self, on: bool) {
        debug!("notification LED {}", if on { "on" } else { "off" });
    }

    fn save_settings(&mut self, settings: &Settings) {
        let path = match self.settings_path {
            Some(ref p) => p,
            None => return,
        };

        let res = File::create(path)
            .map_err(|e| e.to_string())
            .and_then(|f| {
                serde_json::to_writer(f, settings)
                    .map_err(|e| e.to_string())
            });

        if let Err(e) = res {
            warn!("couldn't save the loader settings: {}", e);
        }
    }

    fn update_menu(&mut self, enabled: bool) {
        debug!("plugin loader is now {}",
               if enabled { "enabled" } else { "disabled" });
    }

    fn ir_patch(&mut self) {
    }

    fn ir_unpatch(&mut self) {
    }
}

#[cfg(test)]
pub mod recording {
    //! Frontend that records every call for the scenario tests

    use std::cell::RefCell;
    use std::rc::Rc;

    use super::{Frontend, Settings};

    #[derive(Clone, Debug, PartialEq)]
    pub enum Call {
        Menu(u32),
        Message(String, String),
        ErrorPrompt(String, u32),
        Led(bool),
        SaveSettings(bool),
        UpdateMenu(bool),
        IrPatch,
        IrUnpatch,
    }

    #[derive(Clone)]
    pub struct Recording {
        pub calls: Rc<RefCell<Vec<Call>>>,
    }

    impl Recording {
        pub fn new() -> Recording {
            Recording {
                calls: Rc::new(RefCell::new(Vec::new())),
            }
        }

        pub fn log(&self) -> Vec<Call> {
            self.calls.borrow().clone()
        }
    }

    impl Frontend for Recording {
        fn display_menu(&mut self, nb_items: u32, _: &mut [u8]) {
            self.calls.borrow_mut().push(Call::Menu(nb_items));
        }

        fn display_message(&mut self, title: &str, body: &str) {
            self.calls.borrow_mut()
                .push(Call::Message(title.into(), body.into()));
        }

        fn display_error(&mut self, title: &str, _body: &str,
                         code: u32) {
            self.calls.borrow_mut()
                .push(Call::ErrorPrompt(title.into(), code));
        }

        fn set_led(&mut self, on: bool) {
            self.calls.borrow_mut().push(Call::Led(on));
        }

        fn save_settings(&mut self, settings: &Settings) {
            self.calls.borrow_mut()
                .push(Call::SaveSettings(settings.enabled));
        }

        fn update_menu(&mut self, enabled: bool) {
            self.calls.borrow_mut().push(Call::UpdateMenu(enabled));
        }

        fn ir_patch(&mut self) {
            self.calls.borrow_mut().push(Call::IrPatch);
        }

        fn ir_unpatch(&mut self) {
            self.calls.borrow_mut().push(Call::IrUnpatch);
        }
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    #[test]
    fn settings_json_round_trip() {
        let dir = TempDir::new("plgldr-settings").unwrap();
        let path = dir.path().join("loader.json");

        let mut frontend = Headless::with_settings_file(&path);

        frontend.save_settings(&Settings { enabled: true });

        let back = Settings::load(&path).unwrap();

        assert!(back.enabled);
    }
}
