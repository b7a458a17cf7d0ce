//! Locating the plugin file for a title.
//!
//! Each title gets its own directory under the plugin root, named
//! after the 16 uppercase hex digits of the title id. The first
//! regular file in there ending in `.3gx` wins; when the directory or
//! the file is missing the loader falls back to the default plugin.

use std::fs::File;

use error::{Error, ErrorKind};
use kernel::{make_result, RL_USAGE, RS_NOTFOUND};
use sdmc::Sdmc;

pub const PLUGIN_ROOT: &'static str = "/luma/plugins";

pub const DEFAULT_PLUGIN_PATH: &'static str =
    "/luma/plugins/default.3gx";

/// An opened plugin container
#[derive(Debug)]
pub struct Located {
    pub file: File,
    pub path: String,
    /// True when the default plugin was substituted
    pub is_default: bool,
}

/// Find the plugin file for `title_id` in its title directory.
///
/// Directory entries that are not regular files, whose names don't
/// convert cleanly to UTF-8 or don't end in `.3gx` (case sensitive)
/// are skipped.
pub fn find_plugin_file(sdmc: &Sdmc, title_id: u64)
                        -> Result<String, Error> {
    let dir = format!("{}/{:016X}", PLUGIN_ROOT, title_id);

    let entries = match sdmc.read_dir(&dir) {
        Ok(e) => e,
        Err(_) => return Err(not_found()),
    };

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };

        let is_file = entry.file_type()
            .map(|t| t.is_file())
            .unwrap_or(false);

        if !is_file {
            continue;
        }

        // Names come in UTF-16 from the archive; anything that
        // doesn't convert is no plugin of ours
        let name = match entry.file_name().into_string() {
            Ok(n) => n,
            Err(_) => continue,
        };

        if !name.ends_with(".3gx") {
            continue;
        }

        return Ok(format!("{}/{}", dir, name));
    }

    Err(not_found())
}

/// Open the plugin for `title_id`, falling back to the default plugin
/// when the title has none
pub fn open_plugin_file(sdmc: &Sdmc, title_id: u64)
                        -> Result<Located, Error> {
    if let Ok(path) = find_plugin_file(sdmc, title_id) {
        if let Ok(file) = sdmc.open(&path) {
            info!("using plugin {}", path);

            return Ok(Located {
                file: file,
                path: path,
                is_default: false,
            });
        }
    }

    match sdmc.open(DEFAULT_PLUGIN_PATH) {
        Ok(file) => {
            info!("using default plugin");

            Ok(Located {
                file: file,
                path: DEFAULT_PLUGIN_PATH.to_owned(),
                is_default: true,
            })
        }
        Err(_) => Err(not_found()),
    }
}

fn not_found() -> Error {
    Error::new(ErrorKind::NotFound,
               make_result(RL_USAGE, RS_NOTFOUND, 0, 1018))
}
