//! Access to the SD card filesystem.
//!
//! The archive client proper lives outside this crate; here we only
//! need to turn the absolute paths the loader deals in
//! (`/luma/plugins/...`) into file operations under a configurable
//! root, which doubles as the seam the tests use to point the loader
//! at a scratch directory.

use std::fs;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

pub struct Sdmc {
    root: PathBuf,
}

impl Sdmc {
    pub fn new<P: AsRef<Path>>(root: P) -> Sdmc {
        Sdmc {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Map an absolute console path under the root
    pub fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_left_matches('/'))
    }

    /// Open an existing file read-only
    pub fn open(&self, path: &str) -> io::Result<File> {
        File::open(self.resolve(path))
    }

    /// Open a file read-write, creating it if needed
    pub fn create(&self, path: &str) -> io::Result<File> {
        fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.resolve(path))
    }

    pub fn read_dir(&self, path: &str) -> io::Result<fs::ReadDir> {
        fs::read_dir(self.resolve(path))
    }

    pub fn file_size(&self, path: &str) -> io::Result<u64> {
        fs::metadata(self.resolve(path)).map(|m| m.len())
    }
}
