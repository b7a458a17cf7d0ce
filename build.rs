//! Generate the loader version constants: the human-readable string
//! comes from `git describe --dirty` (falling back to the
//! `CARGO_PKG_VERSION`), while the packed word returned by the
//! GetVersion IPC command is always derived from the Cargo version.
//!
//! The `GIT` environment variable can be used to set an alternative
//! path to the git executable.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::process::Command;

fn main() {
    let out_dir = env::var("OUT_DIR").unwrap();
    let dest_path = Path::new(&out_dir).join("version.rs");
    let mut f = File::create(&dest_path).unwrap();

    let git = env::var("GIT").unwrap_or("git".into());

    let description =
        Command::new(git)
        .arg("describe")
        .arg("--dirty")
        .output();

    let cargo_version = env!("CARGO_PKG_VERSION").to_owned();

    let mut version =
        match description {
            Ok(output) => {
                if output.status.success() {
                    format!("git-{}",
                            String::from_utf8(output.stdout).unwrap())
                } else {
                    cargo_version.clone()
                }
            }
            _ => cargo_version.clone(),
        };

    // Make sure version is on a single line
    if let Some(l) = version.find('\n') {
        version.truncate(l);
    }

    // major.minor.patch packed the way the system version word is laid
    // out: 0xMMmmpp00
    let mut parts = cargo_version.split('.')
        .map(|p| p.parse::<u32>().unwrap_or(0));

    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    let patch = parts.next().unwrap_or(0);

    let word = (major << 24) | (minor << 16) | (patch << 8);

    writeln!(f, "pub const VERSION: &'static str = \
                 \"{}\";", version).unwrap();
    writeln!(f, "pub const VERSION_WORD: u32 = 0x{:08x};", word).unwrap();
}
