// Plgldr - a 3GX plugin loader for the Nintendo 3DS
// Copyright (C) 2021 The plgldr developers
//
// This program is free software; you can redistribute it and/or
// modify it under the terms of the GNU General Public License
// as published by the Free Software Foundation; either version 2
// of the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program; if not, write to the Free Software
// Foundation, Inc., 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301, USA.

//! Host-side 3GX inspection tool: validates a container the way the
//! loader does at injection time and prints what it finds. Handy when
//! a plugin is rejected on the console and you want to know why.

extern crate plgldr;

use std::fs::File;
use std::path::Path;
use std::process::exit;

use plgldr::container;
use plgldr::error::ErrorKind;
use plgldr::inject;

// Allow dead code so that "cargo test" won't yell at us...
#[allow(dead_code)]
fn main() {
    let argv: Vec<_> = std::env::args().collect();

    if argv.len() < 2 {
        println!("Usage: {} <plugin.3gx>", argv[0]);
        println!("plgldr version {}", plgldr::VERSION);
        return;
    }

    let path = Path::new(&argv[1]);

    let mut file =
        match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                println!("Can't open {}: {}", path.display(), e);
                exit(1);
            }
        };

    match container::check_magic(&mut file) {
        Ok(()) => (),
        Err(ref e) if e.kind() == ErrorKind::PluginOutdated => {
            println!("Outdated container version, repackage the \
                      plugin ({})", e);
            exit(1);
        }
        Err(ref e) if e.kind() == ErrorKind::LoaderOutdated => {
            println!("Container version is newer than this loader \
                      ({})", e);
            exit(1);
        }
        Err(e) => {
            println!("Not a 3GX container: {}", e);
            exit(1);
        }
    }

    let file_size =
        match file.metadata() {
            Ok(m) => m.len(),
            Err(e) => {
                println!("Can't stat {}: {}", path.display(), e);
                exit(1);
            }
        };

    // The info strings and the target list can't be larger than the
    // file itself
    let mut tail = vec![0u8; file_size as usize];

    let header =
        match container::read_header(&mut file, &mut tail) {
            Ok(h) => h,
            Err(e) => {
                println!("Bad container: {}", e);
                exit(1);
            }
        };

    println!("Plugin:  {}",
             String::from_utf8_lossy(header.title(&tail)));
    println!("Author:  {}",
             String::from_utf8_lossy(header.author(&tail)));
    println!("Version: {}", header.version);

    let exe = &header.executable;

    println!("Segments: code 0x{:x}, rodata 0x{:x}, data 0x{:x}, \
              bss 0x{:x}",
             exe.code_size, exe.rodata_size, exe.data_size,
             exe.bss_size);

    match inject::exe_footprint(exe) {
        Some(footprint) =>
            println!("In-arena footprint: 0x{:x} bytes", footprint),
        None =>
            println!("Plugin doesn't fit the arena!"),
    }

    let targets = header.target_titles(&tail);

    if targets.is_empty() {
        println!("Targets: any title");
    } else {
        let titles: Vec<_> = targets.iter()
            .map(|t| format!("{:08x}", t))
            .collect();

        println!("Targets: {}", titles.join(", "));
    }
}
