#[macro_use]
extern crate log;
extern crate arrayvec;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;

#[cfg(test)]
extern crate tempdir;

pub mod arena;
pub mod container;
pub mod error;
pub mod frontend;
pub mod inject;
pub mod kernel;
pub mod locator;
pub mod rendezvous;
pub mod sdmc;
pub mod service;

// `VERSION` string and the packed `VERSION_WORD` returned by the
// GetVersion command, generated by the build script
include!(concat!(env!("OUT_DIR"), "/version.rs"));
