//! Library root: the evdev -> uinput injection core.
//!
//! The CLI (`main.rs`) is a thin wrapper around this crate's public surface:
//! load a mapping file, find the hardware device's event nodes, spawn an
//! [`injector::Injector`] for it, and stop it on shutdown.

pub mod classifier;
pub mod device;
pub mod error;
pub mod injector;
pub mod keycodes;
pub mod keys;
pub mod macros;
pub mod mapping;
pub mod numlock;
pub mod producer;
pub mod tracker;

pub use error::{CoreError, CoreResult};
