//! qemu-manager library: QEMU command construction, emulator process
//! supervision, settings, and the interactive console built on top.

pub mod config;
pub mod console;
pub mod logging;
pub mod paths;
pub mod state_machine;
pub mod vm;
