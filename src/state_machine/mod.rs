//! State machines driving the presentation layer.

pub mod console_sm;

pub use console_sm::{ConsoleEvent, ConsoleMachine, Session};
