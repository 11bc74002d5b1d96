//! Front-door multiplexer.
//!
//! Routes each connection on the public port to a backend by inspecting its
//! first bytes. No protocol is terminated here.

pub mod classify;
pub mod listener;

pub use classify::{Classification, Classifier, MuxRule, Verdict};
pub use listener::{MuxConfig, MuxListener, MuxStats};
