//! Quay Core — remote session & command execution engine for Quay
//!
//! Turns a single long-lived interactive shell (local PTY or SSH) into a
//! serialized command/response protocol: delimiter framing with exit-code
//! capture, credential prompt answering, terminal output scrubbing, and
//! structured directory listings for the UI layer.

pub mod channel;
pub mod error;
pub mod fileops;
pub mod listing;
pub mod output;
pub mod services;
pub mod session;

/// Initialize env_logger from `RUST_LOG`. Safe to call more than once.
pub fn init_logger() {
    let _ = env_logger::Builder::from_default_env().try_init();
}
