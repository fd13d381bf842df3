//! Live session orchestration: lifecycle state machine, capture dispatch and
//! inbound playback routing.

mod capture_loop;
mod controller;
mod state;

pub use controller::{SessionController, SessionOptions};
pub use state::{AppMode, Command, ConnectionState, UiSnapshot};
