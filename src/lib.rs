pub mod apply;
pub mod backend;
pub mod config;
pub mod errors;
pub mod hooks;
pub mod ipc;
pub mod matcher;
pub mod mode;
pub mod model;
pub mod profile;
pub mod protocols;
pub mod session;
pub mod state;

pub use errors::{ControlError, PerchError, Result};
pub use state::Perch;
