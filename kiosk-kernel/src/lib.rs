//! Kiosk kernel: command dispatch and migration orchestration for a kiosk fleet.
//!
//! Devices poll over HTTP (`/heartbeat`, `/claim`, `/report`); operators drive
//! control commands and bulk migrations through the admin surface. All state
//! lives in SQLite behind the store traits.

pub mod config;
pub mod context;
pub mod controls;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod migration;
pub mod models;
pub mod status;
pub mod store;
pub mod sweeper;

pub use error::{DispatchError, DispatchResult};
