//! Connection-level orchestration: the turn loop and tunnel forwarding.

mod communication;
mod tunnel;

pub use communication::{Communication, ConnectionHost};
