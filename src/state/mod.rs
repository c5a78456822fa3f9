// src/state/mod.rs

pub mod handler;

pub use handler::{StateDelta, StateHandler};
