//! Implementation of pylon CLI commands.

pub mod wait;
pub mod watch;
