//! Stage implementations registered by the binary

pub mod command;

pub use command::{registry_from_config, CommandStage};
