#![warn(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

pub mod agent;
pub mod channels;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod host;
pub mod ipc;
pub mod plugins;
pub mod queue;
pub mod tasks;
pub mod tools;
pub mod util;
