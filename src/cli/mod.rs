//! CLI argument definitions
//!
//! The top-level [`Cli`] and [`Commands`] live in `args`; the `daemon`
//! subcommand tree lives in `daemon_args`. Handler functions are in
//! `crate::handlers`.

pub mod args;
pub mod daemon_args;

pub use args::{Cli, Commands};
pub use daemon_args::DaemonCommands;
