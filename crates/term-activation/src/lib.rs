//! Activating Python environments in terminals.
//!
//! [`ActivationController`] decides when and how to run an environment's
//! activation commands in a terminal, tracks which environment each terminal
//! is running against, and reports changes. Commands go through shell
//! integration when the terminal offers it (each one awaited before the
//! next) and are typed in as plain text otherwise.

pub mod commands;
pub mod controller;
pub mod terminal;

pub use commands::{activation_commands, deactivation_commands, render};
pub use controller::{
    ActivationConfig, ActivationController, ActivationStateChanged, AutoActivation,
    SHELL_INTEGRATION_POLL_INTERVAL, SHELL_INTEGRATION_TIMEOUT,
};
pub use terminal::{
    CommandCompletion, EnvironmentSource, ShellIntegration, Terminal, TerminalEvent, TerminalHost,
    TerminalId, TerminalOptions,
};
