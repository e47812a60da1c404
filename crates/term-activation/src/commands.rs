//! Turning an environment's activation metadata into terminal input.

use env_registry::{CommandLine, PythonEnvironment, ShellKind};

fn quote(part: &str) -> String {
    if part.contains(' ') && !(part.starts_with('"') && part.ends_with('"')) {
        format!("\"{part}\"")
    } else {
        part.to_string()
    }
}

/// `executable arg1 arg2...`, quoting any part that contains a space.
pub fn render(command: &CommandLine) -> String {
    std::iter::once(command.executable.as_str())
        .chain(command.args.iter().map(String::as_str))
        .map(quote)
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn activation_commands(environment: &PythonEnvironment, shell: ShellKind) -> Vec<String> {
    environment
        .exec_info
        .as_ref()
        .and_then(|info| info.activation_for(shell))
        .map(|commands| commands.iter().map(render).collect())
        .unwrap_or_default()
}

pub fn deactivation_commands(environment: &PythonEnvironment, shell: ShellKind) -> Vec<String> {
    environment
        .exec_info
        .as_ref()
        .and_then(|info| info.deactivation_for(shell))
        .map(|commands| commands.iter().map(render).collect())
        .unwrap_or_default()
}
