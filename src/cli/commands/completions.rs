//! Completions command - print a shell completion script

use crate::cli::args::Cli;
use clap::CommandFactory;
use clap_complete::{generate, Shell};
use std::io;

/// Execute the completions command
pub fn execute(shell: Shell) {
    let mut command = Cli::command();
    generate(shell, &mut command, "kcache", &mut io::stdout());
}
