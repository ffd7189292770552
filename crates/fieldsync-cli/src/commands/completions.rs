use std::io::{self, Write};
use std::path::Path;

use clap::CommandFactory;
use clap_complete::{generate, Shell};

use crate::cli::{Cli, CompletionShell};
use crate::error::CliError;

impl From<CompletionShell> for Shell {
    fn from(shell: CompletionShell) -> Self {
        match shell {
            CompletionShell::Bash => Self::Bash,
            CompletionShell::Zsh => Self::Zsh,
            CompletionShell::Fish => Self::Fish,
            CompletionShell::PowerShell => Self::PowerShell,
        }
    }
}

/// Line that loads a completion file written to `path`.
pub fn load_hint(shell: CompletionShell, path: &Path) -> String {
    let path = path.display();
    match shell {
        CompletionShell::Bash | CompletionShell::Zsh | CompletionShell::Fish => {
            format!("source {path}")
        }
        CompletionShell::PowerShell => format!(". {path}"),
    }
}

/// Render the completion script for `shell`, to `output_path` or stdout.
///
/// A file target also gets its load line on stderr.
pub fn run_completions(shell: CompletionShell, output_path: Option<&Path>) -> Result<(), CliError> {
    let mut command = Cli::command();
    let bin_name = command.get_name().to_string();
    let mut script = Vec::new();
    generate(Shell::from(shell), &mut command, bin_name, &mut script);

    match output_path {
        Some(path) => {
            std::fs::write(path, &script)?;
            println!("{}", path.display());
            eprintln!("Load fieldsync completions with: {}", load_hint(shell, path));
        }
        None => io::stdout().write_all(&script)?,
    }
    Ok(())
}
