use std::io;

use clap::CommandFactory;
use clap_complete::{
    generate,
    shells::{Bash, Elvish, Fish, PowerShell, Shell, Zsh},
};

use crate::cli::Cli;

const BIN_NAME: &str = "create-template";

pub fn print_completions(shell: Shell) {
    let app = &mut Cli::command();
    let buf = &mut io::stdout();
    match shell {
        Shell::Bash => generate(Bash, app, BIN_NAME, buf),
        Shell::Elvish => generate(Elvish, app, BIN_NAME, buf),
        Shell::Fish => generate(Fish, app, BIN_NAME, buf),
        Shell::PowerShell => generate(PowerShell, app, BIN_NAME, buf),
        Shell::Zsh => generate(Zsh, app, BIN_NAME, buf),
        _ => eprintln!("Unsupported shell {}", shell),
    }
}
