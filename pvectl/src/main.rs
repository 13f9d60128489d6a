use std::io;

use anyhow::{anyhow, Result};
use clap::Parser;
use resources::{
    config::{BatchQueue, Settings},
    models::{exit_code_of, ExitCode},
    objects::TemplateConfig,
};
use termion::color;

use crate::{app::App, cli::Cli, menu::Menu};

mod app;
mod batch;
mod cli;
mod completion;
mod logging;
mod menu;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            report(&err);
            exit_code_of(&err)
        },
    };
    std::process::exit(code.code());
}

fn report(err: &anyhow::Error) {
    tracing::debug!("{:?}", err);
    if termion::is_tty(&io::stderr()) {
        eprintln!(
            "{}Error:{} {:#}",
            color::Fg(color::Red),
            color::Fg(color::Reset),
            err
        );
    } else {
        eprintln!("Error: {:#}", err);
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    if let Some(shell) = cli.completion {
        completion::print_completions(shell);
        return Ok(ExitCode::Success);
    }

    let (settings, fallback) = Settings::load(cli.settings.as_deref())?;
    logging::init(cli.debug, settings.log_file.as_deref())?;
    if let Some(err) = fallback {
        tracing::warn!("{:#}", err);
    }

    let app = App::new(settings, cli.options())?;
    if cli.list_distributions {
        print!("{}", app.distribution_table());
        return Ok(ExitCode::Success);
    }

    let config = cli.template_config(app.settings())?;
    if let Some(path) = &cli.export_config {
        config.to_conf().save(
            path,
            &format!("Template configuration exported by create-template {}", env!("CARGO_PKG_VERSION")),
        )?;
        println!("Configuration written to {}", path.display());
        return Ok(ExitCode::Success);
    }

    let result = tokio::select! {
        result = dispatch(&cli, &app, config) => result,
        _ = tokio::signal::ctrl_c() => Err(anyhow!("Interrupted")),
    };
    if let Err(err) = app.run_cleanup().await {
        tracing::error!("{:#}", err);
    }
    result
}

async fn dispatch(cli: &Cli, app: &App, config: TemplateConfig) -> Result<ExitCode> {
    if let Some(path) = &cli.batch {
        let queue = BatchQueue::load(path)?;
        tracing::info!("Processing {} queued templates from {}...", queue.len(), path.display());
        let summary = batch::run(app, &queue, &config).await;
        print!("{}", summary);
        return Ok(if summary.failed() == 0 {
            ExitCode::Success
        } else {
            ExitCode::GeneralError
        });
    }

    if cli.is_interactive() {
        let mut dialog = menu::default_dialog();
        Menu::new(app, dialog.as_mut(), config).run().await?;
        return Ok(ExitCode::Success);
    }

    let created = app.create(&config).await?;
    print!("{}", created);
    Ok(ExitCode::Success)
}
