mod cli;
mod commands;
mod config;
mod error;
mod output;

use clap::{ArgMatches, CommandFactory, FromArgMatches};
use tracing_subscriber::EnvFilter;

use hubwatch_core::Hub;

use crate::cli::{Cli, Command};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let matches = Cli::command().get_matches();
    let cli = Cli::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());

    init_tracing(cli.global.verbose);

    if let Err(err) = run(cli, &matches).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(mut cli: Cli, matches: &ArgMatches) -> Result<(), CliError> {
    if let Command::Completions(args) = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(args.shell, &mut cmd, "hubwatch", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config()?;
    config::apply_defaults(&mut cli.global, matches, &cfg.defaults)?;

    match cli.command {
        Command::Config(args) => commands::config_cmd::handle(args, &cli.global),

        cmd => {
            let hub_config = config::build_hub_config(&cli.global, &cfg)?;
            let global = &cli.global;

            tracing::debug!(command = ?cmd, url = %hub_config.url, "dispatching command");
            Hub::oneshot(hub_config, |hub| async move {
                commands::dispatch(cmd, &hub, global).await
            })
            .await
        }
    }
}
