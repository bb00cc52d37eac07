//! Config subcommand handlers.

use crate::cli::{ConfigArgs, ConfigCommand, ConfigInitArgs, GlobalOpts, OutputFormat};
use crate::config::{self, Config, Profile};
use crate::error::CliError;
use crate::output;

const REDACTED: &str = "****";

/// Copy of `cfg` with plaintext tokens masked.
fn redacted(mut cfg: Config) -> Config {
    for profile in cfg.profiles.values_mut() {
        if profile.token.is_some() {
            profile.token = Some(REDACTED.into());
        }
    }
    cfg
}

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            output::print_output(&config::config_path().display().to_string(), global.quiet);
            Ok(())
        }

        ConfigCommand::Show => {
            let cfg = redacted(config::load_config()?);
            let rendered = match global.output {
                OutputFormat::Table | OutputFormat::Plain => {
                    toml::to_string_pretty(&cfg).map_err(|e| CliError::Config(e.to_string()))?
                }
                format => output::render_single(format, &cfg, |_| String::new(), |_| String::new()),
            };
            output::print_output(rendered.trim_end(), global.quiet);
            Ok(())
        }

        ConfigCommand::Init(init) => init_profile(&init, global),
    }
}

fn init_profile(init: &ConfigInitArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let url = global.url.as_deref().ok_or_else(|| CliError::Validation {
        field: "url".into(),
        reason: "config init needs --url <ws://host:8123/api/websocket>".into(),
    })?;
    config::parse_hub_url(url)?;

    if init.keyring && global.token.is_none() {
        return Err(CliError::Validation {
            field: "keyring".into(),
            reason: "--keyring stores the token given with --token".into(),
        });
    }

    let mut profile = Profile {
        url: url.to_owned(),
        token: None,
        token_env: init.token_env.clone(),
    };
    if let Some(ref token) = global.token {
        if init.keyring {
            config::store_token(&init.name, token)?;
            eprintln!("✓ token stored in system keyring");
        } else {
            profile.token = Some(token.clone());
        }
    } else if profile.token_env.is_none() {
        eprintln!("! no token configured; pass --token or --token-env, or set HUBWATCH_TOKEN");
    }

    let mut cfg = config::load_config()?;
    cfg.profiles.insert(init.name.clone(), profile);
    let default_missing = cfg
        .default_profile
        .as_ref()
        .is_none_or(|name| !cfg.profiles.contains_key(name));
    if init.default || default_missing {
        cfg.default_profile = Some(init.name.clone());
    }

    let path = config::save_config(&cfg)?;
    eprintln!("✓ profile '{}' written to {}", init.name, path.display());
    Ok(())
}
