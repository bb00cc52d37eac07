//! CLI configuration: thin wrapper around `hubwatch_config`.
//!
//! Adds resolution that respects `GlobalOpts` flag overrides
//! (`--url`, `--token`, `--profile`).

use clap::ArgMatches;
use clap::ValueEnum;
use clap::parser::ValueSource;
use secrecy::SecretString;

use hubwatch_core::HubConfig;

use crate::cli::{ColorMode, GlobalOpts, OutputFormat};
use crate::error::CliError;

pub use hubwatch_config::{
    Config, Defaults, Profile, config_path, load_config, parse_hub_url, resolve_token,
    save_config, store_token, to_hub_config,
};

/// Take `--output` / `--color` from `[defaults]` unless a flag or env var set them.
pub fn apply_defaults(
    global: &mut GlobalOpts,
    matches: &ArgMatches,
    defaults: &Defaults,
) -> Result<(), CliError> {
    let unset = |id: &str| matches!(matches.value_source(id), None | Some(ValueSource::DefaultValue));

    if unset("output") {
        global.output = parse_default("defaults.output", &defaults.output)?;
    }
    if unset("color") {
        global.color = parse_default::<ColorMode>("defaults.color", &defaults.color)?;
    }
    Ok(())
}

fn parse_default<T: ValueEnum>(field: &str, raw: &str) -> Result<T, CliError> {
    T::from_str(raw, true).map_err(|reason| CliError::Validation {
        field: field.into(),
        reason,
    })
}

/// Resolve the active profile name from CLI flags and config.
pub fn active_profile_name(global: &GlobalOpts, config: &Config) -> String {
    global
        .profile
        .clone()
        .or_else(|| config.default_profile.clone())
        .unwrap_or_else(|| "default".into())
}

/// Build a `HubConfig` from the config file, the active profile, and flags.
///
/// Flags win over the profile. Without a profile, `--url` and `--token`
/// alone are enough.
pub fn build_hub_config(global: &GlobalOpts, cfg: &Config) -> Result<HubConfig, CliError> {
    let profile_name = active_profile_name(global, cfg);
    let profile = cfg.profiles.get(&profile_name);

    // A profile named explicitly must exist.
    if profile.is_none() && global.profile.is_some() {
        return Err(CliError::ProfileNotFound {
            name: profile_name,
            available: available_profiles(cfg),
        });
    }

    // 1. URL (flag > env > profile)
    let url_str = match (global.url.as_deref(), profile) {
        (Some(url), _) => url,
        (None, Some(profile)) => profile.url.as_str(),
        (None, None) => {
            return Err(CliError::NoConfig {
                path: config_path().display().to_string(),
            });
        }
    };
    let url = parse_hub_url(url_str)?;

    // 2. Token (flag > env > profile chain)
    let token = match (&global.token, profile) {
        (Some(token), _) => SecretString::from(token.clone()),
        (None, Some(profile)) => resolve_token(profile, &profile_name)?,
        (None, None) => {
            return Err(CliError::NoCredentials {
                profile: profile_name,
            });
        }
    };

    let config = to_hub_config(url, token, &cfg.engine);
    config.validate()?;
    Ok(config)
}

fn available_profiles(cfg: &Config) -> String {
    if cfg.profiles.is_empty() {
        "(none)".into()
    } else {
        cfg.profiles.keys().cloned().collect::<Vec<_>>().join(", ")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn global() -> GlobalOpts {
        GlobalOpts {
            profile: None,
            url: None,
            token: None,
            output: OutputFormat::Table,
            color: ColorMode::Never,
            verbose: 0,
            quiet: false,
        }
    }

    fn with_profile() -> Config {
        let mut cfg = Config::default();
        cfg.profiles.insert(
            "default".into(),
            Profile {
                url: "ws://hub.local:8123/api/websocket".into(),
                token: Some("file-token".into()),
                token_env: None,
            },
        );
        cfg
    }

    #[test]
    fn flags_alone_are_enough() {
        let mut g = global();
        g.url = Some("ws://10.0.0.2:8123/api/websocket".into());
        g.token = Some("flag-token".into());

        let config = build_hub_config(&g, &Config::default()).unwrap();
        assert_eq!(config.url.host_str(), Some("10.0.0.2"));
        assert_eq!(config.access_token.expose_secret(), "flag-token");
    }

    #[test]
    fn flags_override_the_profile() {
        let mut g = global();
        g.token = Some("flag-token".into());

        let config = build_hub_config(&g, &with_profile()).unwrap();
        assert_eq!(config.url.host_str(), Some("hub.local"));
        assert_eq!(config.access_token.expose_secret(), "flag-token");
    }

    #[test]
    fn nothing_configured_is_no_config() {
        assert!(matches!(
            build_hub_config(&global(), &Config::default()),
            Err(CliError::NoConfig { .. })
        ));
    }

    #[test]
    fn url_without_token_is_no_credentials() {
        let mut g = global();
        g.url = Some("ws://hub.local/api/websocket".into());
        assert!(matches!(
            build_hub_config(&g, &Config::default()),
            Err(CliError::NoCredentials { .. })
        ));
    }

    #[test]
    fn config_defaults_fill_only_unset_flags() {
        use clap::{CommandFactory, FromArgMatches};

        let defaults = Defaults {
            output: "json".into(),
            color: "never".into(),
        };
        let resolve = |args: &[&str]| {
            let matches = crate::cli::Cli::command().try_get_matches_from(args).unwrap();
            let mut cli = crate::cli::Cli::from_arg_matches(&matches).unwrap();
            apply_defaults(&mut cli.global, &matches, &defaults).unwrap();
            (cli.global.output, cli.global.color)
        };

        assert_eq!(resolve(&["hubwatch", "status"]), (OutputFormat::Json, ColorMode::Never));
        assert_eq!(
            resolve(&["hubwatch", "status", "-o", "yaml", "--color", "always"]),
            (OutputFormat::Yaml, ColorMode::Always)
        );
    }

    #[test]
    fn unknown_default_output_is_a_validation_error() {
        use clap::CommandFactory;

        let matches = crate::cli::Cli::command()
            .try_get_matches_from(["hubwatch", "status"])
            .unwrap();
        let defaults = Defaults {
            output: "xml".into(),
            color: "auto".into(),
        };
        let err = apply_defaults(&mut global(), &matches, &defaults).unwrap_err();
        assert!(matches!(err, CliError::Validation { ref field, .. } if field == "defaults.output"));
    }

    #[test]
    fn unknown_explicit_profile_lists_the_known_ones() {
        let mut g = global();
        g.profile = Some("garage".into());
        let Err(CliError::ProfileNotFound { name, available }) = build_hub_config(&g, &with_profile())
        else {
            panic!("expected ProfileNotFound");
        };
        assert_eq!(name, "garage");
        assert_eq!(available, "default");
    }
}
