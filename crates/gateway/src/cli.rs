//! Command-line surface and config loading.

use std::path::PathBuf;

use bc_domain::{Config, Error, Result};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "beamcode", about = "Multi-backend agent-session broker")]
pub struct Cli {
    /// Path to the TOML config file. Falls back to `BEAMCODE_CONFIG`, then
    /// `./beamcode.toml`, then built-in defaults.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the broker (default).
    Serve,
    /// Config inspection.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config and report problems.
    Validate,
    /// Print the effective config.
    Show,
}

/// Resolve and load the config file. A missing file yields defaults; a file
/// that exists but does not parse is an error.
pub fn load_config(cli_path: Option<&PathBuf>) -> Result<(Config, Option<PathBuf>)> {
    let path = cli_path
        .cloned()
        .or_else(|| std::env::var("BEAMCODE_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("beamcode.toml"));

    if !path.exists() {
        if cli_path.is_some() {
            return Err(Error::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        return Ok((Config::default(), None));
    }

    let raw = std::fs::read_to_string(&path)?;
    let config: Config = toml::from_str(&raw)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    Ok((config, Some(path)))
}

pub fn validate(config: &Config, path: Option<&PathBuf>) -> bool {
    let mut ok = true;
    match path {
        Some(path) => println!("config: {}", path.display()),
        None => println!("config: built-in defaults"),
    }
    if config.broker.max_consumer_message_size == 0 {
        println!("error: broker.max_consumer_message_size must be > 0");
        ok = false;
    }
    if config.broker.rate_limit_capacity == 0 {
        println!("error: broker.rate_limit_capacity must be > 0");
        ok = false;
    }
    if config.supervisor.breaker.failure_threshold == 0 {
        println!("error: supervisor.breaker.failure_threshold must be > 0");
        ok = false;
    }
    for (name, adapter) in &config.adapters {
        if name == "remote" && adapter.url.is_none() {
            println!("warning: adapters.remote has no url; adapter disabled");
        }
    }
    if ok {
        println!("ok");
    }
    ok
}

pub fn show(config: &Config) {
    match toml::to_string_pretty(config) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => println!("failed to render config: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_default_config_falls_back() {
        let (config, path) = load_config(None).unwrap();
        assert!(config.broker.rate_limit_capacity > 0);
        // No explicit path requested, so no file is required.
        let _ = path;
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let missing = PathBuf::from("/definitely/not/here/beamcode.toml");
        assert!(load_config(Some(&missing)).is_err());
    }

    #[test]
    fn config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beamcode.toml");
        std::fs::write(&path, "[server]\nport = 4000\n").unwrap();
        let (config, loaded) = load_config(Some(&path)).unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(loaded, Some(path));
    }

    #[test]
    fn validate_flags_zero_limits() {
        let mut config = Config::default();
        config.broker.rate_limit_capacity = 0;
        assert!(!validate(&config, None));
        assert!(validate(&Config::default(), None));
    }
}
