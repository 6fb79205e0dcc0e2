//! Configuration loading: a `tempo.toml`/`tempo.json` file, auto-detected
//! or given explicitly, with CLI flags taking precedence over file values
//! (§6/§10.3). Database path and listening port are the only externally
//! configurable values; everything else is a compile-time constant inside
//! `tempo-core`.
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

const DEFAULT_DB_PATH: &str = "tempo.db";
const DEFAULT_PORT: u16 = 8080;

#[derive(Parser, Debug)]
#[command(name = "tempo-server", about = "HTTP control surface for the tempo load-generation engine")]
pub struct Args {
    /// Explicit config file path (tempo.toml or tempo.json); autodetected if omitted.
    #[arg(long)]
    pub config: Option<String>,

    /// SQLite database path.
    #[arg(long)]
    pub db_path: Option<String>,

    /// Listening port.
    #[arg(long)]
    pub port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    db_path: Option<String>,
    port: Option<u16>,
}

/// The fully resolved configuration: file values overridden by CLI flags.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub port: u16,
}

impl Config {
    pub fn resolve(args: Args) -> Result<Self, String> {
        let file = load_config_file(args.config.as_deref())?;

        let db_path = args
            .db_path
            .or(file.db_path)
            .unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let port = args.port.or(file.port).unwrap_or(DEFAULT_PORT);

        Ok(Self {
            db_path: PathBuf::from(db_path),
            port,
        })
    }
}

fn load_config_file(explicit: Option<&str>) -> Result<ConfigFile, String> {
    if let Some(path) = explicit {
        return parse_config_file(Path::new(path));
    }

    let toml_path = Path::new("tempo.toml");
    if toml_path.exists() {
        return parse_config_file(toml_path);
    }
    let json_path = Path::new("tempo.json");
    if json_path.exists() {
        return parse_config_file(json_path);
    }
    Ok(ConfigFile::default())
}

fn parse_config_file(path: &Path) -> Result<ConfigFile, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|err| format!("failed to read config {}: {err}", path.display()))?;
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => {
            toml::from_str(&content).map_err(|err| format!("failed to parse {}: {err}", path.display()))
        }
        Some("json") => serde_json::from_str(&content)
            .map_err(|err| format!("failed to parse {}: {err}", path.display())),
        _ => Err(format!(
            "unsupported config extension for {}",
            path.display()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_nothing_set() {
        let args = Args {
            config: None,
            db_path: None,
            port: None,
        };
        let config = Config::resolve(args).unwrap();
        assert_eq!(config.db_path, PathBuf::from(DEFAULT_DB_PATH));
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn cli_flags_override_defaults() {
        let args = Args {
            config: None,
            db_path: Some("custom.db".to_string()),
            port: Some(9090),
        };
        let config = Config::resolve(args).unwrap();
        assert_eq!(config.db_path, PathBuf::from("custom.db"));
        assert_eq!(config.port, 9090);
    }

    #[test]
    fn explicit_missing_config_file_is_an_error() {
        let args = Args {
            config: Some("/nonexistent/tempo.toml".to_string()),
            db_path: None,
            port: None,
        };
        assert!(Config::resolve(args).is_err());
    }
}
