pub mod config;
pub mod crs;
pub mod data;
pub mod error;
pub mod export;
pub mod geometry;
pub mod pipeline;
pub mod processing;
pub mod types;

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "config.toml";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration; built-in defaults are used when the default file is absent
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG, global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct Overrides {
    /// Directory holding the raw boundary files and cluster definitions
    #[arg(long, value_name = "DIR")]
    raw_dir: Option<PathBuf>,
    /// Directory the merged and aggregated outputs are written to
    #[arg(long, value_name = "DIR")]
    clean_dir: Option<PathBuf>,
    /// Simplification tolerance, in target CRS units
    #[arg(long)]
    tolerance: Option<f64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge per-region nanoarea boundaries into one dataset
    Merge(Overrides),
    /// Dissolve merged nanoareas into microarea polygons
    Aggregate(Overrides),
    /// Run merge followed by aggregate
    Run(Overrides),
}

impl Commands {
    fn overrides(&self) -> &Overrides {
        match self {
            Commands::Merge(o) | Commands::Aggregate(o) | Commands::Run(o) => o,
        }
    }
}

/// The config file to read. A missing `config.toml` in the working
/// directory means built-in defaults; any other missing path is left for
/// `load_from_file` to report.
fn resolve_config_path(path: &Path) -> Option<&Path> {
    if path == Path::new(DEFAULT_CONFIG) && !path.exists() {
        None
    } else {
        Some(path)
    }
}

fn load_config(path: Option<&Path>, overrides: &Overrides) -> anyhow::Result<config::AppConfig> {
    let mut app_config = match path {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            config::AppConfig::load_from_file(path)?
        }
        None => {
            info!("No {} found, using built-in defaults", DEFAULT_CONFIG);
            config::AppConfig::default()
        }
    };
    if let Some(dir) = &overrides.raw_dir {
        app_config.paths.raw_dir = dir.clone();
    }
    if let Some(dir) = &overrides.clean_dir {
        app_config.paths.clean_dir = dir.clone();
    }
    if let Some(tolerance) = overrides.tolerance {
        app_config.simplify.tolerance = tolerance;
    }
    app_config.validate()?;
    Ok(app_config)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let app_config = load_config(resolve_config_path(&cli.config), cli.command.overrides())?;

    match &cli.command {
        Commands::Merge(_) => {
            pipeline::run_merge(&app_config)?;
        }
        Commands::Aggregate(_) => {
            pipeline::run_aggregate(&app_config)?;
        }
        Commands::Run(_) => {
            pipeline::run_merge(&app_config)?;
            pipeline::run_aggregate(&app_config)?;
        }
    }

    info!("Done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_overrides_apply() {
        let cli = Cli::parse_from([
            "istat-microareas",
            "merge",
            "--raw-dir",
            "/tmp/raw",
            "--tolerance",
            "0.01",
        ]);
        let config = load_config(None, cli.command.overrides()).unwrap();
        assert_eq!(config.paths.raw_dir, PathBuf::from("/tmp/raw"));
        assert_eq!(config.paths.clean_dir, PathBuf::from("data/clean"));
        assert_eq!(config.simplify.tolerance, 0.01);
    }

    #[test]
    fn test_negative_tolerance_override_rejected() {
        let overrides = Overrides {
            tolerance: Some(-0.5),
            ..Default::default()
        };
        assert!(load_config(None, &overrides).is_err());
    }

    #[test]
    fn test_config_defaults_to_config_toml() {
        let cli = Cli::parse_from(["istat-microareas", "run"]);
        assert_eq!(cli.config, PathBuf::from("config.toml"));

        let cli = Cli::parse_from(["istat-microareas", "merge", "--config", "other.toml"]);
        assert_eq!(cli.config, PathBuf::from("other.toml"));
    }

    #[test]
    fn test_explicit_config_is_loaded_and_must_exist() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("pipeline.toml");
        std::fs::write(&path, "[simplify]\ntolerance = 0.5\n").unwrap();

        assert_eq!(resolve_config_path(&path), Some(path.as_path()));
        let config = load_config(resolve_config_path(&path), &Overrides::default()).unwrap();
        assert_eq!(config.simplify.tolerance, 0.5);

        let missing = tmp.path().join("missing.toml");
        assert!(load_config(resolve_config_path(&missing), &Overrides::default()).is_err());
    }

    #[test]
    fn test_default_config_path_is_read_when_present() {
        // cargo runs tests from the package root, next to the shipped config.toml.
        let default = Path::new(DEFAULT_CONFIG);
        assert_eq!(resolve_config_path(default), Some(default));
        let config = load_config(resolve_config_path(default), &Overrides::default()).unwrap();
        assert_eq!(config.aggregate.sheet, "cluster_def_05_08_2019");
    }
}
