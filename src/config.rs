use crate::crs::Crs;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub merge: MergeConfig,
    pub aggregate: AggregateConfig,
    pub simplify: SimplifyConfig,
    pub crs: CrsConfig,
}

/// Root directories. Every file name below is resolved against one of them.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PathsConfig {
    pub raw_dir: PathBuf,
    pub clean_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MergeConfig {
    /// Directory under `raw_dir` holding one sub-directory per region.
    pub boundaries_dir: PathBuf,
    pub pattern: String,
    pub id_column: String,
    pub string_columns: Vec<String>,
    pub table_output: PathBuf,
    pub full_geojson_output: PathBuf,
    pub simplified_geojson_output: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnmatchedPolicy {
    /// Nanoareas without a cluster are left out of the dissolve.
    #[default]
    Drop,
    /// Nanoareas without a cluster are dissolved under `unassigned_label`.
    Retain,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AggregateConfig {
    pub cluster_definitions: PathBuf,
    pub sheet: String,
    pub join_column: String,
    pub cluster_column: String,
    pub unmatched: UnmatchedPolicy,
    pub unassigned_label: String,
    pub table_output: PathBuf,
    pub full_geojson_output: PathBuf,
    pub simplified_geojson_output: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimplifyConfig {
    pub tolerance: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CrsConfig {
    pub target: Crs,
    /// Used for shapefiles without a recognisable `.prj`.
    pub fallback_source: Crs,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            raw_dir: PathBuf::from("data/raw"),
            clean_dir: PathBuf::from("data/clean"),
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            boundaries_dir: PathBuf::from("SEZ2011"),
            pattern: "*/*.shp".to_string(),
            id_column: "SEZ2011".to_string(),
            string_columns: ["SEZ2011", "LOC2011", "COD_ISTAT", "COD_REG"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            table_output: PathBuf::from("italy_nanoarea_shape.bin"),
            full_geojson_output: PathBuf::from("italy_nanoarea_shape_full.geojson"),
            simplified_geojson_output: PathBuf::from("italy_nanoarea_shape.geojson"),
        }
    }
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            cluster_definitions: PathBuf::from("cluster_def_05_08_2019.xlsx"),
            sheet: "cluster_def_05_08_2019".to_string(),
            join_column: "SEZ2011".to_string(),
            cluster_column: "CLUSTER".to_string(),
            unmatched: UnmatchedPolicy::Drop,
            unassigned_label: "UNASSIGNED".to_string(),
            table_output: PathBuf::from("microareas_full.bin"),
            full_geojson_output: PathBuf::from("microareas_full.geojson"),
            simplified_geojson_output: PathBuf::from("microareas.geojson"),
        }
    }
}

impl Default for SimplifyConfig {
    fn default() -> Self {
        Self { tolerance: 1e-3 }
    }
}

impl Default for CrsConfig {
    fn default() -> Self {
        Self {
            target: Crs::wgs84(),
            fallback_source: Crs::from_epsg(32632),
        }
    }
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let tolerance = self.simplify.tolerance;
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(anyhow!("Simplify tolerance must be finite and >= 0, got {}", tolerance));
        }
        if self.merge.id_column.is_empty() || self.aggregate.cluster_column.is_empty() {
            return Err(anyhow!("Identifier and cluster column names must not be empty"));
        }
        Ok(())
    }

    pub fn boundaries_dir(&self) -> PathBuf {
        self.paths.raw_dir.join(&self.merge.boundaries_dir)
    }

    pub fn cluster_definitions_path(&self) -> PathBuf {
        self.paths.raw_dir.join(&self.aggregate.cluster_definitions)
    }

    pub fn clean_path(&self, file: &Path) -> PathBuf {
        self.paths.clean_dir.join(file)
    }
}
