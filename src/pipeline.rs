//! The two batch jobs, end to end: load, transform, write.

use crate::config::AppConfig;
use crate::data;
use crate::export;
use crate::processing::{self, MergeOptions};
use crate::types::{BoundaryTable, MicroareaTable};
use anyhow::Result;
use tracing::info;

/// Merge every per-region boundary file into the nanoarea table and write
/// the full and simplified outputs.
pub fn run_merge(config: &AppConfig) -> Result<BoundaryTable> {
    let files = data::discover_boundary_files(&config.boundaries_dir(), &config.merge.pattern)?;
    info!("Reading {} boundary files", files.len());

    let sets = files
        .iter()
        .map(|path| data::load_boundary_file(path, config.crs.fallback_source))
        .collect::<Result<Vec<_>>>()?;

    info!("Converting CRS to {}", config.crs.target);
    let table = processing::merge_boundaries(
        sets,
        &MergeOptions {
            target_crs: config.crs.target,
            id_column: &config.merge.id_column,
            string_columns: &config.merge.string_columns,
        },
    )?;

    let simplified = processing::simplify_boundaries(&table, config.simplify.tolerance);

    info!("Exporting nanoarea data");
    export::write_table(&config.clean_path(&config.merge.table_output), &table)?;
    export::write_geojson(
        &config.clean_path(&config.merge.full_geojson_output),
        export::boundary_features(&table),
    )?;
    export::write_geojson(
        &config.clean_path(&config.merge.simplified_geojson_output),
        export::boundary_features(&simplified),
    )?;

    Ok(table)
}

/// Dissolve the merged nanoareas into one polygon per cluster and write the
/// full and simplified outputs.
pub fn run_aggregate(config: &AppConfig) -> Result<MicroareaTable> {
    let table: BoundaryTable = export::read_table(&config.clean_path(&config.merge.table_output))?;
    info!("Loaded {} nanoareas", table.len());

    let aggregate = &config.aggregate;
    let clusters = data::load_cluster_definitions(
        &config.cluster_definitions_path(),
        &aggregate.sheet,
        &aggregate.join_column,
    )?;

    let joined = processing::join_clusters(&table, &clusters, &aggregate.cluster_column);
    let repaired = processing::repair_records(joined, &table.id_column)?;
    let microareas = processing::dissolve(
        repaired,
        table.crs,
        &aggregate.cluster_column,
        aggregate.unmatched,
        &aggregate.unassigned_label,
    );

    export::write_geojson(
        &config.clean_path(&aggregate.full_geojson_output),
        export::microarea_features(&microareas),
    )?;
    export::write_table(&config.clean_path(&aggregate.table_output), &microareas)?;

    let simplified = processing::simplify_microareas(&microareas, config.simplify.tolerance);
    export::write_geojson(
        &config.clean_path(&aggregate.simplified_geojson_output),
        export::microarea_features(&simplified),
    )?;

    Ok(microareas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UnmatchedPolicy;
    use crate::types::AttributeValue;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn square_feature(id: u64, x: f64, y: f64) -> String {
        format!(
            r#"{{"type":"Feature","properties":{{"SEZ2011":{id},"LOC2011":{loc},"COD_ISTAT":1001,"COD_REG":1}},
               "geometry":{{"type":"Polygon","coordinates":[[[{x0},{y0}],[{x1},{y0}],[{x1},{y1}],[{x0},{y1}],[{x0},{y0}]]]}}}}"#,
            id = id,
            loc = id / 10,
            x0 = x,
            y0 = y,
            x1 = x + 1.0,
            y1 = y + 1.0,
        )
    }

    fn write_region(dir: &Path, region: &str, features: &[String]) {
        let region_dir = dir.join(region);
        fs::create_dir_all(&region_dir).unwrap();
        let body = format!(
            r#"{{"type":"FeatureCollection","features":[{}]}}"#,
            features.join(",")
        );
        fs::write(region_dir.join(format!("{region}.geojson")), body).unwrap();
    }

    fn test_config(root: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.paths.raw_dir = root.join("raw");
        config.paths.clean_dir = root.join("clean");
        config.merge.pattern = "*/*.geojson".to_string();
        config.aggregate.cluster_definitions = PathBuf::from("clusters.csv");
        config
    }

    fn setup(root: &Path) -> AppConfig {
        let config = test_config(root);
        let boundaries = config.boundaries_dir();
        write_region(&boundaries, "R02", &[square_feature(20, 5.0, 5.0)]);
        write_region(
            &boundaries,
            "R01",
            &[square_feature(11, 1.0, 0.0), square_feature(10, 0.0, 0.0)],
        );
        fs::write(
            config.cluster_definitions_path(),
            "SEZ2011,CLUSTER\n10,C1\n11,C1\n20,C2\n",
        )
        .unwrap();
        config
    }

    #[test]
    fn test_merge_then_aggregate() {
        let tmp = TempDir::new().unwrap();
        let config = setup(tmp.path());

        let nanoareas = run_merge(&config).unwrap();
        assert_eq!(nanoareas.len(), 3);
        let ids: Vec<&AttributeValue> = nanoareas.records.iter().map(|r| &r.attributes["SEZ2011"]).collect();
        assert_eq!(
            ids,
            vec![
                &AttributeValue::String("10".into()),
                &AttributeValue::String("11".into()),
                &AttributeValue::String("20".into()),
            ]
        );
        for output in [
            &config.merge.table_output,
            &config.merge.full_geojson_output,
            &config.merge.simplified_geojson_output,
        ] {
            assert!(config.clean_path(output).exists(), "missing {:?}", output);
        }

        let microareas = run_aggregate(&config).unwrap();
        assert_eq!(microareas.records.len(), 2);
        assert_eq!(microareas.records[0].cluster, "C1");
        assert!((crate::geometry::area(&microareas.records[0].geometry) - 2.0).abs() < 1e-9);
        assert_eq!(microareas.records[1].cluster, "C2");
        assert!((crate::geometry::area(&microareas.records[1].geometry) - 1.0).abs() < 1e-9);

        let stored: MicroareaTable =
            export::read_table(&config.clean_path(&config.aggregate.table_output)).unwrap();
        assert_eq!(stored.records.len(), 2);
        assert!(config
            .clean_path(&config.aggregate.simplified_geojson_output)
            .exists());
        assert!(config.clean_path(&config.aggregate.full_geojson_output).exists());
    }

    #[test]
    fn test_aggregate_retains_unmatched_when_configured() {
        let tmp = TempDir::new().unwrap();
        let mut config = setup(tmp.path());
        fs::write(config.cluster_definitions_path(), "SEZ2011,CLUSTER\n10,C1\n").unwrap();
        config.aggregate.unmatched = UnmatchedPolicy::Retain;

        run_merge(&config).unwrap();
        let microareas = run_aggregate(&config).unwrap();

        let clusters: Vec<&str> = microareas.records.iter().map(|r| r.cluster.as_str()).collect();
        assert_eq!(clusters, vec!["C1", "UNASSIGNED"]);
        assert_eq!(microareas.records[1].member_count, 2);
    }

    #[test]
    fn test_merge_without_inputs_fails() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        assert!(run_merge(&config).is_err());
        assert!(!config.clean_path(&config.merge.table_output).exists());
    }
}
