use crate::types::{Attributes, BoundaryTable, MicroareaTable};
use anyhow::{Context, Result};
use geo::MultiPolygon;
use geojson::{Feature, FeatureCollection, GeoJson};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::info;

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create output directory: {:?}", parent))?;
        }
    }
    Ok(())
}

fn to_feature(attributes: &Attributes, geometry: &MultiPolygon<f64>) -> Feature {
    let properties: serde_json::Map<String, serde_json::Value> = attributes
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect();

    Feature {
        bbox: None,
        geometry: Some(geojson::Geometry::from(geometry)),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

pub fn boundary_features(table: &BoundaryTable) -> FeatureCollection {
    let features = table
        .records
        .iter()
        .map(|record| to_feature(&record.attributes, &record.geometry))
        .collect();
    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

/// The cluster id and member count are written over any same-named
/// attribute carried from the first member.
pub fn microarea_features(table: &MicroareaTable) -> FeatureCollection {
    let features = table
        .records
        .iter()
        .map(|record| {
            let mut feature = to_feature(&record.attributes, &record.geometry);
            if let Some(props) = feature.properties.as_mut() {
                props.insert(
                    table.cluster_column.clone(),
                    serde_json::Value::String(record.cluster.clone()),
                );
                props.insert(
                    "member_count".to_string(),
                    serde_json::Value::from(record.member_count),
                );
            }
            feature
        })
        .collect();
    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

pub fn write_geojson(path: &Path, collection: FeatureCollection) -> Result<()> {
    ensure_parent_dir(path)?;
    let count = collection.features.len();
    let file = File::create(path).with_context(|| format!("Failed to create GeoJSON file: {:?}", path))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, &GeoJson::FeatureCollection(collection))
        .with_context(|| format!("Failed to write GeoJSON: {:?}", path))?;
    writer.flush()?;
    info!("Wrote {} features to {:?}", count, path);
    Ok(())
}

/// Persist a table in the binary form the aggregator reads back.
pub fn write_table<T: Serialize>(path: &Path, table: &T) -> Result<()> {
    ensure_parent_dir(path)?;
    let file = File::create(path).with_context(|| format!("Failed to create table file: {:?}", path))?;
    let mut writer = BufWriter::new(file);
    bincode::serde::encode_into_std_write(table, &mut writer, bincode::config::standard())
        .with_context(|| format!("Failed to encode table: {:?}", path))?;
    writer.flush()?;
    info!("Wrote table to {:?}", path);
    Ok(())
}

pub fn read_table<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).with_context(|| format!("Failed to open table file: {:?}", path))?;
    let mut reader = BufReader::new(file);
    let table = bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
        .with_context(|| format!("Failed to decode table: {:?}", path))?;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::Crs;
    use crate::geometry::tests::unit_square;
    use crate::types::{AttributeValue, BoundaryRecord, MicroareaRecord};
    use tempfile::TempDir;

    fn sample_table() -> BoundaryTable {
        let mut attributes = Attributes::new();
        attributes.insert("SEZ2011".into(), AttributeValue::String("10010000001".into()));
        attributes.insert("AREA".into(), AttributeValue::Float(1.5));
        BoundaryTable {
            crs: Crs::wgs84(),
            id_column: "SEZ2011".into(),
            records: vec![BoundaryRecord {
                attributes,
                geometry: unit_square(0.0, 0.0),
            }],
        }
    }

    #[test]
    fn test_table_survives_write_and_read() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/out/table.bin");
        let table = sample_table();

        write_table(&path, &table).unwrap();
        let loaded: BoundaryTable = read_table(&path).unwrap();

        assert_eq!(loaded.crs, table.crs);
        assert_eq!(loaded.id_column, "SEZ2011");
        assert_eq!(loaded.records[0].attributes, table.records[0].attributes);
        assert_eq!(loaded.records[0].geometry, table.records[0].geometry);
    }

    #[test]
    fn test_geojson_output_is_feature_collection() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out.geojson");
        write_geojson(&path, boundary_features(&sample_table())).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let parsed: GeoJson = text.parse().unwrap();
        let GeoJson::FeatureCollection(fc) = parsed else {
            panic!("expected a FeatureCollection");
        };
        assert_eq!(fc.features.len(), 1);
        let props = fc.features[0].properties.as_ref().unwrap();
        assert_eq!(props["SEZ2011"], serde_json::json!("10010000001"));
        assert_eq!(props["AREA"], serde_json::json!(1.5));
    }

    #[test]
    fn test_microarea_features_carry_cluster() {
        let table = MicroareaTable {
            crs: Crs::wgs84(),
            cluster_column: "CLUSTER".into(),
            records: vec![MicroareaRecord {
                cluster: "C1".into(),
                member_count: 2,
                attributes: Attributes::new(),
                geometry: unit_square(0.0, 0.0),
            }],
        };
        let fc = microarea_features(&table);
        let props = fc.features[0].properties.as_ref().unwrap();
        assert_eq!(props["CLUSTER"], serde_json::json!("C1"));
        assert_eq!(props["member_count"], serde_json::json!(2));
    }
}
