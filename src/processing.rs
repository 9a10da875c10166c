use crate::config::UnmatchedPolicy;
use crate::crs::{Crs, Reprojector};
use crate::data::LoadedBoundaries;
use crate::error::PipelineError;
use crate::geometry;
use crate::types::{
    AttributeValue, Attributes, BoundaryRecord, BoundaryTable, ClusterTable, MicroareaRecord,
    MicroareaTable,
};
use anyhow::{Context, Result};
use geo::MultiPolygon;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

pub struct MergeOptions<'a> {
    pub target_crs: Crs,
    pub id_column: &'a str,
    pub string_columns: &'a [String],
}

/// Concatenate per-region record sets into one table: reprojected to the
/// target CRS, sorted by identifier, identifier unique, configured columns
/// coerced to strings.
pub fn merge_boundaries(sets: Vec<LoadedBoundaries>, options: &MergeOptions) -> Result<BoundaryTable> {
    let expected: usize = sets.iter().map(|s| s.records.len()).sum();
    let mut records = Vec::with_capacity(expected);

    for set in sets {
        debug!("{} records from {:?} in {}", set.records.len(), set.path, set.crs);
        let reprojector = Reprojector::new(set.crs, options.target_crs)
            .with_context(|| format!("Cannot reproject {:?}", set.path))?;
        if reprojector.is_identity() {
            records.extend(set.records);
        } else {
            let reprojected: Vec<BoundaryRecord> = set
                .records
                .into_par_iter()
                .map(|record| BoundaryRecord {
                    geometry: reprojector.transform(&record.geometry),
                    attributes: record.attributes,
                })
                .collect();
            records.extend(reprojected);
        }
    }

    for record in &records {
        if !record.attributes.contains_key(options.id_column) {
            return Err(PipelineError::MissingColumn {
                column: options.id_column.to_string(),
                location: "boundary records".to_string(),
            }
            .into());
        }
    }

    // Sort on the typed values so numeric identifiers keep numeric order.
    records.sort_by(|a, b| a.attributes[options.id_column].sort_cmp(&b.attributes[options.id_column]));

    // Keys are compared after string coercion: Int(7) and "7" collide.
    let mut seen = HashSet::with_capacity(records.len());
    for record in &records {
        let key = record.attributes[options.id_column].to_key();
        if !seen.insert(key.clone()) {
            return Err(PipelineError::DuplicateId {
                column: options.id_column.to_string(),
                id: key,
            }
            .into());
        }
    }

    for record in &mut records {
        for column in options.string_columns {
            let value = record
                .attributes
                .get_mut(column)
                .ok_or_else(|| PipelineError::MissingColumn {
                    column: column.clone(),
                    location: "boundary records".to_string(),
                })?;
            *value = value.coerce_to_string();
        }
    }

    info!("Merged {} nanoareas into {}", records.len(), options.target_crs);

    Ok(BoundaryTable {
        crs: options.target_crs,
        id_column: options.id_column.to_string(),
        records,
    })
}

pub fn simplify_boundaries(table: &BoundaryTable, tolerance: f64) -> BoundaryTable {
    let records = table
        .records
        .par_iter()
        .map(|record| BoundaryRecord {
            attributes: record.attributes.clone(),
            geometry: geometry::simplify_preserving(&record.geometry, tolerance),
        })
        .collect();
    BoundaryTable {
        crs: table.crs,
        id_column: table.id_column.clone(),
        records,
    }
}

/// A nanoarea after the left join. `cluster` is `None` when the cluster
/// table has no row for it.
#[derive(Debug, Clone)]
pub struct JoinedRecord {
    pub cluster: Option<String>,
    pub attributes: Attributes,
    pub geometry: MultiPolygon<f64>,
}

/// Left join on the string form of the identifier. Matched records gain
/// the cluster table's columns; the boundary's own values win on clashes.
pub fn join_clusters(table: &BoundaryTable, clusters: &ClusterTable, cluster_column: &str) -> Vec<JoinedRecord> {
    table
        .records
        .iter()
        .map(|record| {
            let key = table.id_of(record).map(AttributeValue::to_key);
            let mut attributes = record.attributes.clone();
            let row = key.as_ref().and_then(|k| clusters.rows.get(k));

            let cluster = row.and_then(|row| {
                for (name, value) in row {
                    attributes.entry(name.clone()).or_insert_with(|| value.clone());
                }
                row.get(cluster_column)
                    .filter(|value| !value.is_null())
                    .map(AttributeValue::to_key)
            });

            JoinedRecord {
                cluster,
                attributes,
                geometry: record.geometry.clone(),
            }
        })
        .collect()
}

/// Repair every geometry. A geometry that is still invalid afterwards
/// aborts with the offending identifier.
pub fn repair_records(records: Vec<JoinedRecord>, id_column: &str) -> Result<Vec<JoinedRecord>> {
    records
        .into_par_iter()
        .map(|mut record| -> Result<JoinedRecord> {
            let repaired = geometry::repair_geometry(&record.geometry);
            if !geometry::is_valid(&repaired) {
                let id = record
                    .attributes
                    .get(id_column)
                    .map(AttributeValue::to_key)
                    .unwrap_or_default();
                return Err(PipelineError::InvalidGeometry { id }.into());
            }
            record.geometry = repaired;
            Ok(record)
        })
        .collect()
}

/// Group by cluster id and union each group's geometries. Output is sorted
/// by cluster id.
pub fn dissolve(
    records: Vec<JoinedRecord>,
    crs: Crs,
    cluster_column: &str,
    policy: UnmatchedPolicy,
    unassigned_label: &str,
) -> MicroareaTable {
    let mut groups: BTreeMap<String, Vec<JoinedRecord>> = BTreeMap::new();
    let mut unmatched = 0usize;

    for record in records {
        let key = match (&record.cluster, policy) {
            (Some(cluster), _) => cluster.clone(),
            (None, UnmatchedPolicy::Retain) => {
                unmatched += 1;
                unassigned_label.to_string()
            }
            (None, UnmatchedPolicy::Drop) => {
                unmatched += 1;
                continue;
            }
        };
        groups.entry(key).or_default().push(record);
    }

    if unmatched > 0 {
        match policy {
            UnmatchedPolicy::Drop => warn!("Dropped {} nanoareas with no cluster definition", unmatched),
            UnmatchedPolicy::Retain => warn!(
                "Grouped {} nanoareas with no cluster definition under '{}'",
                unmatched, unassigned_label
            ),
        }
    }

    let groups: Vec<(String, Vec<JoinedRecord>)> = groups.into_iter().collect();
    let records: Vec<MicroareaRecord> = groups
        .into_par_iter()
        .map(|(cluster, members)| {
            let geometry = geometry::dissolve_group(members.iter().map(|m| &m.geometry));
            let mut attributes = members[0].attributes.clone();
            attributes.remove(cluster_column);
            MicroareaRecord {
                cluster,
                member_count: members.len(),
                attributes,
                geometry,
            }
        })
        .collect();

    info!("Dissolved into {} microareas", records.len());

    MicroareaTable {
        crs,
        cluster_column: cluster_column.to_string(),
        records,
    }
}

pub fn simplify_microareas(table: &MicroareaTable, tolerance: f64) -> MicroareaTable {
    let records = table
        .records
        .par_iter()
        .map(|record| MicroareaRecord {
            geometry: geometry::simplify_preserving(&record.geometry, tolerance),
            ..record.clone()
        })
        .collect();
    MicroareaTable {
        crs: table.crs,
        cluster_column: table.cluster_column.clone(),
        records,
    }
}
