use crate::crs::{wkt_name, Crs};
use crate::error::PipelineError;
use crate::types::{AttributeValue, Attributes, BoundaryRecord, ClusterTable};
use anyhow::{anyhow, Context, Result};
use calamine::{open_workbook_auto, Data, Reader as SheetReader};
use csv::ReaderBuilder;
use geo::MultiPolygon;
use shapefile::dbase::FieldValue;
use shapefile::Reader;
use std::collections::btree_map::Entry;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Records read from one boundary file, still in their source CRS.
#[derive(Debug, Clone)]
pub struct LoadedBoundaries {
    pub path: PathBuf,
    pub crs: Crs,
    pub records: Vec<BoundaryRecord>,
}

fn extension_of(path: &Path) -> Result<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_lowercase())
        .ok_or_else(|| anyhow!("File has no extension: {:?}", path))
}

/// Sorted list of files under `dir` matching `pattern`. Fails when nothing
/// matches.
pub fn discover_boundary_files(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let full_pattern = dir.join(pattern).to_string_lossy().to_string();
    let mut paths = Vec::new();
    for entry in glob::glob(&full_pattern)
        .with_context(|| format!("Invalid glob pattern: {}", full_pattern))?
    {
        paths.push(entry?);
    }
    paths.sort();

    if paths.is_empty() {
        return Err(PipelineError::NoInputFiles {
            pattern: full_pattern,
        }
        .into());
    }
    Ok(paths)
}

pub fn load_boundary_file(path: &Path, fallback_crs: Crs) -> Result<LoadedBoundaries> {
    let extension = extension_of(path)?;
    let loaded = match extension.as_str() {
        "shp" => load_shapefile(path, fallback_crs)?,
        "json" | "geojson" => load_geojson(path)?,
        _ => return Err(PipelineError::UnsupportedFormat(extension).into()),
    };
    debug!(
        "Read {} records from {:?} ({})",
        loaded.records.len(),
        path,
        loaded.crs
    );
    Ok(loaded)
}

/// Source CRS from the sibling `.prj`. Only a missing `.prj` falls back
/// to `fallback`; a projection we cannot reproject from is an error.
fn detect_shapefile_crs(path: &Path, fallback: Crs) -> Result<Crs> {
    let prj_path = path.with_extension("prj");
    if !prj_path.exists() {
        warn!("No .prj next to {:?}, assuming {}", path, fallback);
        return Ok(fallback);
    }
    let wkt = fs::read_to_string(&prj_path)
        .with_context(|| format!("Failed to read projection file: {:?}", prj_path))?;
    Crs::detect_from_prj(&wkt).ok_or_else(|| {
        PipelineError::UnsupportedProjection {
            file: prj_path.display().to_string(),
            name: wkt_name(&wkt).unwrap_or("unknown").to_string(),
        }
        .into()
    })
}

fn field_to_attribute(value: FieldValue) -> AttributeValue {
    match value {
        FieldValue::Character(Some(s)) => AttributeValue::String(s),
        FieldValue::Numeric(Some(n)) => AttributeValue::Float(n),
        FieldValue::Float(Some(f)) => AttributeValue::Float(f as f64),
        FieldValue::Integer(i) => AttributeValue::Int(i as i64),
        FieldValue::Double(d) => AttributeValue::Float(d),
        FieldValue::Currency(c) => AttributeValue::Float(c),
        FieldValue::Logical(Some(b)) => AttributeValue::Bool(b),
        FieldValue::Memo(s) => AttributeValue::String(s),
        FieldValue::Character(None)
        | FieldValue::Numeric(None)
        | FieldValue::Float(None)
        | FieldValue::Logical(None)
        | FieldValue::Date(None) => AttributeValue::Null,
        other => AttributeValue::String(format!("{:?}", other)),
    }
}

fn load_shapefile(path: &Path, fallback_crs: Crs) -> Result<LoadedBoundaries> {
    let crs = detect_shapefile_crs(path, fallback_crs)?;
    let mut reader = Reader::from_path(path)
        .with_context(|| format!("Failed to open Shapefile: {:?}", path))?;

    let mut records = Vec::new();
    let mut skipped = 0usize;

    for result in reader.iter_shapes_and_records() {
        let (shape, record) =
            result.with_context(|| format!("Failed to read shape from {:?}", path))?;

        let geometry: MultiPolygon<f64> = match shape {
            shapefile::Shape::Polygon(polygon) => polygon
                .try_into()
                .map_err(|e| anyhow!("Failed to convert polygon: {:?}", e))?,
            shapefile::Shape::PolygonM(polygon) => polygon
                .try_into()
                .map_err(|e| anyhow!("Failed to convert polygonM: {:?}", e))?,
            shapefile::Shape::PolygonZ(polygon) => polygon
                .try_into()
                .map_err(|e| anyhow!("Failed to convert polygonZ: {:?}", e))?,
            _ => {
                skipped += 1;
                continue;
            }
        };

        let attributes: Attributes = record
            .into_iter()
            .map(|(name, value)| (name, field_to_attribute(value)))
            .collect();

        records.push(BoundaryRecord { attributes, geometry });
    }

    if skipped > 0 {
        warn!("Skipped {} non-polygon shapes in {:?}", skipped, path);
    }

    Ok(LoadedBoundaries {
        path: path.to_path_buf(),
        crs,
        records,
    })
}

/// GeoJSON is read as EPSG:4326 (RFC 7946).
fn load_geojson(path: &Path) -> Result<LoadedBoundaries> {
    use geojson::GeoJson;

    let file = File::open(path).with_context(|| format!("Failed to open GeoJSON file: {:?}", path))?;
    let geojson = GeoJson::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse GeoJSON: {:?}", path))?;

    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => return Err(anyhow!("GeoJSON must be a FeatureCollection: {:?}", path)),
    };

    let mut records = Vec::new();
    let mut skipped = 0usize;

    for feature in collection.features {
        let geometry = match feature.geometry {
            Some(geom) => {
                let converted: geo::Geometry<f64> = geom
                    .value
                    .try_into()
                    .map_err(|e| anyhow!("Failed to convert geojson geometry: {:?}", e))?;
                match converted {
                    geo::Geometry::MultiPolygon(mp) => mp,
                    geo::Geometry::Polygon(p) => MultiPolygon::new(vec![p]),
                    _ => {
                        skipped += 1;
                        continue;
                    }
                }
            }
            None => {
                skipped += 1;
                continue;
            }
        };

        let attributes: Attributes = feature
            .properties
            .unwrap_or_default()
            .iter()
            .map(|(k, v)| (k.clone(), AttributeValue::from_json(v)))
            .collect();

        records.push(BoundaryRecord { attributes, geometry });
    }

    if skipped > 0 {
        warn!("Skipped {} features without polygon geometry in {:?}", skipped, path);
    }

    Ok(LoadedBoundaries {
        path: path.to_path_buf(),
        crs: Crs::wgs84(),
        records,
    })
}

/// Read the cluster definitions from a spreadsheet sheet or a CSV file and
/// index them by the string form of `key_column`.
pub fn load_cluster_definitions(path: &Path, sheet: &str, key_column: &str) -> Result<ClusterTable> {
    let extension = extension_of(path)?;
    let rows = match extension.as_str() {
        "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => load_sheet_rows(path, sheet)?,
        "csv" => load_csv_rows(path)?,
        _ => return Err(PipelineError::UnsupportedFormat(extension).into()),
    };
    let table = build_cluster_table(rows, key_column, &format!("{:?}", path))?;
    info!(
        "Loaded {} cluster definitions keyed on '{}' from {:?}",
        table.rows.len(),
        table.key_column,
        path
    );
    Ok(table)
}

struct SheetRows {
    header: Vec<String>,
    rows: Vec<Vec<AttributeValue>>,
}

fn cell_to_attribute(cell: &Data) -> AttributeValue {
    match cell {
        Data::Empty => AttributeValue::Null,
        Data::Int(i) => AttributeValue::Int(*i),
        Data::Float(f) => AttributeValue::Float(*f),
        Data::Bool(b) => AttributeValue::Bool(*b),
        Data::String(s) => AttributeValue::String(s.clone()),
        other => AttributeValue::String(other.to_string()),
    }
}

fn load_sheet_rows(path: &Path, sheet: &str) -> Result<SheetRows> {
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("Failed to open spreadsheet: {:?}", path))?;
    let range = workbook
        .worksheet_range(sheet)
        .with_context(|| format!("Failed to read sheet '{}' from {:?}", sheet, path))?;

    let mut rows = range.rows();
    let header: Vec<String> = rows
        .next()
        .ok_or_else(|| anyhow!("Sheet '{}' in {:?} is empty", sheet, path))?
        .iter()
        .map(|cell| cell_to_attribute(cell).to_key())
        .collect();

    let rows = rows
        .map(|row| row.iter().map(cell_to_attribute).collect())
        .collect();

    Ok(SheetRows { header, rows })
}

fn parse_csv_cell(raw: &str) -> AttributeValue {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        AttributeValue::Null
    } else if let Ok(i) = trimmed.parse::<i64>() {
        AttributeValue::Int(i)
    } else if let Ok(f) = trimmed.parse::<f64>() {
        AttributeValue::Float(f)
    } else {
        AttributeValue::String(trimmed.to_string())
    }
}

fn load_csv_rows(path: &Path) -> Result<SheetRows> {
    let file = File::open(path).with_context(|| format!("Failed to open CSV file: {:?}", path))?;
    let mut rdr = ReaderBuilder::new().from_reader(file);
    let header: Vec<String> = rdr.headers()?.iter().map(|h| h.trim().to_string()).collect();

    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result.with_context(|| format!("Failed to read CSV row from {:?}", path))?;
        rows.push(record.iter().map(parse_csv_cell).collect());
    }

    Ok(SheetRows { header, rows })
}

fn build_cluster_table(sheet: SheetRows, key_column: &str, location: &str) -> Result<ClusterTable> {
    let key_idx = sheet
        .header
        .iter()
        .position(|h| h == key_column)
        .ok_or_else(|| PipelineError::MissingColumn {
            column: key_column.to_string(),
            location: location.to_string(),
        })?;

    let mut table = ClusterTable {
        key_column: key_column.to_string(),
        ..Default::default()
    };

    for row in sheet.rows {
        let key = match row.get(key_idx) {
            Some(value) if !value.is_null() => value.to_key(),
            _ => continue,
        };

        let mut attributes: Attributes = sheet
            .header
            .iter()
            .cloned()
            .zip(row)
            .filter(|(name, _)| !name.is_empty())
            .collect();
        attributes.insert(key_column.to_string(), AttributeValue::String(key.clone()));

        match table.rows.entry(key) {
            Entry::Occupied(entry) => {
                return Err(PipelineError::DuplicateClusterKey {
                    key: entry.key().clone(),
                }
                .into());
            }
            Entry::Vacant(entry) => {
                entry.insert(attributes);
            }
        }
    }

    Ok(table)
}
