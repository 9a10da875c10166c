use crate::crs::Crs;
use geo::MultiPolygon;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A single attribute cell as read from a shapefile, GeoJSON or spreadsheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl AttributeValue {
    /// String form used for joins and coerced columns. Integral floats
    /// (dBase numerics) render without a fractional part.
    pub fn to_key(&self) -> String {
        match self {
            AttributeValue::Null => String::new(),
            AttributeValue::Bool(b) => b.to_string(),
            AttributeValue::Int(i) => i.to_string(),
            AttributeValue::Float(f) => {
                if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 {
                    format!("{}", *f as i64)
                } else {
                    f.to_string()
                }
            }
            AttributeValue::String(s) => s.trim().to_string(),
        }
    }

    pub fn coerce_to_string(&self) -> AttributeValue {
        AttributeValue::String(self.to_key())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Int(i) => Some(*i as f64),
            AttributeValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Total order used when sorting records: numbers numerically, then
    /// booleans, then strings lexically, nulls last.
    pub fn sort_cmp(&self, other: &AttributeValue) -> Ordering {
        fn rank(v: &AttributeValue) -> u8 {
            match v {
                AttributeValue::Int(_) | AttributeValue::Float(_) => 0,
                AttributeValue::Bool(_) => 1,
                AttributeValue::String(_) => 2,
                AttributeValue::Null => 3,
            }
        }

        match (self, other) {
            (AttributeValue::Int(a), AttributeValue::Int(b)) => a.cmp(b),
            (AttributeValue::String(a), AttributeValue::String(b)) => a.cmp(b),
            (AttributeValue::Bool(a), AttributeValue::Bool(b)) => a.cmp(b),
            _ => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => a.total_cmp(&b),
                _ => rank(self).cmp(&rank(other)),
            },
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AttributeValue::Null => serde_json::Value::Null,
            AttributeValue::Bool(b) => serde_json::Value::Bool(*b),
            AttributeValue::Int(i) => serde_json::Value::from(*i),
            AttributeValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            AttributeValue::String(s) => serde_json::Value::String(s.clone()),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> AttributeValue {
        match value {
            serde_json::Value::Null => AttributeValue::Null,
            serde_json::Value::Bool(b) => AttributeValue::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => AttributeValue::Int(i),
                None => AttributeValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => AttributeValue::String(s.clone()),
            other => AttributeValue::String(other.to_string()),
        }
    }
}

pub type Attributes = BTreeMap<String, AttributeValue>;

/// One nanoarea: its attribute row and boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundaryRecord {
    pub attributes: Attributes,
    pub geometry: MultiPolygon<f64>,
}

/// A set of nanoarea records sharing one CRS, keyed by `id_column`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundaryTable {
    pub crs: Crs,
    pub id_column: String,
    pub records: Vec<BoundaryRecord>,
}

impl BoundaryTable {
    pub fn id_of<'a>(&self, record: &'a BoundaryRecord) -> Option<&'a AttributeValue> {
        record.attributes.get(&self.id_column)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Cluster definitions indexed by nanoarea identifier (already string-coerced).
#[derive(Debug, Clone, Default)]
pub struct ClusterTable {
    pub key_column: String,
    pub rows: BTreeMap<String, Attributes>,
}

/// The union of every nanoarea sharing one cluster id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicroareaRecord {
    pub cluster: String,
    pub member_count: usize,
    // First member's remaining columns.
    pub attributes: Attributes,
    pub geometry: MultiPolygon<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicroareaTable {
    pub crs: Crs,
    pub cluster_column: String,
    pub records: Vec<MicroareaRecord>,
}
