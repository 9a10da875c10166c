//! Coordinate reference systems and pure-Rust WGS84 <-> UTM reprojection.
//!
//! Only the WGS84 datum is supported: geographic EPSG:4326 and the UTM
//! zones EPSG 326xx (north) / 327xx (south). ISTAT publishes the 2011
//! census bases in EPSG:32632.

use crate::error::PipelineError;
use geo::{Coord, MapCoords, MultiPolygon};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const A: f64 = 6_378_137.0;
const F: f64 = 1.0 / 298.257_223_563;
const E2: f64 = 2.0 * F - F * F;
const E_PRIME2: f64 = E2 / (1.0 - E2);
const K0: f64 = 0.9996;
const FALSE_EASTING: f64 = 500_000.0;
const FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;

/// An EPSG-coded reference system. Parsed from and printed as `EPSG:<code>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Crs {
    epsg: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Projection {
    Geographic,
    Utm { zone: u32, north: bool },
}

impl Crs {
    pub const fn from_epsg(epsg: u32) -> Self {
        Self { epsg }
    }

    pub const fn wgs84() -> Self {
        Self::from_epsg(4326)
    }

    pub fn utm(zone: u32, north: bool) -> Self {
        let base = if north { 32600 } else { 32700 };
        Self::from_epsg(base + zone)
    }

    pub fn epsg(&self) -> u32 {
        self.epsg
    }

    pub fn identifier(&self) -> String {
        format!("EPSG:{}", self.epsg)
    }

    fn projection(&self) -> Option<Projection> {
        match self.epsg {
            4326 => Some(Projection::Geographic),
            32601..=32660 => Some(Projection::Utm {
                zone: self.epsg - 32600,
                north: true,
            }),
            32701..=32760 => Some(Projection::Utm {
                zone: self.epsg - 32700,
                north: false,
            }),
            _ => None,
        }
    }

    /// Recognise a `.prj` (ESRI or OGC WKT) describing WGS84 geographic or a
    /// WGS84 UTM zone. Anything else, other datums and other WGS84
    /// projections alike, returns `None`.
    pub fn detect_from_prj(wkt: &str) -> Option<Crs> {
        let lower = wkt.to_lowercase();
        if lower.contains("ed_1950") || lower.contains("ed50") || lower.contains("monte_mario") {
            return None;
        }
        if !(lower.contains("wgs_1984") || lower.contains("wgs 84") || lower.contains("wgs84")) {
            return None;
        }

        if lower.trim_start().starts_with("geogcs") {
            return Some(Crs::wgs84());
        }

        let marker = ["utm_zone_", "utm zone "]
            .iter()
            .find_map(|m| lower.find(m).map(|idx| idx + m.len()))?;
        let rest = &lower[marker..];
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        let zone: u32 = digits.parse().ok()?;
        if !(1..=60).contains(&zone) {
            return None;
        }
        let north = match rest[digits.len()..].chars().next() {
            Some('n') => true,
            Some('s') => false,
            _ => return None,
        };
        Some(Crs::utm(zone, north))
    }
}

/// The name of the outermost `PROJCS`/`GEOGCS` in a WKT string.
pub fn wkt_name(wkt: &str) -> Option<&str> {
    let start = wkt.find("[\"")? + 2;
    let len = wkt[start..].find('"')?;
    Some(&wkt[start..start + len])
}

impl Default for Crs {
    fn default() -> Self {
        Self::wgs84()
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identifier())
    }
}

impl FromStr for Crs {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let code = trimmed
            .strip_prefix("EPSG:")
            .or_else(|| trimmed.strip_prefix("epsg:"))
            .unwrap_or(trimmed);
        code.parse::<u32>()
            .map(Crs::from_epsg)
            .map_err(|_| PipelineError::InvalidCrs(s.to_string()))
    }
}

impl TryFrom<String> for Crs {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Crs> for String {
    fn from(crs: Crs) -> Self {
        crs.identifier()
    }
}

/// Transforms coordinates between two supported reference systems,
/// going through WGS84 geographic when both ends are projected.
#[derive(Debug, Clone, Copy)]
pub struct Reprojector {
    from: Projection,
    to: Projection,
}

impl Reprojector {
    pub fn new(from: Crs, to: Crs) -> Result<Self, PipelineError> {
        let unsupported = || PipelineError::UnsupportedCrs {
            from: from.identifier(),
            to: to.identifier(),
        };
        let from_proj = from.projection().ok_or_else(unsupported)?;
        let to_proj = to.projection().ok_or_else(unsupported)?;
        Ok(Self {
            from: from_proj,
            to: to_proj,
        })
    }

    pub fn is_identity(&self) -> bool {
        self.from == self.to
    }

    pub fn transform_coord(&self, c: Coord<f64>) -> Coord<f64> {
        if self.is_identity() {
            return c;
        }
        let (lon, lat) = match self.from {
            Projection::Geographic => (c.x, c.y),
            Projection::Utm { zone, north } => utm_to_wgs84(c.x, c.y, zone, north),
        };
        match self.to {
            Projection::Geographic => Coord { x: lon, y: lat },
            Projection::Utm { zone, north } => {
                let (x, y) = wgs84_to_utm(lon, lat, zone, north);
                Coord { x, y }
            }
        }
    }

    pub fn transform(&self, geometry: &MultiPolygon<f64>) -> MultiPolygon<f64> {
        if self.is_identity() {
            return geometry.clone();
        }
        geometry.map_coords(|c| self.transform_coord(c))
    }
}

fn central_meridian(zone: u32) -> f64 {
    ((zone as f64 - 1.0) * 6.0 - 180.0 + 3.0).to_radians()
}

// Snyder 1987, USGS Prof. Paper 1395, eq. 8-9 and 8-10.
fn wgs84_to_utm(lon_deg: f64, lat_deg: f64, zone: u32, north: bool) -> (f64, f64) {
    let lat = lat_deg.to_radians();
    let lon = lon_deg.to_radians();
    let lon0 = central_meridian(zone);

    let sin_lat = lat.sin();
    let cos_lat = lat.cos();
    let tan_lat = lat.tan();

    let n = A / (1.0 - E2 * sin_lat * sin_lat).sqrt();
    let t = tan_lat * tan_lat;
    let c = E_PRIME2 * cos_lat * cos_lat;
    let a_coeff = cos_lat * (lon - lon0);
    let m = meridional_arc(lat);

    let a2 = a_coeff * a_coeff;
    let a4 = a2 * a2;
    let a6 = a4 * a2;

    let easting = K0
        * n
        * (a_coeff
            + (1.0 - t + c) * a2 * a_coeff / 6.0
            + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * E_PRIME2) * a4 * a_coeff / 120.0)
        + FALSE_EASTING;

    let northing = K0
        * (m + n
            * tan_lat
            * (a2 / 2.0
                + (5.0 - t + 9.0 * c + 4.0 * c * c) * a4 / 24.0
                + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * E_PRIME2) * a6 / 720.0));

    if north {
        (easting, northing)
    } else {
        (easting, northing + FALSE_NORTHING_SOUTH)
    }
}

// Snyder 1987, eq. 8-12 through 8-25 (footpoint latitude series).
fn utm_to_wgs84(easting: f64, northing: f64, zone: u32, north: bool) -> (f64, f64) {
    let x = easting - FALSE_EASTING;
    let y = if north {
        northing
    } else {
        northing - FALSE_NORTHING_SOUTH
    };

    let e4 = E2 * E2;
    let e6 = e4 * E2;
    let m = y / K0;
    let mu = m / (A * (1.0 - E2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0));

    let sqrt_1_e2 = (1.0 - E2).sqrt();
    let e1 = (1.0 - sqrt_1_e2) / (1.0 + sqrt_1_e2);
    let e1_2 = e1 * e1;
    let e1_3 = e1_2 * e1;
    let e1_4 = e1_3 * e1;

    let phi1 = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1_3 / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1_2 / 16.0 - 55.0 * e1_4 / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1_3 / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1_4 / 512.0) * (8.0 * mu).sin();

    let sin_phi1 = phi1.sin();
    let cos_phi1 = phi1.cos();
    let tan_phi1 = phi1.tan();

    let c1 = E_PRIME2 * cos_phi1 * cos_phi1;
    let t1 = tan_phi1 * tan_phi1;
    let denom = 1.0 - E2 * sin_phi1 * sin_phi1;
    let n1 = A / denom.sqrt();
    let r1 = A * (1.0 - E2) / denom.powf(1.5);
    let d = x / (n1 * K0);

    let d2 = d * d;
    let d3 = d2 * d;
    let d4 = d3 * d;
    let d5 = d4 * d;
    let d6 = d5 * d;

    let lat = phi1
        - (n1 * tan_phi1 / r1)
            * (d2 / 2.0 - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * E_PRIME2) * d4 / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * E_PRIME2 - 3.0 * c1 * c1)
                    * d6
                    / 720.0);

    let lon = central_meridian(zone)
        + (d - (1.0 + 2.0 * t1 + c1) * d3 / 6.0
            + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * E_PRIME2 + 24.0 * t1 * t1) * d5
                / 120.0)
            / cos_phi1;

    (lon.to_degrees(), lat.to_degrees())
}

/// Meridional arc from the equator to `lat` (radians), Snyder eq. 3-21.
fn meridional_arc(lat: f64) -> f64 {
    let e4 = E2 * E2;
    let e6 = e4 * E2;

    A * ((1.0 - E2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * lat
        - (3.0 * E2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * lat).sin()
        + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * lat).sin()
        - (35.0 * e6 / 3072.0) * (6.0 * lat).sin())
}
