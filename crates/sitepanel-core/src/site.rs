//! Site attributes and their mapping onto template fields.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PanelError, PanelResult};
use crate::render::Fields;

/// Every field a persona template may reference.
pub const SITE_FIELDS: &[&str] = &[
    "coordinates",
    "landform",
    "ndvi",
    "slope_deg",
    "elevation_m",
    "river_distance_km",
    "hypothesis_summary",
    "region_name",
    "landcover_class",
];

const DEFAULT_LANDFORM: &str = "未分類";
const DEFAULT_HYPOTHESIS: &str = "仮説未入力";
const DEFAULT_REGION: &str = "Amazonia";
const MISSING_NUMBER: &str = "NaN";

/// Attributes of one candidate site.
///
/// Coordinates are the site's representative point (centroid for polygons) in
/// decimal degrees. Absent attributes fall back to placeholder text at render
/// time instead of failing the session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteAttributes {
    #[serde(default)]
    pub site_id: String,
    pub longitude: f64,
    pub latitude: f64,
    #[serde(default)]
    pub landform: Option<String>,
    #[serde(default)]
    pub ndvi: Option<f64>,
    #[serde(default)]
    pub slope_deg: Option<f64>,
    #[serde(default)]
    pub elevation_m: Option<f64>,
    #[serde(default)]
    pub river_distance_km: Option<f64>,
    #[serde(default)]
    pub landcover_class: Option<String>,
    #[serde(default)]
    pub hypothesis_summary: Option<String>,
    #[serde(default)]
    pub region_name: Option<String>,
}

impl SiteAttributes {
    pub fn new(site_id: impl Into<String>, longitude: f64, latitude: f64) -> Self {
        Self {
            site_id: site_id.into(),
            longitude,
            latitude,
            ..Self::default()
        }
    }

    /// `"lon, lat"` with five decimals.
    pub fn coordinates(&self) -> String {
        format!("{:.5}, {:.5}", self.longitude, self.latitude)
    }

    /// The full site field set, defaults applied.
    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("coordinates".to_string(), self.coordinates());
        fields.insert(
            "landform".to_string(),
            text_or(&self.landform, DEFAULT_LANDFORM),
        );
        fields.insert("ndvi".to_string(), number_or_nan(self.ndvi));
        fields.insert("slope_deg".to_string(), number_or_nan(self.slope_deg));
        fields.insert("elevation_m".to_string(), number_or_nan(self.elevation_m));
        fields.insert(
            "river_distance_km".to_string(),
            number_or_nan(self.river_distance_km),
        );
        fields.insert(
            "landcover_class".to_string(),
            text_or(&self.landcover_class, MISSING_NUMBER),
        );
        fields.insert(
            "hypothesis_summary".to_string(),
            text_or(&self.hypothesis_summary, DEFAULT_HYPOTHESIS),
        );
        fields.insert(
            "region_name".to_string(),
            text_or(&self.region_name, DEFAULT_REGION),
        );
        fields
    }
}

fn text_or(value: &Option<String>, default: &str) -> String {
    value.clone().unwrap_or_else(|| default.to_string())
}

fn number_or_nan(value: Option<f64>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| MISSING_NUMBER.to_string())
}

/// Check that `site_id` can name a file inside an output directory.
///
/// Rejects empty ids, path separators, `..` and leading dots.
pub fn validate_site_id(site_id: &str) -> PanelResult<()> {
    let reason = if site_id.trim().is_empty() {
        Some("empty")
    } else if site_id.contains(['/', '\\']) {
        Some("contains a path separator")
    } else if site_id.contains("..") {
        Some("contains `..`")
    } else if site_id.starts_with('.') {
        Some("starts with `.`")
    } else if site_id.chars().any(char::is_control) {
        Some("contains control characters")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(PanelError::InvalidSiteId {
            site_id: site_id.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// Check every id with [`validate_site_id`] and reject repeats.
pub fn validate_sites(sites: &[SiteAttributes]) -> PanelResult<()> {
    let mut seen = BTreeSet::new();
    for site in sites {
        validate_site_id(&site.site_id)?;
        if !seen.insert(site.site_id.as_str()) {
            return Err(PanelError::DuplicateSite {
                site_id: site.site_id.clone(),
            });
        }
    }
    Ok(())
}

/// Read a JSON array of site records.
///
/// Records without a `site_id` are named `site_NNN` after their position.
/// Ids must be unique and safe to use as file names; see [`validate_sites`].
pub fn load_sites(path: &Path) -> PanelResult<Vec<SiteAttributes>> {
    let content = std::fs::read_to_string(path)?;
    parse_sites(&content)
}

/// Parse a JSON array of site records; see [`load_sites`].
pub fn parse_sites(content: &str) -> PanelResult<Vec<SiteAttributes>> {
    let mut sites: Vec<SiteAttributes> = serde_json::from_str(content)?;
    for (idx, site) in sites.iter_mut().enumerate() {
        if site.site_id.is_empty() {
            site.site_id = format!("site_{idx:03}");
        }
    }
    validate_sites(&sites)?;
    Ok(sites)
}
