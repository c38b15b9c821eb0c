//! # Query Builder
//!
//! Catalog search keys. A [`FilterSpec`] maps each catalog facet to the set of
//! values a catalog row must match; [`cm4_query`] builds the fixed GFDL-CM4
//! request.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Filterable catalog attribute. Variants serialize to the catalog column names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Facet {
    ExperimentId,
    TableId,
    VariableId,
    GridLabel,
    MemberId,
    SourceId,
}

impl Facet {
    pub const ALL: [Facet; 6] = [
        Facet::ExperimentId,
        Facet::TableId,
        Facet::VariableId,
        Facet::GridLabel,
        Facet::MemberId,
        Facet::SourceId,
    ];

    /// Column name in the ESM catalog table
    pub fn column(&self) -> &'static str {
        match self {
            Facet::ExperimentId => "experiment_id",
            Facet::TableId => "table_id",
            Facet::VariableId => "variable_id",
            Facet::GridLabel => "grid_label",
            Facet::MemberId => "member_id",
            Facet::SourceId => "source_id",
        }
    }
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// Mapping from facet to accepted values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    facets: BTreeMap<Facet, BTreeSet<String>>,
}

impl FilterSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds accepted values for a facet, extending any values already present.
    pub fn with_facet<I, S>(mut self, facet: Facet, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.facets
            .entry(facet)
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn values(&self, facet: Facet) -> Option<&BTreeSet<String>> {
        self.facets.get(&facet)
    }

    pub fn facets(&self) -> impl Iterator<Item = (Facet, &BTreeSet<String>)> {
        self.facets.iter().map(|(facet, values)| (*facet, values))
    }

    pub fn is_empty(&self) -> bool {
        self.facets.is_empty()
    }

    /// Whether a row with the given facet values satisfies every constraint.
    pub fn matches<'a, F>(&self, mut lookup: F) -> bool
    where
        F: FnMut(Facet) -> Option<&'a str>,
    {
        self.facets.iter().all(|(facet, accepted)| {
            lookup(*facet).is_some_and(|value| accepted.contains(value))
        })
    }
}

impl fmt::Display for FilterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .facets
            .iter()
            .map(|(facet, values)| {
                let values: Vec<&str> = values.iter().map(String::as_str).collect();
                format!("{}=[{}]", facet, values.join(", "))
            })
            .collect();
        write!(f, "{}", parts.join(" "))
    }
}

/// Eday variables requested from GFDL-CM4. Descriptions follow the CMIP6 data request.
pub const CM4_VARIABLES: [&str; 14] = [
    "uas",    // eastward near-surface (10 m) wind
    "vas",    // northward near-surface (10 m) wind
    "tslsi",  // surface temperature of all surfaces except open ocean
    "tas",    // near-surface (2 m) air temperature
    "tasmin", // daily minimum near-surface air temperature
    "tasmax", // daily maximum near-surface air temperature
    "psl",    // sea level pressure
    "pr",     // precipitation
    "prc",    // convective precipitation
    // pressure-level fields, only published on gr2 (250 km nominal resolution)
    "ua",  // eastward wind
    "va",  // northward wind
    "wap", // omega (dp/dt)
    "zg",  // geopotential height
    "ta",  // air temperature
];

/// Reference (`+0K`) experiment
pub const REFERENCE_EXPERIMENT: &str = "amip";
/// Perturbed-forcing (`+4K`) experiment
pub const PERTURBED_EXPERIMENT: &str = "amip-p4K";

/// Builds the GFDL-CM4 amip/amip-p4K daily query.
pub fn cm4_query() -> FilterSpec {
    experiment_query(REFERENCE_EXPERIMENT, PERTURBED_EXPERIMENT)
}

/// Builds the GFDL-CM4 daily query for a reference and a perturbed experiment.
///
/// GFDL-CM4 publishes two regridded grids, `gr1` (100 km) and `gr2` (250 km);
/// only `gr2` carries the pressure-level variables.
pub fn experiment_query(reference: &str, perturbed: &str) -> FilterSpec {
    FilterSpec::new()
        .with_facet(Facet::ExperimentId, [reference, perturbed])
        .with_facet(Facet::TableId, ["Eday"])
        .with_facet(Facet::VariableId, CM4_VARIABLES)
        .with_facet(Facet::GridLabel, ["gr2"])
        .with_facet(Facet::MemberId, ["r1i1p1f1"])
        .with_facet(Facet::SourceId, ["GFDL-CM4"])
}
