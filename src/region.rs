//! # Region Masks
//!
//! Numbered polygon regions evaluated against a regular lon/lat grid. A cell is
//! assigned the number of the first region containing its center, or `None`.
//!
//! Points on a western or southern polygon edge count as inside, points on an
//! eastern or northern edge as outside, so adjacent regions never share a cell.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// A single numbered polygon region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub number: usize,
    pub name: String,
    pub abbrev: String,
    /// Ordered `(lon, lat)` vertices; the closing edge is implicit.
    pub outline: Vec<(f64, f64)>,
}

impl Region {
    /// Crossing-number point-in-polygon test.
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        let n = self.outline.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (xi, yi) = self.outline[i];
            let (xj, yj) = self.outline[j];
            if (yi > lat) != (yj > lat) {
                let x_cross = (xj - xi) * (lat - yi) / (yj - yi) + xi;
                if lon < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }

    /// Whether any vertex uses a negative longitude.
    fn uses_signed_longitudes(&self) -> bool {
        self.outline.iter().any(|&(lon, _)| lon < 0.0)
    }
}

/// A named set of regions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Regions {
    pub name: String,
    pub regions: Vec<Region>,
}

impl Regions {
    pub fn new(name: &str, regions: Vec<Region>) -> Self {
        Regions {
            name: name.to_string(),
            regions,
        }
    }

    /// Region number per grid cell, shaped `(lat.len(), lon.len())`.
    ///
    /// Grid longitudes on 0..360 are wrapped to -180..180 when the outlines use
    /// negative longitudes.
    pub fn mask(&self, lon: &[f64], lat: &[f64]) -> Array2<Option<usize>> {
        let wrap = self.regions.iter().any(Region::uses_signed_longitudes);
        let lons: Vec<f64> = lon
            .iter()
            .map(|&x| if wrap { wrap_longitude(x) } else { x })
            .collect();

        Array2::from_shape_fn((lat.len(), lon.len()), |(i, j)| {
            self.regions
                .iter()
                .find(|region| region.contains(lons[j], lat[i]))
                .map(|region| region.number)
        })
    }

    pub fn abbrevs(&self) -> Vec<&str> {
        self.regions.iter().map(|r| r.abbrev.as_str()).collect()
    }
}

/// Maps a longitude to [-180, 180).
pub fn wrap_longitude(lon: f64) -> f64 {
    (lon + 180.0).rem_euclid(360.0) - 180.0
}

/// Central America to Canada, including the adjacent Pacific and Atlantic.
pub fn cm4_region_mask() -> Regions {
    Regions::new(
        "US",
        vec![Region {
            number: 0,
            name: "Continental United States".to_string(),
            abbrev: "CONUS".to_string(),
            outline: vec![(-170.0, 10.0), (-170.0, 70.0), (-20.0, 70.0), (-20.0, 10.0)],
        }],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cm4_region_definition() {
        let regions = cm4_region_mask();
        assert_eq!(regions.name, "US");
        assert_eq!(regions.abbrevs(), vec!["CONUS"]);
        assert_eq!(regions.regions[0].number, 0);
        assert_eq!(regions, cm4_region_mask());
    }

    #[test]
    fn test_contains_interior_and_exterior() {
        let region = &cm4_region_mask().regions[0];
        assert!(region.contains(-100.0, 40.0));
        assert!(!region.contains(-100.0, 80.0));
        assert!(!region.contains(0.0, 40.0));
        assert!(!region.contains(-175.0, 40.0));
    }

    #[test]
    fn test_boundary_convention() {
        let region = &cm4_region_mask().regions[0];
        // western and southern edges inside
        assert!(region.contains(-170.0, 40.0));
        assert!(region.contains(-100.0, 10.0));
        // eastern and northern edges outside
        assert!(!region.contains(-20.0, 40.0));
        assert!(!region.contains(-100.0, 70.0));
    }

    #[test]
    fn test_winding_order_does_not_matter() {
        let mut reversed = cm4_region_mask();
        reversed.regions[0].outline.reverse();
        let lon: Vec<f64> = (0..36).map(|i| i as f64 * 10.0).collect();
        let lat: Vec<f64> = (0..18).map(|i| -85.0 + i as f64 * 10.0).collect();
        assert_eq!(reversed.mask(&lon, &lat), cm4_region_mask().mask(&lon, &lat));
    }

    #[test]
    fn test_mask_wraps_0_360_grid() {
        let regions = cm4_region_mask();
        let lon = [100.0, 200.0, 300.0, 345.0];
        let lat = [0.0, 40.0, 75.0];
        let mask = regions.mask(&lon, &lat);
        assert_eq!(mask.dim(), (3, 4));
        // 200E = -160, 300E = -60 inside at 40N
        assert_eq!(mask[[1, 1]], Some(0));
        assert_eq!(mask[[1, 2]], Some(0));
        assert_eq!(mask[[1, 0]], None);
        assert_eq!(mask[[1, 3]], None);
        assert!(mask.row(0).iter().all(Option::is_none));
        assert!(mask.row(2).iter().all(Option::is_none));
    }

    #[test]
    fn test_mask_is_pure() {
        let regions = cm4_region_mask();
        let lon: Vec<f64> = (0..144).map(|i| i as f64 * 2.5).collect();
        let lat: Vec<f64> = (0..90).map(|i| -89.0 + i as f64 * 2.0).collect();
        let first = regions.mask(&lon, &lat);
        let second = regions.mask(&lon, &lat);
        assert_eq!(first, second);
        assert!(first.iter().any(Option::is_some));
    }

    #[test]
    fn test_wrap_longitude() {
        assert_eq!(wrap_longitude(190.0), -170.0);
        assert_eq!(wrap_longitude(180.0), -180.0);
        assert_eq!(wrap_longitude(-20.0), -20.0);
        assert_eq!(wrap_longitude(340.0), -20.0);
    }
}
