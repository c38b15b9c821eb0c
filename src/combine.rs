//! # Dataset Combination
//!
//! Merging per-variable datasets of one simulation run, and concatenating runs
//! along a new labeled dimension.

use crate::cftime::{CfDateTime, TimeEncoding};
use crate::dataset::{Dataset, Values, Variable};
use crate::error::DatasetError;
use log::debug;

/// Merges datasets that describe the same run into one.
///
/// Index coordinates present in several inputs must label the same points
/// and `time` must use the same calendar. Other coordinates, scalar ones such
/// as `height` included, keep the first value seen. Global attributes come
/// from the first dataset.
pub fn merge(run: &str, datasets: Vec<Dataset>) -> Result<Dataset, DatasetError> {
    let conflict = |detail: String| DatasetError::MergeConflict {
        run: run.to_string(),
        detail,
    };

    let mut iter = datasets.into_iter();
    let mut merged = iter
        .next()
        .ok_or_else(|| conflict("no datasets to merge".to_string()))?;

    for ds in iter {
        for (name, coord) in ds.coords {
            if !merged.coords.contains_key(&name) {
                merged
                    .insert_coord(&name, coord)
                    .map_err(|e| conflict(e.to_string()))?;
                continue;
            }
            let existing = &merged.coords[&name];
            if !is_index(&name, existing) && !is_index(&name, &coord) {
                if !existing.values.same_as(&coord.values) {
                    debug!("Run '{}': keeping the first '{}' coordinate", run, name);
                }
                continue;
            }
            if existing.dims != coord.dims {
                return Err(conflict(format!(
                    "coordinate '{}' has dimensions {:?} and {:?}",
                    name, existing.dims, coord.dims
                )));
            }
            if existing.attr_str("calendar") != coord.attr_str("calendar") {
                return Err(conflict(format!(
                    "coordinate '{}' has calendars {:?} and {:?}",
                    name,
                    existing.attr_str("calendar"),
                    coord.attr_str("calendar")
                )));
            }
            if !same_index(existing, &coord) {
                return Err(conflict(format!(
                    "coordinate '{}' differs between variables",
                    name
                )));
            }
        }
        for (name, var) in ds.data_vars {
            match merged.data_vars.get(&name) {
                Some(existing) if existing.values.same_as(&var.values) => {}
                Some(_) => {
                    return Err(conflict(format!(
                        "data variable '{}' differs between inputs",
                        name
                    )));
                }
                None => merged
                    .insert_data_var(&name, var)
                    .map_err(|e| conflict(e.to_string()))?,
            }
        }
    }
    debug!("Merged run '{}' into {} data variables", run, merged.data_vars.len());
    Ok(merged)
}

/// Concatenates datasets along a new leading dimension `dim` labeled by `labels`.
///
/// Every input must have the same data variables with the same dimensions and
/// shapes, and index coordinates labelling the same points; time coordinates
/// are compared as decoded dates and the first encoding is kept. Non-index
/// coordinates that differ are concatenated like data variables.
pub fn concat_new_dim(
    parts: &[Dataset],
    dim: &str,
    labels: &[&str],
) -> Result<Dataset, DatasetError> {
    let first = parts
        .first()
        .ok_or_else(|| DatasetError::ShapeMismatch("no datasets to concatenate".to_string()))?;
    if parts.len() != labels.len() {
        return Err(DatasetError::ShapeMismatch(format!(
            "{} datasets but {} labels for '{}'",
            parts.len(),
            labels.len(),
            dim
        )));
    }
    if first.dim_len(dim).is_some() {
        return Err(DatasetError::ShapeMismatch(format!(
            "dimension '{}' already exists",
            dim
        )));
    }

    let reference_dims = first.dims();
    for (i, part) in parts.iter().enumerate().skip(1) {
        let dims = part.dims();
        let mut sorted_ref = reference_dims.clone();
        let mut sorted = dims.clone();
        sorted_ref.sort();
        sorted.sort();
        if sorted_ref != sorted {
            return Err(DatasetError::ShapeMismatch(format!(
                "'{}' has dimensions {:?} but '{}' has {:?}",
                labels[0], reference_dims, labels[i], dims
            )));
        }
        let names: Vec<&String> = part.data_vars.keys().collect();
        let ref_names: Vec<&String> = first.data_vars.keys().collect();
        if names != ref_names {
            return Err(DatasetError::ShapeMismatch(format!(
                "'{}' has data variables {:?} but '{}' has {:?}",
                labels[0], ref_names, labels[i], names
            )));
        }
    }

    let mut out = Dataset {
        attrs: first.attrs.clone(),
        ..Dataset::default()
    };

    for (name, coord) in &first.coords {
        let index = is_index(name, coord);
        let others: Vec<&Variable> = parts[1..]
            .iter()
            .map(|p| {
                p.coords
                    .get(name)
                    .ok_or_else(|| DatasetError::ShapeMismatch(format!("coordinate '{}' missing", name)))
            })
            .collect::<Result<_, _>>()?;
        let identical = if index {
            others.iter().all(|o| same_index(coord, o))
        } else {
            others
                .iter()
                .all(|o| o.dims == coord.dims && o.values.same_as(&coord.values))
        };
        if identical {
            out.coords.insert(name.clone(), coord.clone());
        } else if index {
            return Err(DatasetError::ShapeMismatch(format!(
                "index coordinate '{}' differs between '{}' and the other inputs",
                name, labels[0]
            )));
        } else {
            let stacked = stack(name, coord, &others, dim)?;
            out.coords.insert(name.clone(), stacked);
        }
    }

    for (name, var) in &first.data_vars {
        let others: Vec<&Variable> = parts[1..].iter().map(|p| &p.data_vars[name]).collect();
        let stacked = stack(name, var, &others, dim)?;
        out.data_vars.insert(name.clone(), stacked);
    }

    out.coords.insert(
        dim.to_string(),
        Variable::coord_text(dim, labels.to_vec()),
    );
    Ok(out)
}

fn is_index(name: &str, var: &Variable) -> bool {
    var.dims.len() == 1 && var.dims[0] == name
}

/// Whether two index coordinates label the same points. Coordinates with CF
/// time units are compared as decoded dates, so differing epochs still match.
fn same_index(a: &Variable, b: &Variable) -> bool {
    if a.dims != b.dims {
        return false;
    }
    match (decoded_times(a), decoded_times(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a.values.same_as(&b.values),
    }
}

fn decoded_times(var: &Variable) -> Option<Vec<CfDateTime>> {
    let encoding = TimeEncoding::parse(var.attr_str("units")?, var.attr_str("calendar")).ok()?;
    var.values
        .to_f64_vec()?
        .into_iter()
        .map(|v| encoding.decode(v).ok())
        .collect()
}

fn stack(
    name: &str,
    first: &Variable,
    others: &[&Variable],
    dim: &str,
) -> Result<Variable, DatasetError> {
    for other in others {
        if other.dims != first.dims || other.shape() != first.shape() {
            return Err(DatasetError::ShapeMismatch(format!(
                "variable '{}' has {:?} {:?} and {:?} {:?}",
                name,
                first.dims,
                first.shape(),
                other.dims,
                other.shape()
            )));
        }
    }
    let expanded: Vec<Values> = std::iter::once(first)
        .chain(others.iter().copied())
        .map(|v| v.values.clone().insert_axis(0))
        .collect();
    let refs: Vec<&Values> = expanded.iter().collect();
    let values = Values::concatenate(0, &refs)?;

    let mut dims = Vec::with_capacity(first.dims.len() + 1);
    dims.push(dim.to_string());
    dims.extend(first.dims.iter().cloned());
    Ok(Variable {
        dims,
        values,
        attrs: first.attrs.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::testing::synthetic_run;
    use crate::dataset::Attrs;
    use ndarray::{ArrayD, IxDyn};

    fn single_var(ds: &Dataset, keep: &str) -> Dataset {
        let mut out = ds.clone();
        out.data_vars.retain(|name, _| name == keep);
        out
    }

    #[test]
    fn test_merge_combines_variables() {
        let tas_run = synthetic_run(0.0, &[10.0, 20.0], &[100.0, 200.0], 3);
        let mut pr_run = tas_run.clone();
        let pr = pr_run.data_vars.remove("tas").unwrap();
        pr_run.data_vars.insert("pr".to_string(), pr);

        let merged = merge("GFDL-CM4.amip", vec![tas_run, pr_run]).unwrap();
        assert_eq!(
            merged.data_vars.keys().collect::<Vec<_>>(),
            vec!["pr", "tas"]
        );
        assert_eq!(merged.dim_len("time"), Some(3));
    }

    #[test]
    fn test_merge_conflicting_grid() {
        let a = synthetic_run(0.0, &[10.0, 20.0], &[100.0, 200.0], 3);
        let mut b = synthetic_run(0.0, &[11.0, 21.0], &[100.0, 200.0], 3);
        let pr = b.data_vars.remove("tas").unwrap();
        b.data_vars.insert("pr".to_string(), pr);

        let err = merge("run", vec![a, b]).unwrap_err();
        assert!(matches!(err, DatasetError::MergeConflict { ref detail, .. } if detail.contains("lat")));
    }

    #[test]
    fn test_merge_conflicting_calendar() {
        let a = synthetic_run(0.0, &[10.0, 20.0], &[100.0, 200.0], 3);
        let mut b = a.clone();
        b.coords
            .get_mut("time")
            .unwrap()
            .attrs
            .insert("calendar".to_string(), "julian".into());
        let err = merge("run", vec![a, b]).unwrap_err();
        assert!(matches!(err, DatasetError::MergeConflict { ref detail, .. } if detail.contains("calendar")));
    }

    fn scalar(value: f64) -> Variable {
        Variable::from_parts(
            vec![],
            Values::Double(ArrayD::from_elem(IxDyn(&[]), value)),
            Attrs::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_merge_keeps_first_scalar_height() {
        // tas is reported at 2 m, uas at 10 m
        let mut tas_run = synthetic_run(0.0, &[10.0, 20.0], &[100.0, 200.0], 3);
        tas_run.insert_coord("height", scalar(2.0)).unwrap();
        let mut uas_run = tas_run.clone();
        let uas = uas_run.data_vars.remove("tas").unwrap();
        uas_run.data_vars.insert("uas".to_string(), uas);
        uas_run.insert_coord("height", scalar(10.0)).unwrap();

        let merged = merge("GFDL-CM4.amip", vec![tas_run, uas_run]).unwrap();
        assert_eq!(merged.data_vars.len(), 2);
        assert_eq!(merged.coord_values("height").unwrap(), vec![2.0]);
    }

    #[test]
    fn test_merge_accepts_time_with_other_epoch() {
        let a = synthetic_run(0.0, &[10.0, 20.0], &[100.0, 200.0], 3);
        let mut b = a.clone();
        let pr = b.data_vars.remove("tas").unwrap();
        b.data_vars.insert("pr".to_string(), pr);
        b.insert_coord(
            "time",
            Variable::coord_f64("time", vec![-12.0, 12.0, 36.0])
                .with_attr("units", "hours since 2014-12-30")
                .with_attr("calendar", "noleap"),
        )
        .unwrap();

        let merged = merge("run", vec![a.clone(), b]).unwrap();
        assert_eq!(merged.coords["time"], a.coords["time"]);
    }

    #[test]
    fn test_concat_aligns_decoded_time() {
        let a = synthetic_run(0.0, &[10.0, 20.0], &[100.0, 200.0], 3).squeeze();
        let mut b = synthetic_run(9.0, &[10.0, 20.0], &[100.0, 200.0], 3).squeeze();
        // same instants as 2014-12-29 12:00, 12-30 12:00, 12-31 12:00
        b.insert_coord(
            "time",
            Variable::coord_f64("time", vec![-12.0, 12.0, 36.0])
                .with_attr("units", "hours since 2014-12-30 00:00:00")
                .with_attr("calendar", "noleap"),
        )
        .unwrap();

        let combined = concat_new_dim(&[a.clone(), b], "forcing", &["+0K", "+4K"]).unwrap();
        assert_eq!(combined.coords["time"], a.coords["time"]);

        let mut c = a.clone();
        c.insert_coord(
            "time",
            Variable::coord_f64("time", vec![0.0, 24.0, 48.0])
                .with_attr("units", "hours since 2014-12-30 00:00:00")
                .with_attr("calendar", "noleap"),
        )
        .unwrap();
        assert!(matches!(
            concat_new_dim(&[a, c], "forcing", &["+0K", "+4K"]),
            Err(DatasetError::ShapeMismatch(ref m)) if m.contains("time")
        ));
    }

    #[test]
    fn test_concat_new_dim_labels_and_round_trip() {
        let a = synthetic_run(0.0, &[10.0, 20.0, 30.0], &[100.0, 200.0], 4).squeeze();
        let b = synthetic_run(1000.0, &[10.0, 20.0, 30.0], &[100.0, 200.0], 4).squeeze();

        let combined = concat_new_dim(&[a.clone(), b.clone()], "forcing", &["+0K", "+4K"]).unwrap();
        assert_eq!(
            combined.coords["forcing"].values.to_string_vec(),
            vec!["+0K", "+4K"]
        );
        assert_eq!(combined.data_vars["tas"].dims, vec!["forcing", "time", "lat", "lon"]);
        assert_eq!(combined.dim_len("lat"), Some(3));
        assert_eq!(combined.dim_len("time"), Some(4));

        let first = combined.clone().index_dim("forcing", 0).unwrap();
        let second = combined.index_dim("forcing", 1).unwrap();
        assert!(first.data_vars["tas"].values.same_as(&a.data_vars["tas"].values));
        assert!(second.data_vars["tas"].values.same_as(&b.data_vars["tas"].values));
        assert_eq!(first.coords["lat"], a.coords["lat"]);
    }

    #[test]
    fn test_concat_shape_mismatch() {
        let a = synthetic_run(0.0, &[10.0, 20.0, 30.0], &[100.0, 200.0], 4).squeeze();
        let b = synthetic_run(0.0, &[10.0, 20.0, 30.0], &[100.0, 200.0], 5).squeeze();
        let err = concat_new_dim(&[a.clone(), b], "forcing", &["+0K", "+4K"]).unwrap_err();
        assert!(matches!(err, DatasetError::ShapeMismatch(_)));

        let c = synthetic_run(0.0, &[10.0, 20.0, 35.0], &[100.0, 200.0], 4).squeeze();
        let err = concat_new_dim(&[a.clone(), c], "forcing", &["+0K", "+4K"]).unwrap_err();
        assert!(matches!(err, DatasetError::ShapeMismatch(ref m) if m.contains("lat")));

        let d = single_var(&a, "missing");
        let err = concat_new_dim(&[a.clone(), d], "forcing", &["+0K", "+4K"]).unwrap_err();
        assert!(matches!(err, DatasetError::ShapeMismatch(_)));

        assert!(concat_new_dim(&[a], "forcing", &["+0K", "+4K"]).is_err());
    }

    #[test]
    fn test_concat_differing_scalar_coordinate_is_stacked() {
        let mut a = synthetic_run(0.0, &[10.0, 20.0], &[100.0, 200.0], 2).squeeze();
        let mut b = a.clone();
        let height = |h: f64| {
            Variable::from_parts(
                vec![],
                Values::Double(ArrayD::from_elem(IxDyn(&[]), h)),
                Attrs::new(),
            )
            .unwrap()
        };
        a.insert_coord("height", height(2.0)).unwrap();
        b.insert_coord("height", height(10.0)).unwrap();

        let combined = concat_new_dim(&[a, b], "forcing", &["+0K", "+4K"]).unwrap();
        assert_eq!(combined.coords["height"].dims, vec!["forcing"]);
        assert_eq!(combined.coord_values("height").unwrap(), vec![2.0, 10.0]);
    }
}
