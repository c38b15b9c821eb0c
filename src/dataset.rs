//! # In-Memory Datasets
//!
//! A small labeled-array model: a [`Dataset`] holds named coordinate and data
//! [`Variable`]s, each an n-dimensional [`Values`] array with named dimensions
//! and CF attributes. Dimension lengths are kept consistent across every
//! variable of a dataset.
//!
//! ## Key Operations
//!
//! - [`Dataset::squeeze`]: remove every size-one dimension
//! - [`Dataset::isel`]: select positions along one dimension
//! - [`Dataset::index_dim`]: take a single position, dropping the dimension
//! - [`Dataset::drop_vars`]: remove variables by name

use crate::error::DatasetError;
use ndarray::{Array1, ArrayD, Axis};
use std::collections::BTreeMap;
use std::fmt;

/// Attribute value attached to a variable or a dataset
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Text(String),
    Number(f64),
    Numbers(Vec<f64>),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Number(v) => Some(*v),
            AttrValue::Numbers(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }

    /// Converts a JSON attribute (zarr `.zattrs`) into an attribute value.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => Some(AttrValue::Text(s.clone())),
            serde_json::Value::Number(n) => n.as_f64().map(AttrValue::Number),
            serde_json::Value::Bool(b) => Some(AttrValue::Number(if *b { 1.0 } else { 0.0 })),
            serde_json::Value::Array(items) => {
                let numbers: Option<Vec<f64>> = items.iter().map(|v| v.as_f64()).collect();
                match numbers {
                    Some(numbers) => Some(AttrValue::Numbers(numbers)),
                    None => {
                        let texts: Vec<String> = items
                            .iter()
                            .map(|v| match v {
                                serde_json::Value::String(s) => s.clone(),
                                other => other.to_string(),
                            })
                            .collect();
                        Some(AttrValue::Text(texts.join(" ")))
                    }
                }
            }
            serde_json::Value::Null | serde_json::Value::Object(_) => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Text(value.to_string())
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Number(value)
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Text(s) => write!(f, "{}", s),
            AttrValue::Number(v) => write!(f, "{}", v),
            AttrValue::Numbers(v) => write!(f, "{:?}", v),
        }
    }
}

pub type Attrs = BTreeMap<String, AttrValue>;

/// Typed n-dimensional array of a variable
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    Float(ArrayD<f32>),
    Double(ArrayD<f64>),
    Text(ArrayD<String>),
}

macro_rules! map_values {
    ($values:expr, $arr:ident => $body:expr) => {
        match $values {
            Values::Float($arr) => Values::Float($body),
            Values::Double($arr) => Values::Double($body),
            Values::Text($arr) => Values::Text($body),
        }
    };
}

impl Values {
    pub fn shape(&self) -> &[usize] {
        match self {
            Values::Float(a) => a.shape(),
            Values::Double(a) => a.shape(),
            Values::Text(a) => a.shape(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype_name(&self) -> &'static str {
        match self {
            Values::Float(_) => "float32",
            Values::Double(_) => "float64",
            Values::Text(_) => "str",
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, Values::Text(_))
    }

    /// Values along `axis` at the given positions, in the given order.
    pub fn select(&self, axis: usize, indices: &[usize]) -> Values {
        map_values!(self, a => a.select(Axis(axis), indices))
    }

    /// Single position along `axis`; the axis is removed.
    pub fn index_axis(&self, axis: usize, index: usize) -> Values {
        map_values!(self, a => a.index_axis(Axis(axis), index).to_owned())
    }

    /// New length-one axis at position `axis`.
    pub fn insert_axis(self, axis: usize) -> Values {
        map_values!(self, a => a.insert_axis(Axis(axis)))
    }

    /// Joins arrays of the same type along an existing axis.
    pub fn concatenate(axis: usize, parts: &[&Values]) -> Result<Values, DatasetError> {
        let first = parts
            .first()
            .ok_or_else(|| DatasetError::InvalidData("nothing to concatenate".to_string()))?;

        macro_rules! join {
            ($variant:ident) => {{
                let mut views = Vec::with_capacity(parts.len());
                for part in parts {
                    match part {
                        Values::$variant(a) => views.push(a.view()),
                        other => {
                            return Err(DatasetError::ShapeMismatch(format!(
                                "cannot concatenate {} with {}",
                                first.dtype_name(),
                                other.dtype_name()
                            )));
                        }
                    }
                }
                ndarray::concatenate(Axis(axis), &views)
                    .map(Values::$variant)
                    .map_err(|e| DatasetError::ShapeMismatch(e.to_string()))
            }};
        }

        match first {
            Values::Float(_) => join!(Float),
            Values::Double(_) => join!(Double),
            Values::Text(_) => join!(Text),
        }
    }

    /// Numeric values widened to `f64` in logical order.
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        match self {
            Values::Float(a) => Some(a.iter().map(|&v| v as f64).collect()),
            Values::Double(a) => Some(a.iter().copied().collect()),
            Values::Text(_) => None,
        }
    }

    pub fn to_string_vec(&self) -> Vec<String> {
        match self {
            Values::Float(a) => a.iter().map(|v| v.to_string()).collect(),
            Values::Double(a) => a.iter().map(|v| v.to_string()).collect(),
            Values::Text(a) => a.iter().cloned().collect(),
        }
    }

    /// Element-wise equality where NaN equals NaN.
    pub fn same_as(&self, other: &Values) -> bool {
        if self.shape() != other.shape() {
            return false;
        }
        match (self, other) {
            (Values::Float(a), Values::Float(b)) => a
                .iter()
                .zip(b.iter())
                .all(|(x, y)| x == y || (x.is_nan() && y.is_nan())),
            (Values::Double(a), Values::Double(b)) => a
                .iter()
                .zip(b.iter())
                .all(|(x, y)| x == y || (x.is_nan() && y.is_nan())),
            (Values::Text(a), Values::Text(b)) => a == b,
            (Values::Float(_), Values::Double(_)) | (Values::Double(_), Values::Float(_)) => {
                match (self.to_f64_vec(), other.to_f64_vec()) {
                    (Some(a), Some(b)) => a
                        .iter()
                        .zip(b.iter())
                        .all(|(x, y)| x == y || (x.is_nan() && y.is_nan())),
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// Replaces every element equal to `fill` with NaN. Text is left untouched.
    pub fn mask_fill_value(&mut self, fill: f64) {
        match self {
            Values::Float(a) => {
                let fill = fill as f32;
                a.mapv_inplace(|v| if v == fill { f32::NAN } else { v });
            }
            Values::Double(a) => a.mapv_inplace(|v| if v == fill { f64::NAN } else { v }),
            Values::Text(_) => {}
        }
    }
}

/// A named-dimension array with attributes
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub dims: Vec<String>,
    pub values: Values,
    pub attrs: Attrs,
}

impl Variable {
    pub fn new(dims: &[&str], values: Values) -> Result<Self, DatasetError> {
        let dims: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
        Self::from_parts(dims, values, Attrs::new())
    }

    pub fn from_parts(dims: Vec<String>, values: Values, attrs: Attrs) -> Result<Self, DatasetError> {
        if dims.len() != values.ndim() {
            return Err(DatasetError::ShapeMismatch(format!(
                "{} dimension names for a {}-d array",
                dims.len(),
                values.ndim()
            )));
        }
        Ok(Variable {
            dims,
            values,
            attrs,
        })
    }

    /// One-dimensional `f64` coordinate
    pub fn coord_f64(dim: &str, values: Vec<f64>) -> Self {
        Variable {
            dims: vec![dim.to_string()],
            values: Values::Double(Array1::from_vec(values).into_dyn()),
            attrs: Attrs::new(),
        }
    }

    /// One-dimensional text coordinate
    pub fn coord_text<S: Into<String>>(dim: &str, labels: Vec<S>) -> Self {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        Variable {
            dims: vec![dim.to_string()],
            values: Values::Text(Array1::from_vec(labels).into_dyn()),
            attrs: Attrs::new(),
        }
    }

    pub fn with_attr(mut self, name: &str, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(name.to_string(), value.into());
        self
    }

    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).and_then(AttrValue::as_str)
    }

    pub fn axis_of(&self, dim: &str) -> Option<usize> {
        self.dims.iter().position(|d| d == dim)
    }

    pub fn shape(&self) -> &[usize] {
        self.values.shape()
    }

    pub fn has_dims(&self, dims: &[&str]) -> bool {
        dims.iter().all(|d| self.axis_of(d).is_some())
    }
}

/// Collection of coordinate and data variables sharing dimensions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub coords: BTreeMap<String, Variable>,
    pub data_vars: BTreeMap<String, Variable>,
    pub attrs: Attrs,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_coord(mut self, name: &str, var: Variable) -> Result<Self, DatasetError> {
        self.insert_coord(name, var)?;
        Ok(self)
    }

    pub fn with_data_var(mut self, name: &str, var: Variable) -> Result<Self, DatasetError> {
        self.insert_data_var(name, var)?;
        Ok(self)
    }

    pub fn with_attr(mut self, name: &str, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(name.to_string(), value.into());
        self
    }

    pub fn insert_coord(&mut self, name: &str, var: Variable) -> Result<(), DatasetError> {
        self.check_dims(name, &var)?;
        self.data_vars.remove(name);
        self.coords.insert(name.to_string(), var);
        Ok(())
    }

    pub fn insert_data_var(&mut self, name: &str, var: Variable) -> Result<(), DatasetError> {
        self.check_dims(name, &var)?;
        self.coords.remove(name);
        self.data_vars.insert(name.to_string(), var);
        Ok(())
    }

    fn check_dims(&self, name: &str, var: &Variable) -> Result<(), DatasetError> {
        for (dim, &len) in var.dims.iter().zip(var.shape()) {
            if let Some(existing) = self.dim_len(dim) {
                // a variable may replace itself with a different length
                let replaces_only_user = self
                    .variables()
                    .filter(|(n, v)| v.axis_of(dim).is_some() && *n != name)
                    .count()
                    == 0;
                if existing != len && !replaces_only_user {
                    return Err(DatasetError::ShapeMismatch(format!(
                        "variable '{}' has {} = {} but the dataset has {} = {}",
                        name, dim, len, dim, existing
                    )));
                }
            }
        }
        Ok(())
    }

    /// Every variable, coordinates first.
    pub fn variables(&self) -> impl Iterator<Item = (&String, &Variable)> {
        self.coords.iter().chain(self.data_vars.iter())
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.coords.get(name).or_else(|| self.data_vars.get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variable(name).is_some()
    }

    /// Dimensions in first-seen order with their lengths.
    pub fn dims(&self) -> Vec<(String, usize)> {
        let mut dims: Vec<(String, usize)> = Vec::new();
        for (_, var) in self.variables() {
            for (dim, &len) in var.dims.iter().zip(var.shape()) {
                if !dims.iter().any(|(d, _)| d == dim) {
                    dims.push((dim.clone(), len));
                }
            }
        }
        dims
    }

    pub fn dim_len(&self, dim: &str) -> Option<usize> {
        self.variables().find_map(|(_, var)| {
            var.axis_of(dim).map(|axis| var.shape()[axis])
        })
    }

    /// Numeric coordinate (or data variable) values as `f64`.
    pub fn coord_values(&self, name: &str) -> Result<Vec<f64>, DatasetError> {
        let var = self
            .variable(name)
            .ok_or_else(|| DatasetError::MissingVariable(name.to_string()))?;
        var.values.to_f64_vec().ok_or_else(|| {
            DatasetError::InvalidData(format!("variable '{}' is not numeric", name))
        })
    }

    fn map_variables<F>(self, mut f: F) -> Result<Dataset, DatasetError>
    where
        F: FnMut(Variable) -> Result<Variable, DatasetError>,
    {
        let mut out = Dataset {
            attrs: self.attrs,
            ..Dataset::default()
        };
        for (name, var) in self.coords {
            out.coords.insert(name, f(var)?);
        }
        for (name, var) in self.data_vars {
            out.data_vars.insert(name, f(var)?);
        }
        Ok(out)
    }

    /// Removes every dimension of length one. Coordinates along a removed
    /// dimension become scalar coordinates.
    pub fn squeeze(self) -> Dataset {
        let singletons: Vec<String> = self
            .dims()
            .into_iter()
            .filter(|(_, len)| *len == 1)
            .map(|(dim, _)| dim)
            .collect();
        let squeeze_var = |mut var: Variable| {
            for dim in &singletons {
                if let Some(axis) = var.axis_of(dim) {
                    var.values = var.values.index_axis(axis, 0);
                    var.dims.remove(axis);
                }
            }
            var
        };
        Dataset {
            coords: self
                .coords
                .into_iter()
                .map(|(name, var)| (name, squeeze_var(var)))
                .collect(),
            data_vars: self
                .data_vars
                .into_iter()
                .map(|(name, var)| (name, squeeze_var(var)))
                .collect(),
            attrs: self.attrs,
        }
    }

    /// Keeps the given positions along `dim` in every variable that uses it.
    pub fn isel(self, dim: &str, indices: &[usize]) -> Result<Dataset, DatasetError> {
        let len = self
            .dim_len(dim)
            .ok_or_else(|| DatasetError::MissingDimension(dim.to_string()))?;
        if let Some(&bad) = indices.iter().find(|&&i| i >= len) {
            return Err(DatasetError::InvalidData(format!(
                "index {} out of bounds for dimension '{}' of length {}",
                bad, dim, len
            )));
        }
        self.map_variables(|mut var| {
            if let Some(axis) = var.axis_of(dim) {
                var.values = var.values.select(axis, indices);
            }
            Ok(var)
        })
    }

    /// Takes position `index` along `dim` and removes the dimension.
    pub fn index_dim(self, dim: &str, index: usize) -> Result<Dataset, DatasetError> {
        let len = self
            .dim_len(dim)
            .ok_or_else(|| DatasetError::MissingDimension(dim.to_string()))?;
        if index >= len {
            return Err(DatasetError::InvalidData(format!(
                "index {} out of bounds for dimension '{}' of length {}",
                index, dim, len
            )));
        }
        self.map_variables(|mut var| {
            if let Some(axis) = var.axis_of(dim) {
                var.values = var.values.index_axis(axis, index);
                var.dims.remove(axis);
            }
            Ok(var)
        })
    }

    /// Removes variables by name; every name must exist.
    pub fn drop_vars(mut self, names: &[&str]) -> Result<Dataset, DatasetError> {
        for name in names {
            if self.coords.remove(*name).is_none() && self.data_vars.remove(*name).is_none() {
                return Err(DatasetError::MissingVariable(name.to_string()));
            }
        }
        Ok(self)
    }

    /// Approximate in-memory size of all variables in bytes.
    pub fn nbytes(&self) -> usize {
        self.variables()
            .map(|(_, var)| match &var.values {
                Values::Float(a) => a.len() * 4,
                Values::Double(a) => a.len() * 8,
                Values::Text(a) => a.iter().map(String::len).sum(),
            })
            .sum()
    }
}

fn preview(values: &Values) -> String {
    let items = values.to_string_vec();
    let shown: Vec<&str> = items.iter().take(4).map(String::as_str).collect();
    if items.len() > 4 {
        format!("{} ... {}", shown.join(" "), items[items.len() - 1])
    } else {
        shown.join(" ")
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "<Dataset> ({:.1} MB)", self.nbytes() as f64 / 1024.0 / 1024.0)?;
        let dims: Vec<String> = self
            .dims()
            .iter()
            .map(|(d, l)| format!("{}: {}", d, l))
            .collect();
        writeln!(f, "Dimensions:  ({})", dims.join(", "))?;
        writeln!(f, "Coordinates:")?;
        for (name, var) in &self.coords {
            let marker = if var.dims.len() == 1 && &var.dims[0] == name { "*" } else { " " };
            writeln!(
                f,
                "  {} {:<16} ({}) {} {}",
                marker,
                name,
                var.dims.join(", "),
                var.values.dtype_name(),
                preview(&var.values)
            )?;
        }
        writeln!(f, "Data variables:")?;
        for (name, var) in &self.data_vars {
            writeln!(
                f,
                "    {:<16} ({}) {}",
                name,
                var.dims.join(", "),
                var.values.dtype_name()
            )?;
        }
        if !self.attrs.is_empty() {
            writeln!(f, "Attributes: ({})", self.attrs.len())?;
            for (name, value) in self.attrs.iter().take(8) {
                writeln!(f, "    {}: {}", name, value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Synthetic dataset builders shared by the unit tests.

    use super::*;
    use ndarray::IxDyn;

    /// `tas(member_id, time, lat, lon)` on a noleap calendar starting 2014-12-29,
    /// plus `member_id` and `dcpp_init_year` coordinates as attached on open.
    pub fn synthetic_run(offset: f32, lats: &[f64], lons: &[f64], ntime: usize) -> Dataset {
        let shape = [1, ntime, lats.len(), lons.len()];
        let n: usize = shape.iter().product();
        let tas = ArrayD::from_shape_vec(
            IxDyn(&shape),
            (0..n).map(|i| offset + i as f32).collect(),
        )
        .unwrap();
        let times: Vec<f64> = (0..ntime).map(|t| t as f64 + 0.5).collect();

        Dataset::new()
            .with_coord(
                "time",
                Variable::coord_f64("time", times)
                    .with_attr("units", "days since 2014-12-29 00:00:00")
                    .with_attr("calendar", "noleap"),
            )
            .unwrap()
            .with_coord("lat", Variable::coord_f64("lat", lats.to_vec()).with_attr("units", "degrees_north"))
            .unwrap()
            .with_coord("lon", Variable::coord_f64("lon", lons.to_vec()).with_attr("units", "degrees_east"))
            .unwrap()
            .with_coord("member_id", Variable::coord_text("member_id", vec!["r1i1p1f1"]))
            .unwrap()
            .with_coord(
                "dcpp_init_year",
                Variable::from_parts(vec![], Values::Double(ArrayD::from_elem(IxDyn(&[]), f64::NAN)), Attrs::new()).unwrap(),
            )
            .unwrap()
            .with_data_var(
                "tas",
                Variable::from_parts(
                    vec!["member_id".into(), "time".into(), "lat".into(), "lon".into()],
                    Values::Float(tas),
                    Attrs::new(),
                )
                .unwrap()
                .with_attr("units", "K"),
            )
            .unwrap()
            .with_attr("source_id", "GFDL-CM4")
    }
}
