//! Observation container: a named time × space field with missing cells as NaN.

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{BpcaError, Result};

/// A single time series, e.g. the height record of one station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Decimal years.
    pub time: Vec<f64>,
    pub values: Vec<f64>,
}

/// Time × space observation matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observations {
    pub name: String,
    /// Decimal years, one per row.
    pub time: Array1<f64>,
    /// Location labels, one per column.
    pub space: Vec<String>,
    pub values: Array2<f64>,
}

impl Observations {
    pub fn new(
        name: impl Into<String>,
        time: Array1<f64>,
        space: Vec<String>,
        values: Array2<f64>,
    ) -> Result<Self> {
        let (n_time, n_space) = values.dim();
        if time.len() != n_time {
            return Err(BpcaError::ShapeMismatch {
                what: "time axis",
                expected: n_time,
                found: time.len(),
            });
        }
        if space.len() != n_space {
            return Err(BpcaError::ShapeMismatch {
                what: "space axis",
                expected: n_space,
                found: space.len(),
            });
        }
        Ok(Self {
            name: name.into(),
            time,
            space,
            values,
        })
    }

    /// Builds a field with integer time steps and numbered locations.
    pub fn from_matrix(name: impl Into<String>, values: Array2<f64>) -> Self {
        let (n_time, n_space) = values.dim();
        Self {
            name: name.into(),
            time: Array1::from_iter((0..n_time).map(|t| t as f64)),
            space: (0..n_space).map(|x| x.to_string()).collect(),
            values,
        }
    }

    /// Stacks station series on the union of their time stamps. Stations without
    /// a value at a given time get NaN.
    pub fn from_series<I, S>(name: impl Into<String>, series: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, TimeSeries)>,
        S: Into<String>,
    {
        let series: Vec<(String, TimeSeries)> =
            series.into_iter().map(|(s, ts)| (s.into(), ts)).collect();
        let mut times: Vec<f64> = Vec::new();
        for (_, ts) in &series {
            if ts.time.len() != ts.values.len() {
                return Err(BpcaError::ShapeMismatch {
                    what: "series values",
                    expected: ts.time.len(),
                    found: ts.values.len(),
                });
            }
            times.extend(ts.time.iter().copied());
        }
        times.sort_by(f64::total_cmp);
        times.dedup();

        let mut values = Array2::from_elem((times.len(), series.len()), f64::NAN);
        for (column, (_, ts)) in series.iter().enumerate() {
            for (&t, &v) in ts.time.iter().zip(&ts.values) {
                if let Ok(row) = times.binary_search_by(|probe| probe.total_cmp(&t)) {
                    values[[row, column]] = v;
                }
            }
        }
        let time = Array1::from(times);
        let space = series.into_iter().map(|(s, _)| s).collect();
        Self::new(name, time, space, values)
    }

    pub fn n_time(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_space(&self) -> usize {
        self.values.ncols()
    }

    /// Per-location variance over time, skipping missing cells.
    pub fn temporal_variance(&self) -> Array1<f64> {
        nan_variance(&self.values)
    }
}

/// Population variance along time of every column, ignoring NaN.
pub(crate) fn nan_variance(values: &Array2<f64>) -> Array1<f64> {
    values.map_axis(Axis(0), |column| {
        let present: Vec<f64> = column.iter().copied().filter(|v| !v.is_nan()).collect();
        if present.is_empty() {
            return f64::NAN;
        }
        let n = present.len() as f64;
        let mean = present.iter().sum::<f64>() / n;
        present.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn new_checks_axes() {
        let err = Observations::new("x", array![0.0, 1.0], vec!["a".into()], Array2::zeros((3, 1)))
            .unwrap_err();
        assert!(matches!(err, BpcaError::ShapeMismatch { what: "time axis", .. }));
    }

    #[test]
    fn series_are_aligned_with_gaps() {
        let a = TimeSeries {
            time: vec![2000.0, 2000.5],
            values: vec![1.0, 2.0],
        };
        let b = TimeSeries {
            time: vec![2000.5, 2001.0],
            values: vec![3.0, 4.0],
        };
        let obs = Observations::from_series("heights", [("A", a), ("B", b)]).unwrap();
        assert_eq!(obs.time, array![2000.0, 2000.5, 2001.0]);
        assert_eq!(obs.space, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(obs.values[[0, 0]], 1.0);
        assert!(obs.values[[0, 1]].is_nan());
        assert_eq!(obs.values[[1, 1]], 3.0);
        assert!(obs.values[[2, 0]].is_nan());
    }

    #[test]
    fn variance_skips_missing() {
        let values = array![[1.0, f64::NAN], [3.0, 2.0], [f64::NAN, 2.0]];
        let var = nan_variance(&values);
        assert_eq!(var, array![1.0, 0.0]);
    }
}
