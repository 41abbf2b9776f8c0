/*!
Observed time series compared against simulated trajectories.

A [`DataRecord`] holds the observations made at a single time; a stream that
was not observed at that time is stored as `None` and is skipped when the
record is compared (it neither rewards nor penalises any particle).
*/

use std::collections::BTreeMap;

use crate::error::{MontyError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct DataRecord {
    pub time: f64,
    values: BTreeMap<String, Option<f64>>,
}

impl DataRecord {
    pub fn new(time: f64) -> Self {
        Self {
            time,
            values: BTreeMap::new(),
        }
    }

    /// Builder-style: record `value` for `stream` (`None` = missing).
    pub fn with(mut self, stream: impl Into<String>, value: Option<f64>) -> Self {
        self.values.insert(stream.into(), value);
        self
    }

    pub fn get(&self, stream: &str) -> Option<f64> {
        self.values.get(stream).copied().flatten()
    }

    /// Streams with an observed (non-missing, non-NaN) value.
    pub fn observed(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values
            .iter()
            .filter_map(|(k, v)| v.filter(|x| !x.is_nan()).map(|x| (k.as_str(), x)))
    }

    pub fn is_empty(&self) -> bool {
        self.observed().next().is_none()
    }

    pub fn streams(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

/// Validated observation data: strictly increasing record times, all after
/// (or at) the start time.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationData {
    time_start: f64,
    records: Vec<DataRecord>,
}

impl ObservationData {
    pub fn new(time_start: f64, records: Vec<DataRecord>) -> Result<Self> {
        if records.is_empty() {
            return Err(MontyError::invalid("observation data must contain at least one record"));
        }
        if !time_start.is_finite() {
            return Err(MontyError::invalid("start time must be finite"));
        }
        let mut previous = time_start;
        for (i, record) in records.iter().enumerate() {
            let ok = if i == 0 {
                record.time >= previous
            } else {
                record.time > previous
            };
            if !ok || !record.time.is_finite() {
                return Err(MontyError::TimeOrder {
                    requested: record.time,
                    current: previous,
                });
            }
            previous = record.time;
        }
        Ok(Self {
            time_start,
            records,
        })
    }

    /// Build from a time column plus one column per named stream.
    ///
    /// `NaN` entries are treated as missing.
    pub fn from_columns(
        time_start: f64,
        time: &[f64],
        columns: &[(&str, Vec<f64>)],
    ) -> Result<Self> {
        for (name, col) in columns {
            if col.len() != time.len() {
                return Err(MontyError::shape(format!("data column '{name}'"), time.len(), col.len()));
            }
        }
        let records = time
            .iter()
            .enumerate()
            .map(|(i, &t)| {
                columns.iter().fold(DataRecord::new(t), |rec, (name, col)| {
                    let x = col[i];
                    rec.with(*name, if x.is_nan() { None } else { Some(x) })
                })
            })
            .collect();
        Self::new(time_start, records)
    }

    pub fn time_start(&self) -> f64 {
        self.time_start
    }

    pub fn records(&self) -> &[DataRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn times(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.time).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_values_are_not_observed() {
        let rec = DataRecord::new(1.0)
            .with("cases", Some(3.0))
            .with("deaths", None)
            .with("tests", Some(f64::NAN));
        let observed: Vec<_> = rec.observed().collect();
        assert_eq!(observed, vec![("cases", 3.0)]);
        assert!(!rec.is_empty());
        assert!(DataRecord::new(2.0).with("cases", None).is_empty());
    }

    #[test]
    fn times_must_increase() {
        let recs = vec![DataRecord::new(1.0), DataRecord::new(1.0)];
        assert!(matches!(
            ObservationData::new(0.0, recs),
            Err(MontyError::TimeOrder { .. })
        ));
        let recs = vec![DataRecord::new(1.0)];
        assert!(ObservationData::new(2.0, recs).is_err());
        let recs = vec![DataRecord::new(0.0), DataRecord::new(4.0)];
        assert!(ObservationData::new(0.0, recs).is_ok());
    }

    #[test]
    fn from_columns_treats_nan_as_missing() {
        let data = ObservationData::from_columns(
            0.0,
            &[1.0, 2.0],
            &[("cases", vec![5.0, f64::NAN])],
        )
        .unwrap();
        assert_eq!(data.records()[0].get("cases"), Some(5.0));
        assert_eq!(data.records()[1].get("cases"), None);
        assert_eq!(data.times(), vec![1.0, 2.0]);
    }
}
