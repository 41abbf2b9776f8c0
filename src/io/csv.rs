/*!
# CSV Import and Export

Reads observation data from CSV and writes sample bundles to CSV. Enable via
the `csv` feature.

Observation files have a `time` column plus one column per data stream.
Empty cells and `NA` mark a stream as unobserved at that time.
*/

use std::error::Error;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use csv::{Reader, Writer};
use ndarray::Axis;

use crate::data::{DataRecord, ObservationData};
use crate::error::MontyError;
use crate::samples::Samples;

fn parse_cell(cell: &str) -> Result<Option<f64>, Box<dyn Error>> {
    let cell = cell.trim();
    if cell.is_empty() || cell.eq_ignore_ascii_case("na") {
        return Ok(None);
    }
    Ok(Some(cell.parse::<f64>()?))
}

/// Read observation data from any CSV source.
pub fn read_observations_from<R: Read>(
    reader: R,
    time_start: f64,
) -> Result<ObservationData, Box<dyn Error>> {
    let mut rdr = Reader::from_reader(reader);
    let headers = rdr.headers()?.clone();
    let time_col = headers
        .iter()
        .position(|h| h.trim() == "time")
        .ok_or_else(|| MontyError::UnknownName("time".to_string()))?;
    let streams: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != time_col)
        .map(|(i, h)| (i, h.trim().to_string()))
        .collect();

    let mut records = Vec::new();
    for row in rdr.records() {
        let row = row?;
        let time = parse_cell(row.get(time_col).unwrap_or(""))?
            .ok_or_else(|| MontyError::invalid("missing value in the time column"))?;
        let mut record = DataRecord::new(time);
        for (i, name) in &streams {
            record = record.with(name.as_str(), parse_cell(row.get(*i).unwrap_or(""))?);
        }
        records.push(record);
    }
    Ok(ObservationData::new(time_start, records)?)
}

/**
Read observation data from a CSV file.

# Examples

```rust
use mini_monty::io::csv::read_observations;
use std::io::Write;

let path = std::env::temp_dir().join("mini_monty_doc_obs.csv");
let mut f = std::fs::File::create(&path).unwrap();
writeln!(f, "time,cases,deaths\n1,3,NA\n2,5,0\n3,,1").unwrap();

let data = read_observations(&path, 0.0).unwrap();
assert_eq!(data.times(), vec![1.0, 2.0, 3.0]);
assert_eq!(data.records()[0].get("deaths"), None);
assert_eq!(data.records()[2].get("deaths"), Some(1.0));
```
*/
pub fn read_observations<P: AsRef<Path>>(
    path: P,
    time_start: f64,
) -> Result<ObservationData, Box<dyn Error>> {
    read_observations_from(File::open(path)?, time_start)
}

/**
Saves a sample bundle as a CSV file.

The header is `chain`, `step`, `density` followed by one column per
parameter; each row is one draw of one chain.
*/
pub fn save_samples<P: AsRef<Path>>(samples: &Samples, path: P) -> Result<(), Box<dyn Error>> {
    let mut wtr = Writer::from_writer(File::create(path)?);

    let mut header: Vec<String> = vec!["chain".into(), "step".into(), "density".into()];
    header.extend(samples.parameter_names.iter().cloned());
    wtr.write_record(&header)?;

    for (chain_idx, chain) in samples.pars.axis_iter(Axis(2)).enumerate() {
        for (step_idx, draw) in chain.axis_iter(Axis(1)).enumerate() {
            let mut row = vec![
                chain_idx.to_string(),
                step_idx.to_string(),
                samples.density[[step_idx, chain_idx]].to_string(),
            ];
            row.extend(draw.iter().map(|v| v.to_string()));
            wtr.write_record(&row)?;
        }
    }

    wtr.flush()?;
    Ok(())
}
