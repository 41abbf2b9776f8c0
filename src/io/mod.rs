//! File import and export.

#[cfg(feature = "csv")]
pub mod csv;
