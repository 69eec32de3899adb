//! Serialization of normalized tables and run summaries.

use crate::error::{Error, Result};
use crate::normalize::NormalizedTable;
use crate::types::RunReport;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Write one table as UTF-8 CSV: header row, no index column
pub fn write_table_to<W: Write>(table: &NormalizedTable, writer: W) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(table.headers())?;
    for row in table.rows() {
        csv_writer.write_record(row)?;
    }
    csv_writer.flush()?;
    Ok(())
}

/// Write a table to `path`, reporting any failure as an output error
pub fn write_table(table: &NormalizedTable, path: &Path) -> Result<()> {
    let result = File::create(path)
        .map_err(Error::from)
        .and_then(|file| write_table_to(table, BufWriter::new(file)));
    result.map_err(|err| Error::OutputWrite {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

/// Write the per-hive outcomes as pretty JSON
pub fn write_summary(report: &RunReport, path: &Path) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, report)?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}
