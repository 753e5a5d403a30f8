// Shared plumbing for the CSV loaders: database connection, cell cleaning,
// the per-row savepoint loop, and the failed-rows side files.

use std::env;
use std::error::Error;
use std::fs::OpenOptions;
use std::path::Path;

use itertools::Itertools;
use log::error;
use postgres::{Client, NoTls, Transaction};
use regex::Regex;
use rust_decimal::Decimal;

/// A structural problem with an input file or the environment.  These abort
/// the whole run before any row is attempted.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("column '{0}' not found in the input file")]
    MissingColumn(String),
    #[error("environment variable '{0}' is not set")]
    MissingEnvVar(String),
}

/// Connect to the hospital database.  Connection parameters come from the
/// environment, see the `.env` files.
pub fn connect() -> Result<Client, Box<dyn Error>> {
    let mut config = postgres::Config::new();
    config
        .host(&env_var("DB_HOST")?)
        .dbname(&env_var("DB_NAME")?)
        .user(&env_var("DB_USER")?)
        .password(env_var("DB_PASSWORD")?);
    if let Ok(port) = env::var("DB_PORT") {
        config.port(port.parse::<u16>()?);
    }
    Ok(config.connect(NoTls)?)
}

fn env_var(name: &str) -> Result<String, LoadError> {
    env::var(name).map_err(|_| LoadError::MissingEnvVar(name.to_string()))
}

/// Position of a required column in the header record.  A missing column
/// means the file doesn't have the expected shape, so the whole batch fails.
pub fn column_index(headers: &csv::StringRecord, name: &str) -> Result<usize, LoadError> {
    headers
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| LoadError::MissingColumn(name.to_string()))
}

/// Map empty cells and the "Not Available" marker to `None`.
pub fn clean_text(cell: &str) -> Option<String> {
    let cell = cell.trim();
    if cell.is_empty() || cell == "Not Available" {
        None
    } else {
        Some(cell.to_string())
    }
}

/// Parse a seven-day average cell.  The capacity files use -999999 as a
/// "not reported" sentinel, in several textual forms (-999999, -999999.0).
pub fn parse_report_average(cell: &Option<String>) -> Result<Option<Decimal>, Box<dyn Error>> {
    match cell {
        None => Ok(None),
        Some(s) => {
            let value: Decimal = s.trim().parse()?;
            if value == Decimal::from(-999999) {
                Ok(None)
            } else {
                Ok(Some(value))
            }
        }
    }
}

/// Parse the "Emergency Services" flag from a quality report.
pub fn parse_yes_no(cell: &str) -> Result<bool, Box<dyn Error>> {
    match cell.trim().to_lowercase().as_str() {
        "yes" => Ok(true),
        "no" => Ok(false),
        _ => Err(format!("Failed to parse '{}' as a yes/no flag", cell).into()),
    }
}

/// Extract (longitude, latitude) from a geocoded point string, e.g.
/// "POINT (-80.067053 40.38353)".  Many facilities are not geocoded, so no
/// coordinates is not an error.  Either both coordinates are returned or
/// neither is.
pub fn parse_point(cell: &str) -> (Option<Decimal>, Option<Decimal>) {
    let re = Regex::new(r"-?\d+\.\d+").unwrap();
    let tokens: Vec<&str> = re.find_iter(cell).map(|m| m.as_str()).take(2).collect();
    if tokens.len() < 2 {
        return (None, None);
    }
    match (tokens[0].parse::<Decimal>(), tokens[1].parse::<Decimal>()) {
        (Ok(long), Ok(lat)) => (Some(long), Some(lat)),
        _ => (None, None),
    }
}

/// Row types that can be appended to a failed-rows side file.
pub trait CsvRecord {
    /// Column names, in the order the fields are written out.
    fn columns() -> &'static [&'static str];
    /// Cell values aligned with [`CsvRecord::columns`].  `None` marks a null.
    fn fields(&self) -> Vec<Option<String>>;
}

/// Append-only CSV file collecting the rows that failed to load, for manual
/// inspection and reprocessing.  Never read back by the loaders.
pub struct FailedRowsFile {
    pub path: String,
}

impl FailedRowsFile {
    /// Append one failed row, labeled with its position in the input file.
    /// The header is written only when the file does not exist yet.
    pub fn append<R: CsvRecord>(&self, index: usize, row: &R) -> Result<(), Box<dyn Error>> {
        let exists = Path::new(&self.path).exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if !exists {
            let mut header = vec!["row_index"];
            header.extend_from_slice(R::columns());
            wtr.write_record(&header)?;
        }
        let mut record = vec![index.to_string()];
        record.extend(
            row.fields()
                .into_iter()
                .map(|f| f.unwrap_or_else(|| "NULL".to_string())),
        );
        wtr.write_record(&record)?;
        wtr.flush()?;
        Ok(())
    }
}

/// Run each row through `exec` inside its own savepoint nested in `tx`.
/// A row that fails is rolled back to the savepoint, logged, and appended
/// to `failed`; earlier rows keep their effects and the loop continues.
/// Returns the number of rows that succeeded.
pub fn load_rows<R, F>(
    tx: &mut Transaction,
    rows: &[R],
    table: &str,
    failed: &FailedRowsFile,
    mut exec: F,
) -> Result<usize, Box<dyn Error>>
where
    R: CsvRecord,
    F: FnMut(&mut Transaction<'_>, &R) -> Result<(), Box<dyn Error>>,
{
    let mut count = 0;
    for (index, row) in rows.iter().enumerate() {
        let mut savepoint = tx.transaction()?;
        match exec(&mut savepoint, row) {
            Ok(()) => {
                savepoint.commit()?;
                count += 1;
            }
            Err(e) => {
                savepoint.rollback()?;
                error!("{}", e);
                error!(
                    "Insert into {} failed for row {}: {}",
                    table,
                    index,
                    R::columns()
                        .iter()
                        .zip(row.fields())
                        .map(|(name, field)| format!(
                            "{}={}",
                            name,
                            field.unwrap_or_else(|| "NULL".to_string())
                        ))
                        .join(", ")
                );
                failed.append(index, row)?;
                error!("Appended failed row to {}", failed.path);
            }
        }
    }
    Ok(count)
}
