// CMS Hospital General Information (quality) reports.
// https://data.cms.gov/provider-data/dataset/xubh-q36u

use std::error::Error;
use std::fs::File;
use std::io::Read;

use jiff::civil::Date;
use log::{debug, info};
use postgres::{Client, Transaction};
use serde::Serialize;

use crate::db::lib_load::{
    clean_text, column_index, load_rows, parse_yes_no, CsvRecord, FailedRowsFile,
};

const UPDATE_HOSPITAL: &str = r#"
    UPDATE hospitals AS h
    SET (county, type, ownership) = ($1, $2, $3)
    WHERE h.hospital_id = $4;
"#;

const INSERT_STATUS: &str = r#"
    INSERT INTO statuses (
        hospital_id,
        report_date,
        emergency,
        overall_quality_rating
    )
    VALUES ($1, $2, $3, $4);
"#;

/// The quality-report attributes folded back into an existing hospital.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HospitalUpdateRow {
    pub facility_id: Option<String>,
    pub county: Option<String>,
    pub hospital_type: Option<String>,
    pub ownership: Option<String>,
}

impl CsvRecord for HospitalUpdateRow {
    fn columns() -> &'static [&'static str] {
        &[
            "Facility ID",
            "County Name",
            "Hospital Type",
            "Hospital Ownership",
        ]
    }

    fn fields(&self) -> Vec<Option<String>> {
        vec![
            self.facility_id.clone(),
            self.county.clone(),
            self.hospital_type.clone(),
            self.ownership.clone(),
        ]
    }
}

/// Emergency-services flag and overall rating for one facility.  Cells are
/// kept as cleaned strings; the typed parse happens at write time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusRow {
    pub facility_id: Option<String>,
    pub emergency: Option<String>,
    pub overall_quality_rating: Option<String>,
}

impl CsvRecord for StatusRow {
    fn columns() -> &'static [&'static str] {
        &[
            "Facility ID",
            "Emergency Services",
            "Hospital overall rating",
        ]
    }

    fn fields(&self) -> Vec<Option<String>> {
        vec![
            self.facility_id.clone(),
            self.emergency.clone(),
            self.overall_quality_rating.clone(),
        ]
    }
}

#[derive(Clone)]
pub struct CmsQualityArchive {
    pub base_dir: String,
}

impl CmsQualityArchive {
    /// Path to a quality file, e.g. "hospital_qualities/Hospital_General_Information-2021-07.csv"
    pub fn filename(&self, name: &str) -> String {
        self.base_dir.to_owned() + "/" + name
    }

    /// Read one quality report and normalize it into the hospital-update and
    /// status subsets.  Fails if any expected column is missing.
    pub fn read_file(
        &self,
        path: String,
    ) -> Result<(Vec<HospitalUpdateRow>, Vec<StatusRow>), Box<dyn Error>> {
        let mut file = File::open(path)?;
        let mut buffer = String::new();
        file.read_to_string(&mut buffer)?;

        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(buffer.as_bytes());
        let headers = rdr.headers()?.clone();

        let facility_id = column_index(&headers, "Facility ID")?;
        let county = column_index(&headers, "County Name")?;
        let hospital_type = column_index(&headers, "Hospital Type")?;
        let ownership = column_index(&headers, "Hospital Ownership")?;
        let emergency = column_index(&headers, "Emergency Services")?;
        let rating = column_index(&headers, "Hospital overall rating")?;

        let mut updates: Vec<HospitalUpdateRow> = Vec::new();
        let mut statuses: Vec<StatusRow> = Vec::new();
        for result in rdr.records() {
            let record = result?;
            let cell = |i: usize| clean_text(record.get(i).unwrap_or(""));

            updates.push(HospitalUpdateRow {
                facility_id: cell(facility_id),
                county: cell(county),
                hospital_type: cell(hospital_type),
                ownership: cell(ownership),
            });
            statuses.push(StatusRow {
                facility_id: cell(facility_id),
                emergency: cell(emergency),
                overall_quality_rating: cell(rating),
            });
        }

        Ok((updates, statuses))
    }

    /// Load one quality file: refresh county/type/ownership on the hospitals
    /// already on file, then append the statuses with the supplied report
    /// date (the file itself carries no date).  One transaction for the
    /// whole file, one savepoint per row.  Returns the (updated, statuses)
    /// counts.
    pub fn load(
        &self,
        client: &mut Client,
        report_date: Date,
        name: &str,
    ) -> Result<(usize, usize), Box<dyn Error>> {
        let (updates, statuses) = self.read_file(self.filename(name))?;

        let mut tx = client.transaction()?;

        let n_updated = load_rows(
            &mut tx,
            &updates,
            "Hospitals",
            &FailedRowsFile {
                path: "failed_rows_quality.csv".to_string(),
            },
            execute_hospital_update,
        )?;
        info!("{} rows were updated", n_updated);

        let n_statuses = load_rows(
            &mut tx,
            &statuses,
            "Statuses",
            &FailedRowsFile {
                path: "failed_rows_status.csv".to_string(),
            },
            |tx: &mut Transaction<'_>, row: &StatusRow| execute_status_insert(tx, row, report_date),
        )?;
        info!("{} rows were loaded to Statuses table", n_statuses);

        tx.commit()?;
        Ok((n_updated, n_statuses))
    }
}

/// Overwrite the county, type and ownership of an existing hospital.  A
/// facility with no matching hospital row updates nothing and still counts
/// as a success; the capacity reports are the system of record for which
/// hospitals exist.
pub fn execute_hospital_update(
    tx: &mut Transaction,
    row: &HospitalUpdateRow,
) -> Result<(), Box<dyn Error>> {
    let n = tx.execute(
        UPDATE_HOSPITAL,
        &[
            &row.county,
            &row.hospital_type,
            &row.ownership,
            &row.facility_id,
        ],
    )?;
    if n == 0 {
        debug!(
            "no hospital on file for facility {}, nothing updated",
            row.facility_id.as_deref().unwrap_or("NULL")
        );
    }
    Ok(())
}

/// Append the emergency-services flag and overall rating for one facility.
/// Re-loading the same file and date inserts duplicate rows; there is no
/// natural-key constraint on statuses.
pub fn execute_status_insert(
    tx: &mut Transaction,
    row: &StatusRow,
    report_date: Date,
) -> Result<(), Box<dyn Error>> {
    let emergency: Option<bool> = match &row.emergency {
        Some(s) => Some(parse_yes_no(s)?),
        None => None,
    };
    let rating: Option<i32> = match &row.overall_quality_rating {
        Some(s) => Some(s.trim().parse()?),
        None => None,
    };
    tx.execute(
        INSERT_STATUS,
        &[&row.facility_id, &report_date, &emergency, &rating],
    )?;
    Ok(())
}
