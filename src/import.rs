use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context};
use chrono::{Datelike, NaiveDate};
use serde::Deserialize;
use tracing::warn;

use crate::fiscal::FiscalMonth;
use crate::models::{non_empty, AttendanceRecord, CatalogEntry, NomineeRecord};

#[derive(Deserialize)]
struct CatalogRow {
    training_name: String,
    #[serde(default)]
    pmo_category: Option<String>,
    #[serde(default)]
    pl_category: Option<String>,
    #[serde(default)]
    tni_status: Option<String>,
}

pub fn read_catalog<R: Read>(mut reader: csv::Reader<R>) -> anyhow::Result<Vec<CatalogEntry>> {
    let mut entries = Vec::new();
    for result in reader.deserialize::<CatalogRow>() {
        let row = result?;
        let training_name = row.training_name.trim().to_string();
        if training_name.is_empty() {
            continue;
        }
        entries.push(CatalogEntry {
            training_name,
            pmo_category: non_empty(row.pmo_category),
            pl_category: non_empty(row.pl_category),
            tni_status: non_empty(row.tni_status).unwrap_or_else(|| "TNI".to_string()),
        });
    }
    Ok(entries)
}

pub fn read_catalog_file(path: &Path) -> anyhow::Result<Vec<CatalogEntry>> {
    let reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    read_catalog(reader)
}

#[derive(Debug, Default)]
pub struct NomineeSheet {
    pub records: Vec<NomineeRecord>,
    pub training_columns: Vec<String>,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SheetColumn {
    SrNo,
    PerNo,
    BcNo,
    Name,
    Factory,
}

fn standard_column(header: &str) -> Option<SheetColumn> {
    match header.to_lowercase().as_str() {
        "sr. no" | "sr_no" => Some(SheetColumn::SrNo),
        "per. no" | "per_no" => Some(SheetColumn::PerNo),
        "bc. no" | "bc_no" => Some(SheetColumn::BcNo),
        "name" => Some(SheetColumn::Name),
        "factory" => Some(SheetColumn::Factory),
        _ => None,
    }
}

fn clean_training_header(header: &str) -> String {
    header.replace(['\n', '\r'], " ").trim().to_string()
}

// "1234.0" -> "1234"
fn clean_per_no(value: &str) -> &str {
    let value = value.trim();
    value.strip_suffix(".0").unwrap_or(value)
}

/// Reads the wide nomination sheet (one column of hours per training) and
/// melts it into one record per employee and training with positive hours.
pub fn read_nominee_sheet<R: Read>(
    mut reader: csv::Reader<R>,
    fiscal_year: i32,
) -> anyhow::Result<NomineeSheet> {
    let headers = reader.headers()?.clone();

    let mut standard = Vec::new();
    let mut trainings = Vec::new();
    for (position, header) in headers.iter().enumerate() {
        let header = header.trim();
        if let Some(column) = standard_column(header) {
            standard.push((column, position));
        } else if !header.is_empty() && !header.to_lowercase().starts_with("unnamed") {
            trainings.push((clean_training_header(header), position));
        }
    }

    let column = |wanted: SheetColumn| standard.iter().find(|(c, _)| *c == wanted).map(|(_, p)| *p);
    let Some(per_no_at) = column(SheetColumn::PerNo) else {
        bail!("nominee sheet has no 'Per. No' column");
    };
    if trainings.is_empty() {
        bail!("no training columns found in the uploaded file");
    }
    let name_at = column(SheetColumn::Name);
    let factory_at = column(SheetColumn::Factory);
    let bc_no_at = column(SheetColumn::BcNo);

    let mut sheet = NomineeSheet {
        training_columns: trainings.iter().map(|(name, _)| name.clone()).collect(),
        ..NomineeSheet::default()
    };

    for result in reader.records() {
        let record = result?;
        let cell = |at: Option<usize>| at.and_then(|p| record.get(p)).unwrap_or("").trim();
        let per_no = clean_per_no(cell(Some(per_no_at)));

        for (training_name, position) in &trainings {
            let Some(hours) = record
                .get(*position)
                .and_then(|raw| raw.trim().parse::<f64>().ok())
                .filter(|hours| *hours > 0.0)
            else {
                continue;
            };

            match NomineeRecord::new(
                per_no,
                cell(name_at),
                cell(factory_at),
                cell(bc_no_at),
                training_name,
                hours,
                fiscal_year,
            ) {
                Ok(nominee) => sheet.records.push(nominee),
                Err(err) => {
                    warn!(training = %training_name, error = %err, "skipping nominee row");
                    sheet.skipped += 1;
                }
            }
        }
    }

    Ok(sheet)
}

pub fn read_nominee_file(path: &Path, fiscal_year: i32) -> anyhow::Result<NomineeSheet> {
    let reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    read_nominee_sheet(reader, fiscal_year)
}

#[derive(Deserialize)]
struct AttendanceRow {
    program_id: String,
    per_no: String,
    #[serde(default)]
    participant_name: String,
    #[serde(default)]
    factory: String,
    training_name: String,
    #[serde(default)]
    pmo_category: Option<String>,
    #[serde(default)]
    pl_category: Option<String>,
    #[serde(default)]
    tni_status: Option<String>,
    #[serde(default)]
    calendar_month: Option<String>,
    program_date: NaiveDate,
    #[serde(default)]
    day_1: Option<String>,
    #[serde(default)]
    day_2: Option<String>,
    #[serde(default)]
    day_3: Option<String>,
    #[serde(default)]
    learning_hours: Option<f64>,
}

fn attended(flag: Option<&str>) -> bool {
    matches!(
        flag.map(|f| f.trim().to_lowercase()).as_deref(),
        Some("1" | "y" | "yes" | "true" | "p" | "present")
    )
}

pub fn read_attendance<R: Read>(
    mut reader: csv::Reader<R>,
) -> anyhow::Result<Vec<AttendanceRecord>> {
    let mut records = Vec::new();
    for result in reader.deserialize::<AttendanceRow>() {
        let row = result?;
        let calendar_month = non_empty(row.calendar_month).or_else(|| {
            FiscalMonth::from_calendar_month(row.program_date.month())
                .map(|m| m.column().to_string())
        });

        records.push(AttendanceRecord {
            program_id: row.program_id.trim().to_string(),
            per_no: clean_per_no(&row.per_no).to_string(),
            participant_name: row.participant_name.trim().to_string(),
            factory: row.factory.trim().to_string(),
            training_name: row.training_name.trim().to_string(),
            pmo_category: non_empty(row.pmo_category),
            pl_category: non_empty(row.pl_category),
            tni_status: non_empty(row.tni_status),
            calendar_month,
            program_date: row.program_date,
            day_flags: [
                attended(row.day_1.as_deref()),
                attended(row.day_2.as_deref()),
                attended(row.day_3.as_deref()),
            ],
            learning_hours: row.learning_hours.unwrap_or(0.0),
        });
    }
    Ok(records)
}

pub fn read_attendance_file(path: &Path) -> anyhow::Result<Vec<AttendanceRecord>> {
    let reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    read_attendance(reader)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(data: &str) -> csv::Reader<&[u8]> {
        csv::Reader::from_reader(data.as_bytes())
    }

    #[test]
    fn nominee_sheet_melts_training_columns() {
        let data = "Sr. no,Per. No,BC. No,Name,Factory,Fire & Safety,\"Forklift\nOperation\",Unnamed: 7\n\
                    1,70100.0,BC1,Asha,Pimpri,8,,x\n\
                    2,70101,BC2,Ravi,Sanand,0,4.5,\n\
                    3,70102,BC3,Meena,,abc,2,\n";
        let sheet = read_nominee_sheet(reader(data), 2026).unwrap();

        assert_eq!(sheet.training_columns, vec!["Fire & Safety", "Forklift Operation"]);
        assert_eq!(sheet.records.len(), 3);
        assert_eq!(sheet.records[0].per_no, "70100");
        assert_eq!(sheet.records[0].training_name, "Fire & Safety");
        assert_eq!(sheet.records[1].training_name, "Forklift Operation");
        assert_eq!(sheet.records[1].hours, 4.5);
        assert_eq!(sheet.records[2].factory, "");
        assert!(sheet.records.iter().all(|r| r.fiscal_year == 2026));
    }

    #[test]
    fn nominee_sheet_requires_training_columns() {
        let data = "Per. No,Name,Factory\n1,Asha,Pimpri\n";
        let err = read_nominee_sheet(reader(data), 2026).unwrap_err();
        assert!(err.to_string().contains("no training columns"));
    }

    #[test]
    fn nominee_rows_without_employee_are_skipped() {
        let data = "Per. No,Name,Factory,Welding\n,Asha,Pimpri,3\n";
        let sheet = read_nominee_sheet(reader(data), 2026).unwrap();
        assert!(sheet.records.is_empty());
        assert_eq!(sheet.skipped, 1);
    }

    #[test]
    fn catalog_defaults_to_tni() {
        let data = "training_name,pmo_category,pl_category,tni_status\n\
                    Fire & Safety,Safety,PL-1,\n\
                    Leadership,,,NON TNI\n";
        let entries = read_catalog(reader(data)).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_active());
        assert_eq!(entries[1].pmo_category, None);
        assert!(!entries[1].is_active());
    }

    #[test]
    fn attendance_month_falls_back_to_program_date() {
        let data = "program_id,per_no,training_name,calendar_month,program_date,day_1,day_2\n\
                    P-1,70100,First Aid,,2026-06-12,yes,0\n\
                    P-1,70101,First Aid,July,2026-06-12,P,present\n";
        let records = read_attendance(reader(data)).unwrap();
        assert_eq!(records[0].calendar_month.as_deref(), Some("june"));
        assert_eq!(records[0].day_flags, [true, false, false]);
        assert_eq!(records[1].calendar_month.as_deref(), Some("July"));
        assert_eq!(records[1].day_flags, [true, true, false]);
    }
}
