use std::ops::{Index, IndexMut};

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::fiscal::FiscalMonth;

#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{field} must not be negative (got {value})")]
    Negative { field: &'static str, value: i64 },
    #[error("hours must be positive (got {0})")]
    NonPositiveHours(f64),
}

pub fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub training_name: String,
    pub pmo_category: Option<String>,
    pub pl_category: Option<String>,
    pub tni_status: String,
}

impl CatalogEntry {
    pub fn is_active(&self) -> bool {
        self.tni_status.trim().eq_ignore_ascii_case("TNI")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonthlyCounts([i32; 12]);

impl MonthlyCounts {
    pub fn total(&self) -> i32 {
        self.0.iter().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FiscalMonth, i32)> + '_ {
        FiscalMonth::ALL.into_iter().zip(self.0.iter().copied())
    }

    pub fn add(&mut self, other: &MonthlyCounts) {
        for (slot, value) in self.0.iter_mut().zip(other.0.iter()) {
            *slot += value;
        }
    }
}

impl Index<FiscalMonth> for MonthlyCounts {
    type Output = i32;

    fn index(&self, month: FiscalMonth) -> &i32 {
        &self.0[month.position()]
    }
}

impl IndexMut<FiscalMonth> for MonthlyCounts {
    fn index_mut(&mut self, month: FiscalMonth) -> &mut i32 {
        &mut self.0[month.position()]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingTarget {
    pub id: Uuid,
    pub training_name: String,
    pub pmo_category: Option<String>,
    pub pl_category: Option<String>,
    pub fiscal_year: i32,
    pub target: i32,
    pub batch_size: i32,
    pub monthly: MonthlyCounts,
    pub ytd_actual: i32,
    pub balance: i32,
    pub programs_to_run: f64,
    pub ytd_target: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DerivedMetrics {
    pub balance: i32,
    pub programs_to_run: f64,
    pub ytd_target: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NomineeRecord {
    pub per_no: String,
    pub name: String,
    pub factory: String,
    pub bc_no: String,
    pub training_name: String,
    pub hours: f64,
    pub fiscal_year: i32,
}

impl NomineeRecord {
    pub fn new(
        per_no: &str,
        name: &str,
        factory: &str,
        bc_no: &str,
        training_name: &str,
        hours: f64,
        fiscal_year: i32,
    ) -> Result<Self, ModelError> {
        let per_no = per_no.trim();
        let training_name = training_name.trim();
        if per_no.is_empty() {
            return Err(ModelError::Empty("per_no"));
        }
        if training_name.is_empty() {
            return Err(ModelError::Empty("training_name"));
        }
        if !(hours > 0.0) {
            return Err(ModelError::NonPositiveHours(hours));
        }

        Ok(Self {
            per_no: per_no.to_string(),
            name: name.trim().to_string(),
            factory: factory.trim().to_string(),
            bc_no: bc_no.trim().to_string(),
            training_name: training_name.to_string(),
            hours,
            fiscal_year,
        })
    }

    pub fn has_factory(&self) -> bool {
        !self.factory.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocatedNominee(pub NomineeRecord);

impl AllocatedNominee {
    pub fn record(&self) -> &NomineeRecord {
        &self.0
    }
}

impl From<NomineeRecord> for AllocatedNominee {
    fn from(record: NomineeRecord) -> Self {
        Self(record)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttendanceRecord {
    pub program_id: String,
    pub per_no: String,
    pub participant_name: String,
    pub factory: String,
    pub training_name: String,
    pub pmo_category: Option<String>,
    pub pl_category: Option<String>,
    pub tni_status: Option<String>,
    pub calendar_month: Option<String>,
    pub program_date: NaiveDate,
    pub day_flags: [bool; 3],
    pub learning_hours: f64,
}

/// Distinct attendees for one training/category/month combination.
#[derive(Debug, Clone)]
pub struct AttendanceGroup {
    pub training_name: String,
    pub pmo_category: Option<String>,
    pub pl_category: Option<String>,
    pub calendar_month: Option<String>,
    pub attendance_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FactoryCount {
    pub factory: String,
    pub training_name: String,
    pub count: i64,
}
