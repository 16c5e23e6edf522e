use std::collections::{BTreeSet, HashMap};

use anyhow::Context;
use chrono::NaiveDate;
use serde::Serialize;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{self, AttendanceFilter};
use crate::diagnostics::{self, UnmatchedSuggestion};
use crate::fiscal::{self, FiscalMonth};
use crate::models::{non_empty, AttendanceGroup, DerivedMetrics, MonthlyCounts, TrainingTarget};

pub fn normalize_training_name(name: &str) -> String {
    let collapsed = name.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");
    let replaced = collapsed
        .replace('&', "and")
        .replace('+', "plus")
        .replace('-', " ");
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Rounds to one decimal on the exact binary value, ties to even.
fn round_to_tenth(value: f64) -> f64 {
    format!("{value:.1}").parse().unwrap_or(value)
}

pub fn derive_metrics(
    target: i32,
    batch_size: i32,
    ytd_actual: i32,
    month_index: i32,
) -> DerivedMetrics {
    let target = target.max(0);
    let balance = (target - ytd_actual).max(0);
    let programs_to_run = if batch_size > 0 {
        round_to_tenth(balance as f64 / batch_size as f64)
    } else {
        0.0
    };
    DerivedMetrics {
        balance,
        programs_to_run,
        ytd_target: (target / 10) * month_index,
    }
}

type MatchKey = (String, Option<String>, Option<String>);

/// (normalized name, pmo, pl) to target id, with fallback keys for missing
/// categories.
pub struct TargetIndex {
    keys: HashMap<MatchKey, Uuid>,
}

impl TargetIndex {
    pub fn build(targets: &[TrainingTarget]) -> Self {
        let mut keys = HashMap::new();
        for target in targets {
            let name = normalize_training_name(&target.training_name);
            let pmo = non_empty(target.pmo_category.clone());
            let pl = non_empty(target.pl_category.clone());
            for key in [
                (name.clone(), pmo.clone(), pl.clone()),
                (name.clone(), pmo.clone(), None),
                (name.clone(), None, pl.clone()),
                (name.clone(), None, None),
            ] {
                keys.entry(key).or_insert(target.id);
            }
        }
        Self { keys }
    }

    pub fn resolve(
        &self,
        training_name: &str,
        pmo: Option<&str>,
        pl: Option<&str>,
    ) -> Option<Uuid> {
        let name = normalize_training_name(training_name);
        let pmo = pmo.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string);
        let pl = pl.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string);
        [
            (name.clone(), pmo.clone(), pl.clone()),
            (name.clone(), pmo, None),
            (name.clone(), None, pl),
            (name, None, None),
        ]
        .iter()
        .find_map(|key| self.keys.get(key).copied())
    }
}

#[derive(Debug, Default)]
pub struct MatchOutcome {
    pub counts: HashMap<Uuid, MonthlyCounts>,
    pub unmatched: Vec<String>,
    pub skipped_without_month: usize,
}

pub fn match_attendance(targets: &[TrainingTarget], groups: &[AttendanceGroup]) -> MatchOutcome {
    let index = TargetIndex::build(targets);
    let mut outcome = MatchOutcome::default();
    let mut unmatched = BTreeSet::new();

    for group in groups {
        let month = group
            .calendar_month
            .as_deref()
            .and_then(FiscalMonth::parse_label);
        let Some(month) = month else {
            outcome.skipped_without_month += 1;
            continue;
        };

        match index.resolve(
            &group.training_name,
            group.pmo_category.as_deref(),
            group.pl_category.as_deref(),
        ) {
            Some(id) => {
                let attendees = i32::try_from(group.attendance_count).unwrap_or(i32::MAX);
                let counts = outcome.counts.entry(id).or_default();
                counts[month] = counts[month].saturating_add(attendees);
            }
            None => {
                unmatched.insert(group.training_name.clone());
            }
        }
    }

    outcome.unmatched = unmatched.into_iter().collect();
    outcome
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetRollup {
    pub id: Uuid,
    pub training_name: String,
    pub monthly: MonthlyCounts,
    pub ytd_actual: i32,
    pub metrics: DerivedMetrics,
}

pub fn compute_rollups(
    targets: &[TrainingTarget],
    counts: &HashMap<Uuid, MonthlyCounts>,
    month_index: i32,
) -> Vec<TargetRollup> {
    targets
        .iter()
        .map(|target| {
            let monthly = counts.get(&target.id).copied().unwrap_or_default();
            let ytd_actual = monthly.total();
            TargetRollup {
                id: target.id,
                training_name: target.training_name.clone(),
                monthly,
                ytd_actual,
                metrics: derive_metrics(target.target, target.batch_size, ytd_actual, month_index),
            }
        })
        .collect()
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AggregationOutcome {
    NoRecords,
    Updated {
        fiscal_year: i32,
        updated: usize,
        matched: usize,
        skipped_without_month: usize,
        unmatched: Vec<UnmatchedSuggestion>,
    },
}

pub async fn run(
    pool: &PgPool,
    fiscal_year: i32,
    filter: &AttendanceFilter,
    today: NaiveDate,
) -> anyhow::Result<AggregationOutcome> {
    let (start, end) =
        fiscal::fiscal_year_bounds(fiscal_year).context("fiscal year out of range")?;
    let mut tx = pool.begin().await.context("failed to open aggregation transaction")?;

    let targets = db::fetch_targets(&mut *tx, fiscal_year).await?;
    let groups = db::fetch_attendance_groups(&mut *tx, start, end, filter).await?;
    if groups.is_empty() {
        info!(fiscal_year, "no attendance records matched the filters");
        return Ok(AggregationOutcome::NoRecords);
    }

    let outcome = match_attendance(&targets, &groups);
    let rollups = compute_rollups(&targets, &outcome.counts, fiscal::month_index(today));

    for rollup in &rollups {
        let months = &rollup.monthly;
        sqlx::query(
            r#"
            UPDATE tni.training_targets
            SET ytd_actual = $1, balance = $2, programs_to_run = $3, ytd_target = $4,
                april = $5, may = $6, june = $7, july = $8, august = $9, september = $10,
                october = $11, november = $12, december = $13, january = $14,
                february = $15, march = $16, updated_at = NOW()
            WHERE id = $17
            "#,
        )
        .bind(rollup.ytd_actual)
        .bind(rollup.metrics.balance)
        .bind(rollup.metrics.programs_to_run)
        .bind(rollup.metrics.ytd_target)
        .bind(months[FiscalMonth::April])
        .bind(months[FiscalMonth::May])
        .bind(months[FiscalMonth::June])
        .bind(months[FiscalMonth::July])
        .bind(months[FiscalMonth::August])
        .bind(months[FiscalMonth::September])
        .bind(months[FiscalMonth::October])
        .bind(months[FiscalMonth::November])
        .bind(months[FiscalMonth::December])
        .bind(months[FiscalMonth::January])
        .bind(months[FiscalMonth::February])
        .bind(months[FiscalMonth::March])
        .bind(rollup.id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await.context("failed to commit aggregation")?;

    let suggestions = diagnostics::suggest_for_unmatched(&outcome.unmatched, &targets);
    if !outcome.unmatched.is_empty() {
        warn!(count = outcome.unmatched.len(), "attendance training names without a target");
        for suggestion in &suggestions {
            if suggestion.suggestions.is_empty() {
                warn!(training = %suggestion.training_name, "unmatched training");
            } else {
                warn!(
                    training = %suggestion.training_name,
                    potential = %suggestion.suggestions.join(", "),
                    "unmatched training"
                );
            }
        }
    }
    info!(
        fiscal_year,
        updated = rollups.len(),
        matched = outcome.counts.len(),
        "aggregation complete"
    );

    Ok(AggregationOutcome::Updated {
        fiscal_year,
        updated: rollups.len(),
        matched: outcome.counts.len(),
        skipped_without_month: outcome.skipped_without_month,
        unmatched: suggestions,
    })
}
