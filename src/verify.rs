use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::Context;
use rand::Rng;
use serde::Serialize;
use sqlx::{Connection, PgPool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::allocate::sample;
use crate::db;
use crate::models::{AllocatedNominee, NomineeRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "count", rename_all = "lowercase")]
pub enum RepairAction {
    Add(usize),
    Remove(usize),
}

pub fn repair_action(target: usize, final_count: usize) -> Option<RepairAction> {
    match final_count.cmp(&target) {
        std::cmp::Ordering::Less => Some(RepairAction::Add(target - final_count)),
        std::cmp::Ordering::Greater => Some(RepairAction::Remove(final_count - target)),
        std::cmp::Ordering::Equal => None,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingRepair {
    pub training_name: String,
    pub target: usize,
    pub final_count: usize,
    pub action: RepairAction,
    #[serde(skip)]
    pub added: Vec<NomineeRecord>,
    #[serde(skip)]
    pub removed: Vec<NomineeRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mismatch {
    pub training_name: String,
    pub target: usize,
    pub final_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub fiscal_year: i32,
    pub repairs: Vec<TrainingRepair>,
    pub failed: Vec<String>,
    pub residual: Vec<Mismatch>,
    pub grand_total: i64,
}

fn group_by_training<'a>(
    records: impl IntoIterator<Item = &'a NomineeRecord>,
) -> BTreeMap<&'a str, Vec<&'a NomineeRecord>> {
    let mut grouped: BTreeMap<&str, Vec<&NomineeRecord>> = BTreeMap::new();
    for record in records {
        grouped.entry(record.training_name.as_str()).or_default().push(record);
    }
    grouped
}

/// Rows to add or remove per training. Trainings whose pool is exhausted get
/// no repair and surface later as residual mismatches.
pub fn plan_repairs<R: Rng + ?Sized>(
    targets: &[(String, i32)],
    nominees: &[NomineeRecord],
    allocated: &[AllocatedNominee],
    rng: &mut R,
) -> Vec<TrainingRepair> {
    let pool = group_by_training(nominees.iter().filter(|n| n.has_factory()));
    let current = group_by_training(allocated.iter().map(AllocatedNominee::record));

    let mut repairs = Vec::new();
    for (training_name, target) in targets {
        let target = (*target).max(0) as usize;
        let rows = current.get(training_name.as_str()).map(Vec::as_slice).unwrap_or(&[]);
        let Some(action) = repair_action(target, rows.len()) else {
            continue;
        };

        let (added, removed): (Vec<NomineeRecord>, Vec<NomineeRecord>) = match action {
            RepairAction::Add(difference) => {
                let taken: HashSet<&str> = rows.iter().map(|r| r.per_no.as_str()).collect();
                let mut seen = HashSet::new();
                let candidates: Vec<&NomineeRecord> = pool
                    .get(training_name.as_str())
                    .map(Vec::as_slice)
                    .unwrap_or(&[])
                    .iter()
                    .copied()
                    .filter(|n| !taken.contains(n.per_no.as_str()))
                    .filter(|n| seen.insert(n.per_no.clone()))
                    .collect();
                let added = sample(&candidates, difference, rng).into_iter().cloned().collect();
                (added, Vec::new())
            }
            RepairAction::Remove(difference) => {
                let removed = sample(rows, difference, rng).into_iter().cloned().collect();
                (Vec::new(), removed)
            }
        };
        if added.is_empty() && removed.is_empty() {
            continue;
        }

        repairs.push(TrainingRepair {
            training_name: training_name.clone(),
            target,
            final_count: rows.len(),
            action,
            added,
            removed,
        });
    }

    repairs
}

pub fn residual_mismatches(
    targets: &[(String, i32)],
    counts: &HashMap<String, i64>,
) -> Vec<Mismatch> {
    targets
        .iter()
        .filter_map(|(training_name, target)| {
            let target = (*target).max(0) as usize;
            let final_count = counts.get(training_name).copied().unwrap_or(0).max(0) as usize;
            (final_count != target).then(|| Mismatch {
                training_name: training_name.clone(),
                target,
                final_count,
            })
        })
        .collect()
}

async fn apply_repair(
    conn: &mut sqlx::PgConnection,
    fiscal_year: i32,
    repair: &TrainingRepair,
) -> anyhow::Result<()> {
    let mut savepoint = conn.begin().await?;

    for nominee in &repair.added {
        sqlx::query(
            r#"
            INSERT INTO tni.allocated_nominees
            (id, per_no, name, factory, bc_no, training_name, hours, fiscal_year)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (per_no, training_name, fiscal_year) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&nominee.per_no)
        .bind(&nominee.name)
        .bind(&nominee.factory)
        .bind(&nominee.bc_no)
        .bind(&nominee.training_name)
        .bind(nominee.hours)
        .bind(fiscal_year)
        .execute(&mut *savepoint)
        .await?;
    }

    for nominee in &repair.removed {
        sqlx::query(
            r#"
            DELETE FROM tni.allocated_nominees
            WHERE per_no = $1 AND training_name = $2 AND fiscal_year = $3
            "#,
        )
        .bind(&nominee.per_no)
        .bind(&nominee.training_name)
        .bind(fiscal_year)
        .execute(&mut *savepoint)
        .await?;
    }

    savepoint.commit().await?;
    Ok(())
}

pub async fn run<R: Rng + ?Sized>(
    pool: &PgPool,
    fiscal_year: i32,
    rng: &mut R,
) -> anyhow::Result<VerificationReport> {
    let mut tx = pool.begin().await.context("failed to open verification transaction")?;

    let targets: Vec<(String, i32)> = db::fetch_targets(&mut *tx, fiscal_year)
        .await?
        .into_iter()
        .map(|t| (t.training_name, t.target))
        .collect();
    let nominees = db::fetch_nominees(&mut *tx, fiscal_year).await?;
    let allocated = db::fetch_allocated(&mut *tx, fiscal_year).await?;

    let repairs = plan_repairs(&targets, &nominees, &allocated, rng);
    let mut failed = Vec::new();
    for repair in &repairs {
        if let Err(err) = apply_repair(&mut tx, fiscal_year, repair).await {
            warn!(training = %repair.training_name, error = %err, "repair failed");
            failed.push(repair.training_name.clone());
        }
    }

    let counts = db::count_allocated_by_training(&mut *tx, fiscal_year).await?;
    let residual = residual_mismatches(&targets, &counts);
    for mismatch in &residual {
        warn!(
            training = %mismatch.training_name,
            final_count = mismatch.final_count,
            target = mismatch.target,
            "allocation still off target"
        );
    }
    let grand_total: i64 = counts.values().sum();

    tx.commit().await.context("failed to commit verification")?;
    info!(fiscal_year, repaired = repairs.len(), grand_total, "verification complete");

    Ok(VerificationReport {
        fiscal_year,
        repairs,
        failed,
        residual,
        grand_total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn nominee(per_no: usize, training: &str, factory: &str) -> NomineeRecord {
        NomineeRecord::new(&per_no.to_string(), "Employee", factory, "BC", training, 6.0, 2026)
            .unwrap()
    }

    fn apply(allocated: &mut Vec<AllocatedNominee>, repairs: &[TrainingRepair]) {
        for repair in repairs {
            allocated.retain(|a| !repair.removed.contains(a.record()));
            allocated.extend(repair.added.iter().cloned().map(AllocatedNominee::from));
        }
    }

    fn count(allocated: &[AllocatedNominee], training: &str) -> usize {
        allocated.iter().filter(|a| a.record().training_name == training).count()
    }

    #[test]
    fn actions_follow_difference_sign() {
        assert_eq!(repair_action(10, 7), Some(RepairAction::Add(3)));
        assert_eq!(repair_action(10, 12), Some(RepairAction::Remove(2)));
        assert_eq!(repair_action(10, 10), None);
    }

    #[test]
    fn tops_up_from_unallocated_pool() {
        let nominees: Vec<NomineeRecord> = (0..10).map(|i| nominee(i, "Rigging", "A")).collect();
        let mut allocated: Vec<AllocatedNominee> =
            nominees[..4].iter().cloned().map(AllocatedNominee::from).collect();
        let targets = vec![("Rigging".to_string(), 6)];
        let mut rng = StdRng::seed_from_u64(11);

        let repairs = plan_repairs(&targets, &nominees, &allocated, &mut rng);
        assert_eq!(repairs.len(), 1);
        assert_eq!(repairs[0].action, RepairAction::Add(2));
        for added in &repairs[0].added {
            assert!(!allocated.iter().any(|a| a.record().per_no == added.per_no));
        }

        apply(&mut allocated, &repairs);
        assert_eq!(count(&allocated, "Rigging"), 6);
    }

    #[test]
    fn trims_surplus_allocations() {
        let nominees: Vec<NomineeRecord> = (0..8).map(|i| nominee(i, "Rigging", "A")).collect();
        let mut allocated: Vec<AllocatedNominee> =
            nominees.iter().cloned().map(AllocatedNominee::from).collect();
        let targets = vec![("Rigging".to_string(), 5)];
        let mut rng = StdRng::seed_from_u64(5);

        let repairs = plan_repairs(&targets, &nominees, &allocated, &mut rng);
        assert_eq!(repairs[0].removed.len(), 3);
        apply(&mut allocated, &repairs);
        assert_eq!(count(&allocated, "Rigging"), 5);
    }

    #[test]
    fn second_pass_is_a_fixed_point() {
        let mut nominees: Vec<NomineeRecord> = (0..3).map(|i| nominee(i, "Welding", "A")).collect();
        nominees.extend((10..30).map(|i| nominee(i, "Forklift", "B")));
        let mut allocated: Vec<AllocatedNominee> = nominees[3..20]
            .iter()
            .cloned()
            .map(AllocatedNominee::from)
            .collect();
        let targets = vec![("Welding".to_string(), 5), ("Forklift".to_string(), 12)];
        let mut rng = StdRng::seed_from_u64(21);

        let first = plan_repairs(&targets, &nominees, &allocated, &mut rng);
        apply(&mut allocated, &first);
        let after_first = (count(&allocated, "Welding"), count(&allocated, "Forklift"));
        assert_eq!(after_first, (3, 12));

        let second = plan_repairs(&targets, &nominees, &allocated, &mut rng);
        assert!(second.is_empty());
        assert_eq!(
            (count(&allocated, "Welding"), count(&allocated, "Forklift")),
            after_first
        );
    }

    #[test]
    fn exhausted_pool_plans_no_repair() {
        let nominees: Vec<NomineeRecord> = (0..3).map(|i| nominee(i, "Welding", "A")).collect();
        let allocated: Vec<AllocatedNominee> =
            nominees.iter().cloned().map(AllocatedNominee::from).collect();
        let targets = vec![("Welding".to_string(), 5)];
        let mut rng = StdRng::seed_from_u64(3);

        assert!(plan_repairs(&targets, &nominees, &allocated, &mut rng).is_empty());

        let counts = HashMap::from([("Welding".to_string(), 3)]);
        assert_eq!(residual_mismatches(&targets, &counts).len(), 1);
    }

    #[test]
    fn residuals_report_unreachable_targets() {
        let targets = vec![("Welding".to_string(), 5), ("Forklift".to_string(), 12)];
        let counts = HashMap::from([("Welding".to_string(), 3), ("Forklift".to_string(), 12)]);
        let residual = residual_mismatches(&targets, &counts);
        assert_eq!(
            residual,
            vec![Mismatch {
                training_name: "Welding".to_string(),
                target: 5,
                final_count: 3,
            }]
        );
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs a Postgres DATABASE_URL"]
    async fn failed_repair_leaves_other_trainings_applied(pool: PgPool) -> anyhow::Result<()> {
        let good = TrainingRepair {
            training_name: "Rigging".to_string(),
            target: 1,
            final_count: 0,
            action: RepairAction::Add(1),
            added: vec![nominee(1, "Rigging", "A")],
            removed: Vec::new(),
        };
        // Postgres rejects NUL bytes in text columns.
        let mut rejected = nominee(2, "Welding", "A");
        rejected.training_name = "Weld\0ing".to_string();
        let bad = TrainingRepair {
            training_name: "Welding".to_string(),
            added: vec![rejected],
            ..good.clone()
        };

        let mut tx = pool.begin().await?;
        assert!(apply_repair(&mut tx, 2026, &bad).await.is_err());
        apply_repair(&mut tx, 2026, &good).await?;
        tx.commit().await?;

        let counts = db::count_allocated_by_training(&pool, 2026).await?;
        assert_eq!(counts.get("Rigging"), Some(&1));
        assert_eq!(counts.len(), 1);
        Ok(())
    }
}
