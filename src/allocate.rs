use std::collections::{BTreeMap, HashSet};

use anyhow::Context;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db;
use crate::models::NomineeRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FactoryQuota {
    pub factory: String,
    pub available: usize,
    pub reduction: usize,
    pub to_take: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocationOutcome {
    pub training_name: String,
    pub target: usize,
    pub actual_count: usize,
    pub inserted_count: usize,
    pub quotas: Vec<FactoryQuota>,
    #[serde(skip)]
    pub selected: Vec<NomineeRecord>,
}

impl AllocationOutcome {
    pub fn target_met(&self) -> bool {
        self.selected.len() >= self.target
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocationSummary {
    pub fiscal_year: i32,
    pub outcomes: Vec<AllocationOutcome>,
    pub skipped_zero_target: usize,
    pub total_inserted: usize,
}

// Largest factories absorb the rounding remainder, ties by name.
pub fn plan_factory_quotas(target: usize, factory_counts: &[(String, usize)]) -> Vec<FactoryQuota> {
    let actual_count: usize = factory_counts.iter().map(|(_, count)| count).sum();

    let mut quotas: Vec<FactoryQuota> = factory_counts
        .iter()
        .map(|(factory, count)| FactoryQuota {
            factory: factory.clone(),
            available: *count,
            reduction: 0,
            to_take: *count,
        })
        .collect();

    if actual_count <= target {
        return quotas;
    }

    let overcount = actual_count - target;
    for quota in quotas.iter_mut() {
        quota.reduction = quota.available * overcount / actual_count;
    }

    let total_reduction: usize = quotas.iter().map(|q| q.reduction).sum();
    let remaining = overcount - total_reduction;

    quotas.sort_by(|a, b| {
        b.available
            .cmp(&a.available)
            .then_with(|| a.factory.cmp(&b.factory))
    });
    for quota in quotas.iter_mut().take(remaining) {
        quota.reduction += 1;
    }

    for quota in quotas.iter_mut() {
        quota.to_take = quota.available - quota.reduction;
    }

    quotas
}

pub fn sample<T: Clone, R: Rng + ?Sized>(items: &[T], n: usize, rng: &mut R) -> Vec<T> {
    items.choose_multiple(rng, n).cloned().collect()
}

fn eligible_pool<'a>(
    nominees: impl IntoIterator<Item = &'a NomineeRecord>,
) -> Vec<&'a NomineeRecord> {
    let mut seen: HashSet<String> = HashSet::new();
    nominees
        .into_iter()
        .filter(|n| n.has_factory())
        .filter(|n| seen.insert(n.per_no.clone()))
        .collect()
}

pub fn allocate_training<R: Rng + ?Sized>(
    training_name: &str,
    target: i32,
    nominees: &[&NomineeRecord],
    rng: &mut R,
) -> Option<AllocationOutcome> {
    if target <= 0 {
        return None;
    }
    let target = target as usize;

    let pool = eligible_pool(nominees.iter().copied());
    let actual_count = pool.len();

    let mut by_factory: BTreeMap<&str, Vec<&NomineeRecord>> = BTreeMap::new();
    for nominee in pool.iter().copied() {
        by_factory.entry(nominee.factory.as_str()).or_default().push(nominee);
    }

    let factory_counts: Vec<(String, usize)> = by_factory
        .iter()
        .map(|(factory, members)| (factory.to_string(), members.len()))
        .collect();
    let quotas = plan_factory_quotas(target, &factory_counts);

    let selected: Vec<NomineeRecord> = if actual_count <= target {
        pool.into_iter().cloned().collect()
    } else {
        let mut chosen = Vec::with_capacity(target);
        for quota in quotas.iter().filter(|q| q.to_take > 0) {
            let members = &by_factory[quota.factory.as_str()];
            chosen.extend(sample(members, quota.to_take, rng).into_iter().cloned());
        }
        chosen
    };

    debug!(
        training = training_name,
        target,
        actual_count,
        selected = selected.len(),
        "allocated training"
    );

    Some(AllocationOutcome {
        training_name: training_name.to_string(),
        target,
        actual_count,
        inserted_count: actual_count.min(target),
        quotas,
        selected,
    })
}

/// Returns the outcomes and how many trainings were skipped for a zero target.
pub fn allocate_year<R: Rng + ?Sized>(
    targets: &[(String, i32)],
    nominees: &[NomineeRecord],
    rng: &mut R,
) -> (Vec<AllocationOutcome>, usize) {
    let mut by_training: BTreeMap<&str, Vec<&NomineeRecord>> = BTreeMap::new();
    for nominee in nominees {
        by_training
            .entry(nominee.training_name.as_str())
            .or_default()
            .push(nominee);
    }

    let mut outcomes = Vec::new();
    let mut skipped = 0usize;
    for (training_name, target) in targets {
        let pool = by_training
            .get(training_name.as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        match allocate_training(training_name, *target, pool, rng) {
            Some(outcome) => outcomes.push(outcome),
            None => skipped += 1,
        }
    }

    (outcomes, skipped)
}

pub async fn run<R: Rng + ?Sized>(
    pool: &PgPool,
    fiscal_year: i32,
    rng: &mut R,
) -> anyhow::Result<AllocationSummary> {
    let mut tx = pool.begin().await.context("failed to open allocation transaction")?;

    let targets = db::fetch_targets(&mut *tx, fiscal_year).await?;
    let nominees = db::fetch_nominees(&mut *tx, fiscal_year).await?;
    let target_pairs: Vec<(String, i32)> = targets
        .iter()
        .map(|t| (t.training_name.clone(), t.target))
        .collect();

    let (outcomes, skipped_zero_target) = allocate_year(&target_pairs, &nominees, rng);

    sqlx::query("DELETE FROM tni.allocated_nominees WHERE fiscal_year = $1")
        .bind(fiscal_year)
        .execute(&mut *tx)
        .await?;

    let mut total_inserted = 0usize;
    for outcome in &outcomes {
        let mut persisted = 0usize;
        for nominee in &outcome.selected {
            let result = sqlx::query(
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
            .execute(&mut *tx)
            .await?;
            persisted += result.rows_affected() as usize;
        }

        if persisted != outcome.selected.len() {
            warn!(
                training = %outcome.training_name,
                selected = outcome.selected.len(),
                persisted,
                "duplicate allocations skipped"
            );
        }
        if !outcome.target_met() {
            info!(
                training = %outcome.training_name,
                target = outcome.target,
                available = outcome.actual_count,
                "target not met by nominee pool"
            );
        }
        total_inserted += outcome.inserted_count;
    }

    tx.commit().await.context("failed to commit allocation")?;
    info!(fiscal_year, trainings = outcomes.len(), total_inserted, "allocation complete");

    Ok(AllocationSummary {
        fiscal_year,
        outcomes,
        skipped_zero_target,
        total_inserted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn nominees(training: &str, factory: &str, count: usize, offset: usize) -> Vec<NomineeRecord> {
        (0..count)
            .map(|i| {
                NomineeRecord::new(
                    &format!("{}", offset + i),
                    &format!("Employee {}", offset + i),
                    factory,
                    "BC",
                    training,
                    8.0,
                    2026,
                )
                .unwrap()
            })
            .collect()
    }

    fn quota<'a>(quotas: &'a [FactoryQuota], factory: &str) -> &'a FactoryQuota {
        quotas.iter().find(|q| q.factory == factory).unwrap()
    }

    #[test]
    fn exact_fit_takes_everyone() {
        let mut pool = nominees("Fire Safety", "A", 8, 0);
        pool.extend(nominees("Fire Safety", "B", 2, 100));
        let refs: Vec<&NomineeRecord> = pool.iter().collect();
        let mut rng = StdRng::seed_from_u64(7);

        let outcome = allocate_training("Fire Safety", 10, &refs, &mut rng).unwrap();
        assert_eq!(outcome.actual_count, 10);
        assert_eq!(outcome.selected.len(), 10);
        assert!(outcome.quotas.iter().all(|q| q.reduction == 0));
        for nominee in &pool {
            assert!(outcome.selected.contains(nominee));
        }
    }

    #[test]
    fn remainder_goes_to_largest_factory() {
        let quotas = plan_factory_quotas(10, &[("A".to_string(), 15), ("B".to_string(), 5)]);
        assert_eq!(quota(&quotas, "A").reduction, 8);
        assert_eq!(quota(&quotas, "B").reduction, 2);
        assert_eq!(quota(&quotas, "A").to_take, 7);
        assert_eq!(quota(&quotas, "B").to_take, 3);
        assert_eq!(quotas.iter().map(|q| q.to_take).sum::<usize>(), 10);
    }

    #[test]
    fn overcounted_training_hits_target_exactly() {
        let mut pool = nominees("Forklift", "A", 15, 0);
        pool.extend(nominees("Forklift", "B", 5, 100));
        let refs: Vec<&NomineeRecord> = pool.iter().collect();
        let mut rng = StdRng::seed_from_u64(42);

        let outcome = allocate_training("Forklift", 10, &refs, &mut rng).unwrap();
        assert_eq!(outcome.selected.len(), 10);
        assert_eq!(outcome.inserted_count, 10);
        assert_eq!(outcome.selected.iter().filter(|n| n.factory == "A").count(), 7);
        assert_eq!(outcome.selected.iter().filter(|n| n.factory == "B").count(), 3);

        let unique: HashSet<&str> = outcome.selected.iter().map(|n| n.per_no.as_str()).collect();
        assert_eq!(unique.len(), 10);
    }

    #[test]
    fn quotas_sum_to_target_for_awkward_splits() {
        let counts = vec![
            ("A".to_string(), 13),
            ("B".to_string(), 7),
            ("C".to_string(), 7),
            ("D".to_string(), 1),
        ];
        for target in 1..28 {
            let quotas = plan_factory_quotas(target, &counts);
            assert_eq!(quotas.iter().map(|q| q.to_take).sum::<usize>(), target);
            assert!(quotas.iter().all(|q| q.reduction <= q.available));
        }
    }

    #[test]
    fn larger_factories_never_lose_fewer() {
        let quotas = plan_factory_quotas(12, &[("Big".to_string(), 40), ("Small".to_string(), 4)]);
        assert!(quota(&quotas, "Big").reduction >= quota(&quotas, "Small").reduction);
    }

    #[test]
    fn zero_target_is_skipped() {
        let pool = nominees("Welding", "A", 3, 0);
        let targets = vec![("Welding".to_string(), 0), ("Rigging".to_string(), 5)];
        let mut rng = StdRng::seed_from_u64(1);

        let (outcomes, skipped) = allocate_year(&targets, &pool, &mut rng);
        assert_eq!(skipped, 1);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].training_name, "Rigging");
        assert!(outcomes[0].selected.is_empty());
        assert!(!outcomes[0].target_met());
    }

    #[test]
    fn shortfall_allocates_available_pool() {
        let mut pool = nominees("First Aid", "A", 3, 0);
        pool.extend(nominees("First Aid", "", 2, 50));
        let targets = vec![("First Aid".to_string(), 6)];
        let mut rng = StdRng::seed_from_u64(3);

        let (outcomes, _) = allocate_year(&targets, &pool, &mut rng);
        assert_eq!(outcomes[0].actual_count, 3);
        assert_eq!(outcomes[0].selected.len(), 3);
        assert_eq!(outcomes[0].inserted_count, 3);
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let pool = nominees("Forklift", "A", 30, 0);
        let targets = vec![("Forklift".to_string(), 5)];

        let (first, _) = allocate_year(&targets, &pool, &mut StdRng::seed_from_u64(9));
        let (second, _) = allocate_year(&targets, &pool, &mut StdRng::seed_from_u64(9));
        assert_eq!(first[0].selected, second[0].selected);
    }
}
