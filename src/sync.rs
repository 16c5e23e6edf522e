use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Context};
use chrono::NaiveDate;
use serde::Serialize;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::aggregate::derive_metrics;
use crate::db;
use crate::fiscal;
use crate::models::{CatalogEntry, ModelError, TrainingTarget};

#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub fiscal_year: i32,
    pub catalog_rows: usize,
    pub inserted: usize,
    pub refreshed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncChange {
    Insert {
        training_name: String,
        pmo_category: Option<String>,
        pl_category: Option<String>,
    },
    RefreshCategories {
        id: Uuid,
        pmo_category: Option<String>,
        pl_category: Option<String>,
    },
}

// Existing rows only ever get category updates. A training listed under
// several categories keeps the last entry.
pub fn plan_sync(existing: &[TrainingTarget], catalog: &[CatalogEntry]) -> Vec<SyncChange> {
    let mut wanted: BTreeMap<&str, &CatalogEntry> = BTreeMap::new();
    for entry in catalog.iter().filter(|entry| entry.is_active()) {
        wanted.insert(entry.training_name.as_str(), entry);
    }
    let current: HashMap<&str, &TrainingTarget> = existing
        .iter()
        .map(|target| (target.training_name.as_str(), target))
        .collect();

    let mut changes = Vec::new();
    for (training_name, entry) in wanted {
        match current.get(training_name) {
            None => changes.push(SyncChange::Insert {
                training_name: training_name.to_string(),
                pmo_category: entry.pmo_category.clone(),
                pl_category: entry.pl_category.clone(),
            }),
            Some(target)
                if target.pmo_category != entry.pmo_category
                    || target.pl_category != entry.pl_category =>
            {
                changes.push(SyncChange::RefreshCategories {
                    id: target.id,
                    pmo_category: entry.pmo_category.clone(),
                    pl_category: entry.pl_category.clone(),
                })
            }
            Some(_) => {}
        }
    }
    changes
}

pub async fn sync_catalog_into_targets(
    pool: &PgPool,
    fiscal_year: i32,
) -> anyhow::Result<SyncSummary> {
    let mut tx = pool.begin().await.context("failed to open sync transaction")?;

    let catalog = db::fetch_catalog(&mut *tx).await?;
    let existing = db::fetch_targets(&mut *tx, fiscal_year).await?;
    let catalog_rows = catalog.iter().filter(|entry| entry.is_active()).count();
    let changes = plan_sync(&existing, &catalog);

    let (mut inserted, mut refreshed) = (0usize, 0usize);
    for change in &changes {
        match change {
            SyncChange::Insert {
                training_name,
                pmo_category,
                pl_category,
            } => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO tni.training_targets
                    (id, training_name, pmo_category, pl_category, fiscal_year, target, batch_size)
                    VALUES ($1, $2, $3, $4, $5, 0, 0)
                    ON CONFLICT (training_name, fiscal_year) DO NOTHING
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(training_name)
                .bind(pmo_category)
                .bind(pl_category)
                .bind(fiscal_year)
                .execute(&mut *tx)
                .await?;
                inserted += result.rows_affected() as usize;
            }
            SyncChange::RefreshCategories {
                id,
                pmo_category,
                pl_category,
            } => {
                sqlx::query(
                    r#"
                    UPDATE tni.training_targets
                    SET pmo_category = $1, pl_category = $2, updated_at = NOW()
                    WHERE id = $3
                    "#,
                )
                .bind(pmo_category)
                .bind(pl_category)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                refreshed += 1;
            }
        }
    }

    tx.commit().await.context("failed to commit target sync")?;
    info!(fiscal_year, catalog_rows, inserted, refreshed, "synced catalog into targets");

    Ok(SyncSummary {
        fiscal_year,
        catalog_rows,
        inserted,
        refreshed,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct YearInitSummary {
    pub fiscal_year: i32,
    pub source_year: Option<i32>,
    pub copied: u64,
    pub sync: SyncSummary,
}

/// Copies the structure of an earlier year (the latest on record by default),
/// then pulls in catalog additions.
pub async fn initialize_year(
    pool: &PgPool,
    fiscal_year: i32,
    source_year: Option<i32>,
) -> anyhow::Result<YearInitSummary> {
    let source_year = match source_year {
        Some(year) => Some(year),
        None => db::available_years(pool)
            .await?
            .into_iter()
            .find(|year| *year != fiscal_year),
    };

    let mut copied = 0;
    if let Some(source) = source_year {
        copied = sqlx::query(
            r#"
            INSERT INTO tni.training_targets
            (id, training_name, pmo_category, pl_category, fiscal_year, target, batch_size)
            SELECT gen_random_uuid(), training_name, pmo_category, pl_category, $1, 0, 0
            FROM tni.training_targets
            WHERE fiscal_year = $2
            ON CONFLICT (training_name, fiscal_year) DO NOTHING
            "#,
        )
        .bind(fiscal_year)
        .bind(source)
        .execute(pool)
        .await
        .context("failed to copy year structure")?
        .rows_affected();
        info!(
            fiscal_year,
            source_year = source,
            copied,
            "initialized year from prior structure"
        );
    }

    let sync = sync_catalog_into_targets(pool, fiscal_year).await?;
    Ok(YearInitSummary {
        fiscal_year,
        source_year,
        copied,
        sync,
    })
}

pub async fn set_target(
    pool: &PgPool,
    fiscal_year: i32,
    training_name: &str,
    target: i32,
    batch_size: i32,
    today: NaiveDate,
) -> anyhow::Result<()> {
    if target < 0 {
        return Err(ModelError::Negative {
            field: "target",
            value: target.into(),
        }
        .into());
    }
    if batch_size < 0 {
        return Err(ModelError::Negative {
            field: "batch_size",
            value: batch_size.into(),
        }
        .into());
    }

    let mut tx = pool.begin().await?;
    let ytd_actual: Option<i32> = sqlx::query_scalar(
        "SELECT ytd_actual FROM tni.training_targets \
         WHERE fiscal_year = $1 AND training_name = $2 FOR UPDATE",
    )
    .bind(fiscal_year)
    .bind(training_name)
    .fetch_optional(&mut *tx)
    .await?;
    let Some(ytd_actual) = ytd_actual else {
        bail!("no target row for '{training_name}' in fiscal year {fiscal_year}");
    };

    let metrics = derive_metrics(target, batch_size, ytd_actual, fiscal::month_index(today));
    sqlx::query(
        r#"
        UPDATE tni.training_targets
        SET target = $1, batch_size = $2, balance = $3, programs_to_run = $4,
            ytd_target = $5, updated_at = NOW()
        WHERE fiscal_year = $6 AND training_name = $7
        "#,
    )
    .bind(target)
    .bind(batch_size)
    .bind(metrics.balance)
    .bind(metrics.programs_to_run)
    .bind(metrics.ytd_target)
    .bind(fiscal_year)
    .bind(training_name)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    info!(fiscal_year, training = training_name, target, batch_size, "target updated");
    Ok(())
}
