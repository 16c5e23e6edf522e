use std::collections::HashMap;

use anyhow::Context;
use chrono::NaiveDate;
use sqlx::postgres::{PgExecutor, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;

use crate::fiscal::FiscalMonth;
use crate::models::{
    non_empty, AllocatedNominee, AttendanceGroup, AttendanceRecord, CatalogEntry, FactoryCount,
    MonthlyCounts, NomineeRecord, TrainingTarget,
};

pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool, fiscal_year: i32) -> anyhow::Result<()> {
    let catalog = vec![
        ("Fire & Safety", "Safety", "PL-1", "TNI"),
        ("Forklift Operation", "Technical", "PL-2", "TNI"),
        ("First Aid", "Safety", "PL-1", "TNI"),
        ("Leadership Essentials", "Behavioural", "PL-3", "NON TNI"),
    ];
    for (training_name, pmo, pl, status) in catalog {
        sqlx::query(
            r#"
            INSERT INTO tni.training_catalog (training_name, pmo_category, pl_category, tni_status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (training_name, pmo_category) DO UPDATE
            SET pl_category = EXCLUDED.pl_category, tni_status = EXCLUDED.tni_status
            "#,
        )
        .bind(training_name)
        .bind(pmo)
        .bind(pl)
        .bind(status)
        .execute(pool)
        .await?;
    }

    let targets = vec![
        ("Fire & Safety", 12, 6),
        ("Forklift Operation", 4, 4),
        ("First Aid", 0, 10),
    ];
    for (training_name, target, batch_size) in targets {
        sqlx::query(
            r#"
            INSERT INTO tni.training_targets
            (id, training_name, pmo_category, pl_category, fiscal_year, target, batch_size)
            SELECT $1, training_name, pmo_category, pl_category, $2, $3, $4
            FROM tni.training_catalog
            WHERE training_name = $5
            ON CONFLICT (training_name, fiscal_year) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(fiscal_year)
        .bind(target)
        .bind(batch_size)
        .bind(training_name)
        .execute(pool)
        .await?;
    }

    let factories = ["Pimpri", "Chinchwad", "Sanand"];
    let mut nominees = Vec::new();
    for i in 0..24usize {
        let training = if i % 3 == 0 { "Forklift Operation" } else { "Fire & Safety" };
        let factory = factories[i % factories.len()];
        nominees.push(NomineeRecord::new(
            &format!("{}", 70100 + i),
            &format!("Seed Employee {i}"),
            factory,
            &format!("BC{:03}", i % 7),
            training,
            8.0,
            fiscal_year,
        )?);
    }
    for nominee in &nominees {
        insert_nominee(pool, nominee).await?;
    }

    let june = NaiveDate::from_ymd_opt(fiscal_year, 6, 12).context("invalid date")?;
    let january = NaiveDate::from_ymd_opt(fiscal_year + 1, 1, 20).context("invalid date")?;
    let attendance = vec![
        ("P-100", "70101", "Fire and Safety", Some("Safety"), "June", june),
        ("P-100", "70102", "Fire and Safety", Some("Safety"), "June", june),
        ("P-100", "70104", "Fire and Safety", None, "June", june),
        ("P-200", "70100", "Fork-lift Operation", Some("Technical"), "January", january),
        ("P-300", "70105", "Crane Handling", None, "January", january),
    ];
    for (program_id, per_no, training_name, pmo, month, date) in attendance {
        insert_attendance_row(
            pool,
            &AttendanceRecord {
                program_id: program_id.to_string(),
                per_no: per_no.to_string(),
                participant_name: format!("Seed Employee {per_no}"),
                factory: "Pimpri".to_string(),
                training_name: training_name.to_string(),
                pmo_category: pmo.map(str::to_string),
                pl_category: None,
                tni_status: Some("TNI".to_string()),
                calendar_month: Some(month.to_string()),
                program_date: date,
                day_flags: [true, true, false],
                learning_hours: 8.0,
            },
        )
        .await?;
    }

    Ok(())
}

async fn insert_nominee<'e, E: PgExecutor<'e>>(
    executor: E,
    nominee: &NomineeRecord,
) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO tni.nominees
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
    .bind(nominee.fiscal_year)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

async fn insert_attendance_row<'e, E: PgExecutor<'e>>(
    executor: E,
    record: &AttendanceRecord,
) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO tni.attendance_records
        (id, program_id, per_no, participant_name, factory, training_name, pmo_category,
         pl_category, tni_status, calendar_month, program_date, day_1_attendance,
         day_2_attendance, day_3_attendance, learning_hours)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        ON CONFLICT (program_id, per_no) DO UPDATE
        SET day_1_attendance = tni.attendance_records.day_1_attendance OR EXCLUDED.day_1_attendance,
            day_2_attendance = tni.attendance_records.day_2_attendance OR EXCLUDED.day_2_attendance,
            day_3_attendance = tni.attendance_records.day_3_attendance OR EXCLUDED.day_3_attendance,
            learning_hours = EXCLUDED.learning_hours
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&record.program_id)
    .bind(&record.per_no)
    .bind(&record.participant_name)
    .bind(&record.factory)
    .bind(&record.training_name)
    .bind(&record.pmo_category)
    .bind(&record.pl_category)
    .bind(&record.tni_status)
    .bind(&record.calendar_month)
    .bind(record.program_date)
    .bind(record.day_flags[0])
    .bind(record.day_flags[1])
    .bind(record.day_flags[2])
    .bind(record.learning_hours)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn upsert_catalog(pool: &PgPool, entries: &[CatalogEntry]) -> anyhow::Result<usize> {
    let mut tx = pool.begin().await?;
    let mut written = 0usize;

    for entry in entries {
        let result = sqlx::query(
            r#"
            INSERT INTO tni.training_catalog (training_name, pmo_category, pl_category, tni_status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (training_name, pmo_category) DO UPDATE
            SET pl_category = EXCLUDED.pl_category, tni_status = EXCLUDED.tni_status
            "#,
        )
        .bind(&entry.training_name)
        .bind(entry.pmo_category.as_deref().unwrap_or(""))
        .bind(entry.pl_category.as_deref().unwrap_or(""))
        .bind(&entry.tni_status)
        .execute(&mut *tx)
        .await?;
        written += result.rows_affected() as usize;
    }

    tx.commit().await?;
    Ok(written)
}

pub async fn replace_nominees(
    pool: &PgPool,
    fiscal_year: i32,
    nominees: &[NomineeRecord],
) -> anyhow::Result<usize> {
    let mut tx = pool.begin().await?;

    let removed = sqlx::query("DELETE FROM tni.nominees WHERE fiscal_year = $1")
        .bind(fiscal_year)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if removed > 0 {
        info!(fiscal_year, removed, "cleared previous nominee upload");
    }

    let mut inserted = 0usize;
    for nominee in nominees {
        if insert_nominee(&mut *tx, nominee).await? {
            inserted += 1;
        }
    }
    let duplicates = nominees.len() - inserted;
    if duplicates > 0 {
        warn!(fiscal_year, duplicates, "duplicate nominee rows ignored");
    }

    tx.commit().await?;
    Ok(inserted)
}

pub async fn insert_attendance(
    pool: &PgPool,
    records: &[AttendanceRecord],
) -> anyhow::Result<usize> {
    let mut tx = pool.begin().await?;
    let mut written = 0usize;
    for record in records {
        if insert_attendance_row(&mut *tx, record).await? {
            written += 1;
        }
    }
    tx.commit().await?;
    Ok(written)
}

pub async fn fetch_catalog<'e, E: PgExecutor<'e>>(
    executor: E,
) -> anyhow::Result<Vec<CatalogEntry>> {
    let rows = sqlx::query(
        "SELECT training_name, pmo_category, pl_category, tni_status \
         FROM tni.training_catalog ORDER BY training_name",
    )
    .fetch_all(executor)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| CatalogEntry {
            training_name: row.get("training_name"),
            pmo_category: non_empty(row.get("pmo_category")),
            pl_category: non_empty(row.get("pl_category")),
            tni_status: row.get("tni_status"),
        })
        .collect())
}

fn target_from_row(row: &PgRow) -> TrainingTarget {
    let mut monthly = MonthlyCounts::default();
    for month in FiscalMonth::ALL {
        monthly[month] = row.get(month.column());
    }

    TrainingTarget {
        id: row.get("id"),
        training_name: row.get("training_name"),
        pmo_category: non_empty(row.get("pmo_category")),
        pl_category: non_empty(row.get("pl_category")),
        fiscal_year: row.get("fiscal_year"),
        target: row.get("target"),
        batch_size: row.get("batch_size"),
        monthly,
        ytd_actual: row.get("ytd_actual"),
        balance: row.get("balance"),
        programs_to_run: row.get("programs_to_run"),
        ytd_target: row.get("ytd_target"),
    }
}

pub async fn fetch_targets<'e, E: PgExecutor<'e>>(
    executor: E,
    fiscal_year: i32,
) -> anyhow::Result<Vec<TrainingTarget>> {
    let rows = sqlx::query(
        "SELECT id, training_name, pmo_category, pl_category, fiscal_year, target, batch_size, \
         april, may, june, july, august, september, october, november, december, \
         january, february, march, ytd_actual, balance, programs_to_run, ytd_target \
         FROM tni.training_targets \
         WHERE fiscal_year = $1 \
         ORDER BY pmo_category NULLS FIRST, training_name",
    )
    .bind(fiscal_year)
    .fetch_all(executor)
    .await?;

    Ok(rows.iter().map(target_from_row).collect())
}

pub async fn available_years<'e, E: PgExecutor<'e>>(executor: E) -> anyhow::Result<Vec<i32>> {
    let rows = sqlx::query(
        "SELECT DISTINCT fiscal_year FROM tni.training_targets ORDER BY fiscal_year DESC",
    )
    .fetch_all(executor)
    .await?;

    Ok(rows.into_iter().map(|row| row.get("fiscal_year")).collect())
}

fn nominee_from_row(row: &PgRow) -> NomineeRecord {
    NomineeRecord {
        per_no: row.get("per_no"),
        name: row.get("name"),
        factory: row.get("factory"),
        bc_no: row.get("bc_no"),
        training_name: row.get("training_name"),
        hours: row.get("hours"),
        fiscal_year: row.get("fiscal_year"),
    }
}

pub async fn fetch_nominees<'e, E: PgExecutor<'e>>(
    executor: E,
    fiscal_year: i32,
) -> anyhow::Result<Vec<NomineeRecord>> {
    let rows = sqlx::query(
        "SELECT per_no, name, factory, bc_no, training_name, hours, fiscal_year \
         FROM tni.nominees WHERE fiscal_year = $1 ORDER BY training_name, factory, per_no",
    )
    .bind(fiscal_year)
    .fetch_all(executor)
    .await?;

    Ok(rows.iter().map(nominee_from_row).collect())
}

pub async fn fetch_allocated<'e, E: PgExecutor<'e>>(
    executor: E,
    fiscal_year: i32,
) -> anyhow::Result<Vec<AllocatedNominee>> {
    let rows = sqlx::query(
        "SELECT per_no, name, factory, bc_no, training_name, hours, fiscal_year \
         FROM tni.allocated_nominees WHERE fiscal_year = $1 \
         ORDER BY training_name, factory, per_no",
    )
    .bind(fiscal_year)
    .fetch_all(executor)
    .await?;

    Ok(rows.iter().map(|row| AllocatedNominee(nominee_from_row(row))).collect())
}

pub async fn count_allocated_by_training<'e, E: PgExecutor<'e>>(
    executor: E,
    fiscal_year: i32,
) -> anyhow::Result<HashMap<String, i64>> {
    let rows = sqlx::query(
        "SELECT training_name, COUNT(per_no) AS final_count \
         FROM tni.allocated_nominees WHERE fiscal_year = $1 GROUP BY training_name",
    )
    .bind(fiscal_year)
    .fetch_all(executor)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| (row.get("training_name"), row.get("final_count")))
        .collect())
}

/// Optional narrowing of the attendance considered by the aggregator.
#[derive(Debug, Clone, Default)]
pub struct AttendanceFilter {
    pub training_name: Option<String>,
    pub tni_status: Option<String>,
}

impl AttendanceFilter {
    pub fn new(training_name: Option<String>, tni_status: Option<String>) -> Self {
        Self {
            training_name: non_empty(training_name),
            tni_status: non_empty(tni_status).filter(|status| !status.eq_ignore_ascii_case("all")),
        }
    }
}

pub async fn fetch_attendance_groups<'e, E: PgExecutor<'e>>(
    executor: E,
    start: NaiveDate,
    end: NaiveDate,
    filter: &AttendanceFilter,
) -> anyhow::Result<Vec<AttendanceGroup>> {
    let mut query = String::from(
        "SELECT training_name, pmo_category, pl_category, calendar_month, \
         COUNT(DISTINCT per_no) AS attendance_count \
         FROM tni.attendance_records \
         WHERE calendar_month IS NOT NULL AND program_date BETWEEN $1 AND $2",
    );

    let mut next_param = 3;
    if filter.training_name.is_some() {
        query.push_str(&format!(" AND training_name ILIKE ${next_param}"));
        next_param += 1;
    }
    if filter.tni_status.is_some() {
        query.push_str(&format!(" AND tni_status = ${next_param}"));
    }
    query.push_str(" GROUP BY training_name, pmo_category, pl_category, calendar_month");

    let mut rows = sqlx::query(&query).bind(start).bind(end);
    if let Some(name) = &filter.training_name {
        rows = rows.bind(format!("%{name}%"));
    }
    if let Some(status) = &filter.tni_status {
        rows = rows.bind(status.clone());
    }

    let records = rows.fetch_all(executor).await?;
    let mut groups = Vec::with_capacity(records.len());
    for row in records {
        groups.push(AttendanceGroup {
            training_name: row.get("training_name"),
            pmo_category: row.get("pmo_category"),
            pl_category: row.get("pl_category"),
            calendar_month: row.get("calendar_month"),
            attendance_count: row.get("attendance_count"),
        });
    }

    Ok(groups)
}

pub async fn fetch_attendance_names<'e, E: PgExecutor<'e>>(
    executor: E,
) -> anyhow::Result<Vec<String>> {
    let rows = sqlx::query("SELECT DISTINCT training_name FROM tni.attendance_records")
        .fetch_all(executor)
        .await?;
    Ok(rows.into_iter().map(|row| row.get("training_name")).collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NomineeSource {
    Submitted,
    Allocated,
}

pub async fn fetch_factory_counts<'e, E: PgExecutor<'e>>(
    executor: E,
    fiscal_year: i32,
    source: NomineeSource,
) -> anyhow::Result<Vec<FactoryCount>> {
    let query = match source {
        NomineeSource::Submitted => {
            "SELECT factory, training_name, COUNT(DISTINCT per_no) AS count \
             FROM tni.nominees WHERE factory <> '' AND fiscal_year = $1 \
             GROUP BY factory, training_name ORDER BY factory, training_name"
        }
        NomineeSource::Allocated => {
            "SELECT factory, training_name, COUNT(per_no) AS count \
             FROM tni.allocated_nominees WHERE fiscal_year = $1 \
             GROUP BY factory, training_name ORDER BY factory, training_name"
        }
    };

    let rows = sqlx::query(query).bind(fiscal_year).fetch_all(executor).await?;
    Ok(rows
        .into_iter()
        .map(|row| FactoryCount {
            factory: row.get("factory"),
            training_name: row.get("training_name"),
            count: row.get("count"),
        })
        .collect())
}

pub async fn fetch_nominee_counts<'e, E: PgExecutor<'e>>(
    executor: E,
    fiscal_year: i32,
) -> anyhow::Result<Vec<(String, i64)>> {
    let rows = sqlx::query(
        "SELECT training_name, COUNT(per_no) AS count \
         FROM tni.nominees WHERE factory <> '' AND fiscal_year = $1 \
         GROUP BY training_name ORDER BY training_name",
    )
    .bind(fiscal_year)
    .fetch_all(executor)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| (row.get("training_name"), row.get("count")))
        .collect())
}
