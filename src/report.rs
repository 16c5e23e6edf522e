use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write;

use serde::Serialize;

use crate::aggregate::derive_metrics;
use crate::fiscal::FiscalMonth;
use crate::models::{FactoryCount, MonthlyCounts, TrainingTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowKind {
    Training,
    CategoryTotal,
    GrandTotal,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardRow {
    pub display_id: Option<usize>,
    pub kind: RowKind,
    pub training_name: String,
    pub pmo_category: String,
    pub pl_category: String,
    pub target: i32,
    pub batch_size: i32,
    pub ytd_target: i32,
    pub ytd_actual: i32,
    pub balance: i32,
    pub programs_to_run: f64,
    pub monthly: MonthlyCounts,
}

fn total_row(
    rows: &[&TrainingTarget],
    kind: RowKind,
    label: String,
    month_index: i32,
) -> DashboardRow {
    let mut monthly = MonthlyCounts::default();
    let (mut target, mut batch_size, mut ytd_actual) = (0, 0, 0);
    for row in rows {
        target += row.target;
        batch_size += row.batch_size;
        ytd_actual += row.ytd_actual;
        monthly.add(&row.monthly);
    }
    let metrics = derive_metrics(target, batch_size, ytd_actual, month_index);

    DashboardRow {
        display_id: None,
        kind,
        training_name: label,
        pmo_category: String::new(),
        pl_category: "-".to_string(),
        target,
        batch_size,
        ytd_target: metrics.ytd_target,
        ytd_actual,
        balance: metrics.balance,
        programs_to_run: metrics.programs_to_run,
        monthly,
    }
}

/// Target rows grouped by PMO category with a total after each category and a
/// grand total at the end. Derived columns are recomputed for `month_index`.
pub fn build_dashboard(targets: &[TrainingTarget], month_index: i32) -> Vec<DashboardRow> {
    let mut categories: BTreeMap<String, Vec<&TrainingTarget>> = BTreeMap::new();
    for target in targets {
        categories
            .entry(target.pmo_category.clone().unwrap_or_default())
            .or_default()
            .push(target);
    }

    let mut output = Vec::new();
    let mut counter = 1;
    for (category, rows) in categories.iter_mut() {
        rows.sort_by(|a, b| a.training_name.cmp(&b.training_name));
        for row in rows.iter() {
            let metrics = derive_metrics(row.target, row.batch_size, row.ytd_actual, month_index);
            output.push(DashboardRow {
                display_id: Some(counter),
                kind: RowKind::Training,
                training_name: row.training_name.clone(),
                pmo_category: category.clone(),
                pl_category: row.pl_category.clone().unwrap_or_default(),
                target: row.target,
                batch_size: row.batch_size,
                ytd_target: metrics.ytd_target,
                ytd_actual: row.ytd_actual,
                balance: metrics.balance,
                programs_to_run: metrics.programs_to_run,
                monthly: row.monthly,
            });
            counter += 1;
        }
        output.push(total_row(
            rows.as_slice(),
            RowKind::CategoryTotal,
            format!("{category} (Total)"),
            month_index,
        ));
    }

    if !targets.is_empty() {
        let all: Vec<&TrainingTarget> = targets.iter().collect();
        output.push(total_row(&all, RowKind::GrandTotal, "Grand Total".to_string(), month_index));
    }

    output
}

pub fn write_dashboard_csv<W: std::io::Write>(
    mut writer: csv::Writer<W>,
    rows: &[DashboardRow],
) -> anyhow::Result<()> {
    let mut header = vec![
        "id", "training_name", "pmo_category", "pl_category", "target", "batch_size",
        "ytd_target", "ytd_actual", "balance", "programs_to_run",
    ];
    header.extend(FiscalMonth::ALL.iter().map(|m| m.column()));
    writer.write_record(&header)?;

    for row in rows {
        let mut record = vec![
            row.display_id.map(|id| id.to_string()).unwrap_or_default(),
            row.training_name.clone(),
            row.pmo_category.clone(),
            row.pl_category.clone(),
            row.target.to_string(),
            row.batch_size.to_string(),
            row.ytd_target.to_string(),
            row.ytd_actual.to_string(),
            row.balance.to_string(),
            format!("{:.1}", row.programs_to_run),
        ];
        record.extend(row.monthly.iter().map(|(_, count)| count.to_string()));
        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct FactoryPivotRow {
    pub factory: String,
    pub counts: Vec<i64>,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FactoryPivot {
    pub trainings: Vec<String>,
    pub rows: Vec<FactoryPivotRow>,
}

pub fn factory_pivot(counts: &[FactoryCount]) -> Option<FactoryPivot> {
    if counts.is_empty() {
        return None;
    }

    let trainings: Vec<String> = counts
        .iter()
        .map(|c| c.training_name.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let column: HashMap<&str, usize> = trainings
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();

    let mut by_factory: BTreeMap<&str, Vec<i64>> = BTreeMap::new();
    for count in counts {
        let cells = by_factory
            .entry(count.factory.as_str())
            .or_insert_with(|| vec![0; trainings.len()]);
        cells[column[count.training_name.as_str()]] += count.count;
    }

    let mut grand = vec![0i64; trainings.len()];
    let mut rows: Vec<FactoryPivotRow> = by_factory
        .into_iter()
        .map(|(factory, cells)| {
            for (slot, value) in grand.iter_mut().zip(&cells) {
                *slot += value;
            }
            FactoryPivotRow {
                factory: factory.to_string(),
                total: cells.iter().sum(),
                counts: cells,
            }
        })
        .collect();
    rows.push(FactoryPivotRow {
        factory: "Grand Total".to_string(),
        total: grand.iter().sum(),
        counts: grand,
    });

    Some(FactoryPivot { trainings, rows })
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingSummaryRow {
    pub training_name: String,
    pub count: i64,
    pub target: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingSummary {
    pub rows: Vec<TrainingSummaryRow>,
    pub grand_total_count: i64,
    pub grand_total_target: i64,
}

fn clean_name(name: &str) -> String {
    name.replace(['\n', '\r'], " ").trim().to_string()
}

pub fn training_summary(
    nominee_counts: &[(String, i64)],
    targets: &[TrainingTarget],
) -> TrainingSummary {
    let target_by_name: HashMap<String, i32> = targets
        .iter()
        .map(|t| (clean_name(&t.training_name), t.target))
        .collect();

    let rows: Vec<TrainingSummaryRow> = nominee_counts
        .iter()
        .map(|(name, count)| {
            let training_name = clean_name(name);
            TrainingSummaryRow {
                target: target_by_name.get(&training_name).copied().unwrap_or(0),
                training_name,
                count: *count,
            }
        })
        .collect();

    TrainingSummary {
        grand_total_count: rows.iter().map(|r| r.count).sum(),
        grand_total_target: rows.iter().map(|r| i64::from(r.target)).sum(),
        rows,
    }
}

fn write_pivot(output: &mut String, title: &str, pivot: Option<&FactoryPivot>) {
    let _ = writeln!(output);
    let _ = writeln!(output, "## {title}");

    let Some(pivot) = pivot else {
        let _ = writeln!(output, "No nominees recorded for this year.");
        return;
    };

    let _ = writeln!(output, "| Factory | {} | Total |", pivot.trainings.join(" | "));
    let _ = writeln!(output, "|---{}|---|", "|---".repeat(pivot.trainings.len()));
    for row in &pivot.rows {
        let cells: Vec<String> = row.counts.iter().map(i64::to_string).collect();
        let _ = writeln!(output, "| {} | {} | {} |", row.factory, cells.join(" | "), row.total);
    }
}

pub fn build_report(
    fiscal_year: i32,
    dashboard: &[DashboardRow],
    summary: &TrainingSummary,
    submitted: Option<&FactoryPivot>,
    allocated: Option<&FactoryPivot>,
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Training Target Report");
    let _ = writeln!(output, "Fiscal year {}-{:02}", fiscal_year, (fiscal_year + 1) % 100);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Targets vs Actuals");

    if dashboard.is_empty() {
        let _ = writeln!(output, "No targets recorded for this year.");
    } else {
        let _ = writeln!(
            output,
            "| # | Training | PMO | Target | YTD Target | YTD Actual | Balance | Programs to Run |"
        );
        let _ = writeln!(output, "|---|---|---|---|---|---|---|---|");
        for row in dashboard {
            let name = match row.kind {
                RowKind::Training => row.training_name.clone(),
                _ => format!("**{}**", row.training_name),
            };
            let _ = writeln!(
                output,
                "| {} | {} | {} | {} | {} | {} | {} | {:.1} |",
                row.display_id.map(|id| id.to_string()).unwrap_or_default(),
                name,
                row.pmo_category,
                row.target,
                row.ytd_target,
                row.ytd_actual,
                row.balance,
                row.programs_to_run
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Nominations vs Target");
    if summary.rows.is_empty() {
        let _ = writeln!(output, "No nominations uploaded for this year.");
    } else {
        for row in &summary.rows {
            let _ = writeln!(
                output,
                "- {}: {} nominated (target {})",
                row.training_name, row.count, row.target
            );
        }
        let _ = writeln!(
            output,
            "- Grand total: {} nominated (target {})",
            summary.grand_total_count, summary.grand_total_target
        );
    }

    write_pivot(&mut output, "Nominations by Factory", submitted);
    write_pivot(&mut output, "Allocated by Factory", allocated);

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn target(name: &str, pmo: &str, value: i32, batch: i32, june: i32) -> TrainingTarget {
        let mut monthly = MonthlyCounts::default();
        monthly[FiscalMonth::June] = june;
        TrainingTarget {
            id: Uuid::new_v4(),
            training_name: name.to_string(),
            pmo_category: Some(pmo.to_string()),
            pl_category: Some("PL-1".to_string()),
            fiscal_year: 2026,
            target: value,
            batch_size: batch,
            monthly,
            ytd_actual: june,
            balance: 0,
            programs_to_run: 0.0,
            ytd_target: 0,
        }
    }

    fn count(factory: &str, training: &str, value: i64) -> FactoryCount {
        FactoryCount {
            factory: factory.to_string(),
            training_name: training.to_string(),
            count: value,
        }
    }

    #[test]
    fn dashboard_adds_category_and_grand_totals() {
        let targets = vec![
            target("Forklift", "Technical", 40, 10, 5),
            target("First Aid", "Safety", 30, 15, 10),
            target("Fire Safety", "Safety", 25, 0, 30),
        ];
        let rows = build_dashboard(&targets, 3);

        let names: Vec<&str> = rows.iter().map(|r| r.training_name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Fire Safety",
                "First Aid",
                "Safety (Total)",
                "Forklift",
                "Technical (Total)",
                "Grand Total"
            ]
        );
        assert_eq!(rows[0].display_id, Some(1));
        assert_eq!(rows[3].display_id, Some(3));

        let safety = &rows[2];
        assert_eq!(safety.kind, RowKind::CategoryTotal);
        assert_eq!(safety.target, 55);
        assert_eq!(safety.ytd_actual, 40);
        assert_eq!(safety.balance, 15);
        assert_eq!(safety.programs_to_run, 1.0);
        assert_eq!(safety.ytd_target, 15);
        assert_eq!(safety.monthly[FiscalMonth::June], 40);

        let grand = rows.last().unwrap();
        assert_eq!(grand.kind, RowKind::GrandTotal);
        assert_eq!(grand.target, 95);
        assert_eq!(grand.balance, 50);
        assert_eq!(rows[0].balance, 0);
    }

    #[test]
    fn pivot_totals_rows_and_columns() {
        let pivot = factory_pivot(&[
            count("Pimpri", "Forklift", 4),
            count("Sanand", "Forklift", 2),
            count("Sanand", "Fire Safety", 3),
        ])
        .unwrap();

        assert_eq!(pivot.trainings, vec!["Fire Safety", "Forklift"]);
        assert_eq!(pivot.rows[0].factory, "Pimpri");
        assert_eq!(pivot.rows[0].counts, vec![0, 4]);
        assert_eq!(pivot.rows[1].total, 5);
        let grand = pivot.rows.last().unwrap();
        assert_eq!(grand.counts, vec![3, 6]);
        assert_eq!(grand.total, 9);
        assert!(factory_pivot(&[]).is_none());
    }

    #[test]
    fn summary_joins_targets_by_clean_name() {
        let targets = vec![target("Forklift Operation", "Technical", 12, 4, 0)];
        let summary = training_summary(
            &[("Forklift\nOperation ".to_string(), 20), ("Welding".to_string(), 3)],
            &targets,
        );
        assert_eq!(summary.rows[0].training_name, "Forklift Operation");
        assert_eq!(summary.rows[0].target, 12);
        assert_eq!(summary.rows[1].target, 0);
        assert_eq!(summary.grand_total_count, 23);
        assert_eq!(summary.grand_total_target, 12);
    }

    #[test]
    fn csv_export_writes_one_line_per_row() {
        let rows = build_dashboard(&[target("Forklift", "Technical", 40, 10, 5)], 1);
        let mut out = Vec::new();
        write_dashboard_csv(csv::Writer::from_writer(&mut out), &rows).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("id,training_name"));
        assert!(lines[1].starts_with("1,Forklift,Technical,PL-1,40,10,4,5,35,3.5,0,0,5"));
    }

    #[test]
    fn report_mentions_every_section() {
        let targets = vec![target("Forklift", "Technical", 40, 10, 5)];
        let dashboard = build_dashboard(&targets, 1);
        let summary = training_summary(&[("Forklift".to_string(), 50)], &targets);
        let pivot = factory_pivot(&[count("Pimpri", "Forklift", 50)]);

        let report = build_report(2026, &dashboard, &summary, pivot.as_ref(), None);
        assert!(report.contains("Fiscal year 2026-27"));
        assert!(report.contains("| 1 | Forklift | Technical | 40 | 4 | 5 | 35 | 3.5 |"));
        assert!(report.contains("- Grand total: 50 nominated (target 40)"));
        assert!(report.contains("| Pimpri | 50 | 50 |"));
        assert!(report.contains("## Allocated by Factory\nNo nominees recorded for this year."));
    }
}
