use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use sqlx::PgPool;

use crate::aggregate::normalize_training_name;
use crate::db;
use crate::models::TrainingTarget;

const SUGGESTION_CUTOFF: f64 = 0.7;
const SUGGESTION_LIMIT: usize = 2;
const REPORTED_UNMATCHED: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct UnmatchedSuggestion {
    pub training_name: String,
    pub suggestions: Vec<String>,
}

/// Up to `n` candidates whose similarity to `word` is at least `cutoff`, best first.
pub fn close_matches(word: &str, candidates: &[String], n: usize, cutoff: f64) -> Vec<String> {
    let mut scored: Vec<(f64, &String)> = candidates
        .iter()
        .map(|candidate| (strsim::normalized_levenshtein(word, candidate), candidate))
        .filter(|(score, _)| *score >= cutoff)
        .collect();

    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.cmp(b.1))
    });
    scored.dedup_by(|a, b| a.1 == b.1);
    scored.into_iter().take(n).map(|(_, c)| c.clone()).collect()
}

pub fn suggest_for_unmatched(
    unmatched: &[String],
    targets: &[TrainingTarget],
) -> Vec<UnmatchedSuggestion> {
    let candidates: Vec<String> = targets
        .iter()
        .map(|t| normalize_training_name(&t.training_name))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    unmatched
        .iter()
        .take(REPORTED_UNMATCHED)
        .map(|name| UnmatchedSuggestion {
            training_name: name.clone(),
            suggestions: close_matches(
                &normalize_training_name(name),
                &candidates,
                SUGGESTION_LIMIT,
                SUGGESTION_CUTOFF,
            ),
        })
        .collect()
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NameMappingReport {
    pub unmatched_count: usize,
    pub potential_matches: BTreeMap<String, Vec<String>>,
    pub fully_unmatched: Vec<String>,
}

pub fn validate_name_mapping<'a>(
    catalog_names: impl IntoIterator<Item = &'a str>,
    attendance_names: impl IntoIterator<Item = &'a str>,
) -> NameMappingReport {
    let catalog: BTreeSet<String> = catalog_names
        .into_iter()
        .map(normalize_training_name)
        .collect();
    let attendance: BTreeSet<String> = attendance_names
        .into_iter()
        .map(normalize_training_name)
        .collect();

    let mut report = NameMappingReport::default();
    for name in attendance.difference(&catalog) {
        report.unmatched_count += 1;
        let partial: Vec<String> = if name.chars().count() > 3 {
            catalog
                .iter()
                .filter(|target| target.contains(name.as_str()) || name.contains(target.as_str()))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        if partial.is_empty() {
            report.fully_unmatched.push(name.clone());
        } else {
            report.potential_matches.insert(name.clone(), partial);
        }
    }

    report
}

pub async fn validate_names(pool: &PgPool) -> anyhow::Result<NameMappingReport> {
    let catalog = db::fetch_catalog(pool).await?;
    let attendance = db::fetch_attendance_names(pool).await?;

    Ok(validate_name_mapping(
        catalog
            .iter()
            .filter(|entry| entry.is_active())
            .map(|entry| entry.training_name.as_str()),
        attendance.iter().map(String::as_str),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_matches_respects_cutoff_and_limit() {
        let candidates = vec![
            "fire safety".to_string(),
            "fire safety awareness".to_string(),
            "fire safty".to_string(),
            "forklift operation".to_string(),
        ];
        let matches = close_matches("fire safety", &candidates, 2, 0.7);
        assert_eq!(matches, vec!["fire safety".to_string(), "fire safty".to_string()]);
        assert!(close_matches("welding", &candidates, 2, 0.7).is_empty());
    }

    #[test]
    fn suggestions_use_normalized_target_names() {
        let targets = vec![crate::models::TrainingTarget {
            id: uuid::Uuid::new_v4(),
            training_name: "Fire & Safety".to_string(),
            pmo_category: None,
            pl_category: None,
            fiscal_year: 2026,
            target: 10,
            batch_size: 5,
            monthly: Default::default(),
            ytd_actual: 0,
            balance: 0,
            programs_to_run: 0.0,
            ytd_target: 0,
        }];
        let suggestions = suggest_for_unmatched(&["Fire and Safty".to_string()], &targets);
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].suggestions, vec!["fire and safety".to_string()]);
    }

    #[test]
    fn mapping_report_splits_partial_and_unmatched() {
        let report = validate_name_mapping(
            ["Fire Safety Awareness", "Forklift Operation", "5S"],
            ["fire safety", "Forklift Operation", "Crane", "5s"],
        );
        assert_eq!(report.unmatched_count, 2);
        assert_eq!(
            report.potential_matches.get("fire safety"),
            Some(&vec!["fire safety awareness".to_string()])
        );
        assert_eq!(report.fully_unmatched, vec!["crane".to_string()]);
    }
}
