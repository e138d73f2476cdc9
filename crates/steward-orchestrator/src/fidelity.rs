//! Plan-vs-actual ("fidelity") checking
//!
//! Compares the file paths a plan claims it will touch against the files
//! actually changed since the phase's checkpoint. Purely advisory: the
//! report is logged and recorded, never blocks the pipeline.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Outcome of comparing planned file paths against actual changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FidelityReport {
    pub matched: Vec<String>,
    pub missing: Vec<String>,
    pub unplanned: Vec<String>,
    /// round(matched / max(|planned|, |actual|) x 100); empty vs empty is 100
    pub score: u32,
}

impl FidelityReport {
    pub fn summary(&self) -> String {
        format!(
            "fidelity {}%: {} matched, {} missing, {} unplanned",
            self.score,
            self.matched.len(),
            self.missing.len(),
            self.unplanned.len()
        )
    }
}

static VERB_LINE: OnceLock<Regex> = OnceLock::new();
static BACKTICK_PATH: OnceLock<Regex> = OnceLock::new();

fn verb_line() -> &'static Regex {
    VERB_LINE.get_or_init(|| {
        Regex::new(r"(?i)\b(create|add|modify|update|write|implement|edit|delete)\b")
            .unwrap_or_else(|_| unreachable!())
    })
}

fn backtick_path() -> &'static Regex {
    BACKTICK_PATH.get_or_init(|| {
        Regex::new(r"`([^`\s]+\.[A-Za-z0-9]{1,8})`").unwrap_or_else(|_| unreachable!())
    })
}

/// Extract the set of file paths a plan declares it will touch
///
/// Two sources: backtick-quoted paths on lines carrying a mutation verb,
/// and path-like cells in markdown tables.
pub fn extract_planned_paths(plan_text: &str) -> BTreeSet<String> {
    let mut paths = BTreeSet::new();

    for line in plan_text.lines() {
        let is_table_row = line.trim_start().starts_with('|');
        if is_table_row || verb_line().is_match(line) {
            for capture in backtick_path().captures_iter(line) {
                paths.insert(capture[1].to_string());
            }
            if is_table_row {
                // Bare paths in table cells, without backticks
                for cell in line.split('|') {
                    let cell = cell.trim();
                    if looks_like_path(cell) {
                        paths.insert(cell.to_string());
                    }
                }
            }
        }
    }

    paths
}

fn looks_like_path(cell: &str) -> bool {
    !cell.is_empty()
        && !cell.contains(char::is_whitespace)
        && cell.contains('/')
        && cell.rsplit('.').next().map(|ext| {
            ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric())
        }) == Some(true)
        && cell.contains('.')
}

/// Compare planned paths against actual changed files
pub fn compare(planned: &BTreeSet<String>, actual: &[String]) -> FidelityReport {
    let actual_set: BTreeSet<&str> = actual.iter().map(String::as_str).collect();

    let matched: Vec<String> = planned
        .iter()
        .filter(|p| actual_set.contains(p.as_str()))
        .cloned()
        .collect();
    let missing: Vec<String> = planned
        .iter()
        .filter(|p| !actual_set.contains(p.as_str()))
        .cloned()
        .collect();
    let unplanned: Vec<String> = actual_set
        .iter()
        .filter(|a| !planned.contains(**a))
        .map(|a| a.to_string())
        .collect();

    let denominator = planned.len().max(actual_set.len());
    let score = if denominator == 0 {
        100
    } else {
        ((matched.len() as f64 / denominator as f64) * 100.0).round() as u32
    };

    FidelityReport {
        matched,
        missing,
        unplanned,
        score,
    }
}
