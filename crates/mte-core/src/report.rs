//! Text formats of the aggregate results file and the per-test details.

use crate::grade::{BucketCounts, Evidence, GradeSet};

const NAME_COLUMN: usize = 32;

fn pad(name: &str) -> String {
    " ".repeat(NAME_COLUMN.saturating_sub(name.len()))
}

fn rule(name: &str) -> String {
    "-".repeat(NAME_COLUMN.saturating_sub(name.len()).max(4))
}

pub fn results_line(name: &str, grades: &GradeSet) -> String {
    format!(
        "{}:{} output:{} constable:{} dmesg:{}\n",
        name,
        pad(name),
        grades.output,
        grades.constable,
        grades.dmesg
    )
}

pub fn failure_line(name: &str) -> String {
    format!("{}:{} ERROR (see details)\n", name, pad(name))
}

pub fn summary_line(counts: &BucketCounts) -> String {
    format!(
        "Testing complete: {} passed, {} failed, {} partial\n",
        counts.success, counts.failed, counts.partial
    )
}

pub fn details(name: &str, evidence: &Evidence) -> String {
    let exit = evidence
        .process
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    format!(
        "{} {}\nexit code: {}\noutput:\n{}{}\nconstable:\n{}\ndmesg:\n{}\n",
        name,
        rule(name),
        exit,
        evidence.process.stdout,
        evidence.process.stderr,
        evidence.monitor,
        evidence.kernel
    )
}

pub fn failure_details(name: &str, error: &str) -> String {
    format!("{} {}\n\nerror:\n{}\n", name, rule(name), error)
}

/// Parsed view of a downloaded aggregate results file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultsSummary {
    pub counts: Option<BucketCounts>,
    pub lines: Vec<String>,
}

impl ResultsSummary {
    pub fn parse(text: &str) -> Self {
        let mut summary = ResultsSummary::default();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            if summary.counts.is_none() {
                if let Some(counts) = parse_summary_line(line) {
                    summary.counts = Some(counts);
                    continue;
                }
            }
            summary.lines.push(line.trim_end().to_string());
        }
        summary
    }
}

fn parse_summary_line(line: &str) -> Option<BucketCounts> {
    let rest = line.strip_prefix("Testing complete:")?;
    let mut counts = BucketCounts::default();
    for part in rest.split(',') {
        let mut words = part.split_whitespace();
        let n: usize = words.next()?.parse().ok()?;
        match words.next()? {
            "passed" => counts.success = n,
            "failed" => counts.failed = n,
            "partial" => counts.partial = n,
            _ => return None,
        }
    }
    Some(counts)
}
