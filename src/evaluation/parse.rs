//! Turning free-text grading responses into structured reports.
//!
//! The model is asked to answer with a fixed set of `## ` headings, but it
//! doesn't always comply, so everything here is best-effort.

use std::sync::LazyLock;

use regex::Regex;

use super::EvaluationReport;
use crate::prelude::*;

/// Score patterns, most specific first. Only the first match of each
/// pattern is considered.
static SCORE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(\d+)\s*out of\s*\d+",
        r"(\d+)\s*/\s*\d+",
        r"[Ss]core[:\s]+(\d+)",
        r"[Tt]otal[:\s]+(\d+)",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("failed to compile regex"))
    .collect()
});

const BREAKDOWN: &str = "## Question-by-Question Breakdown";
const STRENGTHS: &str = "## Strengths";
const IMPROVEMENTS: &str = "## Areas for Improvement";
const FEEDBACK: &str = "## Detailed Feedback";

/// Headings which tell us the response is in the expected format.
const KNOWN_HEADINGS: &[&str] = &[
    BREAKDOWN,
    STRENGTHS,
    IMPROVEMENTS,
    FEEDBACK,
    "## Total Score",
    "## Estimated Score",
];

/// Sections pulled out of a response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Sections {
    pub strengths: Vec<String>,
    pub improvements: Vec<String>,
    pub feedback: String,
    pub question_breakdown: String,
}

/// Build a report from a grading response.
pub fn parse_response(text: &str, total_marks: u32) -> EvaluationReport {
    if !KNOWN_HEADINGS.iter().any(|heading| text.contains(heading)) {
        warn!("Grading response has none of the expected sections");
        return EvaluationReport {
            success: true,
            score: 0,
            total_marks,
            percentage: 0.0,
            grade: "N/A".to_owned(),
            raw_text: text.to_owned(),
            error: Some("Could not parse score from response".to_owned()),
            ..EvaluationReport::default()
        };
    }

    let score = extract_score(text, total_marks);
    let sections = extract_sections(text);
    EvaluationReport {
        success: true,
        score,
        total_marks,
        percentage: percentage(score, total_marks),
        grade: calculate_grade(score, total_marks).to_owned(),
        strengths: sections.strengths,
        improvements: sections.improvements,
        feedback: sections.feedback,
        question_breakdown: sections.question_breakdown,
        raw_text: text.to_owned(),
        error: None,
    }
}

/// Find the score in `text`, or 0 if there's no plausible score.
///
/// Patterns are tried in order, and only the first match of each pattern
/// counts. A match is accepted if it lies in `0..=total_marks`.
pub fn extract_score(text: &str, total_marks: u32) -> u32 {
    for pattern in SCORE_PATTERNS.iter() {
        let Some(caps) = pattern.captures(text) else {
            continue;
        };
        // Absurdly long digit strings won't parse, and aren't scores anyway.
        if let Ok(score) = caps[1].parse::<u32>() {
            if score <= total_marks {
                return score;
            }
        }
    }
    warn!("Could not extract score from grading response");
    0
}

/// Pull the known sections out of `text`.
pub fn extract_sections(text: &str) -> Sections {
    Sections {
        strengths: section(text, STRENGTHS).map(list_items).unwrap_or_default(),
        improvements: section(text, IMPROVEMENTS)
            .map(list_items)
            .unwrap_or_default(),
        feedback: section(text, FEEDBACK).unwrap_or_default().to_owned(),
        question_breakdown: section(text, BREAKDOWN).unwrap_or_default().to_owned(),
    }
}

/// Everything after `heading`, up to the next `##`, trimmed.
fn section<'a>(text: &'a str, heading: &str) -> Option<&'a str> {
    let (_, rest) = text.split_once(heading)?;
    let body = match rest.find("##") {
        Some(end) => &rest[..end],
        None => rest,
    };
    Some(body.trim())
}

/// Non-blank lines which aren't headings.
fn list_items(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect()
}

/// `score` as a percentage of `total_marks`, rounded to two places.
fn percentage(score: u32, total_marks: u32) -> f64 {
    if total_marks == 0 {
        return 0.0;
    }
    let pct = f64::from(score) / f64::from(total_marks) * 100.0;
    (pct * 100.0).round() / 100.0
}

/// Map a score to a letter grade.
pub fn calculate_grade(score: u32, total_marks: u32) -> &'static str {
    if total_marks == 0 {
        return "N/A";
    }
    let pct = f64::from(score) / f64::from(total_marks) * 100.0;
    match pct {
        p if p >= 90.0 => "A+",
        p if p >= 85.0 => "A",
        p if p >= 80.0 => "A-",
        p if p >= 75.0 => "B+",
        p if p >= 70.0 => "B",
        p if p >= 65.0 => "B-",
        p if p >= 60.0 => "C+",
        p if p >= 55.0 => "C",
        p if p >= 50.0 => "C-",
        p if p >= 45.0 => "D",
        _ => "F",
    }
}
