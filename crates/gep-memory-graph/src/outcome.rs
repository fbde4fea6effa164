use gep_evolution::{clamp01, OutcomeStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const EVIDENCE_TAIL_LINES: usize = 400;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InferredOutcome {
    pub status: OutcomeStatus,
    pub score: f64,
    pub note: String,
}

impl InferredOutcome {
    fn new(status: OutcomeStatus, score: f64, note: &str) -> Self {
        Self {
            status,
            score,
            note: note.to_string(),
        }
    }
}

/// Error presence before and after the attempt, nothing else.
pub fn infer_outcome_from_signals(prev_had_error: bool, current_has_error: bool) -> InferredOutcome {
    match (prev_had_error, current_has_error) {
        (true, false) => InferredOutcome::new(OutcomeStatus::Success, 0.85, "error_cleared"),
        (true, true) => InferredOutcome::new(OutcomeStatus::Failed, 0.2, "error_persisted"),
        (false, true) => InferredOutcome::new(OutcomeStatus::Failed, 0.15, "new_error_appeared"),
        (false, false) => InferredOutcome::new(OutcomeStatus::Success, 0.6, "stable_no_error"),
    }
}

/// Scans the tail of captured logs backwards for an `EvolutionEvent` line
/// and reports its outcome.
pub fn parse_last_evolution_event_outcome(evidence: &str) -> Option<InferredOutcome> {
    if evidence.is_empty() {
        return None;
    }
    let lines = evidence.split('\n').collect::<Vec<_>>();
    let start = lines.len().saturating_sub(EVIDENCE_TAIL_LINES);
    for line in lines[start..].iter().rev() {
        let line = line.trim();
        if line.is_empty() || !line.contains("\"type\"") || !line.contains("EvolutionEvent") {
            continue;
        }
        let Ok(parsed) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if parsed.get("type").and_then(Value::as_str) != Some("EvolutionEvent") {
            continue;
        }
        let Some(outcome) = parsed.get("outcome").filter(|outcome| outcome.is_object()) else {
            continue;
        };
        let status = match outcome.get("status").and_then(Value::as_str) {
            Some("success") => Some(OutcomeStatus::Success),
            Some("failed") => Some(OutcomeStatus::Failed),
            _ => None,
        };
        let score = outcome.get("score").and_then(finite_number).map(clamp01);
        let (status, score) = match (status, score) {
            (None, None) => continue,
            (Some(status), Some(score)) => (status, score),
            (None, Some(score)) if score >= 0.5 => (OutcomeStatus::Success, score),
            (None, Some(score)) => (OutcomeStatus::Failed, score),
            (Some(OutcomeStatus::Success), None) => (OutcomeStatus::Success, 0.75),
            (Some(OutcomeStatus::Failed), None) => (OutcomeStatus::Failed, 0.25),
        };
        return Some(InferredOutcome::new(status, score, "evolutionevent_observed"));
    }
    None
}

/// Prefers an outcome observed in the evidence tails; otherwise starts from the
/// error heuristic and nudges the score by error-count and scan-time deltas.
pub fn infer_outcome(
    prev_had_error: bool,
    current_has_error: bool,
    baseline: Option<&Value>,
    current: Option<&Value>,
) -> InferredOutcome {
    if let Some(observed) = current
        .and_then(evidence_text)
        .and_then(|text| parse_last_evolution_event_outcome(&text))
    {
        return observed;
    }

    let base = infer_outcome_from_signals(prev_had_error, current_has_error);
    let mut score = base.score;

    let prev_errors = baseline.and_then(|value| numeric_field(value, "recent_error_count"));
    let current_errors = current.and_then(|value| numeric_field(value, "recent_error_count"));
    if let (Some(prev), Some(cur)) = (prev_errors, current_errors) {
        score += ((prev - cur) / 50.0).clamp(-0.12, 0.12);
    }

    let prev_scan = baseline.and_then(|value| numeric_field(value, "scan_ms"));
    let current_scan = current.and_then(|value| numeric_field(value, "scan_ms"));
    if let (Some(prev), Some(cur)) = (prev_scan, current_scan) {
        if prev > 0.0 {
            score += ((prev - cur) / prev).clamp(-0.06, 0.06);
        }
    }

    InferredOutcome {
        status: base.status,
        score: clamp01(score),
        note: format!("{}|heuristic_delta", base.note),
    }
}

fn evidence_text(observed: &Value) -> Option<String> {
    let evidence = observed.get("evidence")?;
    let session = non_empty_str(evidence.get("recent_session_tail"));
    let today = non_empty_str(evidence.get("today_log_tail"));
    if session.is_none() && today.is_none() {
        return None;
    }
    Some(format!(
        "{}\n{}",
        session.unwrap_or_default(),
        today.unwrap_or_default()
    ))
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|text| !text.is_empty())
}

fn numeric_field(value: &Value, key: &str) -> Option<f64> {
    value.get(key).and_then(finite_number)
}

fn finite_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn heuristic_table_matches_error_transitions() {
        assert_eq!(infer_outcome_from_signals(true, false).note, "error_cleared");
        assert_eq!(infer_outcome_from_signals(true, true).score, 0.2);
        assert_eq!(
            infer_outcome_from_signals(false, true).status,
            OutcomeStatus::Failed
        );
        assert_eq!(infer_outcome_from_signals(false, false).score, 0.6);
    }

    #[test]
    fn observed_evolution_event_wins_over_heuristic() {
        let current = json!({
            "evidence": {
                "recent_session_tail": "noise\n{\"type\":\"EvolutionEvent\",\"outcome\":{\"status\":\"failed\",\"score\":0.3}}\nmore noise",
                "today_log_tail": ""
            }
        });
        let outcome = infer_outcome(true, false, None, Some(&current));
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.score, 0.3);
        assert_eq!(outcome.note, "evolutionevent_observed");
    }

    #[test]
    fn observed_status_without_score_uses_defaults() {
        let text = "{\"type\":\"EvolutionEvent\",\"outcome\":{\"status\":\"success\"}}";
        let outcome = parse_last_evolution_event_outcome(text).unwrap();
        assert_eq!(outcome.score, 0.75);
        let text = "{\"type\":\"EvolutionEvent\",\"outcome\":{\"score\":0.4}}";
        assert_eq!(
            parse_last_evolution_event_outcome(text).unwrap().status,
            OutcomeStatus::Failed
        );
        assert!(parse_last_evolution_event_outcome("{\"type\":\"EvolutionEvent\"}").is_none());
    }

    #[test]
    fn deltas_adjust_heuristic_score_within_bounds() {
        let baseline = json!({"recent_error_count": 20, "scan_ms": 1000});
        let current = json!({"recent_error_count": 0, "scan_ms": 500});
        let outcome = infer_outcome(true, false, Some(&baseline), Some(&current));
        assert_eq!(outcome.status, OutcomeStatus::Success);
        assert!((outcome.score - 1.0).abs() < 1e-9);
        assert_eq!(outcome.note, "error_cleared|heuristic_delta");

        let worse = json!({"recent_error_count": 100, "scan_ms": 5000});
        let outcome = infer_outcome(false, true, Some(&baseline), Some(&worse));
        assert_eq!(outcome.score, 0.0);
    }
}
