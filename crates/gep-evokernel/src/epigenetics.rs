//! Environment-class imprints on gene expression.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use gep_evolution::{clip, EnvFingerprint, EpigeneticMark, Gene, OutcomeStatus};

pub const MARK_MAX_AGE_DAYS: i64 = 90;
pub const MAX_MARKS: usize = 10;
const BOOST_LIMIT: f64 = 0.5;

/// `platform/arch/node_version`, skipping empty parts.
pub fn env_context(env: Option<&EnvFingerprint>) -> String {
    let Some(env) = env else {
        return "unknown".into();
    };
    let parts = [
        env.platform.as_str(),
        env.arch.as_str(),
        env.node_version.as_deref().unwrap_or(""),
    ];
    let joined = parts
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/");
    if joined.is_empty() {
        "unknown".into()
    } else {
        joined
    }
}

pub fn build_epigenetic_mark(
    context: &str,
    boost: f64,
    reason: &str,
    now: DateTime<Utc>,
) -> EpigeneticMark {
    let boost = if boost.is_finite() { boost } else { 0.0 };
    EpigeneticMark {
        context: clip(context, 100),
        boost: boost.clamp(-BOOST_LIMIT, BOOST_LIMIT),
        reason: clip(reason, 200),
        created_at: now.to_rfc3339_opts(SecondsFormat::Millis, true),
    }
}

/// Reinforces (+0.05) or suppresses (-0.1) the mark for this environment,
/// creating it at +/-0.1 when absent, then prunes stale and excess marks.
pub fn apply_epigenetic_marks(
    gene: &mut Gene,
    env: Option<&EnvFingerprint>,
    outcome: OutcomeStatus,
    now: DateTime<Utc>,
) {
    let context = env_context(env);
    match gene
        .epigenetic_marks
        .iter_mut()
        .find(|mark| mark.context == context)
    {
        Some(mark) => {
            let (boost, reason) = match outcome {
                OutcomeStatus::Success => (
                    (finite_or_zero(mark.boost) + 0.05).min(BOOST_LIMIT),
                    "reinforced_by_success",
                ),
                OutcomeStatus::Failed => (
                    (finite_or_zero(mark.boost) - 0.1).max(-BOOST_LIMIT),
                    "suppressed_by_failure",
                ),
            };
            mark.boost = boost;
            mark.reason = reason.into();
            mark.created_at = now.to_rfc3339_opts(SecondsFormat::Millis, true);
        }
        None => {
            let (boost, reason) = match outcome {
                OutcomeStatus::Success => (0.1, "success_in_environment"),
                OutcomeStatus::Failed => (-0.1, "failure_in_environment"),
            };
            gene.epigenetic_marks
                .push(build_epigenetic_mark(&context, boost, reason, now));
        }
    }

    let cutoff = now - Duration::days(MARK_MAX_AGE_DAYS);
    gene.epigenetic_marks.retain(|mark| {
        DateTime::parse_from_rfc3339(&mark.created_at)
            .map(|created| created.with_timezone(&Utc) > cutoff)
            .unwrap_or(false)
    });
    let excess = gene.epigenetic_marks.len().saturating_sub(MAX_MARKS);
    gene.epigenetic_marks.drain(..excess);
}

/// Boost of the mark recorded for this environment class, or 0.
pub fn get_epigenetic_boost(gene: &Gene, env: Option<&EnvFingerprint>) -> f64 {
    let context = env_context(env);
    gene.epigenetic_marks
        .iter()
        .find(|mark| mark.context == context)
        .map(|mark| finite_or_zero(mark.boost))
        .unwrap_or(0.0)
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}
