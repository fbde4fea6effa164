//! Per-cycle mutation intent: category, risk level, and the safety downgrades
//! applied against the active personality.

mod strategy;

use gep_evolution::{
    next_id, unique_signals, AssetKind, Gene, GeneCategory, Mutation, PersonalityState, RiskLevel,
};
use serde_json::Value;

pub use strategy::{resolve_strategy, strategy_preset, StrategyName, StrategyPreset};

pub const OPPORTUNITY_SIGNALS: [&str; 9] = [
    "user_feature_request",
    "user_improvement_suggestion",
    "perf_bottleneck",
    "capability_gap",
    "stable_success_plateau",
    "external_opportunity",
    "issue_already_resolved",
    "openclaw_self_healed",
    "empty_cycle_loop_detected",
];

const RESOLVED_SIGNALS: [&str; 2] = ["issue_already_resolved", "openclaw_self_healed"];

pub fn has_errorish_signal<S: AsRef<str>>(signals: &[S]) -> bool {
    if signals
        .iter()
        .any(|signal| RESOLVED_SIGNALS.contains(&signal.as_ref()))
    {
        return false;
    }
    signals.iter().any(|signal| {
        let signal = signal.as_ref();
        signal == "log_error" || signal.starts_with("errsig:") || signal.starts_with("errsig_norm:")
    })
}

pub fn has_opportunity_signal<S: AsRef<str>>(signals: &[S]) -> bool {
    signals
        .iter()
        .any(|signal| OPPORTUNITY_SIGNALS.contains(&signal.as_ref()))
}

pub fn mutation_category<S: AsRef<str>>(
    signals: &[S],
    drift_enabled: bool,
    strategy: &StrategyPreset,
) -> GeneCategory {
    if has_errorish_signal(signals) {
        GeneCategory::Repair
    } else if drift_enabled || has_opportunity_signal(signals) || strategy.favors_innovation() {
        GeneCategory::Innovate
    } else {
        GeneCategory::Optimize
    }
}

pub fn expected_effect_for(category: Option<GeneCategory>) -> &'static str {
    match category {
        Some(GeneCategory::Repair) => {
            "reduce runtime errors, increase stability, and lower failure rate"
        }
        Some(GeneCategory::Optimize) => "improve success rate and reduce repeated operational cost",
        Some(GeneCategory::Innovate) => "explore new strategy combinations to escape local optimum",
        None => "improve robustness and success probability",
    }
}

/// Low rigor or high risk tolerance.
pub fn is_high_risk_personality(state: Option<&PersonalityState>) -> bool {
    state.map_or(false, |state| {
        (state.rigor.is_finite() && state.rigor < 0.5)
            || (state.risk_tolerance.is_finite() && state.risk_tolerance > 0.6)
    })
}

/// Missing values count as rigor 0 and risk tolerance 1.
pub fn is_high_risk_mutation_allowed(state: Option<&PersonalityState>) -> bool {
    let rigor = state
        .map(|state| state.rigor)
        .filter(|value| value.is_finite())
        .unwrap_or(0.0);
    let risk_tolerance = state
        .map(|state| state.risk_tolerance)
        .filter(|value| value.is_finite())
        .unwrap_or(1.0);
    rigor >= 0.6 && risk_tolerance <= 0.5
}

#[derive(Clone, Debug)]
pub struct MutationRequest<'a> {
    pub signals: &'a [String],
    pub selected_gene: Option<&'a Gene>,
    pub drift_enabled: bool,
    pub personality_state: Option<&'a PersonalityState>,
    pub allow_high_risk: bool,
    pub target: Option<String>,
    pub expected_effect: Option<String>,
    pub strategy: &'a StrategyPreset,
}

pub fn build_mutation(request: &MutationRequest<'_>) -> Mutation {
    let category = mutation_category(request.signals, request.drift_enabled, request.strategy);
    let target = request.target.clone().unwrap_or_else(|| {
        request
            .selected_gene
            .filter(|gene| !gene.id.is_empty())
            .map(|gene| format!("gene:{}", gene.id))
            .unwrap_or_else(|| "behavior:protocol".to_string())
    });
    let mut mutation = Mutation {
        kind: AssetKind::Mutation,
        id: next_id("mut"),
        category,
        trigger_signals: unique_signals(request.signals),
        target,
        expected_effect: request
            .expected_effect
            .clone()
            .unwrap_or_else(|| expected_effect_for(Some(category)).to_string()),
        risk_level: RiskLevel::Low,
    };

    if category == GeneCategory::Innovate {
        mutation.risk_level = if request.allow_high_risk {
            RiskLevel::High
        } else {
            RiskLevel::Medium
        };
    }

    if mutation.category == GeneCategory::Innovate
        && is_high_risk_personality(request.personality_state)
    {
        mutation.category = GeneCategory::Optimize;
        mutation.expected_effect = "safety downgrade: optimize under high-risk personality (avoid innovate+high-risk combo)".to_string();
        mutation.risk_level = RiskLevel::Low;
        push_trigger(
            &mut mutation,
            "safety:avoid_innovate_with_high_risk_personality",
        );
    }

    if mutation.risk_level == RiskLevel::High
        && !is_high_risk_mutation_allowed(request.personality_state)
    {
        mutation.risk_level = RiskLevel::Medium;
        push_trigger(&mut mutation, "safety:downgrade_high_risk");
    }

    mutation
}

fn push_trigger(mutation: &mut Mutation, signal: &str) {
    let mut triggers = std::mem::take(&mut mutation.trigger_signals);
    triggers.push(signal.to_string());
    mutation.trigger_signals = unique_signals(triggers);
}

/// Shape check for a mutation read back from untyped state.
pub fn is_valid_mutation(value: &Value) -> bool {
    let non_empty = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .map_or(false, |text| !text.is_empty())
    };
    value.get("type").and_then(Value::as_str) == Some("Mutation")
        && non_empty("id")
        && value
            .get("category")
            .and_then(Value::as_str)
            .and_then(GeneCategory::parse)
            .is_some()
        && value.get("trigger_signals").map_or(false, Value::is_array)
        && non_empty("target")
        && non_empty("expected_effect")
        && value
            .get("risk_level")
            .and_then(Value::as_str)
            .and_then(parse_risk_level)
            .is_some()
}

/// Coerces any JSON value into a well-formed mutation, filling defaults.
pub fn normalize_mutation(value: &Value) -> Mutation {
    let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
    let raw_category = value
        .get("category")
        .and_then(Value::as_str)
        .and_then(GeneCategory::parse);
    let trigger_signals = value
        .get("trigger_signals")
        .and_then(Value::as_array)
        .map(|items| {
            unique_signals(items.iter().map(|item| match item {
                Value::String(text) => text.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            }))
        })
        .unwrap_or_default();
    Mutation {
        kind: AssetKind::Mutation,
        id: text("id").unwrap_or_else(|| next_id("mut")),
        category: raw_category.unwrap_or(GeneCategory::Optimize),
        trigger_signals,
        target: text("target").unwrap_or_else(|| "behavior:protocol".to_string()),
        expected_effect: text("expected_effect")
            .unwrap_or_else(|| expected_effect_for(raw_category).to_string()),
        risk_level: value
            .get("risk_level")
            .and_then(Value::as_str)
            .and_then(parse_risk_level)
            .unwrap_or(RiskLevel::Low),
    }
}

pub fn parse_risk_level(raw: &str) -> Option<RiskLevel> {
    match raw {
        "low" => Some(RiskLevel::Low),
        "medium" => Some(RiskLevel::Medium),
        "high" => Some(RiskLevel::High),
        _ => None,
    }
}
