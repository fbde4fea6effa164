use serde::{Deserialize, Serialize};

/// Named intent allocations. `Auto` resolves from cycle count and saturation signals.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyName {
    #[default]
    Balanced,
    Innovate,
    Harden,
    RepairOnly,
    EarlyStabilize,
    SteadyState,
    Auto,
}

impl StrategyName {
    pub const PRESETS: [StrategyName; 6] = [
        StrategyName::Balanced,
        StrategyName::Innovate,
        StrategyName::Harden,
        StrategyName::RepairOnly,
        StrategyName::EarlyStabilize,
        StrategyName::SteadyState,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyName::Balanced => "balanced",
            StrategyName::Innovate => "innovate",
            StrategyName::Harden => "harden",
            StrategyName::RepairOnly => "repair-only",
            StrategyName::EarlyStabilize => "early-stabilize",
            StrategyName::SteadyState => "steady-state",
            StrategyName::Auto => "auto",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let wanted = raw.trim().to_ascii_lowercase();
        Self::PRESETS
            .into_iter()
            .chain(std::iter::once(StrategyName::Auto))
            .find(|name| name.as_str() == wanted)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StrategyPreset {
    pub name: StrategyName,
    pub repair: f64,
    pub optimize: f64,
    pub innovate: f64,
    /// Repair share over recent cycles that forces innovation.
    pub repair_loop_threshold: f64,
    pub label: String,
    pub description: String,
}

impl StrategyPreset {
    pub fn favors_innovation(&self) -> bool {
        self.innovate >= 0.5
    }
}

pub fn strategy_preset(name: StrategyName) -> StrategyPreset {
    let (repair, optimize, innovate, threshold, label, description) = match name {
        StrategyName::Balanced | StrategyName::Auto => (
            0.20,
            0.30,
            0.50,
            0.50,
            "Balanced",
            "Normal operation. Steady growth with stability.",
        ),
        StrategyName::Innovate => (
            0.05,
            0.15,
            0.80,
            0.30,
            "Innovation Focus",
            "System is stable. Maximize new features and capabilities.",
        ),
        StrategyName::Harden => (
            0.40,
            0.40,
            0.20,
            0.70,
            "Hardening",
            "After a big change. Focus on stability and robustness.",
        ),
        StrategyName::RepairOnly => (
            0.80,
            0.20,
            0.00,
            1.00,
            "Repair Only",
            "Emergency. Fix everything before doing anything else.",
        ),
        StrategyName::EarlyStabilize => (
            0.60,
            0.25,
            0.15,
            0.80,
            "Early Stabilization",
            "First cycles. Prioritize fixing existing issues before innovating.",
        ),
        StrategyName::SteadyState => (
            0.60,
            0.30,
            0.10,
            0.90,
            "Steady State",
            "Evolution saturated. Maintain existing capabilities. Minimal innovation.",
        ),
    };
    let name = if name == StrategyName::Auto {
        StrategyName::Balanced
    } else {
        name
    };
    StrategyPreset {
        name,
        repair,
        optimize,
        innovate,
        repair_loop_threshold: threshold,
        label: label.to_string(),
        description: description.to_string(),
    }
}

/// An explicit non-default name wins. The default (`None`, `balanced`, `auto`)
/// switches to `early-stabilize` during cycles 1..=5 and to `steady-state`
/// when saturation signals are present.
pub fn resolve_strategy<S: AsRef<str>>(
    configured: Option<StrategyName>,
    cycle_count: u64,
    signals: &[S],
) -> StrategyPreset {
    let mut name = configured.unwrap_or_default();
    let is_default = matches!(name, StrategyName::Balanced | StrategyName::Auto);
    if is_default {
        if (1..=5).contains(&cycle_count) {
            name = StrategyName::EarlyStabilize;
        }
        let saturated = signals.iter().any(|signal| {
            matches!(
                signal.as_ref(),
                "force_steady_state" | "evolution_saturation"
            )
        });
        if saturated {
            name = StrategyName::SteadyState;
        }
    }
    strategy_preset(name)
}
