//! Signal-driven gene and capsule selection with population-size dependent drift.

use std::sync::Mutex;

use gep_evolution::{AssetKind, Capsule, Gene, GeneId, SelectorDecision};
use gep_memory_graph::MemoryAdvice;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde::{Deserialize, Serialize};

const MAX_ALTERNATIVES: usize = 4;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SelectorConfig {
    /// Overrides the gene pool size as the effective population size.
    pub effective_population_size: Option<f64>,
}

/// A pattern is either a case-insensitive substring or `/body/flags`.
/// Regex-like patterns that fail to compile fall back to substring matching.
pub fn match_pattern_to_signals<S: AsRef<str>>(pattern: &str, signals: &[S]) -> bool {
    if pattern.is_empty() || signals.is_empty() {
        return false;
    }
    if let Some(regex) = regex_pattern(pattern) {
        return signals.iter().any(|signal| regex.is_match(signal.as_ref()));
    }
    let needle = pattern.to_lowercase();
    signals
        .iter()
        .any(|signal| signal.as_ref().to_lowercase().contains(&needle))
}

fn regex_pattern(pattern: &str) -> Option<Regex> {
    if pattern.len() < 2 || !pattern.starts_with('/') {
        return None;
    }
    let last_slash = pattern.rfind('/').filter(|index| *index > 0)?;
    let body = &pattern[1..last_slash];
    let flags = &pattern[last_slash + 1..];
    let flags = if flags.is_empty() { "i" } else { flags };
    let inline = flags
        .chars()
        .filter(|flag| matches!(flag, 'i' | 'm' | 's'))
        .collect::<String>();
    let source = if inline.is_empty() {
        body.to_string()
    } else {
        format!("(?{inline}){body}")
    };
    Regex::new(&source).ok()
}

/// Number of `signals_match` patterns hitting the current signals.
pub fn score_gene<S: AsRef<str>>(gene: &Gene, signals: &[S]) -> usize {
    if gene.kind != AssetKind::Gene {
        return 0;
    }
    gene.signals_match
        .iter()
        .filter(|pattern| match_pattern_to_signals(pattern, signals))
        .count()
}

/// `1/sqrt(Ne)` capped at 1; explicit drift lifts it by 0.3, or to 0.7 when
/// the population is unknown or a single gene.
pub fn compute_drift_intensity(drift_enabled: bool, population_size: Option<f64>) -> f64 {
    let ne = population_size.filter(|size| size.is_finite() && *size != 0.0);
    if drift_enabled {
        return match ne {
            Some(ne) if ne > 1.0 => (1.0 / ne.sqrt() + 0.3).min(1.0),
            _ => 0.7,
        };
    }
    match ne {
        Some(ne) if ne > 0.0 => (1.0 / ne.sqrt()).min(1.0),
        _ => 0.0,
    }
}

#[derive(Clone, Debug, Default)]
pub struct GeneSelectOptions<'a> {
    pub banned_gene_ids: &'a [GeneId],
    pub preferred_gene_id: Option<&'a str>,
    pub drift_enabled: bool,
    pub effective_population_size: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GeneSelection {
    pub selected: Option<Gene>,
    pub alternatives: Vec<Gene>,
    pub drift_intensity: f64,
}

pub fn select_gene<S, R>(
    genes: &[Gene],
    signals: &[S],
    options: &GeneSelectOptions<'_>,
    rng: &mut R,
) -> GeneSelection
where
    S: AsRef<str>,
    R: Rng,
{
    let population = options
        .effective_population_size
        .or(Some(genes.len() as f64));
    let drift_intensity = compute_drift_intensity(options.drift_enabled, population);
    let use_drift = options.drift_enabled || drift_intensity > 0.15;
    let banned = |gene: &Gene| options.banned_gene_ids.iter().any(|id| *id == gene.id);

    let mut scored = genes
        .iter()
        .map(|gene| (gene, score_gene(gene, signals)))
        .filter(|(_, score)| *score > 0)
        .collect::<Vec<_>>();
    scored.sort_by(|left, right| right.1.cmp(&left.1));

    if scored.is_empty() {
        return GeneSelection {
            selected: None,
            alternatives: Vec::new(),
            drift_intensity,
        };
    }

    if let Some(preferred_id) = options.preferred_gene_id {
        if let Some((preferred, _)) = scored.iter().find(|(gene, _)| gene.id == preferred_id) {
            if use_drift || !banned(*preferred) {
                let alternatives = scored
                    .iter()
                    .map(|(gene, _)| *gene)
                    .filter(|gene| gene.id != preferred_id)
                    .filter(|gene| use_drift || !banned(*gene))
                    .take(MAX_ALTERNATIVES)
                    .cloned()
                    .collect();
                return GeneSelection {
                    selected: Some((*preferred).clone()),
                    alternatives,
                    drift_intensity,
                };
            }
        }
    }

    let filtered = scored
        .iter()
        .map(|(gene, _)| *gene)
        .filter(|gene| use_drift || !banned(*gene))
        .collect::<Vec<_>>();
    if filtered.is_empty() {
        return GeneSelection {
            selected: None,
            alternatives: scored
                .iter()
                .take(MAX_ALTERNATIVES)
                .map(|(gene, _)| (*gene).clone())
                .collect(),
            drift_intensity,
        };
    }

    let mut selected_index = 0;
    if drift_intensity > 0.0 && filtered.len() > 1 && rng.gen::<f64>() < drift_intensity {
        let top_n = filtered
            .len()
            .min(((filtered.len() as f64 * drift_intensity).ceil() as usize).max(2));
        selected_index = rng.gen_range(0..top_n);
    }

    GeneSelection {
        selected: Some(filtered[selected_index].clone()),
        alternatives: filtered
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != selected_index)
            .take(MAX_ALTERNATIVES)
            .map(|(_, gene)| (*gene).clone())
            .collect(),
        drift_intensity,
    }
}

/// Highest trigger-match count wins; ties keep store order.
pub fn select_capsule<'a, S: AsRef<str>>(
    capsules: &'a [Capsule],
    signals: &[S],
) -> Option<&'a Capsule> {
    let mut best: Option<(&Capsule, usize)> = None;
    for capsule in capsules {
        let score = capsule
            .trigger
            .iter()
            .filter(|trigger| match_pattern_to_signals(trigger, signals))
            .count();
        if score == 0 {
            continue;
        }
        if best.map_or(true, |(_, current)| score > current) {
            best = Some((capsule, score));
        }
    }
    best.map(|(capsule, _)| capsule)
}

pub fn build_selector_decision(
    gene: Option<&Gene>,
    capsule: Option<&Capsule>,
    signals: &[String],
    alternatives: &[Gene],
    advice: Option<&MemoryAdvice>,
    drift_enabled: bool,
    drift_intensity: f64,
) -> SelectorDecision {
    let mut reason = Vec::new();
    if gene.is_some() {
        reason.push("signals match gene.signals_match".to_string());
    }
    if capsule.is_some() {
        reason.push("capsule trigger matches signals".to_string());
    }
    if gene.is_none() {
        reason.push("no matching gene found; new gene may be required".to_string());
    }
    if !signals.is_empty() {
        reason.push(format!("signals: {}", signals.join(", ")));
    }
    if let Some(advice) = advice.filter(|advice| !advice.explanation.is_empty()) {
        reason.push(format!("memory_graph: {}", advice.explanation.join(" | ")));
    }
    if drift_enabled {
        reason.push("random_drift_override: true".to_string());
    }
    if drift_intensity.is_finite() && drift_intensity > 0.0 {
        reason.push(format!("drift_intensity: {drift_intensity:.3}"));
    }
    SelectorDecision {
        selected: gene.map(|gene| gene.id.clone()),
        reason,
        alternatives: alternatives.iter().map(|gene| gene.id.clone()).collect(),
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SelectionInput<'a> {
    pub genes: &'a [Gene],
    pub capsules: &'a [Capsule],
    pub signals: &'a [String],
    pub advice: Option<&'a MemoryAdvice>,
    pub drift_enabled: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Selection {
    pub selected_gene: Option<Gene>,
    pub capsule_candidates: Vec<Capsule>,
    pub selector: SelectorDecision,
    pub drift_intensity: f64,
}

pub trait GeneSelector: Send + Sync {
    fn select(&self, input: &SelectionInput<'_>) -> Selection;
}

pub struct DriftSelector {
    config: SelectorConfig,
    rng: Mutex<StdRng>,
}

impl DriftSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(config: SelectorConfig, seed: u64) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl GeneSelector for DriftSelector {
    fn select(&self, input: &SelectionInput<'_>) -> Selection {
        let empty = Vec::new();
        let banned = input
            .advice
            .map(|advice| &advice.banned_gene_ids)
            .unwrap_or(&empty);
        let options = GeneSelectOptions {
            banned_gene_ids: banned,
            preferred_gene_id: input
                .advice
                .and_then(|advice| advice.preferred_gene_id.as_deref()),
            drift_enabled: input.drift_enabled,
            effective_population_size: self.config.effective_population_size,
        };
        let selection = match self.rng.lock() {
            Ok(mut rng) => select_gene(input.genes, input.signals, &options, &mut *rng),
            Err(poisoned) => {
                select_gene(input.genes, input.signals, &options, &mut *poisoned.into_inner())
            }
        };
        let capsule = select_capsule(input.capsules, input.signals);
        let selector = build_selector_decision(
            selection.selected.as_ref(),
            capsule,
            input.signals,
            &selection.alternatives,
            input.advice,
            input.drift_enabled,
            selection.drift_intensity,
        );
        Selection {
            selected_gene: selection.selected,
            capsule_candidates: capsule.cloned().into_iter().collect(),
            selector,
            drift_intensity: selection.drift_intensity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gep_evolution::{GeneCategory, Outcome, OutcomeStatus};
    use serde_json::json;

    fn gene(id: &str, patterns: &[&str]) -> Gene {
        let mut gene = Gene::new(id, GeneCategory::Repair);
        gene.signals_match = patterns.iter().map(|p| p.to_string()).collect();
        gene
    }

    fn capsule(id: &str, trigger: &[&str]) -> Capsule {
        serde_json::from_value(json!({
            "type": "Capsule",
            "id": id,
            "trigger": trigger,
            "outcome": {"status": "success", "score": 0.9},
        }))
        .unwrap()
    }

    fn signals(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn patterns_match_substrings_and_regex_literals() {
        let current = signals(&["log_error", "errsig:TypeError: x is undefined"]);
        assert!(match_pattern_to_signals("ERROR", &current));
        assert!(match_pattern_to_signals("/typeerror/", &current));
        assert!(!match_pattern_to_signals("/typeerror/m", &current));
        assert!(match_pattern_to_signals("/^log_/", &current));
        assert!(!match_pattern_to_signals("perf", &current));
        assert!(!match_pattern_to_signals("error", &[] as &[String]));
        // unbalanced regex falls back to substring
        assert!(!match_pattern_to_signals("/(/", &current));
    }

    #[test]
    fn drift_intensity_shrinks_with_population() {
        let mut previous = f64::INFINITY;
        for size in [1.0, 2.0, 4.0, 25.0, 100.0] {
            let intensity = compute_drift_intensity(false, Some(size));
            assert!(intensity <= previous);
            previous = intensity;
        }
        assert!((compute_drift_intensity(false, Some(25.0)) - 0.2).abs() < 1e-9);
        assert!(compute_drift_intensity(true, Some(1.0)) >= 0.7);
        assert_eq!(compute_drift_intensity(false, None), 0.0);
        assert!((compute_drift_intensity(true, Some(4.0)) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn single_matching_gene_is_selected_deterministically() {
        let genes = vec![gene("g_repair", &["error"]), gene("g_perf", &["perf_bottleneck"])];
        let mut rng = StdRng::seed_from_u64(7);
        let selection = select_gene(
            &genes,
            &signals(&["log_error"]),
            &GeneSelectOptions::default(),
            &mut rng,
        );
        assert_eq!(selection.selected.unwrap().id, "g_repair");
        assert!(selection.alternatives.is_empty());
    }

    #[test]
    fn preferred_gene_overrides_score_only_among_matches() {
        let genes = vec![
            gene("g_strong", &["error", "log"]),
            gene("g_weak", &["error"]),
            gene("g_other", &["perf"]),
        ];
        let current = signals(&["log_error"]);
        let mut rng = StdRng::seed_from_u64(1);
        let options = GeneSelectOptions {
            preferred_gene_id: Some("g_weak"),
            ..GeneSelectOptions::default()
        };
        let selection = select_gene(&genes, &current, &options, &mut rng);
        assert_eq!(selection.selected.unwrap().id, "g_weak");

        let options = GeneSelectOptions {
            preferred_gene_id: Some("g_other"),
            effective_population_size: Some(1e12),
            ..GeneSelectOptions::default()
        };
        let selection = select_gene(&genes, &current, &options, &mut rng);
        assert_eq!(selection.selected.unwrap().id, "g_strong");
    }

    #[test]
    fn banned_genes_are_filtered_without_drift() {
        let genes = vec![gene("g_a", &["error"]), gene("g_b", &["log"])];
        let banned = vec!["g_a".to_string(), "g_b".to_string()];
        let mut rng = StdRng::seed_from_u64(3);
        let options = GeneSelectOptions {
            banned_gene_ids: &banned,
            effective_population_size: Some(1000.0),
            ..GeneSelectOptions::default()
        };
        let selection = select_gene(&genes, &signals(&["log_error"]), &options, &mut rng);
        assert!(selection.selected.is_none());
        assert_eq!(selection.alternatives.len(), 2);

        let options = GeneSelectOptions {
            drift_enabled: true,
            ..options
        };
        let selection = select_gene(&genes, &signals(&["log_error"]), &options, &mut rng);
        assert!(selection.selected.is_some());
    }

    #[test]
    fn capsule_with_most_trigger_hits_wins() {
        let capsules = vec![
            capsule("c_one", &["log_error"]),
            capsule("c_two", &["log_error", "errsig"]),
            capsule("c_none", &["perf"]),
        ];
        let current = signals(&["log_error", "errsig:boom"]);
        assert_eq!(select_capsule(&capsules, &current).unwrap().id, "c_two");
        assert!(select_capsule(&capsules, &signals(&["unrelated"])).is_none());
        assert_eq!(
            capsules[0].outcome,
            Outcome {
                status: OutcomeStatus::Success,
                score: 0.9
            }
        );
    }

    #[test]
    fn decision_reasons_follow_selection() {
        let advice = MemoryAdvice {
            current_signal_key: "log_error".into(),
            preferred_gene_id: Some("g_a".into()),
            banned_gene_ids: Vec::new(),
            explanation: vec!["memory_prefer:g_a".into()],
        };
        let genes = vec![gene("g_a", &["error"])];
        let capsules = vec![capsule("c_a", &["log_error"])];
        let current = signals(&["log_error"]);
        let selector = DriftSelector::with_seed(SelectorConfig::default(), 11);
        let selection = selector.select(&SelectionInput {
            genes: &genes,
            capsules: &capsules,
            signals: &current,
            advice: Some(&advice),
            drift_enabled: false,
        });
        assert_eq!(selection.selector.selected.as_deref(), Some("g_a"));
        assert_eq!(selection.capsule_candidates.len(), 1);
        assert_eq!(
            selection.selector.reason,
            vec![
                "signals match gene.signals_match".to_string(),
                "capsule trigger matches signals".to_string(),
                "signals: log_error".to_string(),
                "memory_graph: memory_prefer:g_a".to_string(),
                "drift_intensity: 1.000".to_string(),
            ]
        );
    }
}
