use gep_evolution::{
    stable_hash, unique_signals, ContentAddressed, EvolutionError, Gene, GeneCategory,
    GeneConstraints, ValidationCommand, ValidationProgram, ValidationStep,
};
use gep_memory_graph::compute_signal_key;
use gep_selector::{GeneSelector, SelectionInput};
use serde::{Deserialize, Serialize};

pub const AUTO_GENE_MAX_FILES: usize = 12;

const AUTO_GENE_FORBIDDEN_PATHS: [&str; 11] = [
    ".git",
    "node_modules",
    "skills/feishu-evolver-wrapper",
    "skills/feishu-common",
    "skills/feishu-post",
    "skills/feishu-card",
    "skills/feishu-doc",
    "skills/skill-tools",
    "skills/clawhub",
    "skills/clawhub-batch-undelete",
    "skills/git-sync",
];

const AUTO_GENE_STRATEGY: [&str; 6] = [
    "Extract structured signals from logs and user instructions",
    "Select an existing Gene by signals match (no improvisation)",
    "Estimate blast radius (files, lines) before editing and record it",
    "Apply smallest reversible patch",
    "Validate using declared validation steps; rollback on failure",
    "Solidify knowledge: append EvolutionEvent, update Gene/Capsule store",
];

pub fn infer_category_from_signals<S: AsRef<str>>(signals: &[S]) -> GeneCategory {
    if signals.iter().any(|signal| signal.as_ref() == "log_error") {
        GeneCategory::Repair
    } else {
        GeneCategory::Optimize
    }
}

/// Content-addressed gene keyed by the signal set, `gene_auto_<hash>`.
pub fn build_auto_gene<S: AsRef<str>>(
    signals: &[S],
    intent: Option<GeneCategory>,
) -> Result<Gene, EvolutionError> {
    let signals = unique_signals(signals);
    let signal_key = compute_signal_key(&signals);
    let category = intent.unwrap_or_else(|| infer_category_from_signals(&signals));

    let mut gene = Gene::new(format!("gene_auto_{}", stable_hash(&signal_key)), category);
    gene.signals_match = if signals.is_empty() {
        vec!["(none)".to_string()]
    } else {
        signals.iter().take(8).cloned().collect()
    };
    gene.preconditions = vec![format!("signals_key == {signal_key}")];
    gene.strategy = AUTO_GENE_STRATEGY.iter().map(|line| line.to_string()).collect();
    gene.constraints = GeneConstraints {
        max_files: Some(AUTO_GENE_MAX_FILES),
        forbidden_paths: AUTO_GENE_FORBIDDEN_PATHS
            .iter()
            .map(|path| path.to_string())
            .collect(),
    };
    gene.validation = vec![ValidationStep::Command(ValidationCommand::new(
        ValidationProgram::Node,
        ["-e", "require('./src/gep/solidify'); console.log('ok')"],
    ))];
    gene.seal()?;
    Ok(gene)
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GeneResolution {
    SelectedGeneIdPresent,
    ReselectedFromExisting,
    NoMatchCreateNew,
}

impl GeneResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeneResolution::SelectedGeneIdPresent => "selected_gene_id_present",
            GeneResolution::ReselectedFromExisting => "reselected_from_existing",
            GeneResolution::NoMatchCreateNew => "no_match_create_new",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EnsuredGene {
    pub gene: Gene,
    pub created: bool,
    pub resolution: GeneResolution,
}

/// The pending selection, else a drift-free reselection, else a new auto gene.
/// Persisting a created gene is left to the caller.
pub fn ensure_gene(
    genes: &[Gene],
    selected: Option<&Gene>,
    signals: &[String],
    intent: Option<GeneCategory>,
    selector: &dyn GeneSelector,
) -> Result<EnsuredGene, EvolutionError> {
    if let Some(gene) = selected {
        return Ok(EnsuredGene {
            gene: gene.clone(),
            created: false,
            resolution: GeneResolution::SelectedGeneIdPresent,
        });
    }
    let reselected = selector
        .select(&SelectionInput {
            genes,
            capsules: &[],
            signals,
            advice: None,
            drift_enabled: false,
        })
        .selected_gene;
    if let Some(gene) = reselected {
        return Ok(EnsuredGene {
            gene,
            created: false,
            resolution: GeneResolution::ReselectedFromExisting,
        });
    }
    Ok(EnsuredGene {
        gene: build_auto_gene(signals, intent)?,
        created: true,
        resolution: GeneResolution::NoMatchCreateNew,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gep_selector::{DriftSelector, SelectorConfig};

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn category_follows_error_signal() {
        assert_eq!(
            infer_category_from_signals(&["log_error", "x"]),
            GeneCategory::Repair
        );
        assert_eq!(
            infer_category_from_signals(&["protocol_drift"]),
            GeneCategory::Optimize
        );
        assert_eq!(
            infer_category_from_signals::<&str>(&[]),
            GeneCategory::Optimize
        );
    }

    #[test]
    fn auto_gene_is_deterministic_and_sealed() {
        let signals = strings(&["log_error", "errsig:boom", "log_error"]);
        let first = build_auto_gene(&signals, None).unwrap();
        let second = build_auto_gene(&strings(&["errsig:boom", "log_error"]), None).unwrap();

        assert_eq!(first.id, second.id);
        assert!(first.id.starts_with("gene_auto_"));
        assert_eq!(first.category, GeneCategory::Repair);
        assert_eq!(first.signals_match, strings(&["log_error", "errsig:boom"]));
        assert_eq!(first.constraints.max_files, Some(AUTO_GENE_MAX_FILES));
        assert_eq!(first.constraints.forbidden_paths.len(), 11);
        assert_eq!(first.strategy.len(), 6);
        assert!(first.has_valid_asset_id());
        assert!(first.validation[0].resolve().is_ok());
    }

    #[test]
    fn auto_gene_without_signals_matches_none_marker() {
        let gene = build_auto_gene::<String>(&[], Some(GeneCategory::Innovate)).unwrap();
        assert_eq!(gene.signals_match, strings(&["(none)"]));
        assert_eq!(gene.category, GeneCategory::Innovate);
    }

    #[test]
    fn resolution_prefers_selection_then_reselection_then_auto() {
        let selector = DriftSelector::with_seed(SelectorConfig::default(), 7);
        let mut repair = Gene::new("gene_repair", GeneCategory::Repair);
        repair.signals_match = strings(&["error"]);
        let genes = vec![repair.clone()];

        let kept = ensure_gene(&genes, Some(&repair), &[], None, &selector).unwrap();
        assert_eq!(kept.resolution, GeneResolution::SelectedGeneIdPresent);
        assert!(!kept.created);

        let reselected =
            ensure_gene(&genes, None, &strings(&["log_error"]), None, &selector).unwrap();
        assert_eq!(reselected.resolution, GeneResolution::ReselectedFromExisting);
        assert_eq!(reselected.gene.id, "gene_repair");

        let created =
            ensure_gene(&genes, None, &strings(&["user_feature_request"]), None, &selector)
                .unwrap();
        assert_eq!(created.resolution, GeneResolution::NoMatchCreateNew);
        assert!(created.created);
        assert_eq!(created.resolution.as_str(), "no_match_create_new");
    }
}
