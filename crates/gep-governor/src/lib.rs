//! Policy-only constraint checks for solidify: blast radius, forbidden and protected paths.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use gep_evolution::{
    normalize_rel_path, path_under_any, BlastMeasurement, BlastRadius, BlastSeverity,
    DirectoryCount, EstimateComparison, Gene, GeneCategory,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// System caps no gene constraint can raise.
    pub hard_cap_files: usize,
    pub hard_cap_lines: usize,
    /// Floor applied to a gene's `max_files`.
    pub min_max_files: usize,
    pub warn_ratio: f64,
    pub critical_ratio: f64,
    pub estimate_drift_high: f64,
    pub estimate_drift_low: f64,
    pub breakdown_top_n: usize,
    pub protected_prefixes: Vec<String>,
    pub protected_files: Vec<String>,
    pub allow_self_modify: bool,
    pub self_modify_prefix: String,
    pub min_skill_files: usize,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|item| item.to_string()).collect();
        Self {
            hard_cap_files: 60,
            hard_cap_lines: 20_000,
            min_max_files: 20,
            warn_ratio: 0.8,
            critical_ratio: 2.0,
            estimate_drift_high: 3.0,
            estimate_drift_low: 0.1,
            breakdown_top_n: 5,
            protected_prefixes: strings(&[
                "skills/feishu-evolver-wrapper/",
                "skills/feishu-common/",
                "skills/feishu-post/",
                "skills/feishu-card/",
                "skills/feishu-doc/",
                "skills/skill-tools/",
                "skills/clawhub/",
                "skills/clawhub-batch-undelete/",
                "skills/git-sync/",
                "skills/evolver/",
            ]),
            protected_files: strings(&[
                "MEMORY.md",
                "SOUL.md",
                "IDENTITY.md",
                "AGENTS.md",
                "USER.md",
                "HEARTBEAT.md",
                "RECENT_EVENTS.md",
                "TOOLS.md",
                "TROUBLESHOOTING.md",
                "openclaw.json",
                ".env",
                "package.json",
            ]),
            allow_self_modify: false,
            self_modify_prefix: "skills/evolver/".to_string(),
            min_skill_files: 2,
        }
    }
}

impl GovernorConfig {
    /// Prefixes and root files as one list of path patterns.
    pub fn protected_paths(&self) -> Vec<String> {
        self.protected_prefixes
            .iter()
            .chain(self.protected_files.iter())
            .cloned()
            .collect()
    }

    pub fn is_critical_protected_path(&self, raw: &str) -> bool {
        let rel = normalize_rel_path(raw);
        if rel.is_empty() {
            return false;
        }
        path_under_any(&rel, &self.protected_prefixes)
            || self.protected_files.iter().any(|file| *file == rel)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SeverityAssessment {
    pub severity: BlastSeverity,
    pub message: String,
}

#[derive(Clone, Debug)]
pub struct ConstraintInput<'a> {
    pub gene: Option<&'a Gene>,
    pub blast: &'a BlastMeasurement,
    pub estimate: Option<&'a BlastRadius>,
    /// Enables the incomplete-skill scan when present.
    pub repo_root: Option<&'a Path>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ConstraintCheck {
    pub ok: bool,
    pub violations: Vec<String>,
    pub warnings: Vec<String>,
    pub severity: Option<SeverityAssessment>,
    pub estimate: Option<EstimateComparison>,
    pub breakdown: Vec<DirectoryCount>,
}

pub trait Governor: Send + Sync {
    fn check_constraints(&self, input: ConstraintInput<'_>) -> ConstraintCheck;
    fn detect_destructive_changes(
        &self,
        repo_root: &Path,
        changed_files: &[String],
        baseline_untracked: &[String],
    ) -> Vec<String>;
    /// Paths rollback must never delete.
    fn protected_paths(&self) -> Vec<String>;
}

#[derive(Clone, Debug, Default)]
pub struct DefaultGovernor {
    config: GovernorConfig,
}

impl DefaultGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }
}

impl Governor for DefaultGovernor {
    fn check_constraints(&self, input: ConstraintInput<'_>) -> ConstraintCheck {
        let config = &self.config;
        let mut check = ConstraintCheck {
            ok: true,
            ..ConstraintCheck::default()
        };
        let Some(gene) = input.gene else {
            return check;
        };
        let blast = input.blast;
        let max_files = gene
            .constraints
            .max_files
            .unwrap_or(0)
            .max(config.min_max_files);

        let severity = classify_blast_severity(blast.files, blast.lines, max_files, config);
        let touched = if blast.all_changed_files.is_empty() {
            &blast.changed_files
        } else {
            &blast.all_changed_files
        };
        match severity.severity {
            BlastSeverity::HardCapBreach => {
                log::error!("blast hard cap breach message={}", severity.message);
                check.violations.push(severity.message.clone());
                check.breakdown = blast_breakdown(touched, config.breakdown_top_n);
            }
            BlastSeverity::CriticalOverrun => {
                check.violations.push(severity.message.clone());
                check.breakdown = blast_breakdown(touched, config.breakdown_top_n);
                log::error!(
                    "blast critical overrun message={} top_dirs={}",
                    severity.message,
                    check
                        .breakdown
                        .iter()
                        .map(|entry| format!("{} ({})", entry.dir, entry.files))
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
            BlastSeverity::Exceeded => check
                .violations
                .push(format!("max_files exceeded: {} > {}", blast.files, max_files)),
            BlastSeverity::ApproachingLimit => check.warnings.push(severity.message.clone()),
            BlastSeverity::WithinLimit => {}
        }
        check.severity = Some(severity);

        check.estimate = compare_blast_estimate(input.estimate, blast.files, config);
        if let Some(comparison) = check.estimate.as_ref().filter(|c| c.drifted) {
            if let Some(message) = &comparison.message {
                log::warn!("blast estimate drift message={}", message);
                check.warnings.push(message.clone());
            }
        }

        for file in touched {
            if is_forbidden_path(file, &gene.constraints.forbidden_paths) {
                check.violations.push(format!("forbidden_path touched: {file}"));
            }
        }

        for file in touched {
            if !config.is_critical_protected_path(file) {
                continue;
            }
            let rel = normalize_rel_path(file);
            if config.allow_self_modify
                && path_under_any(&rel, &[config.self_modify_prefix.as_str()])
                && gene.category == GeneCategory::Repair
            {
                check.warnings.push(format!(
                    "self_modify_evolver_repair: {rel} (EVOLVE_ALLOW_SELF_MODIFY=true)"
                ));
            } else {
                check.violations.push(format!("critical_path_modified: {rel}"));
            }
        }

        if let Some(repo_root) = input.repo_root {
            check
                .warnings
                .extend(incomplete_skill_warnings(repo_root, touched, config));
        }

        check.ok = check.violations.is_empty();
        for violation in &check.violations {
            log::warn!("constraint violation gene_id={} detail={}", gene.id, violation);
        }
        check
    }

    fn detect_destructive_changes(
        &self,
        repo_root: &Path,
        changed_files: &[String],
        baseline_untracked: &[String],
    ) -> Vec<String> {
        let baseline = baseline_untracked
            .iter()
            .map(|path| normalize_rel_path(path))
            .collect::<Vec<_>>();
        let mut violations = Vec::new();
        for file in changed_files {
            let rel = normalize_rel_path(file);
            if rel.is_empty()
                || !self.config.is_critical_protected_path(&rel)
                || rel.split('/').any(|segment| segment == "..")
                || Path::new(&rel).is_absolute()
                || baseline.contains(&rel)
            {
                continue;
            }
            let abs = repo_root.join(&rel);
            match fs::metadata(&abs) {
                Err(_) => violations.push(format!("CRITICAL_FILE_DELETED: {rel}")),
                Ok(meta) if meta.is_file() && meta.len() == 0 => {
                    violations.push(format!("CRITICAL_FILE_EMPTIED: {rel}"))
                }
                Ok(_) => {}
            }
        }
        violations
    }

    fn protected_paths(&self) -> Vec<String> {
        self.config.protected_paths()
    }
}

/// Hard cap first, then ratios against `max_files`.
pub fn classify_blast_severity(
    files: usize,
    lines: usize,
    max_files: usize,
    config: &GovernorConfig,
) -> SeverityAssessment {
    if files > config.hard_cap_files || lines > config.hard_cap_lines {
        return SeverityAssessment {
            severity: BlastSeverity::HardCapBreach,
            message: format!(
                "HARD CAP BREACH: {files} files / {lines} lines exceeds system limit ({} files / {} lines)",
                config.hard_cap_files, config.hard_cap_lines
            ),
        };
    }
    if max_files == 0 {
        return SeverityAssessment {
            severity: BlastSeverity::WithinLimit,
            message: "no max_files constraint defined".to_string(),
        };
    }
    let actual = files as f64;
    let limit = max_files as f64;
    if actual > limit * config.critical_ratio {
        return SeverityAssessment {
            severity: BlastSeverity::CriticalOverrun,
            message: format!(
                "CRITICAL OVERRUN: {files} files > {} ({}x limit of {max_files}). Agent likely performed bulk/unintended operation.",
                limit * config.critical_ratio,
                config.critical_ratio
            ),
        };
    }
    if files > max_files {
        return SeverityAssessment {
            severity: BlastSeverity::Exceeded,
            message: format!("max_files exceeded: {files} > {max_files}"),
        };
    }
    if actual > limit * config.warn_ratio {
        return SeverityAssessment {
            severity: BlastSeverity::ApproachingLimit,
            message: format!(
                "approaching limit: {files} / {max_files} files ({}%)",
                (actual / limit * 100.0).round()
            ),
        };
    }
    SeverityAssessment {
        severity: BlastSeverity::WithinLimit,
        message: format!("{files} / {max_files} files"),
    }
}

/// Groups by the first two path segments, largest groups first.
pub fn blast_breakdown(files: &[String], top_n: usize) -> Vec<DirectoryCount> {
    let mut groups: Vec<DirectoryCount> = Vec::new();
    for file in files {
        let rel = normalize_rel_path(file);
        if rel.is_empty() {
            continue;
        }
        let dir = rel.split('/').take(2).collect::<Vec<_>>().join("/");
        match groups.iter_mut().find(|group| group.dir == dir) {
            Some(group) => group.files += 1,
            None => groups.push(DirectoryCount { dir, files: 1 }),
        }
    }
    groups.sort_by(|a, b| b.files.cmp(&a.files));
    groups.truncate(if top_n == 0 { 5 } else { top_n });
    groups
}

pub fn compare_blast_estimate(
    estimate: Option<&BlastRadius>,
    actual_files: usize,
    config: &GovernorConfig,
) -> Option<EstimateComparison> {
    let estimate = estimate.filter(|estimate| estimate.files > 0)?;
    let ratio = actual_files as f64 / estimate.files as f64;
    let high = ratio > config.estimate_drift_high;
    Some(EstimateComparison {
        estimate_files: estimate.files,
        actual_files,
        ratio: (ratio * 100.0).round() / 100.0,
        drifted: high || ratio < config.estimate_drift_low,
        message: high.then(|| {
            format!(
                "Estimate drift: actual {actual_files} files is {ratio:.1}x the estimated {}. Agent did not plan accurately.",
                estimate.files
            )
        }),
    })
}

pub fn is_forbidden_path<S: AsRef<str>>(file: &str, forbidden_paths: &[S]) -> bool {
    path_under_any(file, forbidden_paths)
}

fn incomplete_skill_warnings(
    repo_root: &Path,
    touched: &[String],
    config: &GovernorConfig,
) -> Vec<String> {
    let mut skills: Vec<String> = Vec::new();
    for file in touched {
        let rel = normalize_rel_path(file);
        let mut segments = rel.split('/');
        let (Some("skills"), Some(name), Some(_)) =
            (segments.next(), segments.next(), segments.next())
        else {
            continue;
        };
        if name.is_empty() || config.is_critical_protected_path(&rel) {
            continue;
        }
        if !skills.iter().any(|skill| skill == name) {
            skills.push(name.to_string());
        }
    }

    let mut warnings = Vec::new();
    for skill in skills {
        let Ok(entries) = fs::read_dir(repo_root.join("skills").join(&skill)) else {
            continue;
        };
        let count = entries
            .filter_map(Result::ok)
            .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
            .count();
        if count < config.min_skill_files {
            warnings.push(format!(
                "incomplete_skill: skills/{skill}/ has only {count} file(s). New skills should have at least index.js + SKILL.md."
            ));
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use gep_evolution::{next_id, GeneConstraints};
    use std::path::PathBuf;

    fn temp_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("gep-governor-{name}-{}", next_id("t")))
    }

    fn measurement(files: &[String], lines: usize) -> BlastMeasurement {
        BlastMeasurement {
            files: files.len(),
            lines,
            changed_files: files.to_vec(),
            ignored_files: Vec::new(),
            all_changed_files: files.to_vec(),
        }
    }

    fn numbered(prefix: &str, count: usize) -> Vec<String> {
        (0..count).map(|idx| format!("{prefix}/f{idx}.js")).collect()
    }

    fn gene(max_files: Option<usize>, category: GeneCategory) -> Gene {
        let mut gene = Gene::new("gene_test", category);
        gene.constraints = GeneConstraints {
            max_files,
            forbidden_paths: vec![".git".into(), "node_modules".into()],
        };
        gene
    }

    #[test]
    fn hard_cap_wins_over_generous_gene_limit() {
        let governor = DefaultGovernor::default();
        let gene = gene(Some(1000), GeneCategory::Repair);
        let blast = measurement(&numbered("src/a", 61), 100);
        let check = governor.check_constraints(ConstraintInput {
            gene: Some(&gene),
            blast: &blast,
            estimate: None,
            repo_root: None,
        });
        assert!(!check.ok);
        assert_eq!(
            check.severity.map(|s| s.severity),
            Some(BlastSeverity::HardCapBreach)
        );
        assert!(check.violations[0].starts_with("HARD CAP BREACH: 61 files / 100 lines"));
    }

    #[test]
    fn severity_ladder_uses_ratios_of_max_files() {
        let config = GovernorConfig::default();
        assert_eq!(
            classify_blast_severity(41, 10, 20, &config).message,
            "CRITICAL OVERRUN: 41 files > 40 (2x limit of 20). Agent likely performed bulk/unintended operation."
        );
        assert_eq!(
            classify_blast_severity(21, 10, 20, &config).severity,
            BlastSeverity::Exceeded
        );
        assert_eq!(
            classify_blast_severity(17, 10, 20, &config).message,
            "approaching limit: 17 / 20 files (85%)"
        );
        assert_eq!(
            classify_blast_severity(16, 10, 20, &config).message,
            "16 / 20 files"
        );
        assert_eq!(
            classify_blast_severity(1, 20_001, 20, &config).severity,
            BlastSeverity::HardCapBreach
        );
    }

    #[test]
    fn gene_max_files_is_floored_and_approaching_is_only_a_warning() {
        let governor = DefaultGovernor::default();
        let gene = gene(Some(3), GeneCategory::Optimize);
        let blast = measurement(&numbered("src/b", 17), 50);
        let check = governor.check_constraints(ConstraintInput {
            gene: Some(&gene),
            blast: &blast,
            estimate: None,
            repo_root: None,
        });
        assert!(check.ok);
        assert_eq!(check.warnings, vec!["approaching limit: 17 / 20 files (85%)"]);
    }

    #[test]
    fn forbidden_and_protected_paths_are_violations() {
        let governor = DefaultGovernor::default();
        let gene = gene(Some(12), GeneCategory::Repair);
        let files = vec![
            "node_modules/x/index.js".to_string(),
            "skills/evolver/index.js".to_string(),
            "./MEMORY.md".to_string(),
        ];
        let check = governor.check_constraints(ConstraintInput {
            gene: Some(&gene),
            blast: &measurement(&files, 3),
            estimate: None,
            repo_root: None,
        });
        assert!(!check.ok);
        assert!(check
            .violations
            .contains(&"forbidden_path touched: node_modules/x/index.js".to_string()));
        assert!(check
            .violations
            .contains(&"critical_path_modified: skills/evolver/index.js".to_string()));
        assert!(check
            .violations
            .contains(&"critical_path_modified: MEMORY.md".to_string()));
    }

    #[test]
    fn self_modify_opt_in_only_covers_repair_of_own_directory() {
        let governor = DefaultGovernor::new(GovernorConfig {
            allow_self_modify: true,
            ..GovernorConfig::default()
        });
        let files = vec!["skills/evolver/src/a.js".to_string()];
        let blast = measurement(&files, 3);

        let repair = gene(None, GeneCategory::Repair);
        let check = governor.check_constraints(ConstraintInput {
            gene: Some(&repair),
            blast: &blast,
            estimate: None,
            repo_root: None,
        });
        assert!(check.ok);
        assert_eq!(
            check.warnings,
            vec!["self_modify_evolver_repair: skills/evolver/src/a.js (EVOLVE_ALLOW_SELF_MODIFY=true)"]
        );

        let innovate = gene(None, GeneCategory::Innovate);
        let check = governor.check_constraints(ConstraintInput {
            gene: Some(&innovate),
            blast: &blast,
            estimate: None,
            repo_root: None,
        });
        assert!(!check.ok);
    }

    #[test]
    fn estimate_drift_is_reported_both_ways() {
        let config = GovernorConfig::default();
        let high = compare_blast_estimate(Some(&BlastRadius { files: 2, lines: 0 }), 7, &config)
            .unwrap();
        assert_eq!(high.ratio, 3.5);
        assert!(high.drifted);
        assert_eq!(
            high.message.as_deref(),
            Some("Estimate drift: actual 7 files is 3.5x the estimated 2. Agent did not plan accurately.")
        );
        let low = compare_blast_estimate(Some(&BlastRadius { files: 20, lines: 0 }), 1, &config)
            .unwrap();
        assert!(low.drifted);
        assert!(low.message.is_none());
        assert!(compare_blast_estimate(Some(&BlastRadius { files: 0, lines: 0 }), 1, &config)
            .is_none());
    }

    #[test]
    fn breakdown_groups_by_two_segments() {
        let mut files = numbered("skills/demo", 3);
        files.extend(numbered("src", 1));
        files.push("README.md".to_string());
        let breakdown = blast_breakdown(&files, 2);
        assert_eq!(
            breakdown,
            vec![
                DirectoryCount {
                    dir: "skills/demo".into(),
                    files: 3
                },
                DirectoryCount {
                    dir: "src/f0.js".into(),
                    files: 1
                },
            ]
        );
    }

    #[test]
    fn destructive_changes_flag_deleted_and_emptied_protected_files() {
        let root = temp_root("destructive");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("SOUL.md"), "").unwrap();
        fs::write(root.join("USER.md"), "kept").unwrap();
        let governor = DefaultGovernor::default();
        let violations = governor.detect_destructive_changes(
            &root,
            &[
                "MEMORY.md".to_string(),
                "SOUL.md".to_string(),
                "USER.md".to_string(),
                "src/a.js".to_string(),
                "TOOLS.md".to_string(),
            ],
            &["TOOLS.md".to_string()],
        );
        assert_eq!(
            violations,
            vec!["CRITICAL_FILE_DELETED: MEMORY.md", "CRITICAL_FILE_EMPTIED: SOUL.md"]
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn new_skill_with_single_file_warns() {
        let root = temp_root("skill");
        fs::create_dir_all(root.join("skills/weather")).unwrap();
        fs::write(root.join("skills/weather/index.js"), "x").unwrap();
        fs::write(root.join("skills/weather/.keep"), "").unwrap();
        let governor = DefaultGovernor::default();
        let gene = gene(None, GeneCategory::Innovate);
        let files = vec!["skills/weather/index.js".to_string()];
        let check = governor.check_constraints(ConstraintInput {
            gene: Some(&gene),
            blast: &measurement(&files, 1),
            estimate: None,
            repo_root: Some(&root),
        });
        assert!(check.ok);
        assert_eq!(
            check.warnings,
            vec!["incomplete_skill: skills/weather/ has only 1 file(s). New skills should have at least index.js + SKILL.md."]
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_gene_passes() {
        let check = DefaultGovernor::default().check_constraints(ConstraintInput {
            gene: None,
            blast: &measurement(&numbered("src", 100), 1),
            estimate: None,
            repo_root: None,
        });
        assert!(check.ok);
        assert!(check.severity.is_none());
    }
}
