//! Evolution kernel: run start, the solidify state machine, epigenetic marks, and hub publishing.

mod config;
mod epigenetics;
mod genes;
mod report;
mod state;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use gep_evolution::{
    capture_env_fingerprint, clamp01, next_id, now_iso, stable_hash, unique_signals,
    verify_asset_id, A2aStatus, AssetKind, AssetStore, BlastMeasurement, BlastRadius, Capsule,
    ContentAddressed, EnvFingerprint, EnvProbe, EventMeta, EvolutionError, EvolutionEvent, Gene,
    GeneCategory, GeneMeta, JsonAssetStore, Mutation, Outcome, OutcomeStatus, PersonalityMeta,
    PersonalityState, RiskLevel, SourceType, ValidationCommandOutcome, ValidationReport,
    ValidationReportRef, SCHEMA_VERSION,
};
use gep_evolution_network::{
    build_publish_bundle, compute_capsule_success_streak, is_capsule_broadcast_eligible,
    lower_confidence, node_id, parse_a2a_input, prepare_publish_assets, HubClient,
    LowerConfidence, PublishBundle, PublishResult, TaskCompleteResult,
};
use gep_governor::{blast_breakdown, ConstraintCheck, ConstraintInput, DefaultGovernor, Governor};
use gep_memory_graph::{
    compute_signal_key, AttemptContext, MemoryAdvice, MemoryGraph, MemoryGraphError,
};
use gep_mutation::{
    build_mutation, is_high_risk_mutation_allowed, is_high_risk_personality, is_valid_mutation,
    normalize_mutation, resolve_strategy, MutationRequest,
};
use gep_personality::{is_valid_personality_state, PersonalityError, PersonalityStore};
use gep_sandbox::{
    CanaryResult, CommandValidator, GitWorkspace, RollbackReport, ValidationRun, Validator,
    Workspace,
};
use gep_selector::{DriftSelector, GeneSelector, SelectionInput};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub use config::{EvolverConfig, PathsConfig};
pub use epigenetics::{
    apply_epigenetic_marks, build_epigenetic_mark, env_context, get_epigenetic_boost,
    MARK_MAX_AGE_DAYS, MAX_MARKS,
};
pub use genes::{
    build_auto_gene, ensure_gene, infer_category_from_signals, EnsuredGene, GeneResolution,
    AUTO_GENE_MAX_FILES,
};
pub use report::{build_validation_report, is_valid_validation_report};
pub use state::{
    LastRun, LastSolidify, RunState, SolidifyState, SolidifyStateFile, SOLIDIFY_STATE_FILE,
};

const RECENT_EVENT_WINDOW: usize = 80;
const INNOVATION_TAIL: usize = 6;
const ESTIMATE_LINES_PER_FILE: usize = 80;
const SUCCESS_SCORE: f64 = 0.85;
const FAILURE_SCORE: f64 = 0.2;
const AGENT_NAME: &str = "evolver";

#[derive(Debug, Error)]
pub enum EvoKernelError {
    #[error("config error: {0}")]
    Config(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("memory graph error: {0}")]
    MemoryGraph(String),
    #[error("personality error: {0}")]
    Personality(String),
    #[error("solidify state error: {0}")]
    State(String),
    #[error("run {0} is still pending solidify")]
    PendingRun(String),
    #[error("run {0} is already solidified")]
    AlreadySolidified(String),
}

/// An asset the hub matched for this run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HubHit {
    pub asset_id: Option<String>,
    pub source_node_id: Option<String>,
    pub chain_id: Option<String>,
    /// Reused as-is rather than consulted as a reference.
    pub direct: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ActiveTask {
    pub id: String,
    pub title: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct RunRequest {
    pub signals: Vec<String>,
    pub observations: Option<Value>,
    pub drift: bool,
    pub force_innovation: bool,
    pub cycle_count: u64,
    pub hub_hit: Option<HubHit>,
    pub active_task: Option<ActiveTask>,
}

/// Everything decided before the external patch is applied.
#[derive(Clone, Debug)]
pub struct RunTicket {
    pub run_id: String,
    pub selected_gene: Option<Gene>,
    pub capsule_candidates: Vec<Capsule>,
    pub mutation: Mutation,
    pub personality_state: PersonalityState,
    pub advice: MemoryAdvice,
    pub innovation_pressure: bool,
    pub hypothesis_id: String,
    pub action_id: String,
    pub last_run: LastRun,
}

#[derive(Clone, Debug)]
pub struct SolidifyRequest {
    pub intent: Option<GeneCategory>,
    pub summary: Option<String>,
    pub dry_run: bool,
    pub rollback_on_failure: bool,
    /// Used only when no pending run recorded signals.
    pub fallback_signals: Vec<String>,
}

impl Default for SolidifyRequest {
    fn default() -> Self {
        Self {
            intent: None,
            summary: None,
            dry_run: false,
            rollback_on_failure: true,
            fallback_signals: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SolidifyOutcome {
    pub ok: bool,
    pub run_id: String,
    pub event: EvolutionEvent,
    pub capsule: Option<Capsule>,
    pub gene: Gene,
    pub constraint_check: ConstraintCheck,
    pub validation: ValidationRun,
    pub validation_report: ValidationReport,
    pub blast: BlastMeasurement,
    pub canary: CanaryResult,
    pub rollback: Option<RollbackReport>,
    pub publish_result: Option<PublishResult>,
    pub task_complete_result: Option<TaskCompleteResult>,
}

pub struct EvoKernel {
    pub store: Arc<dyn AssetStore>,
    pub memory_graph: MemoryGraph,
    pub personality: PersonalityStore,
    pub selector: Arc<dyn GeneSelector>,
    pub workspace: Arc<dyn Workspace>,
    pub validator: Arc<dyn Validator>,
    pub governor: Arc<dyn Governor>,
    pub hub: Option<Arc<dyn HubClient>>,
    config: EvolverConfig,
    state_file: SolidifyStateFile,
    env_probe: EnvProbe,
    env_fingerprint: Option<EnvFingerprint>,
    now: Option<DateTime<Utc>>,
}

impl EvoKernel {
    pub fn new(config: EvolverConfig) -> Self {
        let repo_root = config.paths.repo_root.clone();
        let evolution_dir = config.paths.evolution_path();
        Self {
            store: Arc::new(JsonAssetStore::new(config.paths.assets_path())),
            memory_graph: MemoryGraph::new(evolution_dir.clone(), config.memory_graph.clone()),
            personality: PersonalityStore::new(evolution_dir.clone(), config.personality.clone()),
            selector: Arc::new(DriftSelector::new(config.selector.clone())),
            workspace: Arc::new(GitWorkspace::new(repo_root.clone(), config.sandbox.clone())),
            validator: Arc::new(CommandValidator::new(repo_root.clone(), config.sandbox.clone())),
            governor: Arc::new(DefaultGovernor::new(config.governor.clone())),
            hub: None,
            state_file: SolidifyStateFile::new(evolution_dir.clone()),
            env_probe: EnvProbe {
                device_id: config.device_id.clone(),
                state_dir: evolution_dir,
                repo_root,
            },
            env_fingerprint: None,
            now: None,
            config,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn AssetStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_selector(mut self, selector: Arc<dyn GeneSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_workspace(mut self, workspace: Arc<dyn Workspace>) -> Self {
        self.workspace = workspace;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_governor(mut self, governor: Arc<dyn Governor>) -> Self {
        self.governor = governor;
        self
    }

    pub fn with_hub(mut self, hub: Arc<dyn HubClient>) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Skips probing the host for the environment fingerprint.
    pub fn with_env_fingerprint(mut self, env: EnvFingerprint) -> Self {
        self.env_fingerprint = Some(env);
        self
    }

    /// Fixes the clock used for epigenetic mark ages.
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn config(&self) -> &EvolverConfig {
        &self.config
    }

    pub fn solidify_state(&self) -> SolidifyState {
        self.state_file.read()
    }

    /// Selects a gene, builds the mutation, records the hypothesis and the
    /// attempt, and leaves the run pending until `solidify`.
    pub async fn start_run(&self, request: RunRequest) -> Result<RunTicket, EvoKernelError> {
        let mut state = self.state_file.read();
        if let Err(err) = state.ensure_not_pending() {
            log::warn!("evolution run refused reason=pending_solidify detail={}", err);
            return Err(err);
        }

        let signals = unique_signals(&request.signals);
        self.memory_graph
            .record_outcome_from_state(&signals, request.observations.as_ref())
            .map_err(memory_err)?;
        self.memory_graph
            .record_signal_snapshot(&signals, request.observations.as_ref())
            .map_err(memory_err)?;

        let genes = self.store.load_genes();
        let capsules = self.store.load_capsules();
        let events = self.store.read_evolution_events();
        let recent = &events[events.len().saturating_sub(RECENT_EVENT_WINDOW)..];

        let advice = self.memory_graph.advice(&signals, &genes, request.drift);
        let selection = self.selector.select(&SelectionInput {
            genes: &genes,
            capsules: &capsules,
            signals: &signals,
            advice: Some(&advice),
            drift_enabled: request.drift,
        });
        let selected_by = if advice.preferred_gene_id.is_some() {
            "memory_graph+selector"
        } else {
            "selector"
        };
        let capsules_used = selection
            .capsule_candidates
            .iter()
            .map(|capsule| capsule.id.clone())
            .collect::<Vec<_>>();

        let personality = self
            .personality
            .select_for_run(request.drift, &signals, recent)
            .map_err(personality_err)?;

        let innovation_pressure =
            has_innovation_pressure(request.drift, &personality.state, recent);
        let mut mutation_signals = signals.clone();
        if innovation_pressure {
            mutation_signals.push("stable_success_plateau".into());
        }
        if request.force_innovation {
            mutation_signals.push("force_innovation".into());
        }
        let mutation_signals = unique_signals(&mutation_signals);
        let innovate_mode = request.drift || innovation_pressure || request.force_innovation;

        let strategy = resolve_strategy(self.config.strategy, request.cycle_count, &signals);
        let mutation = build_mutation(&MutationRequest {
            signals: &mutation_signals,
            selected_gene: selection.selected_gene.as_ref(),
            drift_enabled: innovate_mode,
            personality_state: Some(&personality.state),
            allow_high_risk: allows_high_risk(
                request.drift,
                personality.known,
                &personality.state,
                &signals,
            ),
            target: None,
            expected_effect: None,
            strategy: &strategy,
        });

        let context = AttemptContext {
            signals: &signals,
            mutation: Some(&mutation),
            personality_state: Some(&personality.state),
            selected_gene: selection.selected_gene.as_ref(),
            selector: Some(&selection.selector),
            drift_enabled: request.drift,
            selected_by,
            capsules_used: &capsules_used,
            observations: request.observations.as_ref(),
        };
        let hypothesis = self
            .memory_graph
            .record_hypothesis(&context)
            .map_err(memory_err)?;
        let attempt = self
            .memory_graph
            .record_attempt(&context, Some(&hypothesis.hypothesis_id))
            .map_err(memory_err)?;

        let baseline_untracked = self.workspace.untracked_files().await;
        let baseline_git_head = self.workspace.head().await;
        let estimate_files = selection
            .selected_gene
            .as_ref()
            .and_then(|gene| gene.constraints.max_files)
            .filter(|files| *files > 0)
            .unwrap_or(AUTO_GENE_MAX_FILES);

        let previous_run_id = state.last_run.as_ref().map(|run| run.run_id.as_str());
        let hub_hit = request.hub_hit.as_ref();
        let last_run = LastRun {
            run_id: fresh_run_id(previous_run_id),
            state: RunState::Pending,
            created_at: now_iso(),
            parent_event_id: self.store.last_event_id(),
            selected_gene_id: selection.selected_gene.as_ref().map(|gene| gene.id.clone()),
            selected_capsule_id: capsules_used.first().cloned(),
            selector: Some(selection.selector.clone()),
            signals: signals.clone(),
            mutation: serde_json::to_value(&mutation).ok(),
            mutation_id: Some(mutation.id.clone()),
            personality_state: serde_json::to_value(&personality.state).ok(),
            personality_key: Some(personality.key.clone()),
            personality_known: personality.known,
            personality_mutations: personality.mutations.clone(),
            drift: request.drift,
            selected_by: selected_by.to_string(),
            source_type: match hub_hit {
                Some(hit) if hit.direct => SourceType::Reused,
                Some(_) => SourceType::Reference,
                None => SourceType::Generated,
            },
            reused_asset_id: hub_hit.and_then(|hit| hit.asset_id.clone()),
            reused_source_node: hub_hit.and_then(|hit| hit.source_node_id.clone()),
            reused_chain_id: hub_hit.and_then(|hit| hit.chain_id.clone()),
            baseline_untracked,
            baseline_git_head,
            blast_radius_estimate: Some(BlastRadius {
                files: estimate_files,
                lines: estimate_files * ESTIMATE_LINES_PER_FILE,
            }),
            active_task_id: request.active_task.as_ref().map(|task| task.id.clone()),
            active_task_title: request
                .active_task
                .as_ref()
                .and_then(|task| task.title.clone()),
        };
        state.last_run = Some(last_run.clone());
        self.state_file.write(&state)?;

        log::info!(
            "evolution run started run_id={} gene_id={} category={} risk={} personality_key={} innovation_pressure={}",
            last_run.run_id,
            last_run.selected_gene_id.as_deref().unwrap_or("none"),
            mutation.category,
            mutation.risk_level.as_str(),
            personality.key,
            innovation_pressure
        );

        Ok(RunTicket {
            run_id: last_run.run_id.clone(),
            selected_gene: selection.selected_gene,
            capsule_candidates: selection.capsule_candidates,
            mutation,
            personality_state: personality.state,
            advice,
            innovation_pressure,
            hypothesis_id: hypothesis.hypothesis_id,
            action_id: attempt.action_id,
            last_run,
        })
    }

    /// Measures, validates, and records the pending run, rolling back on failure.
    pub async fn solidify(
        &self,
        request: SolidifyRequest,
    ) -> Result<SolidifyOutcome, EvoKernelError> {
        let mut state = self.state_file.read();
        state.ensure_solidifiable()?;
        let pending = state
            .last_run
            .clone()
            .filter(|run| !run.run_id.is_empty());
        let run = pending.clone().unwrap_or_default();

        let genes = self.store.load_genes();
        let selected_gene = run
            .selected_gene_id
            .as_deref()
            .and_then(|id| genes.iter().find(|gene| gene.id == id));
        let parent = run
            .parent_event_id
            .clone()
            .or_else(|| self.store.last_event_id());
        let signals = if run.signals.is_empty() {
            unique_signals(&request.fallback_signals)
        } else {
            unique_signals(&run.signals)
        };
        let signal_key = compute_signal_key(&signals);

        let mutation = run
            .mutation
            .as_ref()
            .filter(|value| is_valid_mutation(value))
            .map(normalize_mutation);
        let personality_state = run
            .personality_state
            .as_ref()
            .filter(|value| is_valid_personality_state(value))
            .and_then(|value| serde_json::from_value::<PersonalityState>(value.clone()).ok())
            .map(|state| state.normalized());
        let mut protocol_violations = protocol_violations(
            mutation.as_ref(),
            personality_state.as_ref(),
            run.personality_known,
        );
        if let (Some(intent), Some(mutation)) = (request.intent, mutation.as_ref()) {
            if intent != mutation.category {
                protocol_violations.push(format!(
                    "intent_mismatch_with_mutation:{}!={}",
                    intent, mutation.category
                ));
            }
        }
        if !protocol_violations.is_empty() {
            log::warn!(
                "protocol violations run_id={} violations={}",
                run.run_id,
                protocol_violations.join("; ")
            );
        }

        let ensured = ensure_gene(
            &genes,
            selected_gene,
            &signals,
            request.intent,
            self.selector.as_ref(),
        )
        .map_err(store_err)?;
        if ensured.created && !request.dry_run {
            self.store
                .upsert_gene(ensured.gene.clone())
                .map_err(store_err)?;
        }
        let EnsuredGene {
            gene: mut gene_used,
            created: gene_created,
            resolution,
        } = ensured;

        let blast = self
            .workspace
            .measure_blast(&run.baseline_untracked, &self.config.counted_paths)
            .await;
        let mut constraint_check = self.governor.check_constraints(ConstraintInput {
            gene: Some(&gene_used),
            blast: &blast,
            estimate: run.blast_radius_estimate.as_ref(),
            repo_root: Some(self.workspace.root()),
        });
        let touched = if blast.all_changed_files.is_empty() {
            &blast.changed_files
        } else {
            &blast.all_changed_files
        };
        let destructive = self.governor.detect_destructive_changes(
            self.workspace.root(),
            touched,
            &run.baseline_untracked,
        );
        if !destructive.is_empty() {
            log::error!(
                "destructive changes detected run_id={} violations={}",
                run.run_id,
                destructive.join("; ")
            );
            constraint_check.violations.extend(destructive);
            constraint_check.ok = false;
        }

        let env = self.env_fingerprint();
        let validation = self.validator.run_validations(&gene_used.validation).await;
        let canary = self.validator.run_canary().await;
        if !canary.ok && !canary.skipped {
            log::error!("canary failed run_id={} err={}", run.run_id, canary.err);
            constraint_check.violations.push(format!(
                "canary_failed: entry point cannot load in a child process: {}",
                canary.err
            ));
            constraint_check.ok = false;
        }
        let validation_report =
            build_validation_report(Some(&gene_used.id), &validation, &env).map_err(store_err)?;

        let success = constraint_check.ok && validation.ok && protocol_violations.is_empty();
        let outcome = Outcome {
            status: if success {
                OutcomeStatus::Success
            } else {
                OutcomeStatus::Failed
            },
            score: clamp01(if success { SUCCESS_SCORE } else { FAILURE_SCORE }),
        };
        let at = now_iso();
        let selected_capsule_id = run
            .selected_capsule_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        let capsule_id = success.then(|| {
            selected_capsule_id
                .clone()
                .unwrap_or_else(|| next_id("capsule"))
        });

        let mut event = EvolutionEvent {
            kind: AssetKind::EvolutionEvent,
            schema_version: SCHEMA_VERSION.to_string(),
            id: next_id("evt"),
            parent: parent.clone(),
            intent: request
                .intent
                .or_else(|| mutation.as_ref().map(|mutation| mutation.category))
                .unwrap_or(gene_used.category),
            signals: signals.clone(),
            genes_used: vec![gene_used.id.clone()],
            mutation_id: mutation.as_ref().map(|mutation| mutation.id.clone()),
            personality_state: personality_state.clone(),
            blast_radius: blast.radius(),
            outcome,
            capsule_id: capsule_id.clone(),
            source_type: run.source_type,
            reused_asset_id: run.reused_asset_id.clone(),
            env_fingerprint: Some(env.clone()),
            validation_report_id: Some(validation_report.id.clone()),
            meta: EventMeta {
                at: at.clone(),
                signal_key: signal_key.clone(),
                selector: run.selector.clone(),
                blast_radius_estimate: run.blast_radius_estimate,
                mutation: mutation.clone(),
                personality: PersonalityMeta {
                    key: personality_state.as_ref().map(PersonalityState::key),
                    known: run.personality_known,
                    mutations: run.personality_mutations.clone(),
                },
                gene: GeneMeta {
                    id: Some(gene_used.id.clone()),
                    created: gene_created,
                    reason: Some(resolution.as_str().to_string()),
                },
                constraints_ok: constraint_check.ok,
                constraint_violations: constraint_check.violations.clone(),
                constraint_warnings: constraint_check.warnings.clone(),
                blast_severity: constraint_check
                    .severity
                    .as_ref()
                    .map(|assessment| assessment.severity),
                blast_breakdown: (!constraint_check.ok)
                    .then(|| blast_breakdown(touched, self.config.governor.breakdown_top_n)),
                blast_estimate_comparison: constraint_check.estimate.clone(),
                validation_ok: validation.ok,
                validation: validation
                    .results
                    .iter()
                    .map(|result| ValidationCommandOutcome {
                        cmd: result.cmd.clone(),
                        ok: result.ok,
                    })
                    .collect(),
                validation_report: Some(ValidationReportRef {
                    id: validation_report.id.clone(),
                    overall_ok: validation_report.overall_ok,
                    env_fingerprint_key: validation_report.env_fingerprint_key.clone(),
                }),
                canary_ok: canary.ok,
                canary_skipped: canary.skipped,
                protocol_ok: protocol_violations.is_empty(),
                protocol_violations: protocol_violations.clone(),
                memory_graph: Some(self.memory_graph.graph_path().display().to_string()),
            },
            asset_id: None,
        };
        event.seal().map_err(store_err)?;

        let mut capsule = match &capsule_id {
            Some(id) => {
                let previous = selected_capsule_id.as_ref().and_then(|selected| {
                    self.store
                        .load_capsules()
                        .into_iter()
                        .find(|capsule| &capsule.id == selected)
                });
                let mut capsule = Capsule {
                    kind: AssetKind::Capsule,
                    schema_version: SCHEMA_VERSION.to_string(),
                    id: id.clone(),
                    trigger: previous
                        .as_ref()
                        .map(|capsule| capsule.trigger.clone())
                        .filter(|trigger| !trigger.is_empty())
                        .unwrap_or_else(|| signals.clone()),
                    gene: Some(gene_used.id.clone()),
                    summary: capsule_summary(
                        request.summary.as_deref(),
                        previous.as_ref(),
                        &gene_used,
                        &signals,
                        &blast,
                    ),
                    confidence: outcome.score,
                    blast_radius: blast.radius(),
                    outcome,
                    success_streak: 1,
                    env_fingerprint: Some(env.clone()),
                    source_type: run.source_type,
                    reused_asset_id: run.reused_asset_id.clone(),
                    a2a: A2aStatus::default(),
                    asset_id: None,
                    extra: Default::default(),
                };
                capsule.seal().map_err(store_err)?;
                Some(capsule)
            }
            None => None,
        };

        let rollback = if !success && request.rollback_on_failure && !request.dry_run {
            self.workspace.rollback_tracked().await;
            let report = self
                .workspace
                .rollback_new_untracked(&run.baseline_untracked, &self.governor.protected_paths())
                .await;
            log::info!(
                "rollback finished run_id={} deleted={} skipped={} removed_dirs={}",
                run.run_id,
                report.deleted.len(),
                report.skipped.len(),
                report.removed_dirs.len()
            );
            Some(report)
        } else {
            None
        };

        if !request.dry_run {
            apply_epigenetic_marks(&mut gene_used, Some(&env), outcome.status, self.now());
            let written = gene_used
                .seal()
                .and_then(|_| self.store.upsert_gene(gene_used.clone()));
            if let Err(err) = written {
                log::warn!(
                    "epigenetic mark write failed gene_id={} error={}",
                    gene_used.id,
                    err
                );
            }

            self.store
                .append_validation_report(&validation_report)
                .map_err(store_err)?;
            if let Some(capsule) = &capsule {
                self.store
                    .upsert_capsule(capsule.clone())
                    .map_err(store_err)?;
            }
            self.store.append_event(&event).map_err(store_err)?;
            if let Some(capsule) = capsule.as_mut() {
                let events = self.store.read_evolution_events();
                capsule.success_streak =
                    compute_capsule_success_streak(&capsule.id, &events).max(1);
                capsule.a2a = A2aStatus {
                    eligible_to_broadcast: is_capsule_broadcast_eligible(
                        capsule,
                        &events,
                        &self.config.publish.limits(),
                    ),
                    ..A2aStatus::default()
                };
                capsule.seal().map_err(store_err)?;
                *capsule = self
                    .store
                    .upsert_capsule(capsule.clone())
                    .map_err(store_err)?;
            }
            if let Some(personality_state) = &personality_state {
                let notes = format!("event:{}", event.id);
                if let Err(err) = self.personality.update_stats(
                    Some(personality_state),
                    Some(outcome.status),
                    Some(outcome.score),
                    Some(&notes),
                ) {
                    log::warn!(
                        "personality stats update failed event_id={} error={}",
                        event.id,
                        err
                    );
                }
            }
        }

        let run_id = match &pending {
            Some(run) => run.run_id.clone(),
            None => stable_hash(&format!(
                "{}|{}|{}",
                parent.as_deref().unwrap_or("root"),
                run.selected_gene_id.as_deref().unwrap_or("none"),
                signal_key
            )),
        };
        state.mark_solidified(LastSolidify {
            run_id: run_id.clone(),
            at,
            event_id: event.id.clone(),
            capsule_id: capsule_id.clone(),
            outcome,
        });
        if !request.dry_run {
            self.state_file.write(&state)?;
        }

        let publish_result = match &capsule {
            Some(capsule) if !request.dry_run && capsule.a2a.eligible_to_broadcast => {
                Some(self.publish(&gene_used, capsule, &event, &run).await)
            }
            _ => None,
        };
        let task_complete_result = match (&capsule, run.active_task_id.as_deref()) {
            (Some(capsule), Some(task_id)) if !request.dry_run => Some(
                self.complete_task(task_id, run.active_task_title.as_deref(), capsule)
                    .await,
            ),
            _ => None,
        };

        log::info!(
            "solidify finished run_id={} ok={} event_id={} gene_id={} capsule_id={} files={} lines={}",
            run_id,
            success,
            event.id,
            gene_used.id,
            capsule_id.as_deref().unwrap_or("none"),
            blast.files,
            blast.lines
        );

        Ok(SolidifyOutcome {
            ok: success,
            run_id,
            event,
            capsule,
            gene: gene_used,
            constraint_check,
            validation,
            validation_report,
            blast,
            canary,
            rollback,
            publish_result,
            task_complete_result,
        })
    }

    /// Accepts a hub asset as a lower-confidence candidate. Assets whose
    /// claimed `asset_id` does not match their content are dropped.
    pub fn ingest_external_asset(
        &self,
        asset: &Value,
        source: Option<&str>,
        signals: &[String],
    ) -> Result<Option<Value>, EvoKernelError> {
        let claims_id = asset
            .get("asset_id")
            .and_then(Value::as_str)
            .map_or(false, |id| !id.is_empty());
        if claims_id && !verify_asset_id(asset) {
            log::warn!(
                "external asset rejected reason=asset_id_mismatch id={}",
                asset.get("id").and_then(Value::as_str).unwrap_or("unknown")
            );
            return Ok(None);
        }
        let options = LowerConfidence {
            source: source.unwrap_or("external").to_string(),
            ..LowerConfidence::default()
        };
        let Some(candidate) = lower_confidence(asset, &options) else {
            return Ok(None);
        };
        self.store
            .append_external_candidate(&candidate)
            .map_err(store_err)?;
        self.memory_graph
            .record_external_candidate(&candidate, source, signals)
            .map_err(memory_err)?;
        log::info!(
            "external candidate stored id={} source={}",
            candidate.get("id").and_then(Value::as_str).unwrap_or("unknown"),
            options.source
        );
        Ok(Some(candidate))
    }

    /// Ingests every asset found in JSON or JSONL hub output.
    pub fn ingest_a2a_input(
        &self,
        text: &str,
        source: Option<&str>,
        signals: &[String],
    ) -> Result<Vec<Value>, EvoKernelError> {
        let mut accepted = Vec::new();
        for asset in parse_a2a_input(text) {
            if let Some(candidate) = self.ingest_external_asset(&asset, source, signals)? {
                accepted.push(candidate);
            }
        }
        Ok(accepted)
    }

    async fn publish(
        &self,
        gene: &Gene,
        capsule: &Capsule,
        event: &EvolutionEvent,
        run: &LastRun,
    ) -> PublishResult {
        let config = &self.config.publish;
        if let Some(reason) = config.skip_reason(run.source_type, capsule.outcome.score) {
            log::info!(
                "auto publish skipped capsule_id={} reason={}",
                capsule.id,
                reason
            );
            return PublishResult::skipped(reason);
        }
        let Some(hub) = &self.hub else {
            log::info!(
                "auto publish skipped capsule_id={} reason=no_hub_client",
                capsule.id
            );
            return PublishResult::skipped("no_hub_client");
        };

        let sender_id = config.node_id.clone().unwrap_or_else(|| {
            let env = event.env_fingerprint.clone().unwrap_or_default();
            node_id(&env.device_id, AGENT_NAME, &env.cwd)
        });
        let secret = config
            .node_secret
            .clone()
            .unwrap_or_else(|| sender_id.clone());
        let message = prepare_publish_assets(Some(gene), capsule, Some(event)).and_then(|assets| {
            build_publish_bundle(
                PublishBundle {
                    gene: &assets.gene,
                    capsule: &assets.capsule,
                    event: assets.event.as_ref(),
                    chain_id: run.reused_chain_id.as_deref(),
                },
                &sender_id,
                &secret,
            )
        });
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                log::warn!(
                    "auto publish bundle failed capsule_id={} error={}",
                    capsule.id,
                    err
                );
                return PublishResult::skipped(err.to_string());
            }
        };

        let asset_id = capsule
            .asset_id
            .clone()
            .unwrap_or_else(|| capsule.id.clone());
        match hub.send(&message).await {
            Ok(_) => {
                log::info!(
                    "auto publish sent asset_id={} message_id={}",
                    asset_id,
                    message.message_id
                );
                PublishResult {
                    attempted: true,
                    reason: None,
                    asset_id: Some(asset_id),
                    bundle: true,
                }
            }
            Err(err) => {
                log::warn!("auto publish failed asset_id={} error={}", asset_id, err);
                PublishResult {
                    attempted: true,
                    reason: Some(err.to_string()),
                    asset_id: Some(asset_id),
                    bundle: true,
                }
            }
        }
    }

    async fn complete_task(
        &self,
        task_id: &str,
        title: Option<&str>,
        capsule: &Capsule,
    ) -> TaskCompleteResult {
        let asset_id = capsule
            .asset_id
            .clone()
            .unwrap_or_else(|| capsule.id.clone());
        let Some(hub) = &self.hub else {
            return TaskCompleteResult {
                attempted: false,
                task_id: Some(task_id.to_string()),
                asset_id: None,
                reason: Some("no_hub_client".into()),
            };
        };
        match hub.complete_task(task_id, &asset_id).await {
            Ok(accepted) => {
                if accepted {
                    log::info!(
                        "task completed task_id={} title={} asset_id={}",
                        task_id,
                        title.unwrap_or(""),
                        asset_id
                    );
                } else {
                    log::warn!("task completion rejected task_id={}", task_id);
                }
                TaskCompleteResult {
                    attempted: true,
                    task_id: Some(task_id.to_string()),
                    asset_id: Some(asset_id),
                    reason: (!accepted).then(|| "rejected_by_hub".to_string()),
                }
            }
            Err(err) => {
                log::warn!("task completion failed task_id={} error={}", task_id, err);
                TaskCompleteResult {
                    attempted: false,
                    task_id: Some(task_id.to_string()),
                    asset_id: None,
                    reason: Some(err.to_string()),
                }
            }
        }
    }

    fn env_fingerprint(&self) -> EnvFingerprint {
        self.env_fingerprint
            .clone()
            .unwrap_or_else(|| capture_env_fingerprint(&self.env_probe))
    }

    fn now(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }
}

/// A long run of confident successes under a creative personality pushes
/// the next mutation toward innovation.
pub fn has_innovation_pressure(
    drift_enabled: bool,
    personality: &PersonalityState,
    recent_events: &[EvolutionEvent],
) -> bool {
    if drift_enabled || !personality.creativity.is_finite() || personality.creativity < 0.75 {
        return false;
    }
    let tail = &recent_events[recent_events.len().saturating_sub(INNOVATION_TAIL)..];
    if tail.len() < INNOVATION_TAIL || !tail.iter().all(|event| event.outcome.is_success()) {
        return false;
    }
    let total = tail
        .iter()
        .map(|event| {
            if event.outcome.score.is_finite() {
                event.outcome.score
            } else {
                0.0
            }
        })
        .sum::<f64>();
    total / tail.len() as f64 >= 0.7
}

pub fn allows_high_risk(
    drift_enabled: bool,
    personality_known: bool,
    personality: &PersonalityState,
    signals: &[String],
) -> bool {
    drift_enabled
        && personality_known
        && is_high_risk_mutation_allowed(Some(personality))
        && personality.rigor >= 0.8
        && personality.risk_tolerance <= 0.3
        && !signals.iter().any(|signal| signal == "log_error")
}

/// Shape and risk/personality combinations a solidified run must satisfy.
pub fn protocol_violations(
    mutation: Option<&Mutation>,
    personality: Option<&PersonalityState>,
    personality_known: bool,
) -> Vec<String> {
    let mut violations = Vec::new();
    if mutation.is_none() {
        violations.push("missing_or_invalid_mutation".to_string());
    }
    if personality.is_none() {
        violations.push("missing_or_invalid_personality_state".to_string());
    }
    if let Some(mutation) = mutation {
        if mutation.risk_level == RiskLevel::High {
            if !is_high_risk_mutation_allowed(personality) {
                violations.push("high_risk_mutation_not_allowed_by_personality".to_string());
            }
            if !personality_known {
                violations.push("high_risk_mutation_forbidden_under_unknown_personality".to_string());
            }
        }
        if mutation.category == GeneCategory::Innovate && is_high_risk_personality(personality) {
            violations.push("forbidden_innovate_with_high_risk_personality".to_string());
        }
    }
    violations
}

fn capsule_summary(
    requested: Option<&str>,
    previous: Option<&Capsule>,
    gene: &Gene,
    signals: &[String],
    blast: &BlastMeasurement,
) -> String {
    if let Some(summary) = requested.map(str::trim).filter(|text| !text.is_empty()) {
        return summary.to_string();
    }
    if let Some(summary) = previous
        .map(|capsule| capsule.summary.trim())
        .filter(|text| !text.is_empty())
    {
        return summary.to_string();
    }
    let signals = if signals.is_empty() {
        "(none)".to_string()
    } else {
        signals.join(", ")
    };
    format!(
        "Solidified with {}: signals [{}], changed {} files / {} lines.",
        gene.id, signals, blast.files, blast.lines
    )
}

/// `run_<ms>`, never equal to the previous run id.
fn fresh_run_id(previous: Option<&str>) -> String {
    let run_id = next_id("run");
    match previous {
        Some(previous) if previous == run_id || previous.starts_with(&format!("{run_id}_")) => {
            format!("{run_id}_{}", stable_hash(previous))
        }
        _ => run_id,
    }
}

fn store_err(err: EvolutionError) -> EvoKernelError {
    EvoKernelError::Store(err.to_string())
}

fn memory_err(err: MemoryGraphError) -> EvoKernelError {
    EvoKernelError::MemoryGraph(err.to_string())
}

fn personality_err(err: PersonalityError) -> EvoKernelError {
    EvoKernelError::Personality(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use gep_evolution::ValidationStep;
    use gep_evolution_network::{NetworkError, ProtocolMessage};
    use gep_sandbox::{CommandResult, CountedPathPolicy};
    use serde_json::json;

    const REPAIR_GENE: &str = "gene_gep_repair_from_errors";

    fn temp_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("gep-evokernel-{name}-{}", next_id("t")))
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    fn env() -> EnvFingerprint {
        EnvFingerprint {
            device_id: "device-test".into(),
            platform: "linux".into(),
            arch: "x64".into(),
            node_version: Some("v20.11.0".into()),
            cwd: "/srv/agent".into(),
            ..EnvFingerprint::default()
        }
    }

    struct FakeWorkspace {
        root: PathBuf,
        blast: BlastMeasurement,
        rollbacks: Mutex<usize>,
    }

    impl FakeWorkspace {
        fn touching(root: &Path, files: &[&str], lines: usize) -> Self {
            let changed = strings(files);
            Self {
                root: root.to_path_buf(),
                blast: BlastMeasurement {
                    files: changed.len(),
                    lines,
                    changed_files: changed.clone(),
                    ignored_files: Vec::new(),
                    all_changed_files: changed,
                },
                rollbacks: Mutex::new(0),
            }
        }

        fn rollbacks(&self) -> usize {
            *self.rollbacks.lock().unwrap()
        }
    }

    #[async_trait]
    impl Workspace for FakeWorkspace {
        fn root(&self) -> &Path {
            &self.root
        }

        async fn untracked_files(&self) -> Vec<String> {
            strings(&["notes.txt"])
        }

        async fn head(&self) -> Option<String> {
            Some("abc123".into())
        }

        async fn measure_blast(
            &self,
            _baseline_untracked: &[String],
            _policy: &CountedPathPolicy,
        ) -> BlastMeasurement {
            self.blast.clone()
        }

        async fn rollback_tracked(&self) {
            *self.rollbacks.lock().unwrap() += 1;
        }

        async fn rollback_new_untracked(
            &self,
            _baseline_untracked: &[String],
            _protected: &[String],
        ) -> RollbackReport {
            RollbackReport {
                deleted: self.blast.changed_files.clone(),
                skipped: Vec::new(),
                removed_dirs: Vec::new(),
            }
        }
    }

    struct FakeValidator {
        validation_ok: bool,
        canary_ok: bool,
    }

    #[async_trait]
    impl Validator for FakeValidator {
        async fn run_validations(&self, steps: &[ValidationStep]) -> ValidationRun {
            ValidationRun {
                ok: self.validation_ok,
                results: vec![CommandResult {
                    cmd: format!("node -e check({})", steps.len()),
                    ok: self.validation_ok,
                    out: "ok".into(),
                    err: if self.validation_ok {
                        String::new()
                    } else {
                        "AssertionError: boom".into()
                    },
                }],
                started_at: 100,
                finished_at: 140,
            }
        }

        async fn run_canary(&self) -> CanaryResult {
            CanaryResult {
                ok: self.canary_ok,
                skipped: false,
                reason: None,
                out: String::new(),
                err: if self.canary_ok {
                    String::new()
                } else {
                    "SyntaxError: Unexpected token".into()
                },
            }
        }
    }

    #[derive(Default)]
    struct FakeHub {
        sent: Mutex<Vec<ProtocolMessage>>,
        completed: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl HubClient for FakeHub {
        async fn send(&self, message: &ProtocolMessage) -> Result<Value, NetworkError> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(json!({"status": "accepted"}))
        }

        async fn complete_task(&self, task_id: &str, asset_id: &str) -> Result<bool, NetworkError> {
            self.completed
                .lock()
                .unwrap()
                .push((task_id.to_string(), asset_id.to_string()));
            Ok(true)
        }
    }

    struct Harness {
        kernel: EvoKernel,
        workspace: Arc<FakeWorkspace>,
        hub: Arc<FakeHub>,
    }

    fn harness(name: &str, validation_ok: bool, canary_ok: bool) -> Harness {
        let root = temp_root(name);
        let mut config = EvolverConfig::default();
        config.paths.repo_root = root.clone();
        let workspace = Arc::new(FakeWorkspace::touching(&root, &["src/a.js"], 10));
        let hub = Arc::new(FakeHub::default());
        let kernel = EvoKernel::new(config)
            .with_workspace(workspace.clone())
            .with_validator(Arc::new(FakeValidator {
                validation_ok,
                canary_ok,
            }))
            .with_hub(hub.clone())
            .with_env_fingerprint(env());
        Harness {
            kernel,
            workspace,
            hub,
        }
    }

    fn error_run() -> RunRequest {
        RunRequest {
            signals: strings(&["log_error", "errsig:TypeError"]),
            ..RunRequest::default()
        }
    }

    fn repair_gene(kernel: &EvoKernel) -> Gene {
        kernel
            .store
            .load_genes()
            .into_iter()
            .find(|gene| gene.id == REPAIR_GENE)
            .unwrap()
    }

    #[tokio::test]
    async fn pending_run_blocks_until_solidified() {
        let h = harness("success", true, true);
        let ticket = h.kernel.start_run(error_run()).await.unwrap();
        assert_eq!(
            ticket.selected_gene.as_ref().map(|gene| gene.id.as_str()),
            Some(REPAIR_GENE)
        );
        assert_eq!(ticket.mutation.category, GeneCategory::Repair);
        assert_eq!(ticket.last_run.state, RunState::Pending);
        assert_eq!(ticket.last_run.baseline_untracked, strings(&["notes.txt"]));
        assert_eq!(ticket.last_run.baseline_git_head.as_deref(), Some("abc123"));
        assert_eq!(
            ticket.last_run.blast_radius_estimate,
            Some(BlastRadius {
                files: 12,
                lines: 960
            })
        );

        let refused = h.kernel.start_run(error_run()).await;
        assert!(matches!(refused, Err(EvoKernelError::PendingRun(ref id)) if *id == ticket.run_id));

        let outcome = h.kernel.solidify(SolidifyRequest::default()).await.unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.run_id, ticket.run_id);
        assert_eq!(outcome.event.outcome.status, OutcomeStatus::Success);
        assert_eq!(outcome.event.outcome.score, 0.85);
        assert_eq!(
            outcome.event.meta.gene.reason.as_deref(),
            Some("selected_gene_id_present")
        );
        assert!(outcome.event.meta.protocol_ok);
        assert!(outcome.event.meta.blast_breakdown.is_none());
        assert!(outcome.event.has_valid_asset_id());
        assert!(outcome.validation_report.overall_ok);
        assert!(outcome.rollback.is_none());
        assert_eq!(h.workspace.rollbacks(), 0);

        let capsule = outcome.capsule.as_ref().unwrap();
        assert_eq!(capsule.gene.as_deref(), Some(REPAIR_GENE));
        assert_eq!(capsule.trigger, strings(&["log_error", "errsig:TypeError"]));
        assert_eq!(capsule.success_streak, 1);
        assert!(!capsule.a2a.eligible_to_broadcast);
        assert!(outcome.publish_result.is_none());

        let events = h.kernel.store.read_evolution_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, outcome.event.id);
        assert_eq!(h.kernel.store.load_capsules().len(), 1);
        let boost = get_epigenetic_boost(&repair_gene(&h.kernel), Some(&env()));
        assert!((boost - 0.1).abs() < 1e-9);

        let state = h.kernel.solidify_state();
        assert!(matches!(
            state.run_state(),
            Some((_, RunState::Solidified(outcome))) if outcome.is_success()
        ));
        assert!(matches!(
            h.kernel.solidify(SolidifyRequest::default()).await,
            Err(EvoKernelError::AlreadySolidified(_))
        ));
        let next = h.kernel.start_run(error_run()).await.unwrap();
        assert_ne!(next.run_id, ticket.run_id);
    }

    #[tokio::test]
    async fn failed_validation_rolls_back_and_suppresses_the_gene() {
        let h = harness("failure", false, true);
        h.kernel.start_run(error_run()).await.unwrap();

        let outcome = h.kernel.solidify(SolidifyRequest::default()).await.unwrap();
        assert!(!outcome.ok);
        assert!(outcome.capsule.is_none());
        assert!(outcome.event.capsule_id.is_none());
        assert_eq!(outcome.event.outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.event.outcome.score, 0.2);
        assert!(!outcome.event.meta.validation_ok);
        assert!(!outcome.validation_report.overall_ok);
        assert_eq!(
            outcome.validation_report.commands[0].stderr,
            "AssertionError: boom"
        );

        assert_eq!(h.workspace.rollbacks(), 1);
        assert_eq!(
            outcome.rollback.as_ref().map(|report| report.deleted.clone()),
            Some(strings(&["src/a.js"]))
        );
        assert!(h.kernel.store.load_capsules().is_empty());
        assert_eq!(h.kernel.store.read_evolution_events().len(), 1);
        let boost = get_epigenetic_boost(&repair_gene(&h.kernel), Some(&env()));
        assert!((boost + 0.1).abs() < 1e-9);
        assert!(h.kernel.solidify_state().ensure_not_pending().is_ok());
    }

    #[tokio::test]
    async fn canary_failure_is_a_constraint_violation() {
        let h = harness("canary", true, false);
        h.kernel.start_run(error_run()).await.unwrap();

        let outcome = h
            .kernel
            .solidify(SolidifyRequest {
                rollback_on_failure: false,
                ..SolidifyRequest::default()
            })
            .await
            .unwrap();
        assert!(!outcome.ok);
        assert!(outcome.validation.ok);
        assert!(!outcome.constraint_check.ok);
        assert!(outcome
            .event
            .meta
            .constraint_violations
            .iter()
            .any(|violation| violation.starts_with("canary_failed")
                && violation.contains("SyntaxError")));
        assert!(!outcome.event.meta.canary_ok);
        assert!(outcome.event.meta.blast_breakdown.is_some());
        assert!(outcome.rollback.is_none());
        assert_eq!(h.workspace.rollbacks(), 0);
    }

    #[tokio::test]
    async fn dry_run_persists_nothing_and_keeps_the_run_pending() {
        let h = harness("dry-run", true, true);
        h.kernel.start_run(error_run()).await.unwrap();

        let outcome = h
            .kernel
            .solidify(SolidifyRequest {
                dry_run: true,
                ..SolidifyRequest::default()
            })
            .await
            .unwrap();
        assert!(outcome.ok);
        assert!(outcome.capsule.is_some());
        assert!(h.kernel.store.read_evolution_events().is_empty());
        assert!(h.kernel.store.load_capsules().is_empty());
        assert!(repair_gene(&h.kernel).epigenetic_marks.is_empty());
        assert!(matches!(
            h.kernel.solidify_state().ensure_not_pending(),
            Err(EvoKernelError::PendingRun(_))
        ));
    }

    #[tokio::test]
    async fn intent_mismatch_fails_the_run() {
        let h = harness("intent", true, true);
        h.kernel.start_run(error_run()).await.unwrap();

        let outcome = h
            .kernel
            .solidify(SolidifyRequest {
                intent: Some(GeneCategory::Optimize),
                ..SolidifyRequest::default()
            })
            .await
            .unwrap();
        assert!(!outcome.ok);
        assert_eq!(outcome.event.intent, GeneCategory::Optimize);
        assert_eq!(
            outcome.event.meta.protocol_violations,
            strings(&["intent_mismatch_with_mutation:optimize!=repair"])
        );
    }

    #[tokio::test]
    async fn ad_hoc_solidify_creates_an_auto_gene_and_reports_protocol_gaps() {
        let h = harness("ad-hoc", true, true);
        let signals = strings(&["user_feature_request"]);

        let outcome = h
            .kernel
            .solidify(SolidifyRequest {
                fallback_signals: signals.clone(),
                ..SolidifyRequest::default()
            })
            .await
            .unwrap();
        assert!(!outcome.ok);
        assert_eq!(
            outcome.event.meta.protocol_violations,
            strings(&[
                "missing_or_invalid_mutation",
                "missing_or_invalid_personality_state"
            ])
        );
        assert!(outcome.gene.id.starts_with("gene_auto_"));
        assert!(outcome.event.meta.gene.created);
        assert_eq!(
            outcome.event.meta.gene.reason.as_deref(),
            Some("no_match_create_new")
        );
        assert!(h
            .kernel
            .store
            .load_genes()
            .iter()
            .any(|gene| gene.id == outcome.gene.id));
        assert_eq!(
            outcome.run_id,
            stable_hash(&format!("root|none|{}", compute_signal_key(&signals)))
        );
        assert_eq!(h.workspace.rollbacks(), 1);
    }

    #[tokio::test]
    async fn reused_capsule_with_a_streak_is_published_and_completes_the_task() {
        let h = harness("publish", true, true);
        h.kernel.start_run(error_run()).await.unwrap();
        let first = h.kernel.solidify(SolidifyRequest::default()).await.unwrap();
        assert!(first.ok);
        assert!(first.publish_result.is_none());
        assert!(first.task_complete_result.is_none());
        let first_capsule = first.capsule.unwrap();

        let ticket = h
            .kernel
            .start_run(RunRequest {
                active_task: Some(ActiveTask {
                    id: "task_1".into(),
                    title: Some("Fix crash".into()),
                }),
                ..error_run()
            })
            .await
            .unwrap();
        assert_eq!(
            ticket.last_run.selected_capsule_id.as_deref(),
            Some(first_capsule.id.as_str())
        );

        let second = h.kernel.solidify(SolidifyRequest::default()).await.unwrap();
        assert!(second.ok);
        let capsule = second.capsule.as_ref().unwrap();
        assert_eq!(capsule.id, first_capsule.id);
        assert_eq!(capsule.summary, first_capsule.summary);
        assert_eq!(capsule.success_streak, 2);
        assert!(capsule.a2a.eligible_to_broadcast);
        assert!(capsule.has_valid_asset_id());

        let publish = second.publish_result.as_ref().unwrap();
        assert!(publish.attempted);
        assert!(publish.bundle);
        assert_eq!(publish.asset_id, capsule.asset_id);
        let sent = h.hub.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].sender_id,
            node_id("device-test", "evolver", "/srv/agent")
        );
        assert_eq!(sent[0].payload["assets"].as_array().map(Vec::len), Some(3));

        let task = second.task_complete_result.as_ref().unwrap();
        assert!(task.attempted);
        assert_eq!(task.task_id.as_deref(), Some("task_1"));
        let completed = h.hub.completed.lock().unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].0, "task_1");
        assert_eq!(Some(&completed[0].1), capsule.asset_id.as_ref());
    }

    #[tokio::test]
    async fn direct_hub_reuse_is_not_republished() {
        let h = harness("reuse", true, true);
        let hit = HubHit {
            asset_id: Some("sha256:remote".into()),
            source_node_id: Some("node_remote".into()),
            chain_id: Some("chain_1".into()),
            direct: true,
        };
        for _ in 0..2 {
            let ticket = h
                .kernel
                .start_run(RunRequest {
                    hub_hit: Some(hit.clone()),
                    ..error_run()
                })
                .await
                .unwrap();
            assert_eq!(ticket.last_run.source_type, SourceType::Reused);
            assert_eq!(ticket.last_run.reused_chain_id.as_deref(), Some("chain_1"));
            let outcome = h.kernel.solidify(SolidifyRequest::default()).await.unwrap();
            assert!(outcome.ok);
            assert_eq!(outcome.event.reused_asset_id.as_deref(), Some("sha256:remote"));
            if let Some(publish) = outcome.publish_result {
                assert!(!publish.attempted);
                assert_eq!(publish.reason.as_deref(), Some("skip_direct_reused_asset"));
            }
        }
        assert!(h.hub.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn external_assets_are_verified_and_down_weighted() {
        let h = harness("ingest", true, true);
        let mut capsule: Capsule = serde_json::from_value(json!({
            "type": "Capsule",
            "id": "capsule_remote",
            "trigger": ["log_error"],
            "confidence": 0.9,
            "outcome": {"status": "success", "score": 0.9}
        }))
        .unwrap();
        capsule.seal().unwrap();
        let value = serde_json::to_value(&capsule).unwrap();

        let accepted = h
            .kernel
            .ingest_external_asset(&value, Some("hub"), &strings(&["log_error"]))
            .unwrap()
            .unwrap();
        let confidence = accepted["confidence"].as_f64().unwrap();
        assert!((confidence - 0.54).abs() < 1e-9);
        assert_eq!(accepted["a2a"]["status"], "external_candidate");
        assert_eq!(accepted["a2a"]["source"], "hub");
        assert_eq!(h.kernel.store.read_recent_external_candidates(10).len(), 1);

        let mut tampered = value.clone();
        tampered["summary"] = json!("rewritten in transit");
        assert!(h
            .kernel
            .ingest_external_asset(&tampered, Some("hub"), &[])
            .unwrap()
            .is_none());

        let lines = format!(
            "{}\nnot json\n{}\n",
            value,
            json!({"type": "Unknown", "id": "x"})
        );
        let batch = h.kernel.ingest_a2a_input(&lines, None, &[]).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(h.kernel.store.read_recent_external_candidates(10).len(), 2);
    }

    fn event_with(status: OutcomeStatus, score: f64) -> EvolutionEvent {
        serde_json::from_value(json!({
            "type": "EvolutionEvent",
            "id": "evt_1",
            "intent": "repair",
            "outcome": {"status": status, "score": score}
        }))
        .unwrap()
    }

    #[test]
    fn innovation_pressure_needs_a_confident_success_streak() {
        let creative = PersonalityState {
            creativity: 0.8,
            ..PersonalityState::default()
        };
        let streak = vec![event_with(OutcomeStatus::Success, 0.85); 6];
        assert!(has_innovation_pressure(false, &creative, &streak));
        assert!(!has_innovation_pressure(true, &creative, &streak));
        assert!(!has_innovation_pressure(
            false,
            &PersonalityState::default(),
            &streak
        ));
        assert!(!has_innovation_pressure(false, &creative, &streak[..5]));

        let mut broken = streak.clone();
        broken[3] = event_with(OutcomeStatus::Failed, 0.2);
        assert!(!has_innovation_pressure(false, &creative, &broken));

        let weak = vec![event_with(OutcomeStatus::Success, 0.5); 6];
        assert!(!has_innovation_pressure(false, &creative, &weak));
    }

    #[test]
    fn high_risk_needs_drift_a_known_careful_personality_and_no_errors() {
        let careful = PersonalityState {
            rigor: 0.85,
            risk_tolerance: 0.2,
            ..PersonalityState::default()
        };
        let gap = strings(&["capability_gap"]);
        assert!(allows_high_risk(true, true, &careful, &gap));
        assert!(!allows_high_risk(false, true, &careful, &gap));
        assert!(!allows_high_risk(true, false, &careful, &gap));
        assert!(!allows_high_risk(
            true,
            true,
            &careful,
            &strings(&["log_error"])
        ));
        assert!(!allows_high_risk(
            true,
            true,
            &PersonalityState::default(),
            &gap
        ));
    }

    #[test]
    fn protocol_violations_cover_shape_and_risk_combinations() {
        let mutation = Mutation {
            kind: AssetKind::Mutation,
            id: "mut_1".into(),
            category: GeneCategory::Innovate,
            trigger_signals: Vec::new(),
            target: "behavior:protocol".into(),
            expected_effect: "explore".into(),
            risk_level: RiskLevel::High,
        };
        let reckless = PersonalityState {
            rigor: 0.3,
            risk_tolerance: 0.8,
            ..PersonalityState::default()
        };
        assert_eq!(
            protocol_violations(Some(&mutation), Some(&reckless), false),
            strings(&[
                "high_risk_mutation_not_allowed_by_personality",
                "high_risk_mutation_forbidden_under_unknown_personality",
                "forbidden_innovate_with_high_risk_personality",
            ])
        );
        assert_eq!(
            protocol_violations(None, None, true),
            strings(&[
                "missing_or_invalid_mutation",
                "missing_or_invalid_personality_state"
            ])
        );
        let careful = PersonalityState {
            rigor: 0.85,
            risk_tolerance: 0.2,
            ..PersonalityState::default()
        };
        assert!(protocol_violations(Some(&mutation), Some(&careful), true).is_empty());
    }

    #[test]
    fn run_ids_never_repeat_the_previous_run() {
        let previous = next_id("run");
        let fresh = fresh_run_id(Some(&previous));
        assert!(fresh.starts_with("run_"));
        assert_ne!(fresh, previous);
        assert_ne!(fresh_run_id(Some(&fresh)), fresh);
        assert!(fresh_run_id(None).starts_with("run_"));
    }
}
