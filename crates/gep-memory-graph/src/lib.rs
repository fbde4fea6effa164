//! Append-only causal memory of signal, hypothesis, attempt, and outcome records,
//! aggregated with time decay into gene selection advice.

mod outcome;
mod signals;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use gep_evolution::{
    stable_hash, AssetKind, Gene, GeneCategory, GeneId, Mutation, OutcomeStatus, PersonalityState,
    RiskLevel, SelectorDecision,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use outcome::{
    infer_outcome, infer_outcome_from_signals, parse_last_evolution_event_outcome,
    InferredOutcome,
};
pub use signals::{
    compute_signal_key, extract_error_signature, has_error_signal, jaccard,
    normalize_error_signature, normalize_signals_for_matching,
};

#[derive(Debug, Error)]
pub enum MemoryGraphError {
    #[error("memory graph I/O error: {0}")]
    Io(String),
    #[error("memory graph serialization error: {0}")]
    Serde(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemoryGraphConfig {
    pub read_limit: usize,
    pub similarity_threshold: f64,
    pub edge_half_life_days: f64,
    pub gene_half_life_days: f64,
}

impl Default for MemoryGraphConfig {
    fn default() -> Self {
        Self {
            read_limit: 2000,
            similarity_threshold: 0.34,
            edge_half_life_days: 30.0,
            gene_half_life_days: 45.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemoryEventKind {
    Signal,
    Hypothesis,
    Attempt,
    Outcome,
    ConfidenceEdge,
    ConfidenceGeneOutcome,
    ExternalCandidate,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SignalRecord {
    pub key: String,
    #[serde(default)]
    pub signals: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_signature: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PredictedOutcome {
    pub status: Option<OutcomeStatus>,
    pub score: Option<f64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HypothesisRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicted_outcome: Option<PredictedOutcome>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct MutationRecord {
    pub id: Option<String>,
    pub category: Option<GeneCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_signals: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_effect: Option<String>,
    pub risk_level: Option<RiskLevel>,
}

impl From<&Mutation> for MutationRecord {
    fn from(mutation: &Mutation) -> Self {
        Self {
            id: Some(mutation.id.clone()),
            category: Some(mutation.category),
            trigger_signals: Some(mutation.trigger_signals.clone()),
            target: Some(mutation.target.clone()),
            expected_effect: Some(mutation.expected_effect.clone()),
            risk_level: Some(mutation.risk_level),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PersonalityRecord {
    pub key: Option<String>,
    pub state: Option<PersonalityState>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct GeneRef {
    pub id: Option<GeneId>,
    pub category: Option<GeneCategory>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ActionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<SelectorDecision>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CapsulesUsed {
    #[serde(default)]
    pub used: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OutcomeRecord {
    pub status: OutcomeStatus,
    pub score: f64,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub observed: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceHint {
    pub half_life_days: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EdgeRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_key: Option<String>,
    pub gene_id: GeneId,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceStats {
    pub success: u64,
    pub fail: u64,
    pub attempts: u64,
    pub p: f64,
    pub decay_weight: f64,
    pub value: f64,
    pub half_life_days: f64,
    pub updated_at: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DerivedFrom {
    pub outcome_event_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExternalRecord {
    pub source: String,
    pub received_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AssetRef {
    #[serde(rename = "type")]
    pub asset_type: String,
    pub id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CandidateHint {
    pub trigger: Vec<String>,
    pub gene: Option<String>,
    pub confidence: Option<f64>,
}

/// One line of `memory_graph.jsonl`. Sections are present per kind.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MemoryGraphEvent {
    #[serde(rename = "type")]
    pub event_type: AssetKind,
    pub kind: MemoryEventKind,
    pub id: String,
    pub ts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<SignalRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypothesis: Option<HypothesisRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation: Option<MutationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personality: Option<PersonalityRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gene: Option<GeneRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capsules: Option<CapsulesUsed>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<OutcomeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<ConfidenceHint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge: Option<EdgeRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<ConfidenceStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_from: Option<DerivedFrom>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<AssetRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<CandidateHint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<Value>,
}

impl MemoryGraphEvent {
    fn new(kind: MemoryEventKind, id: String, ts: String) -> Self {
        Self {
            event_type: AssetKind::MemoryGraphEvent,
            kind,
            id,
            ts,
            signal: None,
            hypothesis: None,
            mutation: None,
            personality: None,
            gene: None,
            action: None,
            capsules: None,
            outcome: None,
            confidence: None,
            edge: None,
            stats: None,
            derived_from: None,
            external: None,
            asset: None,
            candidate: None,
            observed: None,
            baseline: None,
        }
    }

    fn signal_key(&self) -> &str {
        self.signal
            .as_ref()
            .map(|signal| signal.key.as_str())
            .filter(|key| !key.is_empty())
            .unwrap_or("(none)")
    }

    fn gene_id(&self) -> Option<&str> {
        self.gene
            .as_ref()
            .and_then(|gene| gene.id.as_deref())
            .filter(|id| !id.is_empty())
    }
}

/// The pending attempt, rewritten on every attempt; the graph itself is append-only.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LastAction {
    pub action_id: String,
    pub signal_key: String,
    #[serde(default)]
    pub signals: Vec<String>,
    pub mutation_id: Option<String>,
    pub mutation_category: Option<GeneCategory>,
    pub mutation_risk_level: Option<RiskLevel>,
    pub personality_key: Option<String>,
    pub personality_state: Option<PersonalityState>,
    pub gene_id: Option<GeneId>,
    pub gene_category: Option<GeneCategory>,
    pub hypothesis_id: Option<String>,
    #[serde(default)]
    pub capsules_used: Vec<String>,
    #[serde(default)]
    pub had_error: bool,
    pub created_at: String,
    #[serde(default)]
    pub outcome_recorded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome_recorded_at: Option<String>,
    #[serde(default)]
    pub baseline_observed: Option<Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct MemoryGraphState {
    #[serde(default)]
    pub last_action: Option<LastAction>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutcomeAggregate {
    pub success: u64,
    pub fail: u64,
    pub last_ts: Option<String>,
    pub last_score: Option<f64>,
}

impl OutcomeAggregate {
    fn observe(&mut self, event: &MemoryGraphEvent) {
        let Some(outcome) = event.outcome.as_ref() else {
            return;
        };
        match outcome.status {
            OutcomeStatus::Success => self.success += 1,
            OutcomeStatus::Failed => self.fail += 1,
        }
        let newer = match self.last_ts.as_deref() {
            None => true,
            Some(current) => match (parse_ts(&event.ts), parse_ts(current)) {
                (Some(candidate), Some(current)) => candidate > current,
                _ => false,
            },
        };
        if !event.ts.is_empty() && newer {
            self.last_ts = Some(event.ts.clone());
            if outcome.score.is_finite() {
                self.last_score = Some(outcome.score);
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExpectedSuccess {
    pub p: f64,
    pub w: f64,
    pub total: u64,
    pub value: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct MemoryAdvice {
    pub current_signal_key: String,
    pub preferred_gene_id: Option<GeneId>,
    pub banned_gene_ids: Vec<GeneId>,
    pub explanation: Vec<String>,
}

impl MemoryAdvice {
    pub fn is_banned(&self, gene_id: &str) -> bool {
        self.banned_gene_ids.iter().any(|id| id == gene_id)
    }
}

/// Everything recorded about one attempt at hypothesis and attempt time.
#[derive(Clone, Copy, Debug)]
pub struct AttemptContext<'a> {
    pub signals: &'a [String],
    pub mutation: Option<&'a Mutation>,
    pub personality_state: Option<&'a PersonalityState>,
    pub selected_gene: Option<&'a Gene>,
    pub selector: Option<&'a SelectorDecision>,
    pub drift_enabled: bool,
    pub selected_by: &'a str,
    pub capsules_used: &'a [String],
    pub observations: Option<&'a Value>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HypothesisReceipt {
    pub hypothesis_id: String,
    pub signal_key: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttemptReceipt {
    pub action_id: String,
    pub signal_key: String,
}

pub struct MemoryGraph {
    graph_path: PathBuf,
    state_path: PathBuf,
    config: MemoryGraphConfig,
    now: Option<DateTime<Utc>>,
}

impl MemoryGraph {
    pub fn new<P: Into<PathBuf>>(evolution_dir: P, config: MemoryGraphConfig) -> Self {
        let evolution_dir = evolution_dir.into();
        Self {
            graph_path: evolution_dir.join("memory_graph.jsonl"),
            state_path: evolution_dir.join("memory_graph_state.json"),
            config,
            now: None,
        }
    }

    pub fn with_graph_path<P: Into<PathBuf>>(mut self, graph_path: P) -> Self {
        self.graph_path = graph_path.into();
        self
    }

    /// Pins the clock used for timestamps, ids, and decay.
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn graph_path(&self) -> &Path {
        &self.graph_path
    }

    pub fn config(&self) -> &MemoryGraphConfig {
        &self.config
    }

    fn clock(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    fn stamp(&self) -> (i64, String) {
        let now = self.clock();
        (
            now.timestamp_millis(),
            now.to_rfc3339_opts(SecondsFormat::Millis, true),
        )
    }

    /// The most recent `read_limit` parseable events; unreadable lines are skipped.
    pub fn read_events(&self) -> Vec<MemoryGraphEvent> {
        let Ok(raw) = fs::read_to_string(&self.graph_path) else {
            return Vec::new();
        };
        let lines = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>();
        let start = lines.len().saturating_sub(self.config.read_limit);
        lines[start..]
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    pub fn read_state(&self) -> MemoryGraphState {
        fs::read_to_string(&self.state_path)
            .ok()
            .filter(|raw| !raw.trim().is_empty())
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn advice(&self, signals: &[String], genes: &[Gene], drift_enabled: bool) -> MemoryAdvice {
        let events = self.read_events();
        let now = self.clock();
        let edges = aggregate_edges(&events);
        let gene_outcomes = aggregate_gene_outcomes(&events);
        let current_key = compute_signal_key(signals);

        let mut candidate_keys = vec![(current_key.clone(), 1.0)];
        for event in &events {
            let key = event.signal_key();
            if candidate_keys.iter().any(|(seen, _)| seen == key) {
                continue;
            }
            let historic = event
                .signal
                .as_ref()
                .map(|signal| signal.signals.as_slice())
                .unwrap_or_default();
            let similarity = jaccard(signals, historic);
            if similarity >= self.config.similarity_threshold {
                candidate_keys.push((key.to_string(), similarity));
            }
        }

        let mut order: Vec<GeneId> = Vec::new();
        let mut by_gene: HashMap<GeneId, GeneEvidence> = HashMap::new();
        for (key, similarity) in &candidate_keys {
            for gene in genes {
                if gene.kind != AssetKind::Gene || gene.id.is_empty() {
                    continue;
                }
                let entry = by_gene.entry(gene.id.clone()).or_insert_with(|| {
                    order.push(gene.id.clone());
                    GeneEvidence::default()
                });
                if let Some(edge) = edges.get(&edge_key(key, &gene.id)) {
                    let expected =
                        expected_success(edge, self.config.edge_half_life_days, now);
                    entry.best = entry.best.max(expected.value * similarity);
                    entry.attempts = entry.attempts.max(expected.total);
                }
                if let Some(prior) = gene_outcomes.get(&gene.id) {
                    let expected =
                        expected_success(prior, self.config.gene_half_life_days, now);
                    entry.prior = entry.prior.max(expected.value);
                    entry.prior_attempts = entry.prior_attempts.max(expected.total);
                }
            }
        }

        let mut scored = Vec::new();
        let mut banned: Vec<GeneId> = Vec::new();
        for gene_id in order {
            let Some(info) = by_gene.remove(&gene_id) else {
                continue;
            };
            let combined = if info.best > 0.0 {
                info.best + info.prior * 0.12
            } else {
                info.prior * 0.4
            };
            if !drift_enabled {
                let low_efficiency = info.attempts >= 2 && info.best < 0.18;
                let poor_prior =
                    info.attempts < 2 && info.prior_attempts >= 3 && info.prior < 0.12;
                if (low_efficiency || poor_prior) && !banned.contains(&gene_id) {
                    banned.push(gene_id.clone());
                }
            }
            scored.push((gene_id, combined, info.prior));
        }
        scored.sort_by(|left, right| right.1.partial_cmp(&left.1).unwrap_or(Ordering::Equal));

        let preferred = scored.first().cloned();
        let mut explanation = Vec::new();
        if let Some((gene_id, _, _)) = &preferred {
            explanation.push(format!("memory_prefer:{gene_id}"));
        }
        if !banned.is_empty() {
            let listed = banned.iter().take(6).cloned().collect::<Vec<_>>();
            explanation.push(format!("memory_ban:{}", listed.join(",")));
        }
        if let Some((_, _, prior)) = &preferred {
            if prior.is_finite() && *prior > 0.0 {
                explanation.push(format!("gene_prior:{prior:.3}"));
            }
        }
        if drift_enabled {
            explanation.push("random_drift:enabled".to_string());
        }

        MemoryAdvice {
            current_signal_key: current_key,
            preferred_gene_id: preferred.map(|(gene_id, _, _)| gene_id),
            banned_gene_ids: banned,
            explanation,
        }
    }

    pub fn record_signal_snapshot(
        &self,
        signals: &[String],
        observations: Option<&Value>,
    ) -> Result<MemoryGraphEvent, MemoryGraphError> {
        let signal_key = compute_signal_key(signals);
        let (ms, ts) = self.stamp();
        let id = format!(
            "mge_{ms}_{}",
            stable_hash(&format!("{signal_key}|signal|{ts}"))
        );
        let mut event = MemoryGraphEvent::new(MemoryEventKind::Signal, id, ts);
        event.signal = Some(signal_record(signals, signal_key));
        event.observed = observed(observations);
        self.append(&event)?;
        Ok(event)
    }

    pub fn record_hypothesis(
        &self,
        context: &AttemptContext<'_>,
    ) -> Result<HypothesisReceipt, MemoryGraphError> {
        let signal_key = compute_signal_key(context.signals);
        let (ms, ts) = self.stamp();
        let gene = gene_ref(context.selected_gene);
        let hypothesis_id = format!(
            "hyp_{ms}_{}",
            stable_hash(&format!(
                "{signal_key}|{}|{ts}",
                gene.id.as_deref().unwrap_or("none")
            ))
        );
        let id = format!(
            "mge_{ms}_{}",
            stable_hash(&format!("{hypothesis_id}|{ts}"))
        );
        let mut event = MemoryGraphEvent::new(MemoryEventKind::Hypothesis, id, ts);
        event.signal = Some(signal_record(context.signals, signal_key.clone()));
        event.hypothesis = Some(HypothesisRecord {
            id: hypothesis_id.clone(),
            text: Some(hypothesis_text(
                &signal_key,
                context.signals.len(),
                &gene,
                context.drift_enabled,
            )),
            predicted_outcome: Some(PredictedOutcome::default()),
        });
        event.mutation = context.mutation.map(MutationRecord::from);
        event.personality = context.personality_state.map(personality_record);
        event.gene = Some(gene);
        event.action = Some(ActionRecord {
            id: None,
            drift: Some(context.drift_enabled),
            selected_by: Some(selected_by(context.selected_by)),
            selector: context.selector.cloned(),
        });
        event.capsules = Some(capsules_used(context.capsules_used));
        event.observed = observed(context.observations);
        self.append(&event)?;
        Ok(HypothesisReceipt {
            hypothesis_id,
            signal_key,
        })
    }

    /// Appends the attempt and replaces `last_action` in the state file.
    pub fn record_attempt(
        &self,
        context: &AttemptContext<'_>,
        hypothesis_id: Option<&str>,
    ) -> Result<AttemptReceipt, MemoryGraphError> {
        let signal_key = compute_signal_key(context.signals);
        let (ms, ts) = self.stamp();
        let gene = gene_ref(context.selected_gene);
        let action_id = format!(
            "act_{ms}_{}",
            stable_hash(&format!(
                "{signal_key}|{}|{ts}",
                gene.id.as_deref().unwrap_or("none")
            ))
        );
        let id = format!("mge_{ms}_{}", stable_hash(&action_id));
        let personality = context.personality_state.map(personality_record);
        let capsules = capsules_used(context.capsules_used);

        let mut event = MemoryGraphEvent::new(MemoryEventKind::Attempt, id, ts.clone());
        event.signal = Some(signal_record(context.signals, signal_key.clone()));
        event.mutation = context.mutation.map(MutationRecord::from);
        event.personality = personality.clone();
        event.gene = Some(gene.clone());
        event.hypothesis = hypothesis_id.map(|id| HypothesisRecord {
            id: id.to_string(),
            text: None,
            predicted_outcome: None,
        });
        event.action = Some(ActionRecord {
            id: Some(action_id.clone()),
            drift: Some(context.drift_enabled),
            selected_by: Some(selected_by(context.selected_by)),
            selector: context.selector.cloned(),
        });
        event.capsules = Some(capsules.clone());
        event.observed = observed(context.observations);
        self.append(&event)?;

        let mut state = self.read_state();
        state.last_action = Some(LastAction {
            action_id: action_id.clone(),
            signal_key: signal_key.clone(),
            signals: context.signals.to_vec(),
            mutation_id: context.mutation.map(|mutation| mutation.id.clone()),
            mutation_category: context.mutation.map(|mutation| mutation.category),
            mutation_risk_level: context.mutation.map(|mutation| mutation.risk_level),
            personality_key: personality.as_ref().and_then(|record| record.key.clone()),
            personality_state: personality.and_then(|record| record.state),
            gene_id: gene.id,
            gene_category: gene.category,
            hypothesis_id: hypothesis_id.map(str::to_string),
            capsules_used: capsules.used,
            had_error: has_error_signal(context.signals),
            created_at: ts,
            outcome_recorded: false,
            outcome_recorded_at: None,
            baseline_observed: observed(context.observations),
        });
        self.write_state(&state)?;

        Ok(AttemptReceipt {
            action_id,
            signal_key,
        })
    }

    /// Closes the pending attempt with an inferred outcome. Returns `None` when
    /// there is no pending attempt or its outcome was already recorded.
    pub fn record_outcome_from_state(
        &self,
        signals: &[String],
        observations: Option<&Value>,
    ) -> Result<Option<MemoryGraphEvent>, MemoryGraphError> {
        let mut state = self.read_state();
        let Some(mut last) = state.last_action.take() else {
            return Ok(None);
        };
        if last.action_id.is_empty() || last.outcome_recorded {
            return Ok(None);
        }

        let inferred = infer_outcome(
            last.had_error,
            has_error_signal(signals),
            last.baseline_observed.as_ref(),
            observations,
        );
        let (ms, ts) = self.stamp();
        let signal_key = if last.signal_key.is_empty() {
            "(none)".to_string()
        } else {
            last.signal_key.clone()
        };
        let id = format!(
            "mge_{ms}_{}",
            stable_hash(&format!("{}|outcome|{ts}", last.action_id))
        );
        let mut event = MemoryGraphEvent::new(MemoryEventKind::Outcome, id, ts.clone());
        event.signal = Some(SignalRecord {
            key: signal_key.clone(),
            signals: last.signals.clone(),
            error_signature: extract_error_signature(signals),
        });
        if last.mutation_id.is_some()
            || last.mutation_category.is_some()
            || last.mutation_risk_level.is_some()
        {
            event.mutation = Some(MutationRecord {
                id: last.mutation_id.clone(),
                category: last.mutation_category,
                risk_level: last.mutation_risk_level,
                ..MutationRecord::default()
            });
        }
        if last.personality_key.is_some() || last.personality_state.is_some() {
            event.personality = Some(PersonalityRecord {
                key: last.personality_key.clone(),
                state: last.personality_state.clone(),
            });
        }
        event.gene = Some(GeneRef {
            id: last.gene_id.clone(),
            category: last.gene_category,
        });
        event.action = Some(ActionRecord {
            id: Some(last.action_id.clone()),
            ..ActionRecord::default()
        });
        event.hypothesis = last.hypothesis_id.as_ref().map(|id| HypothesisRecord {
            id: id.clone(),
            text: None,
            predicted_outcome: None,
        });
        event.outcome = Some(OutcomeRecord {
            status: inferred.status,
            score: inferred.score,
            note: inferred.note,
            observed: Some(serde_json::json!({ "current_signals": signals })),
        });
        event.confidence = Some(ConfidenceHint {
            half_life_days: self.config.edge_half_life_days,
        });
        event.observed = observed(observations);
        event.baseline = last.baseline_observed.clone();
        event.capsules = Some(CapsulesUsed {
            used: last.capsules_used.clone(),
        });
        self.append(&event)?;

        if let Some(gene_id) = last.gene_id.clone().filter(|id| !id.is_empty()) {
            if let Err(err) = self.append_confidence_snapshots(&last, &signal_key, &gene_id, &event.id)
            {
                log::warn!(
                    "memory_graph_confidence_snapshot_failed gene_id={} error={}",
                    gene_id,
                    err
                );
            }
        }

        last.outcome_recorded = true;
        last.outcome_recorded_at = Some(ts);
        state.last_action = Some(last);
        self.write_state(&state)?;
        Ok(Some(event))
    }

    /// Annotates an externally received asset. Outcome aggregation ignores it.
    pub fn record_external_candidate(
        &self,
        asset: &Value,
        source: Option<&str>,
        signals: &[String],
    ) -> Result<Option<MemoryGraphEvent>, MemoryGraphError> {
        let asset_type = asset
            .get("type")
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty());
        let asset_id = asset
            .get("id")
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty());
        let (Some(asset_type), Some(asset_id)) = (asset_type, asset_id) else {
            return Ok(None);
        };

        let (ms, ts) = self.stamp();
        let id = format!(
            "mge_{ms}_{}",
            stable_hash(&format!("{asset_type}|{asset_id}|external|{ts}"))
        );
        let is_capsule = asset_type == "Capsule";
        let mut event = MemoryGraphEvent::new(MemoryEventKind::ExternalCandidate, id, ts.clone());
        event.signal = Some(SignalRecord {
            key: compute_signal_key(signals),
            signals: signals.to_vec(),
            error_signature: None,
        });
        event.external = Some(ExternalRecord {
            source: source.unwrap_or("external").to_string(),
            received_at: ts,
        });
        event.asset = Some(AssetRef {
            asset_type: asset_type.to_string(),
            id: asset_id.to_string(),
        });
        event.candidate = Some(CandidateHint {
            trigger: if is_capsule {
                string_list(asset.get("trigger"))
            } else {
                Vec::new()
            },
            gene: asset
                .get("gene")
                .and_then(Value::as_str)
                .filter(|_| is_capsule)
                .map(str::to_string),
            confidence: asset
                .get("confidence")
                .and_then(Value::as_f64)
                .filter(|value| is_capsule && value.is_finite()),
        });
        self.append(&event)?;
        Ok(Some(event))
    }

    fn append_confidence_snapshots(
        &self,
        last: &LastAction,
        signal_key: &str,
        gene_id: &str,
        outcome_event_id: &str,
    ) -> Result<(), MemoryGraphError> {
        let events = self.read_events();
        let now = self.clock();
        let (ms, ts) = self.stamp();

        let edges = aggregate_edges(&events);
        let edge = edges
            .get(&edge_key(signal_key, gene_id))
            .cloned()
            .unwrap_or_default();
        let half_life = self.config.edge_half_life_days;
        let id = format!(
            "mge_{ms}_{}",
            stable_hash(&format!("{signal_key}|{gene_id}|confidence|{ts}"))
        );
        let mut edge_event = MemoryGraphEvent::new(MemoryEventKind::ConfidenceEdge, id, ts.clone());
        edge_event.signal = Some(SignalRecord {
            key: signal_key.to_string(),
            signals: last.signals.clone(),
            error_signature: None,
        });
        edge_event.gene = Some(GeneRef {
            id: Some(gene_id.to_string()),
            category: last.gene_category,
        });
        edge_event.edge = Some(EdgeRef {
            signal_key: Some(signal_key.to_string()),
            gene_id: gene_id.to_string(),
        });
        edge_event.stats = Some(confidence_stats(&edge, half_life, now, &ts));
        edge_event.derived_from = Some(DerivedFrom {
            outcome_event_id: Some(outcome_event_id.to_string()),
        });
        self.append(&edge_event)?;

        let gene_outcomes = aggregate_gene_outcomes(&events);
        let prior = gene_outcomes.get(gene_id).cloned().unwrap_or_default();
        let half_life = self.config.gene_half_life_days;
        let id = format!(
            "mge_{ms}_{}",
            stable_hash(&format!("{gene_id}|gene_outcome|confidence|{ts}"))
        );
        let mut gene_event =
            MemoryGraphEvent::new(MemoryEventKind::ConfidenceGeneOutcome, id, ts.clone());
        gene_event.gene = Some(GeneRef {
            id: Some(gene_id.to_string()),
            category: last.gene_category,
        });
        gene_event.edge = Some(EdgeRef {
            signal_key: None,
            gene_id: gene_id.to_string(),
        });
        gene_event.stats = Some(confidence_stats(&prior, half_life, now, &ts));
        gene_event.derived_from = Some(DerivedFrom {
            outcome_event_id: Some(outcome_event_id.to_string()),
        });
        self.append(&gene_event)
    }

    fn append(&self, event: &MemoryGraphEvent) -> Result<(), MemoryGraphError> {
        if let Some(parent) = self.graph_path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.graph_path)
            .map_err(io_err)?;
        let line = serde_json::to_string(event).map_err(serde_err)?;
        file.write_all(line.as_bytes()).map_err(io_err)?;
        file.write_all(b"\n").map_err(io_err)?;
        Ok(())
    }

    fn write_state(&self, state: &MemoryGraphState) -> Result<(), MemoryGraphError> {
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut tmp = self.state_path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp_path = PathBuf::from(tmp);
        let mut bytes = serde_json::to_vec_pretty(state).map_err(serde_err)?;
        bytes.push(b'\n');
        fs::write(&tmp_path, bytes).map_err(io_err)?;
        fs::rename(&tmp_path, &self.state_path).map_err(io_err)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct GeneEvidence {
    best: f64,
    attempts: u64,
    prior: f64,
    prior_attempts: u64,
}

pub fn edge_key(signal_key: &str, gene_id: &str) -> String {
    format!("{signal_key}::{gene_id}")
}

/// Outcome counts per `signal_key::gene_id`.
pub fn aggregate_edges(events: &[MemoryGraphEvent]) -> HashMap<String, OutcomeAggregate> {
    let mut edges: HashMap<String, OutcomeAggregate> = HashMap::new();
    for event in outcome_events(events) {
        let Some(gene_id) = event.gene_id() else {
            continue;
        };
        edges
            .entry(edge_key(event.signal_key(), gene_id))
            .or_default()
            .observe(event);
    }
    edges
}

/// Outcome counts per gene, independent of signals.
pub fn aggregate_gene_outcomes(events: &[MemoryGraphEvent]) -> HashMap<GeneId, OutcomeAggregate> {
    let mut genes: HashMap<GeneId, OutcomeAggregate> = HashMap::new();
    for event in outcome_events(events) {
        let Some(gene_id) = event.gene_id() else {
            continue;
        };
        genes.entry(gene_id.to_string()).or_default().observe(event);
    }
    genes
}

/// `0.5^(age_days / half_life)`; 1 when the half-life or timestamp is unusable
/// or the timestamp is not in the past.
pub fn decay_weight(last_ts: Option<&str>, half_life_days: f64, now: DateTime<Utc>) -> f64 {
    if !half_life_days.is_finite() || half_life_days <= 0.0 {
        return 1.0;
    }
    let Some(updated) = last_ts.and_then(parse_ts) else {
        return 1.0;
    };
    let age_days = (now - updated).num_milliseconds() as f64 / 86_400_000.0;
    if !age_days.is_finite() || age_days <= 0.0 {
        return 1.0;
    }
    0.5f64.powf(age_days / half_life_days)
}

/// Laplace-smoothed success probability times decay weight.
pub fn expected_success(
    aggregate: &OutcomeAggregate,
    half_life_days: f64,
    now: DateTime<Utc>,
) -> ExpectedSuccess {
    let total = aggregate.success + aggregate.fail;
    let p = (aggregate.success as f64 + 1.0) / (total as f64 + 2.0);
    let w = decay_weight(aggregate.last_ts.as_deref(), half_life_days, now);
    ExpectedSuccess {
        p,
        w,
        total,
        value: p * w,
    }
}

fn outcome_events(events: &[MemoryGraphEvent]) -> impl Iterator<Item = &MemoryGraphEvent> {
    events.iter().filter(|event| {
        event.event_type == AssetKind::MemoryGraphEvent
            && event.kind == MemoryEventKind::Outcome
            && event.outcome.is_some()
    })
}

fn confidence_stats(
    aggregate: &OutcomeAggregate,
    half_life_days: f64,
    now: DateTime<Utc>,
    updated_at: &str,
) -> ConfidenceStats {
    let expected = expected_success(aggregate, half_life_days, now);
    ConfidenceStats {
        success: aggregate.success,
        fail: aggregate.fail,
        attempts: expected.total,
        p: expected.p,
        decay_weight: expected.w,
        value: expected.value,
        half_life_days,
        updated_at: updated_at.to_string(),
    }
}

fn hypothesis_text(signal_key: &str, signal_count: usize, gene: &GeneRef, drift: bool) -> String {
    let gene_label = match (&gene.id, gene.category) {
        (Some(id), Some(category)) => format!("{id}({category})"),
        (Some(id), None) => id.clone(),
        (None, _) => "(none)".to_string(),
    };
    let mode = if drift { "drift" } else { "directed" };
    format!(
        "Given signal_key={signal_key} with {signal_count} signals, selecting gene={gene_label} under mode={mode} is expected to reduce repeated errors and improve stability."
    )
}

fn signal_record(signals: &[String], key: String) -> SignalRecord {
    SignalRecord {
        key,
        signals: signals.to_vec(),
        error_signature: extract_error_signature(signals),
    }
}

fn gene_ref(gene: Option<&Gene>) -> GeneRef {
    match gene.filter(|gene| !gene.id.is_empty()) {
        Some(gene) => GeneRef {
            id: Some(gene.id.clone()),
            category: Some(gene.category),
        },
        None => GeneRef::default(),
    }
}

fn personality_record(state: &PersonalityState) -> PersonalityRecord {
    let normalized = state.normalized();
    PersonalityRecord {
        key: Some(normalized.key()),
        state: Some(normalized),
    }
}

fn capsules_used(ids: &[String]) -> CapsulesUsed {
    CapsulesUsed {
        used: ids.iter().filter(|id| !id.is_empty()).cloned().collect(),
    }
}

fn selected_by(raw: &str) -> String {
    if raw.is_empty() {
        "selector".to_string()
    } else {
        raw.to_string()
    }
}

fn observed(observations: Option<&Value>) -> Option<Value> {
    observations.filter(|value| value.is_object()).cloned()
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn io_err(err: std::io::Error) -> MemoryGraphError {
    MemoryGraphError::Io(err.to_string())
}

fn serde_err(err: serde_json::Error) -> MemoryGraphError {
    MemoryGraphError::Serde(err.to_string())
}
