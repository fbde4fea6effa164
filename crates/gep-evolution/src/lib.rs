//! GEP asset model, content addressing, environment fingerprints, and the JSON/JSONL asset store.

mod content_hash;
mod env;
mod store;

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use content_hash::{canonicalize, compute_asset_id, verify_asset_id, ContentAddressed};
pub use env::{
    capture_env_fingerprint, env_fingerprint_key, is_same_env_class, resolve_device_id, EnvProbe,
};
pub use store::{default_genes, AssetStore, JsonAssetStore};

pub const SCHEMA_VERSION: &str = "1.5.0";

pub type GeneId = String;
pub type CapsuleId = String;
pub type EventId = String;
pub type MutationId = String;

#[derive(Debug, Error)]
pub enum EvolutionError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serde(String),
}

/// The `type` discriminator carried by every persisted GEP object.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AssetKind {
    Gene,
    Capsule,
    EvolutionEvent,
    ValidationReport,
    Mutation,
    PersonalityState,
    PersonalityMutation,
    MemoryGraphEvent,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GeneCategory {
    #[default]
    Repair,
    Optimize,
    Innovate,
}

impl GeneCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeneCategory::Repair => "repair",
            GeneCategory::Optimize => "optimize",
            GeneCategory::Innovate => "innovate",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "repair" => Some(GeneCategory::Repair),
            "optimize" => Some(GeneCategory::Optimize),
            "innovate" => Some(GeneCategory::Innovate),
            _ => None,
        }
    }
}

impl fmt::Display for GeneCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Failed => "failed",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Outcome {
    pub status: OutcomeStatus,
    pub score: f64,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    #[default]
    Generated,
    Reused,
    Reference,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlastRadius {
    pub files: usize,
    pub lines: usize,
}

/// Measured blast radius plus the file lists it was derived from.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlastMeasurement {
    pub files: usize,
    pub lines: usize,
    pub changed_files: Vec<String>,
    pub ignored_files: Vec<String>,
    pub all_changed_files: Vec<String>,
}

impl BlastMeasurement {
    pub fn radius(&self) -> BlastRadius {
        BlastRadius {
            files: self.files,
            lines: self.lines,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlastSeverity {
    WithinLimit,
    ApproachingLimit,
    Exceeded,
    CriticalOverrun,
    HardCapBreach,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectoryCount {
    pub dir: String,
    pub files: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EstimateComparison {
    pub estimate_files: usize,
    pub actual_files: usize,
    pub ratio: f64,
    pub drifted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EnvFingerprint {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub node_version: Option<String>,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub os_release: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub evolver_version: Option<String>,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub container: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EpigeneticMark {
    pub context: String,
    pub boost: f64,
    pub reason: String,
    pub created_at: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeneConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_files: Option<usize>,
    #[serde(default)]
    pub forbidden_paths: Vec<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ValidationProgram {
    Node,
    Npm,
    Npx,
}

impl ValidationProgram {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationProgram::Node => "node",
            ValidationProgram::Npm => "npm",
            ValidationProgram::Npx => "npx",
        }
    }
}

/// A validation command executed without a shell.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationCommand {
    pub program: ValidationProgram,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ValidationCommand {
    pub fn new<I, S>(program: ValidationProgram, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Parses a legacy command line such as `node -e "require('x')"`.
    ///
    /// Only `node`, `npm` and `npx` are accepted. Command substitution is
    /// rejected anywhere, and `; & | > <` are rejected outside quotes.
    pub fn parse_legacy(raw: &str) -> Result<Self, CommandRejection> {
        let command = raw.trim();
        if command.is_empty() {
            return Err(CommandRejection::Empty);
        }
        if command.contains('`') || command.contains("$(") {
            return Err(CommandRejection::CommandSubstitution(command.to_string()));
        }
        if let Some(operator) = unquoted_operator(command) {
            return Err(CommandRejection::ShellOperator(operator));
        }
        let mut tokens = split_command_line(command).into_iter();
        let program = match tokens.next().as_deref() {
            Some("node") => ValidationProgram::Node,
            Some("npm") => ValidationProgram::Npm,
            Some("npx") => ValidationProgram::Npx,
            Some(other) => return Err(CommandRejection::ProgramNotAllowed(other.to_string())),
            None => return Err(CommandRejection::Empty),
        };
        let args = tokens.collect::<Vec<_>>();
        if args.is_empty() {
            return Err(CommandRejection::ProgramNotAllowed(program.as_str().to_string()));
        }
        Ok(Self { program, args })
    }
}

impl fmt::Display for ValidationCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program.as_str())?;
        for arg in &self.args {
            if arg.is_empty() || arg.chars().any(char::is_whitespace) {
                write!(f, " \"{}\"", arg.replace('"', "\\\""))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CommandRejection {
    #[error("empty validation command")]
    Empty,
    #[error("program not allowed: {0}")]
    ProgramNotAllowed(String),
    #[error("command substitution is prohibited: {0}")]
    CommandSubstitution(String),
    #[error("shell operator outside quotes: {0}")]
    ShellOperator(char),
}

/// A gene validation entry: structured, or a legacy command line kept verbatim.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ValidationStep {
    Command(ValidationCommand),
    Legacy(String),
}

impl ValidationStep {
    pub fn resolve(&self) -> Result<ValidationCommand, CommandRejection> {
        match self {
            ValidationStep::Command(command) => Ok(command.clone()),
            ValidationStep::Legacy(raw) => ValidationCommand::parse_legacy(raw),
        }
    }

    pub fn display(&self) -> String {
        match self {
            ValidationStep::Command(command) => command.to_string(),
            ValidationStep::Legacy(raw) => raw.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Gene {
    #[serde(rename = "type")]
    pub kind: AssetKind,
    #[serde(default)]
    pub schema_version: String,
    pub id: GeneId,
    #[serde(default)]
    pub category: GeneCategory,
    #[serde(default)]
    pub signals_match: Vec<String>,
    #[serde(default)]
    pub preconditions: Vec<String>,
    #[serde(default)]
    pub strategy: Vec<String>,
    #[serde(default)]
    pub constraints: GeneConstraints,
    #[serde(default)]
    pub validation: Vec<ValidationStep>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub epigenetic_marks: Vec<EpigeneticMark>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Gene {
    pub fn new<S: Into<GeneId>>(id: S, category: GeneCategory) -> Self {
        Self {
            kind: AssetKind::Gene,
            schema_version: SCHEMA_VERSION.to_string(),
            id: id.into(),
            category,
            signals_match: Vec::new(),
            preconditions: Vec::new(),
            strategy: Vec::new(),
            constraints: GeneConstraints::default(),
            validation: Vec::new(),
            epigenetic_marks: Vec::new(),
            asset_id: None,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct A2aStatus {
    #[serde(default)]
    pub eligible_to_broadcast: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Capsule {
    #[serde(rename = "type")]
    pub kind: AssetKind,
    #[serde(default)]
    pub schema_version: String,
    pub id: CapsuleId,
    #[serde(default)]
    pub trigger: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gene: Option<GeneId>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub blast_radius: BlastRadius,
    pub outcome: Outcome,
    #[serde(default)]
    pub success_streak: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_fingerprint: Option<EnvFingerprint>,
    #[serde(default)]
    pub source_type: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reused_asset_id: Option<String>,
    #[serde(default)]
    pub a2a: A2aStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PersonalityState {
    #[serde(rename = "type", default = "personality_state_kind")]
    pub kind: AssetKind,
    pub rigor: f64,
    pub creativity: f64,
    pub verbosity: f64,
    pub risk_tolerance: f64,
    pub obedience: f64,
}

impl Default for PersonalityState {
    fn default() -> Self {
        Self {
            kind: AssetKind::PersonalityState,
            rigor: 0.7,
            creativity: 0.35,
            verbosity: 0.25,
            risk_tolerance: 0.4,
            obedience: 0.85,
        }
    }
}

impl PersonalityState {
    pub fn get(&self, param: PersonalityParam) -> f64 {
        match param {
            PersonalityParam::Rigor => self.rigor,
            PersonalityParam::Creativity => self.creativity,
            PersonalityParam::Verbosity => self.verbosity,
            PersonalityParam::RiskTolerance => self.risk_tolerance,
            PersonalityParam::Obedience => self.obedience,
        }
    }

    pub fn set(&mut self, param: PersonalityParam, value: f64) {
        let slot = match param {
            PersonalityParam::Rigor => &mut self.rigor,
            PersonalityParam::Creativity => &mut self.creativity,
            PersonalityParam::Verbosity => &mut self.verbosity,
            PersonalityParam::RiskTolerance => &mut self.risk_tolerance,
            PersonalityParam::Obedience => &mut self.obedience,
        };
        *slot = value;
    }

    /// Every parameter clamped to `[0, 1]`; non-finite values become 0.
    pub fn normalized(&self) -> Self {
        let mut out = Self::default();
        for param in PersonalityParam::ALL {
            out.set(param, clamp01(self.get(param)));
        }
        out
    }

    /// Stable bucket key, each parameter rounded to one decimal.
    pub fn key(&self) -> String {
        let state = self.normalized();
        PersonalityParam::ALL
            .iter()
            .map(|param| {
                let rounded = (state.get(*param) / 0.1).round() * 0.1;
                format!("{}={:.1}", param.as_str(), rounded)
            })
            .collect::<Vec<_>>()
            .join("|")
    }
}

pub fn clamp01(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn personality_state_kind() -> AssetKind {
    AssetKind::PersonalityState
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PersonalityParam {
    Rigor,
    Creativity,
    Verbosity,
    RiskTolerance,
    Obedience,
}

impl PersonalityParam {
    pub const ALL: [PersonalityParam; 5] = [
        PersonalityParam::Rigor,
        PersonalityParam::Creativity,
        PersonalityParam::Verbosity,
        PersonalityParam::RiskTolerance,
        PersonalityParam::Obedience,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PersonalityParam::Rigor => "rigor",
            PersonalityParam::Creativity => "creativity",
            PersonalityParam::Verbosity => "verbosity",
            PersonalityParam::RiskTolerance => "risk_tolerance",
            PersonalityParam::Obedience => "obedience",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|param| param.as_str() == raw)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PersonalityMutation {
    #[serde(rename = "type", default = "personality_mutation_kind")]
    pub kind: AssetKind,
    pub param: PersonalityParam,
    pub delta: f64,
    pub reason: String,
}

fn personality_mutation_kind() -> AssetKind {
    AssetKind::PersonalityMutation
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Mutation {
    #[serde(rename = "type", default = "mutation_kind")]
    pub kind: AssetKind,
    pub id: MutationId,
    pub category: GeneCategory,
    #[serde(default)]
    pub trigger_signals: Vec<String>,
    pub target: String,
    pub expected_effect: String,
    pub risk_level: RiskLevel,
}

fn mutation_kind() -> AssetKind {
    AssetKind::Mutation
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectorDecision {
    pub selected: Option<GeneId>,
    pub reason: Vec<String>,
    pub alternatives: Vec<GeneId>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PersonalityMeta {
    pub key: Option<String>,
    pub known: bool,
    pub mutations: Vec<PersonalityMutation>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeneMeta {
    pub id: Option<GeneId>,
    pub created: bool,
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationCommandOutcome {
    pub cmd: String,
    pub ok: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ValidationReportRef {
    pub id: String,
    pub overall_ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_fingerprint_key: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EventMeta {
    pub at: String,
    pub signal_key: String,
    #[serde(default)]
    pub selector: Option<SelectorDecision>,
    #[serde(default)]
    pub blast_radius_estimate: Option<BlastRadius>,
    #[serde(default)]
    pub mutation: Option<Mutation>,
    #[serde(default)]
    pub personality: PersonalityMeta,
    #[serde(default)]
    pub gene: GeneMeta,
    #[serde(default)]
    pub constraints_ok: bool,
    #[serde(default)]
    pub constraint_violations: Vec<String>,
    #[serde(default)]
    pub constraint_warnings: Vec<String>,
    #[serde(default)]
    pub blast_severity: Option<BlastSeverity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blast_breakdown: Option<Vec<DirectoryCount>>,
    #[serde(default)]
    pub blast_estimate_comparison: Option<EstimateComparison>,
    #[serde(default)]
    pub validation_ok: bool,
    #[serde(default)]
    pub validation: Vec<ValidationCommandOutcome>,
    #[serde(default)]
    pub validation_report: Option<ValidationReportRef>,
    #[serde(default)]
    pub canary_ok: bool,
    #[serde(default)]
    pub canary_skipped: bool,
    #[serde(default)]
    pub protocol_ok: bool,
    #[serde(default)]
    pub protocol_violations: Vec<String>,
    #[serde(default)]
    pub memory_graph: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EvolutionEvent {
    #[serde(rename = "type")]
    pub kind: AssetKind,
    #[serde(default)]
    pub schema_version: String,
    pub id: EventId,
    #[serde(default)]
    pub parent: Option<EventId>,
    pub intent: GeneCategory,
    #[serde(default)]
    pub signals: Vec<String>,
    #[serde(default)]
    pub genes_used: Vec<GeneId>,
    #[serde(default)]
    pub mutation_id: Option<MutationId>,
    #[serde(default)]
    pub personality_state: Option<PersonalityState>,
    #[serde(default)]
    pub blast_radius: BlastRadius,
    pub outcome: Outcome,
    #[serde(default)]
    pub capsule_id: Option<CapsuleId>,
    #[serde(default)]
    pub source_type: SourceType,
    #[serde(default)]
    pub reused_asset_id: Option<String>,
    #[serde(default)]
    pub env_fingerprint: Option<EnvFingerprint>,
    #[serde(default)]
    pub validation_report_id: Option<String>,
    #[serde(default)]
    pub meta: EventMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationCommandReport {
    pub command: String,
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ValidationReport {
    #[serde(rename = "type")]
    pub kind: AssetKind,
    #[serde(default)]
    pub schema_version: String,
    pub id: String,
    #[serde(default)]
    pub gene_id: Option<GeneId>,
    #[serde(default)]
    pub env_fingerprint: Option<EnvFingerprint>,
    #[serde(default)]
    pub env_fingerprint_key: Option<String>,
    pub commands: Vec<ValidationCommandReport>,
    pub overall_ok: bool,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.kind == AssetKind::ValidationReport
            && !self.id.is_empty()
            && self.overall_ok
                == (!self.commands.is_empty() && self.commands.iter().all(|command| command.ok))
    }
}

/// 32-bit FNV-1a over UTF-16 code units, rendered as 8 lowercase hex chars.
pub fn stable_hash(input: &str) -> String {
    let mut hash: u32 = 2_166_136_261;
    for unit in input.encode_utf16() {
        hash ^= u32::from(unit);
        hash = hash.wrapping_mul(16_777_619);
    }
    format!("{hash:08x}")
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Millisecond-stamped id, e.g. `evt_1739000000000`.
pub fn next_id(prefix: &str) -> String {
    format!("{prefix}_{}", now_ms())
}

/// Truncates to at most `max` characters without splitting a code point.
pub fn clip(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Forward slashes, no leading `./`, trimmed.
pub fn normalize_rel_path(raw: &str) -> String {
    let mut rel = raw.trim().replace('\\', "/");
    while let Some(rest) = rel.strip_prefix("./") {
        rel = rest.trim_start_matches('/').to_string();
    }
    rel
}

/// True when `rel` equals one of `roots` or lies beneath it. Trailing slashes are ignored.
pub fn path_under_any<S: AsRef<str>>(rel: &str, roots: &[S]) -> bool {
    let rel = normalize_rel_path(rel);
    if rel.is_empty() {
        return false;
    }
    roots.iter().any(|root| {
        let root = normalize_rel_path(root.as_ref());
        let root = root.trim_end_matches('/');
        !root.is_empty() && (rel == root || rel.starts_with(&format!("{root}/")))
    })
}

pub fn unique_signals<I, S>(signals: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::BTreeSet::new();
    let mut out = Vec::new();
    for signal in signals {
        let trimmed = signal.as_ref().trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            out.push(trimmed.to_string());
        }
    }
    out
}

fn unquoted_operator(command: &str) -> Option<char> {
    let mut quote: Option<char> = None;
    for ch in command.chars() {
        match quote {
            Some(open) if ch == open => quote = None,
            Some(_) => {}
            None if ch == '"' || ch == '\'' => quote = Some(ch),
            None if matches!(ch, ';' | '&' | '|' | '>' | '<') => return Some(ch),
            None => {}
        }
    }
    None
}

fn split_command_line(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    for ch in command.chars() {
        match quote {
            Some(open) if ch == open => quote = None,
            Some(_) => current.push(ch),
            None if ch == '"' || ch == '\'' => {
                quote = Some(ch);
                in_token = true;
            }
            None if ch.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(ch);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

fn io_err(err: std::io::Error) -> EvolutionError {
    EvolutionError::Io(err.to_string())
}

fn serde_err(err: serde_json::Error) -> EvolutionError {
    EvolutionError::Serde(err.to_string())
}
