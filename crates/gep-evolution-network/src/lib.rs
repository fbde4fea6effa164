//! GEP A2A protocol contracts: publish bundles, broadcast eligibility, and external intake.

mod sanitize;

pub use sanitize::{redact_string, sanitize_payload, REDACTED};

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use gep_evolution::{
    clamp01, compute_asset_id, now_iso, now_ms, BlastRadius, Capsule, EvolutionEvent, Gene,
    GeneCategory, OutcomeStatus, SourceType, SCHEMA_VERSION,
};

pub const PROTOCOL_NAME: &str = "gep-a2a";
pub const PROTOCOL_VERSION: &str = "1.0.0";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("invalid asset: {0}")]
    InvalidAsset(String),
    #[error("signature error: {0}")]
    Signature(String),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Hello,
    Publish,
    Fetch,
    Report,
    Decision,
    Revoke,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Hello => "hello",
            MessageType::Publish => "publish",
            MessageType::Fetch => "fetch",
            MessageType::Report => "report",
            MessageType::Decision => "decision",
            MessageType::Revoke => "revoke",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProtocolMessage {
    pub protocol: String,
    pub protocol_version: String,
    pub message_type: MessageType,
    pub message_id: String,
    pub sender_id: String,
    pub timestamp: String,
    pub payload: Value,
}

impl ProtocolMessage {
    pub fn new(message_type: MessageType, sender_id: impl Into<String>, payload: Value) -> Self {
        Self {
            protocol: PROTOCOL_NAME.into(),
            protocol_version: PROTOCOL_VERSION.into(),
            message_type,
            message_id: generate_message_id(),
            sender_id: sender_id.into(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            payload,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.protocol == PROTOCOL_NAME && !self.message_id.is_empty() && !self.timestamp.is_empty()
    }
}

/// `msg_<ms>_<8 hex>`.
pub fn generate_message_id() -> String {
    format!("msg_{}_{}", now_ms(), hex::encode(rand::random::<[u8; 4]>()))
}

/// `node_<12 hex>` derived from device, agent name, and working directory.
pub fn node_id(device_id: &str, agent_name: &str, cwd: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{device_id}|{agent_name}|{cwd}").as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("node_{}", &digest[..12])
}

/// HMAC-SHA256 over the two asset ids, sorted and joined by `|`.
pub fn sign_bundle(
    node_secret: &str,
    gene_asset_id: &str,
    capsule_asset_id: &str,
) -> Result<String, NetworkError> {
    let mut ids = [gene_asset_id, capsule_asset_id];
    ids.sort();
    let mut mac = HmacSha256::new_from_slice(node_secret.as_bytes())
        .map_err(|err| NetworkError::Signature(err.to_string()))?;
    mac.update(ids.join("|").as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn verify_bundle_signature(message: &ProtocolMessage, node_secret: &str) -> bool {
    let payload = &message.payload;
    let assets = payload
        .get("assets")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let asset_id_of = |kind: &str| {
        assets
            .iter()
            .find(|asset| asset.get("type").and_then(Value::as_str) == Some(kind))
            .and_then(|asset| asset.get("asset_id"))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let (Some(gene_id), Some(capsule_id), Some(claimed)) = (
        asset_id_of("Gene"),
        asset_id_of("Capsule"),
        payload.get("signature").and_then(Value::as_str),
    ) else {
        return false;
    };
    sign_bundle(node_secret, &gene_id, &capsule_id)
        .map(|expected| expected == claimed)
        .unwrap_or(false)
}

#[derive(Clone, Debug)]
pub struct PublishBundle<'a> {
    pub gene: &'a Value,
    pub capsule: &'a Value,
    pub event: Option<&'a Value>,
    pub chain_id: Option<&'a str>,
}

/// Publish message with `payload.assets = [gene, capsule, event?]` and a bundle signature.
pub fn build_publish_bundle(
    bundle: PublishBundle<'_>,
    sender_id: &str,
    node_secret: &str,
) -> Result<ProtocolMessage, NetworkError> {
    require_asset(bundle.gene, "Gene")?;
    require_asset(bundle.capsule, "Capsule")?;
    let gene_asset_id = existing_or_computed_asset_id(bundle.gene);
    let capsule_asset_id = existing_or_computed_asset_id(bundle.capsule);
    let signature = sign_bundle(node_secret, &gene_asset_id, &capsule_asset_id)?;

    let mut assets = vec![bundle.gene.clone(), bundle.capsule.clone()];
    if let Some(event) = bundle
        .event
        .filter(|event| event.get("type").and_then(Value::as_str) == Some("EvolutionEvent"))
    {
        assets.push(event.clone());
    }
    let mut payload = Map::new();
    payload.insert("assets".into(), Value::Array(assets));
    payload.insert("signature".into(), Value::String(signature));
    if let Some(chain_id) = bundle.chain_id.filter(|chain_id| !chain_id.is_empty()) {
        payload.insert("chain_id".into(), Value::String(chain_id.to_string()));
    }
    Ok(ProtocolMessage::new(
        MessageType::Publish,
        sender_id,
        Value::Object(payload),
    ))
}

/// Sanitized and re-addressed copies of the assets that leave this node.
#[derive(Clone, Debug, PartialEq)]
pub struct PublishAssets {
    pub gene: Value,
    pub capsule: Value,
    pub event: Option<Value>,
}

/// Synthesizes a minimal gene from the capsule when none was used.
pub fn prepare_publish_assets(
    gene: Option<&Gene>,
    capsule: &Capsule,
    event: Option<&EvolutionEvent>,
) -> Result<PublishAssets, NetworkError> {
    let mut gene_value = match gene {
        Some(gene) => sanitize_payload(&serde_json::to_value(gene).map_err(serde_err)?),
        None => json!({
            "type": "Gene",
            "id": capsule
                .gene
                .clone()
                .unwrap_or_else(|| format!("gene_auto_{}", capsule.id)),
            "category": event.map(|event| event.intent).unwrap_or(GeneCategory::Repair),
            "signals_match": capsule.trigger,
            "summary": capsule.summary,
        }),
    };
    readdress(&mut gene_value);

    let mut capsule_value = sanitize_payload(&serde_json::to_value(capsule).map_err(serde_err)?);
    readdress(&mut capsule_value);

    let event_value = match event {
        Some(event) => {
            let mut value = sanitize_payload(&serde_json::to_value(event).map_err(serde_err)?);
            readdress(&mut value);
            Some(value)
        }
        None => None,
    };

    Ok(PublishAssets {
        gene: gene_value,
        capsule: capsule_value,
        event: event_value,
    })
}

// ---------------------------------------------------------------------------
// Broadcast eligibility
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct A2aLimits {
    pub max_files: usize,
    pub max_lines: usize,
}

impl Default for A2aLimits {
    fn default() -> Self {
        Self {
            max_files: 5,
            max_lines: 200,
        }
    }
}

pub fn is_blast_radius_safe(blast: &BlastRadius, limits: &A2aLimits) -> bool {
    blast.files <= limits.max_files && blast.lines <= limits.max_lines
}

/// Consecutive successes for the capsule, counted back from the newest event.
pub fn compute_capsule_success_streak(capsule_id: &str, events: &[EvolutionEvent]) -> u32 {
    if capsule_id.is_empty() {
        return 0;
    }
    let mut streak = 0;
    for event in events.iter().rev() {
        if event.capsule_id.as_deref() != Some(capsule_id) {
            continue;
        }
        if event.outcome.status != OutcomeStatus::Success {
            break;
        }
        streak += 1;
    }
    streak
}

pub fn is_capsule_broadcast_eligible(
    capsule: &Capsule,
    events: &[EvolutionEvent],
    limits: &A2aLimits,
) -> bool {
    capsule.outcome.score >= 0.7
        && is_blast_radius_safe(&capsule.blast_radius, limits)
        && compute_capsule_success_streak(&capsule.id, events) >= 2
}

pub fn is_gene_broadcast_eligible(gene: &Gene) -> bool {
    !gene.id.is_empty() && !gene.strategy.is_empty() && !gene.validation.is_empty()
}

// ---------------------------------------------------------------------------
// External intake
// ---------------------------------------------------------------------------

pub fn is_allowed_a2a_asset(asset: &Value) -> bool {
    matches!(
        asset.get("type").and_then(Value::as_str),
        Some("Gene" | "Capsule" | "EvolutionEvent")
    )
}

/// The asset inside a publish message, or the value itself when it already is an asset.
pub fn unwrap_asset_from_message(input: &Value) -> Option<Value> {
    if input.get("protocol").and_then(Value::as_str) == Some(PROTOCOL_NAME)
        && input.get("message_type").and_then(Value::as_str) == Some("publish")
    {
        return input
            .get("payload")
            .and_then(|payload| payload.get("asset"))
            .filter(|asset| asset.is_object())
            .cloned();
    }
    is_allowed_a2a_asset(input).then(|| input.clone())
}

/// Accepts a JSON array, a single JSON object, or JSONL.
pub fn parse_a2a_input(text: &str) -> Vec<Value> {
    let raw = text.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => {
            return items
                .into_iter()
                .filter(|item| !item.is_null())
                .map(|item| unwrap_asset_from_message(&item).unwrap_or(item))
                .collect();
        }
        Ok(value @ Value::Object(_)) => {
            return vec![unwrap_asset_from_message(&value).unwrap_or(value)];
        }
        _ => {}
    }
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .map(|value| unwrap_asset_from_message(&value).unwrap_or(value))
        .collect()
}

#[derive(Clone, Debug)]
pub struct LowerConfidence {
    pub factor: f64,
    pub source: String,
    pub received_at: Option<String>,
}

impl Default for LowerConfidence {
    fn default() -> Self {
        Self {
            factor: 0.6,
            source: "external".into(),
            received_at: None,
        }
    }
}

/// Marks a received asset as an external candidate. Capsule confidence is scaled by `factor`.
pub fn lower_confidence(asset: &Value, options: &LowerConfidence) -> Option<Value> {
    if !is_allowed_a2a_asset(asset) {
        return None;
    }
    let mut cloned = asset.clone();
    let map = cloned.as_object_mut()?;
    if map.get("type").and_then(Value::as_str) == Some("Capsule") {
        if let Some(confidence) = map.get("confidence").and_then(Value::as_f64) {
            map.insert(
                "confidence".into(),
                json!(clamp01(confidence * options.factor)),
            );
        }
    }
    let a2a = map
        .entry("a2a")
        .or_insert_with(|| Value::Object(Map::new()));
    if !a2a.is_object() {
        *a2a = Value::Object(Map::new());
    }
    if let Some(a2a) = a2a.as_object_mut() {
        a2a.insert("status".into(), json!("external_candidate"));
        a2a.insert("source".into(), json!(options.source));
        a2a.insert(
            "received_at".into(),
            json!(options.received_at.clone().unwrap_or_else(now_iso)),
        );
        a2a.insert("confidence_factor".into(), json!(options.factor));
    }
    let needs_schema = map
        .get("schema_version")
        .and_then(Value::as_str)
        .map(str::is_empty)
        .unwrap_or(true);
    if needs_schema {
        map.insert("schema_version".into(), json!(SCHEMA_VERSION));
    }
    let needs_id = map
        .get("asset_id")
        .and_then(Value::as_str)
        .map(str::is_empty)
        .unwrap_or(true);
    if needs_id {
        let asset_id = compute_asset_id(&cloned);
        if let Some(map) = cloned.as_object_mut() {
            map.insert("asset_id".into(), json!(asset_id));
        }
    }
    Some(cloned)
}

// ---------------------------------------------------------------------------
// Publish policy and hub transport
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub auto_publish: bool,
    pub visibility: Visibility,
    pub min_publish_score: f64,
    /// Falls back to the node id when unset.
    pub node_secret: Option<String>,
    pub node_id: Option<String>,
    pub a2a_max_files: usize,
    pub a2a_max_lines: usize,
}

impl Default for PublishConfig {
    fn default() -> Self {
        let limits = A2aLimits::default();
        Self {
            auto_publish: true,
            visibility: Visibility::Public,
            min_publish_score: 0.78,
            node_secret: None,
            node_id: None,
            a2a_max_files: limits.max_files,
            a2a_max_lines: limits.max_lines,
        }
    }
}

impl PublishConfig {
    pub fn limits(&self) -> A2aLimits {
        A2aLimits {
            max_files: self.a2a_max_files,
            max_lines: self.a2a_max_lines,
        }
    }

    /// First applicable reason not to publish, in precedence order.
    pub fn skip_reason(&self, source_type: SourceType, score: f64) -> Option<&'static str> {
        if !self.auto_publish {
            Some("auto_publish_disabled")
        } else if self.visibility != Visibility::Public {
            Some("visibility_private")
        } else if source_type == SourceType::Reused {
            Some("skip_direct_reused_asset")
        } else if score < self.min_publish_score {
            Some("below_min_score")
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PublishResult {
    pub attempted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub bundle: bool,
}

impl PublishResult {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            attempted: false,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskCompleteResult {
    pub attempted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[async_trait]
pub trait HubClient: Send + Sync {
    async fn send(&self, message: &ProtocolMessage) -> Result<Value, NetworkError>;
    async fn complete_task(&self, task_id: &str, asset_id: &str) -> Result<bool, NetworkError>;
}

/// Outbox/inbox JSONL directories, one file per message type.
pub struct FileTransport {
    dir: PathBuf,
}

impl FileTransport {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    fn append(&self, file_name: &str, line: &Value) -> Result<PathBuf, NetworkError> {
        let outbox = self.dir.join("outbox");
        fs::create_dir_all(&outbox).map_err(transport_err)?;
        let path = outbox.join(file_name);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(transport_err)?;
        let text = serde_json::to_string(line).map_err(serde_err)?;
        file.write_all(text.as_bytes()).map_err(transport_err)?;
        file.write_all(b"\n").map_err(transport_err)?;
        Ok(path)
    }

    pub fn receive(&self) -> Vec<ProtocolMessage> {
        let Ok(entries) = fs::read_dir(self.dir.join("inbox")) else {
            return Vec::new();
        };
        let mut files = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("jsonl"))
            .collect::<Vec<_>>();
        files.sort();
        let mut messages = Vec::new();
        for path in files {
            let Ok(text) = fs::read_to_string(&path) else {
                continue;
            };
            messages.extend(
                text.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .filter_map(|line| serde_json::from_str::<ProtocolMessage>(line).ok())
                    .filter(|message| message.protocol == PROTOCOL_NAME),
            );
        }
        messages
    }
}

#[async_trait]
impl HubClient for FileTransport {
    async fn send(&self, message: &ProtocolMessage) -> Result<Value, NetworkError> {
        let value = serde_json::to_value(message).map_err(serde_err)?;
        let path = self.append(&format!("{}.jsonl", message.message_type.as_str()), &value)?;
        log::info!(
            "a2a message written type={} message_id={} path={}",
            message.message_type.as_str(),
            message.message_id,
            path.display()
        );
        Ok(json!({"ok": true, "path": path.to_string_lossy()}))
    }

    async fn complete_task(&self, task_id: &str, asset_id: &str) -> Result<bool, NetworkError> {
        self.append(
            "task_complete.jsonl",
            &json!({"task_id": task_id, "asset_id": asset_id, "at": now_iso()}),
        )?;
        Ok(true)
    }
}

fn require_asset(asset: &Value, kind: &str) -> Result<(), NetworkError> {
    let typed = asset.get("type").and_then(Value::as_str) == Some(kind);
    let has_id = asset
        .get("id")
        .and_then(Value::as_str)
        .map(|id| !id.is_empty())
        .unwrap_or(false);
    if typed && has_id {
        Ok(())
    } else {
        Err(NetworkError::InvalidAsset(format!(
            "publish bundle requires a {kind} with type and id"
        )))
    }
}

fn existing_or_computed_asset_id(asset: &Value) -> String {
    asset
        .get("asset_id")
        .and_then(Value::as_str)
        .filter(|asset_id| !asset_id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| compute_asset_id(asset))
}

fn readdress(asset: &mut Value) {
    let asset_id = compute_asset_id(asset);
    if let Some(map) = asset.as_object_mut() {
        map.insert("asset_id".into(), Value::String(asset_id));
    }
}

fn serde_err(err: serde_json::Error) -> NetworkError {
    NetworkError::Serde(err.to_string())
}

fn transport_err(err: std::io::Error) -> NetworkError {
    NetworkError::Transport(err.to_string())
}
