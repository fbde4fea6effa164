use std::collections::BTreeSet;
use std::sync::OnceLock;

use gep_evolution::stable_hash;
use regex::Regex;

const ERRSIG_PREFIX: &str = "errsig:";
const MAX_SIGNATURE_CHARS: usize = 220;

fn signature_rules() -> &'static [(Regex, &'static str)] {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (r"(?i)[a-z]:\\[^ \n\r\t]+", "<path>"),
            (r"/[^ \n\r\t]+", "<path>"),
            (r"(?i)\b0x[0-9a-f]+\b", "<hex>"),
            (r"\b[0-9]+\b", "<n>"),
            (r"\s+", " "),
        ]
        .into_iter()
        .filter_map(|(pattern, replacement)| {
            Regex::new(pattern).ok().map(|regex| (regex, replacement))
        })
        .collect()
    })
}

/// Lowercases an error text and masks paths, hex literals, and numbers so
/// that recurring errors share one signature.
pub fn normalize_error_signature(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut normalized = trimmed.to_lowercase();
    for (regex, replacement) in signature_rules() {
        normalized = regex.replace_all(&normalized, *replacement).into_owned();
    }
    Some(normalized.chars().take(MAX_SIGNATURE_CHARS).collect())
}

/// `errsig:<raw>` entries are replaced by `errsig_norm:<hash>` of their
/// normalized form; blanks are dropped.
pub fn normalize_signals_for_matching<S: AsRef<str>>(signals: &[S]) -> Vec<String> {
    let mut out = Vec::new();
    for signal in signals {
        let signal = signal.as_ref().trim();
        if signal.is_empty() {
            continue;
        }
        if let Some(raw) = signal.strip_prefix(ERRSIG_PREFIX) {
            if let Some(norm) = normalize_error_signature(raw) {
                out.push(format!("errsig_norm:{}", stable_hash(&norm)));
            }
            continue;
        }
        out.push(signal.to_string());
    }
    out
}

pub fn compute_signal_key<S: AsRef<str>>(signals: &[S]) -> String {
    let unique = normalize_signals_for_matching(signals)
        .into_iter()
        .collect::<BTreeSet<_>>();
    if unique.is_empty() {
        return "(none)".to_string();
    }
    unique.into_iter().collect::<Vec<_>>().join("|")
}

pub fn extract_error_signature<S: AsRef<str>>(signals: &[S]) -> Option<String> {
    signals
        .iter()
        .find_map(|signal| signal.as_ref().strip_prefix(ERRSIG_PREFIX))
        .and_then(normalize_error_signature)
}

pub fn jaccard<A: AsRef<str>, B: AsRef<str>>(left: &[A], right: &[B]) -> f64 {
    let left = normalize_signals_for_matching(left)
        .into_iter()
        .collect::<BTreeSet<_>>();
    let right = normalize_signals_for_matching(right)
        .into_iter()
        .collect::<BTreeSet<_>>();
    if left.is_empty() && right.is_empty() {
        return 1.0;
    }
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let intersection = left.intersection(&right).count();
    let union = left.len() + right.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

pub fn has_error_signal<S: AsRef<str>>(signals: &[S]) -> bool {
    signals.iter().any(|signal| signal.as_ref() == "log_error")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_signatures_mask_volatile_fragments() {
        let first = normalize_error_signature(
            "TypeError at /srv/app/index.js:42 code 0xDEADBEEF after 1500 ms",
        )
        .unwrap();
        assert_eq!(first, "typeerror at <path> code <hex> after <n> ms");
        let second = normalize_error_signature(
            "TypeError at /opt/other/main.js:7 code 0x1F after 3 ms",
        )
        .unwrap();
        assert_eq!(first, second);
        assert_eq!(
            normalize_error_signature("Failed to read C:\\Users\\me\\x.txt").unwrap(),
            "failed to read <path>"
        );
        assert_eq!(normalize_error_signature("   "), None);
    }

    #[test]
    fn signal_key_is_sorted_unique_and_normalized() {
        let key = compute_signal_key(&["perf_bottleneck", "log_error", "log_error"]);
        assert_eq!(key, "log_error|perf_bottleneck");
        assert_eq!(compute_signal_key::<&str>(&[]), "(none)");

        let first = compute_signal_key(&["errsig:Timeout after 30 ms in /a/b.js"]);
        let second = compute_signal_key(&["errsig:Timeout after 45 ms in /c/d.js"]);
        assert_eq!(first, second);
        assert!(first.starts_with("errsig_norm:"));
    }

    #[test]
    fn jaccard_handles_empty_sets() {
        assert_eq!(jaccard::<&str, &str>(&[], &[]), 1.0);
        assert_eq!(jaccard(&["a"], &[] as &[&str]), 0.0);
        assert!((jaccard(&["a", "b"], &["b", "c"]) - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn extract_error_signature_uses_first_errsig() {
        let signals = ["log_error", "errsig:Boom 12", "errsig:Other"];
        assert_eq!(extract_error_signature(&signals).as_deref(), Some("boom <n>"));
        assert!(has_error_signal(&signals));
    }
}
