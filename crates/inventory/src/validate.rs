//! Kubernetes label syntax checks.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::Labels;

const VALUE_PATTERN: &str = r"^(([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9])?$";
const KEY_NAME_PATTERN: &str = r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$";
const KEY_PREFIX_PATTERN: &str = r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$";

static VALUE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(VALUE_PATTERN).expect("static regex"));
static KEY_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(KEY_NAME_PATTERN).expect("static regex"));
static KEY_PREFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(KEY_PREFIX_PATTERN).expect("static regex"));

const RESERVED_PREFIXES: [&str; 2] = ["kubernetes.io", "k8s.io"];

/// Returns one message per violation; empty when every label is valid.
pub fn validate_labels(labels: &Labels) -> Vec<String> {
    let mut errs = Vec::new();
    for (k, v) in labels {
        if v.len() > 63 {
            errs.push(format!("Label value longer than 63 chars: {}", v));
        }
        if !VALUE_RE.is_match(v) {
            errs.push(format!("Label value is invalid, it needs to match '{}': {}", VALUE_PATTERN, v));
        }

        let (prefix, name) = match k.split('/').collect::<Vec<_>>().as_slice() {
            [name] => ("", *name),
            [prefix, name] => (*prefix, *name),
            [prefix, name, ..] => {
                errs.push(format!("Only one \"/\" allowed in label keys: {}", k));
                (*prefix, *name)
            }
            [] => ("", ""),
        };

        if name.len() > 63 {
            errs.push(format!("Label key name is longer than 63 chars: {}", name));
        }
        if !KEY_NAME_RE.is_match(name) {
            errs.push(format!("Label key name is invalid, it needs to match '{}': {}", KEY_NAME_PATTERN, name));
        }

        if !prefix.is_empty() {
            if prefix.len() > 253 {
                errs.push(format!("Label key prefix longer than 253 chars: {}", prefix));
            }
            if !KEY_PREFIX_RE.is_match(prefix) {
                errs.push(format!("Label key prefix is invalid, it needs to match '{}': {}", KEY_PREFIX_PATTERN, prefix));
            }
            if RESERVED_PREFIXES.contains(&prefix) {
                errs.push(format!("Label key prefix is reserved: {}", prefix));
            }
        }
    }
    errs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(k: &str, v: &str) -> Labels { Labels::from([(k.to_string(), v.to_string())]) }

    #[test]
    fn accepts_common_labels() {
        assert!(validate_labels(&one("env", "prod")).is_empty());
        assert!(validate_labels(&one("app.kubernetes.io/name", "billing-api")).is_empty());
        assert!(validate_labels(&one("team", "")).is_empty());
        assert!(validate_labels(&one("a_b.c-d", "X.y_z-1")).is_empty());
    }

    #[test]
    fn rejects_bad_values() {
        let errs = validate_labels(&one("env", "-prod"));
        assert_eq!(errs.len(), 1);
        assert!(errs[0].starts_with("Label value is invalid"), "errs={:?}", errs);

        let long = "a".repeat(64);
        let errs = validate_labels(&one("env", &long));
        assert!(errs.iter().any(|e| e.starts_with("Label value longer than 63 chars")));
    }

    #[test]
    fn rejects_bad_keys() {
        assert!(validate_labels(&one("a/b/c", "v")).iter().any(|e| e.contains("Only one \"/\"")));
        assert!(validate_labels(&one("Bad_Prefix/name", "v")).iter().any(|e| e.starts_with("Label key prefix is invalid")));
        assert!(validate_labels(&one("k8s.io/name", "v")).iter().any(|e| e.contains("reserved")));
        assert!(validate_labels(&one("-name", "v")).iter().any(|e| e.starts_with("Label key name is invalid")));
        assert!(validate_labels(&one(&"n".repeat(64), "v")).iter().any(|e| e.contains("longer than 63")));
    }

    #[test]
    fn reports_every_violation() {
        let mut labels = one("k8s.io/-x", "-y");
        labels.insert("ok".into(), "fine".into());
        let errs = validate_labels(&labels);
        // value, key name, reserved prefix
        assert_eq!(errs.len(), 3, "errs={:?}", errs);
    }
}
