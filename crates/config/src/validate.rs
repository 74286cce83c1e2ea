//! Configuration validation.
//!
//! Detects unknown or misspelled fields, dangling references between
//! sections, malformed chat patterns and risky instance settings.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};

use serde_json::Value;

use crate::schema::{PlatformKind, WxRelayConfig};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "type-error", "reference",
    /// "pattern", "range", "security"
    pub category: &'static str,
    /// Dotted path, e.g. "rules[0].platform_id"
    pub path: String,
    pub message: String,
}

impl Diagnostic {
    fn new(
        severity: Severity,
        category: &'static str,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result of validating a configuration file.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<PathBuf>,
}

impl ValidationResult {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

// ── Schema tree for unknown-field detection ─────────────────────────────────

enum KnownKeys {
    Struct(HashMap<&'static str, KnownKeys>),
    Array(Box<KnownKeys>),
    /// Scalar or free-form value; recursion stops here.
    Leaf,
}

fn build_schema_map() -> KnownKeys {
    use KnownKeys::{Array, Leaf, Struct};

    let listener = Struct(HashMap::from([
        ("poll_interval_secs", Leaf),
        ("listener_poll_interval_secs", Leaf),
        ("max_listeners_per_instance", Leaf),
        ("timeout_minutes", Leaf),
        ("eviction_interval_secs", Leaf),
        ("startup_grace_secs", Leaf),
        ("last_chance_buffer_secs", Leaf),
        ("endpoint_timeout_secs", Leaf),
        ("main_window_enabled", Leaf),
        ("restart_delay_secs", Leaf),
    ]));
    let delivery = Struct(HashMap::from([
        ("poll_interval_secs", Leaf),
        ("batch_size", Leaf),
        ("merge_enabled", Leaf),
        ("merge_window_secs", Leaf),
        ("max_concurrent", Leaf),
        ("platform_timeout_secs", Leaf),
    ]));
    let sender = Struct(HashMap::from([
        ("max_retries", Leaf),
        ("retry_backoff_ms", Leaf),
        ("echo_window_secs", Leaf),
    ]));
    let instance = Struct(HashMap::from([
        ("id", Leaf),
        ("name", Leaf),
        ("base_url", Leaf),
        ("api_key", Leaf),
        ("enabled", Leaf),
    ]));
    let platform = Struct(HashMap::from([
        ("id", Leaf),
        ("name", Leaf),
        ("kind", Leaf),
        ("enabled", Leaf),
        ("send_mode", Leaf),
        ("api_key", Leaf),
        ("options", Leaf),
    ]));
    let rule = Struct(HashMap::from([
        ("rule_id", Leaf),
        ("name", Leaf),
        ("instance_id", Leaf),
        ("chat_pattern", Leaf),
        ("platform_id", Leaf),
        ("priority", Leaf),
        ("enabled", Leaf),
        ("only_at_messages", Leaf),
        ("at_names", Leaf),
        ("reply_at_sender", Leaf),
    ]));
    let fixed = Struct(HashMap::from([
        ("session_name", Leaf),
        ("enabled", Leaf),
        ("description", Leaf),
    ]));

    Struct(HashMap::from([
        ("database", Struct(HashMap::from([("path", Leaf)]))),
        ("listener", listener),
        ("delivery", delivery),
        ("sender", sender),
        ("instances", Array(Box::new(instance))),
        ("platforms", Array(Box::new(platform))),
        ("rules", Array(Box::new(rule))),
        ("fixed_listeners", Array(Box::new(fixed))),
    ]))
}

// ── Levenshtein distance ────────────────────────────────────────────────────

fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_chars.len()]
}

fn suggest<'a>(needle: &str, candidates: &[&'a str], max_distance: usize) -> Option<&'a str> {
    candidates
        .iter()
        .map(|c| (*c, levenshtein(needle, c)))
        .filter(|(_, d)| *d > 0 && *d <= max_distance)
        .min_by_key(|(_, d)| *d)
        .map(|(c, _)| c)
}

// ── Core validation ─────────────────────────────────────────────────────────

/// Validate a config file at `path`, or the discovered config file when
/// `path` is `None`.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = path
        .map(Path::to_path_buf)
        .or_else(crate::loader::find_config_file);

    let Some(actual_path) = config_path else {
        return ValidationResult {
            diagnostics: vec![Diagnostic::new(
                Severity::Info,
                "syntax",
                "",
                "no config file found; using defaults",
            )],
            config_path: None,
        };
    };

    let raw = match std::fs::read_to_string(&actual_path) {
        Ok(raw) => crate::env_subst::substitute_env(&raw),
        Err(e) => {
            return ValidationResult {
                diagnostics: vec![Diagnostic::new(
                    Severity::Error,
                    "syntax",
                    "",
                    format!("failed to read config file: {e}"),
                )],
                config_path: Some(actual_path),
            };
        },
    };

    let format = actual_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("toml")
        .to_string();
    let mut result = validate_str(&raw, &format);
    result.config_path = Some(actual_path);
    result
}

/// Validate config text in the given format (`toml`, `yaml`, `yml`, `json`).
#[must_use]
pub fn validate_str(raw: &str, format: &str) -> ValidationResult {
    let mut diagnostics = Vec::new();

    let parsed: Result<Value, String> = match format {
        "toml" => toml::from_str::<toml::Table>(raw)
            .map_err(|e| e.to_string())
            .and_then(|v| serde_json::to_value(v).map_err(|e| e.to_string())),
        "yaml" | "yml" => serde_yaml::from_str::<Value>(raw).map_err(|e| e.to_string()),
        "json" => serde_json::from_str::<Value>(raw).map_err(|e| e.to_string()),
        other => Err(format!("unsupported config format: .{other}")),
    };
    let value = match parsed {
        Ok(Value::Null) => Value::Object(Default::default()),
        Ok(v) => v,
        Err(e) => {
            diagnostics.push(Diagnostic::new(Severity::Error, "syntax", "", e));
            return ValidationResult {
                diagnostics,
                config_path: None,
            };
        },
    };

    check_unknown_fields(&value, &build_schema_map(), "", &mut diagnostics);

    match serde_json::from_value::<WxRelayConfig>(value) {
        Ok(config) => check_semantics(&config, &mut diagnostics),
        Err(e) => diagnostics.push(Diagnostic::new(
            Severity::Error,
            "type-error",
            "",
            format!("type error: {e}"),
        )),
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

fn check_unknown_fields(
    value: &Value,
    schema: &KnownKeys,
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match (value, schema) {
        (Value::Object(map), KnownKeys::Struct(fields)) => {
            let known: Vec<&str> = fields.keys().copied().collect();
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                match fields.get(key.as_str()) {
                    Some(child_schema) => {
                        check_unknown_fields(child, child_schema, &path, diagnostics);
                    },
                    None => {
                        let message = match suggest(key, &known, 3) {
                            Some(s) => format!("unknown field (did you mean \"{s}\"?)"),
                            None => "unknown field".to_string(),
                        };
                        diagnostics.push(Diagnostic::new(
                            Severity::Error,
                            "unknown-field",
                            path,
                            message,
                        ));
                    },
                }
            }
        },
        (Value::Array(items), KnownKeys::Array(item_schema)) => {
            for (i, item) in items.iter().enumerate() {
                check_unknown_fields(item, item_schema, &format!("{prefix}[{i}]"), diagnostics);
            }
        },
        _ => {},
    }
}

fn duplicates<'a>(ids: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    let mut seen = HashSet::new();
    ids.filter(|id| !seen.insert(*id)).collect()
}

fn is_local_host(url: &str) -> bool {
    let authority = url.split("://").nth(1).unwrap_or(url);
    if authority.starts_with("[::1]") {
        return true;
    }
    let host = authority.split(['/', ':']).next().unwrap_or_default();
    matches!(host, "127.0.0.1" | "localhost")
}

/// Run semantic checks on a successfully parsed config.
fn check_semantics(config: &WxRelayConfig, diagnostics: &mut Vec<Diagnostic>) {
    use Severity::{Error, Info, Warning};

    for id in duplicates(config.instances.iter().map(|i| i.id.as_str())) {
        diagnostics.push(Diagnostic::new(
            Error,
            "reference",
            "instances",
            format!("duplicate instance id \"{id}\""),
        ));
    }
    for id in duplicates(config.platforms.iter().map(|p| p.id.as_str())) {
        diagnostics.push(Diagnostic::new(
            Error,
            "reference",
            "platforms",
            format!("duplicate platform id \"{id}\""),
        ));
    }
    for id in duplicates(config.rules.iter().map(|r| r.rule_id.as_str())) {
        diagnostics.push(Diagnostic::new(
            Error,
            "reference",
            "rules",
            format!("duplicate rule id \"{id}\""),
        ));
    }
    for name in duplicates(config.fixed_listeners.iter().map(|f| f.session_name.as_str())) {
        diagnostics.push(Diagnostic::new(
            Warning,
            "reference",
            "fixed_listeners",
            format!("fixed listener \"{name}\" is declared more than once"),
        ));
    }

    if config.instances.is_empty() {
        diagnostics.push(Diagnostic::new(
            Info,
            "reference",
            "instances",
            "no instances configured; nothing will be listened to",
        ));
    }

    for (idx, inst) in config.instances.iter().enumerate() {
        let path = format!("instances[{idx}]");
        if inst.id.trim().is_empty() {
            diagnostics.push(Diagnostic::new(Error, "reference", &path, "instance id is empty"));
        }
        if !(inst.base_url.starts_with("http://") || inst.base_url.starts_with("https://")) {
            diagnostics.push(Diagnostic::new(
                Error,
                "reference",
                format!("{path}.base_url"),
                format!("base_url \"{}\" must start with http:// or https://", inst.base_url),
            ));
        } else if inst.base_url.starts_with("http://")
            && inst.api_key.is_some()
            && !is_local_host(&inst.base_url)
        {
            diagnostics.push(Diagnostic::new(
                Warning,
                "security",
                format!("{path}.api_key"),
                "api key is sent over plain http to a non-local host",
            ));
        }
    }

    for (idx, platform) in config.platforms.iter().enumerate() {
        let path = format!("platforms[{idx}].options");
        let required: &[&str] = match platform.kind {
            PlatformKind::Webhook => &["url"],
            PlatformKind::Openai => &["base_url", "model"],
            PlatformKind::Keyword => &[],
        };
        for key in required {
            if platform.options.get(*key).and_then(Value::as_str).is_none() {
                diagnostics.push(Diagnostic::new(
                    Error,
                    "reference",
                    &path,
                    format!("platform \"{}\" is missing option \"{key}\"", platform.id),
                ));
            }
        }
    }

    let instance_ids: HashSet<&str> = config.instances.iter().map(|i| i.id.as_str()).collect();
    for (idx, rule) in config.rules.iter().enumerate() {
        let path = format!("rules[{idx}]");
        match config.platform(&rule.platform_id) {
            None => diagnostics.push(Diagnostic::new(
                Error,
                "reference",
                format!("{path}.platform_id"),
                format!("unknown platform \"{}\"", rule.platform_id),
            )),
            Some(p) if !p.enabled && rule.enabled => diagnostics.push(Diagnostic::new(
                Warning,
                "reference",
                format!("{path}.platform_id"),
                format!("rule is enabled but platform \"{}\" is disabled", p.id),
            )),
            Some(_) => {},
        }
        if rule.instance_id != "*" && !instance_ids.contains(rule.instance_id.as_str()) {
            diagnostics.push(Diagnostic::new(
                Warning,
                "reference",
                format!("{path}.instance_id"),
                format!("rule targets unknown instance \"{}\"", rule.instance_id),
            ));
        }
        if let Some(expr) = rule.chat_pattern.strip_prefix("regex:")
            && let Err(e) = regex::Regex::new(expr)
        {
            diagnostics.push(Diagnostic::new(
                Error,
                "pattern",
                format!("{path}.chat_pattern"),
                format!("invalid regex: {e}"),
            ));
        }
        if rule.only_at_messages && rule.at_names.iter().all(|n| n.trim().is_empty()) {
            diagnostics.push(Diagnostic::new(
                Warning,
                "reference",
                format!("{path}.at_names"),
                "only_at_messages is set but at_names is empty; no message will pass",
            ));
        }
    }

    let ranges: [(&str, u64); 4] = [
        ("delivery.batch_size", config.delivery.batch_size as u64),
        ("delivery.max_concurrent", config.delivery.max_concurrent as u64),
        (
            "listener.max_listeners_per_instance",
            config.listener.max_listeners_per_instance as u64,
        ),
        ("listener.timeout_minutes", config.listener.timeout_minutes),
    ];
    for (path, value) in ranges {
        if value == 0 {
            diagnostics.push(Diagnostic::new(
                Error,
                "range",
                path,
                "must be greater than zero",
            ));
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
