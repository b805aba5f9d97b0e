//! Config validation: syntax, unknown keys, types, then semantic checks.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    path::{Path, PathBuf},
};

use serde_json::Value;

use crate::{
    env_subst::{substitute_env, unresolved_placeholders},
    loader::{self, Format},
    schema::{FlowlineConfig, TransportConfig},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    /// "syntax", "unknown-field", "type-error", "env", "semantic", "file-ref"
    pub category: &'static str,
    /// Dotted path, e.g. `service.poll_timeout_ms`. Empty for the whole file.
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

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{} [{}] {}", self.severity, self.category, self.message)
        } else {
            write!(
                f,
                "{} [{}] {}: {}",
                self.severity, self.category, self.path, self.message
            )
        }
    }
}

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

// ── Known keys ──────────────────────────────────────────────────────────────

enum KnownKeys {
    Struct(HashMap<&'static str, KnownKeys>),
    Leaf,
}

fn build_schema_map() -> KnownKeys {
    use KnownKeys::{Leaf, Struct};

    let leaves = |names: &[&'static str]| Struct(names.iter().map(|n| (*n, Leaf)).collect());

    Struct(HashMap::from([
        (
            "service",
            leaves(&[
                "name",
                "input_devices",
                "output_device",
                "poll_timeout_ms",
                "idle_backoff_ms",
                "max_batch_read_count",
                "wait_for_batch_count",
                "loop_failure_backoff_ms",
                "max_consecutive_failures",
                "max_inactivity_secs",
            ]),
        ),
        (
            "runner",
            leaves(&[
                "instances",
                "shutdown_timeout_secs",
                "restart_on_failure",
                "restart_backoff_ms",
                "live_check_interval_secs",
                "live_check_timeout_secs",
            ]),
        ),
        (
            "transport",
            leaves(&["kind", "root", "max_rollbacks", "fifo", "poll_interval_ms"]),
        ),
        (
            "wrappers",
            Struct(HashMap::from([
                ("compression", Leaf),
                ("short_circuit", leaves(&["fail_count", "cooldown_ms"])),
                ("rate_limit", leaves(&["actions", "per_ms"])),
                ("failover_root", Leaf),
                (
                    "message_store",
                    leaves(&["root", "threshold_bytes", "delete_on_commit"]),
                ),
            ])),
        ),
    ]))
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut diag = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let above = row[j + 1];
            row[j + 1] = (diag + usize::from(ca != *cb))
                .min(above + 1)
                .min(row[j] + 1);
            diag = above;
        }
    }
    row[b.len()]
}

fn suggest<'a>(needle: &str, candidates: &[&'a str]) -> Option<&'a str> {
    candidates
        .iter()
        .map(|c| (*c, levenshtein(needle, c)))
        .filter(|(_, d)| *d > 0 && *d <= 3)
        .min_by_key(|(_, d)| *d)
        .map(|(c, _)| c)
}

fn check_unknown_fields(value: &Value, schema: &KnownKeys, prefix: &str, out: &mut Vec<Diagnostic>) {
    let (Value::Object(map), KnownKeys::Struct(fields)) = (value, schema) else {
        return;
    };
    let mut known: Vec<&str> = fields.keys().copied().collect();
    known.sort_unstable();
    for (key, child) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match fields.get(key.as_str()) {
            Some(child_schema) => check_unknown_fields(child, child_schema, &path, out),
            None => {
                let message = match suggest(key, &known) {
                    Some(s) => format!("unknown field (did you mean \"{s}\"?)"),
                    None => "unknown field".to_string(),
                };
                out.push(Diagnostic::new(Severity::Error, "unknown-field", path, message));
            },
        }
    }
}

// ── Entry points ────────────────────────────────────────────────────────────

/// Validate the file at `path`, or the discovered config when `None`.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let Some(path) = path.map(Path::to_path_buf).or_else(loader::find_config_file) else {
        return ValidationResult {
            diagnostics: vec![Diagnostic::new(
                Severity::Info,
                "file-ref",
                "",
                "no config file found; using defaults",
            )],
            config_path: None,
        };
    };

    let mut result = match (Format::from_path(&path), std::fs::read_to_string(&path)) {
        (Err(e), _) => ValidationResult {
            diagnostics: vec![Diagnostic::new(Severity::Error, "syntax", "", e.to_string())],
            config_path: None,
        },
        (_, Err(e)) => ValidationResult {
            diagnostics: vec![Diagnostic::new(
                Severity::Error,
                "file-ref",
                "",
                format!("failed to read config file: {e}"),
            )],
            config_path: None,
        },
        (Ok(format), Ok(raw)) => validate_str(&substitute_env(&raw), format),
    };
    result.config_path = Some(path);
    result
}

/// Validate config text that has already had `${ENV}` substitution applied.
#[must_use]
pub fn validate_str(raw: &str, format: Format) -> ValidationResult {
    let mut diagnostics = Vec::new();

    for name in unresolved_placeholders(raw) {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "env",
            "",
            format!("environment variable {name} is not set"),
        ));
    }

    let value = match loader::parse_value(format, raw) {
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

    match serde_json::from_value::<FlowlineConfig>(value) {
        Ok(config) => diagnostics.extend(check_config(&config)),
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

/// Semantic checks on an already parsed config.
#[must_use]
pub fn check_config(config: &FlowlineConfig) -> Vec<Diagnostic> {
    let mut out = Vec::new();
    let mut error = |path: &str, message: &str| {
        out.push(Diagnostic::new(Severity::Error, "semantic", path, message));
    };

    let service = &config.service;
    if service.name.trim().is_empty() {
        error("service.name", "must not be empty");
    }
    if service.poll_timeout_ms == 0 {
        error("service.poll_timeout_ms", "must be positive");
    }
    if service.max_batch_read_count == 0 {
        error("service.max_batch_read_count", "must be at least 1");
    }
    if service.max_consecutive_failures == Some(0) {
        error("service.max_consecutive_failures", "must be at least 1 when set");
    }
    if service.max_inactivity_secs == Some(0) {
        error("service.max_inactivity_secs", "must be positive when set");
    }
    if service.input_devices.iter().any(|d| d.trim().is_empty()) {
        error("service.input_devices", "device names must not be empty");
    }

    if config.runner.instances == 0 {
        error("runner.instances", "must be at least 1");
    }
    if config.runner.live_check_interval_secs == Some(0) {
        error("runner.live_check_interval_secs", "must be positive when set");
    }

    if let TransportConfig::FileSystem(fs) = &config.transport
        && fs.root.as_os_str().is_empty()
    {
        error("transport.root", "required for the file_system transport");
    }

    let wrappers = &config.wrappers;
    if let Some(level) = wrappers.compression
        && !(-1..=9).contains(&level)
    {
        error("wrappers.compression", "zlib level must be between -1 and 9");
    }
    if let Some(sc) = &wrappers.short_circuit
        && sc.fail_count == 0
    {
        error("wrappers.short_circuit.fail_count", "must be at least 1");
    }
    if let Some(rl) = &wrappers.rate_limit {
        if rl.actions == 0 {
            error("wrappers.rate_limit.actions", "must be at least 1");
        }
        if rl.per_ms == 0 {
            error("wrappers.rate_limit.per_ms", "must be positive");
        }
    }
    if let Some(store) = &wrappers.message_store
        && store.root.as_os_str().is_empty()
    {
        error("wrappers.message_store.root", "required when the message store is enabled");
    }
    if wrappers.failover_root.is_some() && matches!(config.transport, TransportConfig::Memory) {
        error(
            "wrappers.failover_root",
            "failover needs the file_system transport",
        );
    }

    let mut seen = HashSet::new();
    for device in &service.input_devices {
        if !seen.insert(device.as_str()) {
            out.push(Diagnostic::new(
                Severity::Warning,
                "semantic",
                "service.input_devices",
                format!("'{device}' is listed more than once"),
            ));
        }
    }
    if let Some(output) = &service.output_device
        && service.input_devices.contains(output)
    {
        out.push(Diagnostic::new(
            Severity::Warning,
            "semantic",
            "service.output_device",
            format!("'{output}' is also an input device; messages will loop"),
        ));
    }
    if service.input_devices.is_empty() {
        out.push(Diagnostic::new(
            Severity::Warning,
            "semantic",
            "service.input_devices",
            "no input devices configured; `run` has nothing to poll",
        ));
    }
    if config.runner.instances > 1 && matches!(config.transport, TransportConfig::Memory) {
        out.push(Diagnostic::new(
            Severity::Warning,
            "semantic",
            "runner.instances",
            "memory queues are per process; instances will not share messages",
        ));
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, rstest::rstest};

    fn toml(raw: &str) -> ValidationResult {
        validate_str(raw, Format::Toml)
    }

    fn find<'a>(result: &'a ValidationResult, path: &str) -> Option<&'a Diagnostic> {
        result.diagnostics.iter().find(|d| d.path == path)
    }

    #[test]
    fn levenshtein_distances() {
        assert_eq!(levenshtein("runner", "runner"), 0);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("sevice", "service"), 1);
        assert_eq!(levenshtein("cat", "car"), 1);
    }

    #[test]
    fn minimal_config_has_no_errors() {
        let result = toml("[service]\ninput_devices = [\"in\"]\noutput_device = \"out\"\n");
        assert!(!result.has_errors(), "{:?}", result.diagnostics);
        assert_eq!(result.count(Severity::Warning), 0);
    }

    #[test]
    fn unknown_keys_get_suggestions() {
        let result = toml("[sevice]\nname = \"x\"\n[runner]\ninstance = 2\n");
        let top = find(&result, "sevice").unwrap();
        assert_eq!(top.category, "unknown-field");
        assert!(top.message.contains("\"service\""), "{}", top.message);
        let nested = find(&result, "runner.instance").unwrap();
        assert!(nested.message.contains("\"instances\""), "{}", nested.message);
    }

    #[test]
    fn syntax_errors_stop_validation() {
        let result = toml("[service\n");
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].category, "syntax");
    }

    #[test]
    fn type_errors_are_reported() {
        let result = toml("[service]\npoll_timeout_ms = \"soon\"\n");
        assert!(result.diagnostics.iter().any(|d| d.category == "type-error"));
    }

    #[rstest]
    #[case("[service]\npoll_timeout_ms = 0\n", "service.poll_timeout_ms")]
    #[case("[runner]\ninstances = 0\n", "runner.instances")]
    #[case("[transport]\nkind = \"file_system\"\n", "transport.root")]
    #[case("[wrappers]\ncompression = 12\n", "wrappers.compression")]
    #[case("[wrappers.rate_limit]\nactions = 0\n", "wrappers.rate_limit.actions")]
    #[case("[wrappers]\nfailover_root = \"/tmp/f\"\n", "wrappers.failover_root")]
    #[case("[wrappers.message_store]\nthreshold_bytes = 1024\n", "wrappers.message_store.root")]
    fn semantic_errors(#[case] raw: &str, #[case] path: &str) {
        let result = toml(raw);
        let d = find(&result, path).unwrap_or_else(|| panic!("no diagnostic for {path}: {:?}", result.diagnostics));
        assert_eq!(d.severity, Severity::Error);
    }

    #[test]
    fn looping_output_is_a_warning() {
        let result = toml("[service]\ninput_devices = [\"q\", \"q\"]\noutput_device = \"q\"\n");
        assert!(!result.has_errors());
        assert_eq!(result.count(Severity::Warning), 2);
    }

    #[test]
    fn unresolved_env_is_a_warning() {
        let result = toml("[service]\nname = \"${FLOWLINE_TEST_UNSET_VAR}\"\ninput_devices = [\"in\"]\n");
        let env = result.diagnostics.iter().find(|d| d.category == "env").unwrap();
        assert!(env.message.contains("FLOWLINE_TEST_UNSET_VAR"));
    }

    #[test]
    fn yaml_and_json_are_validated_too() {
        let yaml = validate_str("service:\n  naem: x\n", Format::Yaml);
        assert!(find(&yaml, "service.naem").is_some());
        let json = validate_str(r#"{"runner": {"instances": 0}}"#, Format::Json);
        assert!(json.has_errors());
    }

    #[test]
    fn validate_reads_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowline.toml");
        std::fs::write(&path, "[runner]\ninstances = 0\n").unwrap();
        let result = validate(Some(&path));
        assert_eq!(result.config_path.as_deref(), Some(path.as_path()));
        assert!(result.has_errors());
    }
}
