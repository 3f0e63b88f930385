use std::collections::HashSet;
use std::path::Path;

use crate::config::Config;
use crate::user_store::{DiskUserStore, UserStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CheckResult {
    pub name: &'static str,
    pub severity: Severity,
    pub passed: bool,
    pub message: String,
}

#[derive(Debug, Default)]
pub(crate) struct CheckReport {
    pub results: Vec<CheckResult>,
}

impl CheckReport {
    pub(crate) fn push(&mut self, result: CheckResult) {
        self.results.push(result);
    }

    fn check(&mut self, name: &'static str, severity: Severity, passed: bool, message: String) {
        self.push(CheckResult {
            name,
            severity,
            passed,
            message,
        });
    }

    pub(crate) fn has_errors(&self) -> bool {
        self.results
            .iter()
            .any(|r| r.severity == Severity::Error && !r.passed)
    }

    fn count(&self, severity: Severity) -> usize {
        self.results
            .iter()
            .filter(|r| r.severity == severity && !r.passed)
            .count()
    }

    fn format_result(r: &CheckResult) -> String {
        let icon = if r.severity == Severity::Info {
            "·"
        } else if r.passed {
            "✓"
        } else {
            match r.severity {
                Severity::Warning => "⚠",
                _ => "✗",
            }
        };
        format!("{icon} {}", r.message)
    }

    pub(crate) fn to_summary_string(&self) -> String {
        let mut lines: Vec<String> = self.results.iter().map(Self::format_result).collect();
        let errors = self.count(Severity::Error);
        let warnings = self.count(Severity::Warning);
        if errors == 0 && warnings == 0 {
            lines.push("\nall checks passed".to_owned());
        } else {
            lines.push(format!("\n{errors} error(s), {warnings} warning(s)"));
        }
        lines.join("\n")
    }

    pub(crate) fn print_human(&self) {
        println!("{}", self.to_summary_string());
    }

    pub(crate) fn print_json(&self) {
        let value = self.to_json_value();
        println!(
            "{}",
            serde_json::to_string_pretty(&value).unwrap_or_default()
        );
    }

    pub(crate) fn to_json_value(&self) -> serde_json::Value {
        let checks: Vec<serde_json::Value> = self
            .results
            .iter()
            .map(|r| {
                serde_json::json!({
                    "name": r.name,
                    "severity": r.severity.as_str(),
                    "passed": r.passed,
                    "message": r.message,
                })
            })
            .collect();

        serde_json::json!({
            "passed": !self.has_errors(),
            "errors": self.count(Severity::Error),
            "warnings": self.count(Severity::Warning),
            "checks": checks,
        })
    }
}

/// Validate a config file without starting anything.
pub(crate) fn validate_config(config_path: &Path) -> CheckReport {
    let mut report = CheckReport::default();

    let config = match Config::load(config_path) {
        Ok(c) => {
            report.check(
                "toml_parse",
                Severity::Error,
                true,
                format!("config syntax valid: {}", config_path.display()),
            );
            c
        }
        Err(e) => {
            report.check("toml_parse", Severity::Error, false, format!("{e:#}"));
            return report;
        }
    };

    let admin_ok = config.admin.id > 0;
    report.check(
        "admin_id",
        Severity::Error,
        admin_ok,
        if admin_ok {
            format!("admin: {}", config.admin.id)
        } else {
            format!("admin.id must be a positive user id, got {}", config.admin.id)
        },
    );

    check_secret(&mut report, "telegram_token", &config.telegram.token_env);
    check_secret(&mut report, "completion_key", &config.completion.api_key_env);
    check_secret(&mut report, "speech_key", &config.speech.api_key_env);

    check_limits(&mut report, &config);
    check_models(&mut report, &config);
    check_users_file(&mut report, &config);

    report
}

fn check_secret(report: &mut CheckReport, name: &'static str, var: &str) {
    let present = std::env::var(var).is_ok_and(|v| !v.trim().is_empty());
    report.check(
        name,
        Severity::Error,
        present,
        if present {
            format!("{var}: present")
        } else {
            format!("{var} environment variable not set")
        },
    );
}

fn check_limits(report: &mut CheckReport, config: &Config) {
    let limits = &config.limits;

    let ceiling_ok = limits.usage_ceiling.is_finite() && limits.usage_ceiling >= 0.0;
    report.check(
        "usage_ceiling",
        Severity::Error,
        ceiling_ok,
        if ceiling_ok {
            format!("usage ceiling: ${:.2}", limits.usage_ceiling)
        } else {
            format!(
                "limits.usage_ceiling must be a non-negative number, got {}",
                limits.usage_ceiling
            )
        },
    );

    let timeout_ok = limits.service_timeout_secs > 0;
    report.check(
        "service_timeout",
        Severity::Error,
        timeout_ok,
        if timeout_ok {
            format!("service timeout: {}s", limits.service_timeout_secs)
        } else {
            "limits.service_timeout_secs must be greater than zero".to_owned()
        },
    );

    let window_ok = limits.summary_window > 0;
    report.check(
        "summary_window",
        Severity::Warning,
        window_ok,
        if window_ok {
            format!("summary window: {} messages", limits.summary_window)
        } else {
            "limits.summary_window is 0, summaries will see no messages".to_owned()
        },
    );
}

fn check_models(report: &mut CheckReport, config: &Config) {
    if config.models.is_empty() {
        report.check(
            "models",
            Severity::Info,
            true,
            "models: built-in price table".to_owned(),
        );
        return;
    }

    let mut seen = HashSet::new();
    for model in &config.models {
        if !seen.insert(model.name.as_str()) {
            report.check(
                "models",
                Severity::Error,
                false,
                format!("duplicate model '{}'", model.name),
            );
        }
        if model.prompt_price < 0.0 || model.completion_price < 0.0 {
            report.check(
                "models",
                Severity::Error,
                false,
                format!("model '{}' has a negative price", model.name),
            );
        }
    }

    let open = config.models.iter().filter(|m| !m.restricted).count();
    report.check(
        "models_available",
        Severity::Warning,
        open > 0,
        if open > 0 {
            format!("models: {} configured, {open} open to all users", config.models.len())
        } else {
            "every configured model is restricted, only the admin can chat".to_owned()
        },
    );
}

fn check_users_file(report: &mut CheckReport, config: &Config) {
    let path = config.users_path();
    if !path.exists() {
        report.check(
            "users_file",
            Severity::Info,
            true,
            format!("users file: {} (will be created)", path.display()),
        );
        return;
    }

    let loaded = DiskUserStore::new(&path).and_then(|store| store.load_all());
    match loaded {
        Ok(users) => report.check(
            "users_file",
            Severity::Error,
            true,
            format!("users file: {} ({} users)", path.display(), users.len()),
        ),
        Err(e) => report.check("users_file", Severity::Error, false, format!("{e:#}")),
    }
}
