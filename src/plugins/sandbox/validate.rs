//! Static pre-execution policy checks
//!
//! Pattern matching against known-dangerous Lua constructs. This is an
//! advisory pass: only process termination is fatal, everything else is
//! reported as a warning. Isolation itself comes from the sandbox globals.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use super::bindings::ALLOWED_MODULES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Fatal,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub rule: &'static str,
    pub message: String,
    pub line: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }

    pub fn fatal(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Fatal)
    }
}

static PROCESS_EXIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bos\s*\.\s*exit\b").unwrap());
static REQUIRE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\brequire\s*\(?\s*["']([^"']+)["']"#).unwrap());
static DYNAMIC_CODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(load|loadstring|loadfile|dofile)\s*\(|\bstring\s*\.\s*dump\b").unwrap()
});
static RESTRICTED_LIB: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(io|os|debug|package)\s*\.\s*(\w+)").unwrap());
static WHILE_TRUE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bwhile\s+true\s+do\b").unwrap());
static REPEAT_FOREVER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\brepeat\b.*?\buntil\s+false\b").unwrap());

fn line_of(code: &str, offset: usize) -> usize {
    code[..offset].matches('\n').count() + 1
}

/// Run the static policy pass over plugin source
pub fn validate_code(code: &str) -> ValidationReport {
    let mut issues = Vec::new();

    for m in PROCESS_EXIT.find_iter(code) {
        issues.push(ValidationIssue {
            severity: Severity::Fatal,
            rule: "process-exit",
            message: "Process termination (os.exit) is not allowed".to_string(),
            line: line_of(code, m.start()),
        });
    }

    for caps in REQUIRE.captures_iter(code) {
        let module = &caps[1];
        if !ALLOWED_MODULES.contains(&module) {
            issues.push(ValidationIssue {
                severity: Severity::Warning,
                rule: "restricted-module",
                message: format!("require of restricted module '{}'", module),
                line: line_of(code, caps.get(0).map_or(0, |m| m.start())),
            });
        }
    }

    for m in DYNAMIC_CODE.find_iter(code) {
        issues.push(ValidationIssue {
            severity: Severity::Warning,
            rule: "dynamic-code",
            message: format!("Dynamic code construct '{}'", m.as_str().trim_end_matches('(').trim()),
            line: line_of(code, m.start()),
        });
    }

    for caps in RESTRICTED_LIB.captures_iter(code) {
        if &caps[1] == "os" && &caps[2] == "exit" {
            continue;
        }
        issues.push(ValidationIssue {
            severity: Severity::Warning,
            rule: "restricted-library",
            message: format!("Access to restricted library '{}.{}'", &caps[1], &caps[2]),
            line: line_of(code, caps.get(0).map_or(0, |m| m.start())),
        });
    }

    for m in WHILE_TRUE.find_iter(code).chain(REPEAT_FOREVER.find_iter(code)) {
        issues.push(ValidationIssue {
            severity: Severity::Warning,
            rule: "unbounded-loop",
            message: "Potentially unbounded loop".to_string(),
            line: line_of(code, m.start()),
        });
    }

    issues.sort_by_key(|issue| issue.line);
    let valid = !issues.iter().any(|i| i.severity == Severity::Fatal);

    ValidationReport { valid, issues }
}
