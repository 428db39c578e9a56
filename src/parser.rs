//! Best-effort parsing of test runner and type checker output.
//!
//! The project's test and check commands are external and their output is
//! not guaranteed to be structured. Parsers pattern-match the summaries of
//! common tools (jest, vitest, mocha, pytest, cargo, tsc, rustc, mypy) and
//! flag anything they cannot read as `ambiguous` instead of failing.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::command::CommandOutput;

/// Maximum characters of raw output kept on a parsed result.
const MAX_OUTPUT_CHARS: usize = 20_000;

/// A single failing test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFailure {
    /// Test name or path as reported by the runner.
    pub name: String,
    /// First line of the failure message, if any.
    pub message: String,
}

/// Parsed outcome of a test run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    /// Exit code was zero and no failures were counted.
    pub success: bool,
    /// Total tests reported.
    pub total: u32,
    /// Passing tests.
    pub passed: u32,
    /// Failing tests.
    pub failed: u32,
    /// Skipped, ignored or pending tests.
    pub skipped: u32,
    /// Failure descriptions.
    pub failures: Vec<TestFailure>,
    /// Raw combined output (truncated).
    pub output: String,
    /// How long the run took.
    pub duration: Duration,
    /// No known summary format matched; counts are zero-confidence.
    pub ambiguous: bool,
}

impl TestResult {
    /// Fraction of tests that did not fail. No tests counts as passing.
    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        f64::from(self.total.saturating_sub(self.failed)) / f64::from(self.total)
    }
}

/// A single type-check diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCheckError {
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub code: Option<String>,
    pub message: String,
}

impl std::fmt::Display for TypeCheckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(file) = &self.file {
            write!(f, "{}", file)?;
            if let Some(line) = self.line {
                write!(f, ":{}", line)?;
                if let Some(column) = self.column {
                    write!(f, ":{}", column)?;
                }
            }
            write!(f, ": ")?;
        }
        if let Some(code) = &self.code {
            write!(f, "{} ", code)?;
        }
        write!(f, "{}", self.message)
    }
}

/// Parsed outcome of a static check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeCheckResult {
    /// Exit code was zero and no diagnostics were found.
    pub passed: bool,
    /// Diagnostics found.
    pub errors: Vec<TypeCheckError>,
    /// Raw combined output (truncated).
    pub output: String,
    /// How long the check took.
    pub duration: Duration,
    /// Failed but no diagnostic format matched.
    pub ambiguous: bool,
}

impl TypeCheckResult {
    /// Renders diagnostics as one line each.
    pub fn error_lines(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }
}

/// Parses the output of one external tool.
pub trait ResultParser: Send + Sync {
    /// The structured result.
    type Output;

    /// Parses a finished command. Must never panic on unknown formats.
    fn parse(&self, output: &CommandOutput) -> Self::Output;
}

/// Parses summaries of common test runners.
#[derive(Debug, Clone, Copy, Default)]
pub struct TestOutputParser;

/// Parses diagnostics of common type checkers and compilers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypeCheckOutputParser;

struct TestPatterns {
    cargo_summary: Regex,
    jest_summary_line: Regex,
    pytest_summary_line: Regex,
    mocha_count: Regex,
    count_pair: Regex,
    paren_total: Regex,
    jest_failure: Regex,
    cargo_failure: Regex,
    pytest_failure: Regex,
    vitest_failure: Regex,
}

fn test_patterns() -> &'static TestPatterns {
    static PATTERNS: OnceLock<TestPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| TestPatterns {
        cargo_summary: Regex::new(
            r"test result: \w+\. (\d+) passed; (\d+) failed; (\d+) ignored",
        )
        .expect("valid regex"),
        jest_summary_line: Regex::new(r"^\s*Tests:?\s").expect("valid regex"),
        pytest_summary_line: Regex::new(r"^=+ .*\b(passed|failed|error|errors)\b.* in [\d.]+s")
            .expect("valid regex"),
        mocha_count: Regex::new(r"^\s*(\d+) (passing|failing|pending)\b").expect("valid regex"),
        count_pair: Regex::new(
            r"(\d+) (passed|failed|skipped|todo|pending|total|error|errors|xfailed|xpassed)\b",
        )
        .expect("valid regex"),
        paren_total: Regex::new(r"\((\d+)\)").expect("valid regex"),
        jest_failure: Regex::new(r"^\s*● (.+)$").expect("valid regex"),
        cargo_failure: Regex::new(r"^test (\S+) \.\.\. FAILED$").expect("valid regex"),
        pytest_failure: Regex::new(r"^FAILED (\S+)(?: - (.*))?$").expect("valid regex"),
        vitest_failure: Regex::new(r"^\s*(?:[×✗]|FAIL\s+\S+\s+>)\s+(.+)$").expect("valid regex"),
    })
}

#[derive(Default)]
struct Counts {
    passed: u32,
    failed: u32,
    skipped: u32,
    total: Option<u32>,
    matched: bool,
}

impl Counts {
    fn add(&mut self, label: &str, n: u32) {
        match label {
            "passed" | "passing" | "xpassed" => self.passed = self.passed.saturating_add(n),
            "failed" | "failing" | "error" | "errors" => self.failed = self.failed.saturating_add(n),
            "skipped" | "todo" | "pending" | "ignored" | "xfailed" => {
                self.skipped = self.skipped.saturating_add(n)
            }
            "total" => self.total = Some(self.total.unwrap_or(0).saturating_add(n)),
            _ => {}
        }
        self.matched = true;
    }
}

fn parse_u32(text: &str) -> u32 {
    // Only called on `\d+` captures, so a parse error means overflow.
    text.parse().unwrap_or(u32::MAX)
}

fn truncate_output(output: &str) -> String {
    if output.chars().count() <= MAX_OUTPUT_CHARS {
        return output.to_string();
    }
    let skip = output.chars().count() - MAX_OUTPUT_CHARS;
    output.chars().skip(skip).collect()
}

fn tail_lines(output: &str, n: usize) -> String {
    let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

impl ResultParser for TestOutputParser {
    type Output = TestResult;

    fn parse(&self, output: &CommandOutput) -> TestResult {
        let patterns = test_patterns();
        let text = output.combined();
        let mut counts = Counts::default();
        let mut failures: Vec<TestFailure> = Vec::new();
        let lines: Vec<&str> = text.lines().collect();

        for (idx, line) in lines.iter().enumerate() {
            if let Some(caps) = patterns.cargo_summary.captures(line) {
                counts.add("passed", parse_u32(&caps[1]));
                counts.add("failed", parse_u32(&caps[2]));
                counts.add("ignored", parse_u32(&caps[3]));
            } else if patterns.jest_summary_line.is_match(line)
                || patterns.pytest_summary_line.is_match(line)
            {
                for caps in patterns.count_pair.captures_iter(line) {
                    counts.add(&caps[2], parse_u32(&caps[1]));
                }
                if counts.total.is_none() {
                    if let Some(caps) = patterns.paren_total.captures(line) {
                        counts.add("total", parse_u32(&caps[1]));
                    }
                }
            } else if let Some(caps) = patterns.mocha_count.captures(line) {
                counts.add(&caps[2], parse_u32(&caps[1]));
            }

            let failure = if let Some(caps) = patterns.jest_failure.captures(line) {
                let name = caps[1].trim().to_string();
                if name.starts_with("Console") {
                    None
                } else {
                    let message = lines[idx + 1..]
                        .iter()
                        .map(|l| l.trim())
                        .find(|l| !l.is_empty())
                        .unwrap_or_default()
                        .to_string();
                    Some(TestFailure { name, message })
                }
            } else if let Some(caps) = patterns.cargo_failure.captures(line) {
                Some(TestFailure {
                    name: caps[1].to_string(),
                    message: String::new(),
                })
            } else if let Some(caps) = patterns.pytest_failure.captures(line) {
                Some(TestFailure {
                    name: caps[1].to_string(),
                    message: caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
                })
            } else {
                patterns.vitest_failure.captures(line).map(|caps| TestFailure {
                    name: caps[1].trim().to_string(),
                    message: String::new(),
                })
            };

            if let Some(failure) = failure {
                if !failures.iter().any(|f| f.name == failure.name) {
                    failures.push(failure);
                }
            }
        }

        let total = counts
            .total
            .unwrap_or_else(|| {
                counts
                    .passed
                    .saturating_add(counts.failed)
                    .saturating_add(counts.skipped)
            });
        let ambiguous = !counts.matched;

        if ambiguous && !output.success() && failures.is_empty() {
            failures.push(TestFailure {
                name: "test command".to_string(),
                message: tail_lines(&text, 5),
            });
        }
        if ambiguous {
            tracing::warn!(
                exit_code = ?output.exit_code,
                "test output did not match any known summary format"
            );
        }

        TestResult {
            success: output.success() && counts.failed == 0,
            total,
            passed: counts.passed,
            failed: counts.failed,
            skipped: counts.skipped,
            failures,
            output: truncate_output(&text),
            duration: output.duration,
            ambiguous,
        }
    }
}

struct CheckPatterns {
    tsc_paren: Regex,
    tsc_pretty: Regex,
    rustc_header: Regex,
    rustc_location: Regex,
    colon_error: Regex,
}

fn check_patterns() -> &'static CheckPatterns {
    static PATTERNS: OnceLock<CheckPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| CheckPatterns {
        tsc_paren: Regex::new(r"^(.+?)\((\d+),(\d+)\): error (TS\d+): (.*)$")
            .expect("valid regex"),
        tsc_pretty: Regex::new(r"^(.+?):(\d+):(\d+) - error (TS\d+): (.*)$")
            .expect("valid regex"),
        rustc_header: Regex::new(r"^error(?:\[(E\d+)\])?: (.*)$").expect("valid regex"),
        rustc_location: Regex::new(r"^\s*--> (.+?):(\d+):(\d+)").expect("valid regex"),
        colon_error: Regex::new(r"^(.+?):(\d+):(?:(\d+):)? error:? (.*)$").expect("valid regex"),
    })
}

impl ResultParser for TypeCheckOutputParser {
    type Output = TypeCheckResult;

    fn parse(&self, output: &CommandOutput) -> TypeCheckResult {
        let patterns = check_patterns();
        let text = output.combined();
        let lines: Vec<&str> = text.lines().collect();
        let mut errors = Vec::new();

        for (idx, line) in lines.iter().enumerate() {
            if let Some(caps) = patterns
                .tsc_paren
                .captures(line)
                .or_else(|| patterns.tsc_pretty.captures(line))
            {
                errors.push(TypeCheckError {
                    file: Some(caps[1].trim().to_string()),
                    line: caps[2].parse().ok(),
                    column: caps[3].parse().ok(),
                    code: Some(caps[4].to_string()),
                    message: caps[5].trim().to_string(),
                });
            } else if let Some(caps) = patterns.rustc_header.captures(line) {
                let message = caps[2].trim().to_string();
                if message.starts_with("aborting due to") || message.starts_with("could not compile")
                {
                    continue;
                }
                let location = lines[idx + 1..]
                    .iter()
                    .take(3)
                    .find_map(|l| patterns.rustc_location.captures(l));
                errors.push(TypeCheckError {
                    file: location.as_ref().map(|c| c[1].to_string()),
                    line: location.as_ref().and_then(|c| c[2].parse().ok()),
                    column: location.as_ref().and_then(|c| c[3].parse().ok()),
                    code: caps.get(1).map(|m| m.as_str().to_string()),
                    message,
                });
            } else if let Some(caps) = patterns.colon_error.captures(line) {
                errors.push(TypeCheckError {
                    file: Some(caps[1].trim().to_string()),
                    line: caps[2].parse().ok(),
                    column: caps.get(3).and_then(|m| m.as_str().parse().ok()),
                    code: None,
                    message: caps[4].trim().to_string(),
                });
            }
        }

        let mut ambiguous = false;
        if !output.success() && errors.is_empty() {
            ambiguous = true;
            tracing::warn!(
                exit_code = ?output.exit_code,
                timed_out = output.timed_out,
                "type check failed without recognizable diagnostics"
            );
            errors.push(TypeCheckError {
                file: None,
                line: None,
                column: None,
                code: None,
                message: if output.timed_out {
                    "type check timed out".to_string()
                } else {
                    tail_lines(&text, 5)
                },
            });
        }

        TypeCheckResult {
            passed: output.success() && errors.is_empty(),
            errors,
            output: truncate_output(&text),
            duration: output.duration,
            ambiguous,
        }
    }
}
