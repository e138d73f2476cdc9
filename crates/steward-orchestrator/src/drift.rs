//! Cross-phase regression ("drift") checking
//!
//! Before a phase is marked complete, the test directories of every prior
//! phase are re-run with the project's detected test runner. A regression
//! gets one repair attempt; a persistent failure is logged as advisory.
//! Regressions are a quality signal, not a hard gate.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use steward_core::{Result, StewardError};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Detected project test runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestRunner {
    Cargo,
    Npm,
    Pytest,
    Go,
}

impl TestRunner {
    /// Detect by marker file; first match wins
    pub fn detect(project_root: &Path) -> Option<Self> {
        if project_root.join("Cargo.toml").exists() {
            Some(TestRunner::Cargo)
        } else if project_root.join("package.json").exists() {
            Some(TestRunner::Npm)
        } else if project_root.join("pyproject.toml").exists()
            || project_root.join("pytest.ini").exists()
        {
            Some(TestRunner::Pytest)
        } else if project_root.join("go.mod").exists() {
            Some(TestRunner::Go)
        } else {
            None
        }
    }

    /// Command line for running the tests under one directory
    fn command_for(&self, test_dir: &Path) -> (&'static str, Vec<String>) {
        let dir = test_dir.to_string_lossy().to_string();
        match self {
            TestRunner::Cargo => {
                // Integration-test files are named after the phase directory
                let filter = test_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().replace('-', "_"))
                    .unwrap_or_default();
                ("cargo", vec!["test".to_string(), filter])
            }
            TestRunner::Npm => ("npx", vec!["jest".to_string(), dir]),
            TestRunner::Pytest => ("pytest", vec![dir]),
            TestRunner::Go => ("go", vec!["test".to_string(), format!("./{}/...", dir)]),
        }
    }
}

/// Pass/fail counts and failing-test names parsed from runner output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestSummary {
    pub passed: u32,
    pub failed: u32,
    pub failing_tests: Vec<String>,
}

impl TestSummary {
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// One prior phase whose tests now fail
#[derive(Debug, Clone)]
pub struct DriftFailure {
    pub phase: u32,
    pub summary: TestSummary,
}

/// Result of a drift pass over all prior phases
#[derive(Debug, Clone, Default)]
pub struct DriftReport {
    pub checked_phases: Vec<u32>,
    pub failures: Vec<DriftFailure>,
}

impl DriftReport {
    pub fn clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Fix instruction handed to a repair session
    pub fn repair_instruction(&self) -> String {
        let mut text = String::from(
            "Later changes broke tests from earlier phases. Fix the regressions without changing the tests:\n",
        );
        for failure in &self.failures {
            text.push_str(&format!(
                "- phase {}: {} failing ({})\n",
                failure.phase,
                failure.summary.failed,
                failure.summary.failing_tests.join(", ")
            ));
        }
        text
    }
}

/// Runs prior-phase test suites and parses their summaries
pub struct DriftRunner {
    project_root: PathBuf,
}

impl DriftRunner {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    /// Test directories scoped to phases before `before_phase`
    ///
    /// Naming convention: `tests/phase-{N}` with `tests/phase_{N}` and
    /// `test/phase-{N}` as accepted variants.
    pub fn phase_test_dirs(&self, before_phase: u32) -> Vec<(u32, PathBuf)> {
        let mut dirs = Vec::new();
        for phase in 1..before_phase {
            let candidates = [
                format!("tests/phase-{}", phase),
                format!("tests/phase_{}", phase),
                format!("test/phase-{}", phase),
            ];
            for candidate in candidates {
                let path = self.project_root.join(&candidate);
                if path.is_dir() {
                    dirs.push((phase, path));
                    break;
                }
            }
        }
        dirs
    }

    /// Run every prior phase's tests and collect regressions
    pub async fn check(&self, before_phase: u32) -> Result<DriftReport> {
        let mut report = DriftReport::default();

        let Some(runner) = TestRunner::detect(&self.project_root) else {
            debug!("No test runner detected, skipping drift check");
            return Ok(report);
        };

        for (phase, dir) in self.phase_test_dirs(before_phase) {
            info!("Drift check: re-running phase {} tests", phase);
            let summary = self.run_suite(runner, &dir).await?;
            report.checked_phases.push(phase);
            if !summary.all_passed() {
                warn!(
                    "Drift in phase {}: {} failed, {} passed",
                    phase, summary.failed, summary.passed
                );
                report.failures.push(DriftFailure { phase, summary });
            }
        }

        Ok(report)
    }

    async fn run_suite(&self, runner: TestRunner, dir: &Path) -> Result<TestSummary> {
        let relative = dir.strip_prefix(&self.project_root).unwrap_or(dir);
        let (program, args) = runner.command_for(relative);
        let output = Command::new(program)
            .args(&args)
            .current_dir(&self.project_root)
            .output()
            .await
            .map_err(|e| StewardError::Drift(format!("failed to run {}: {}", program, e)))?;

        let combined = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        Ok(parse_summary(runner, &combined))
    }
}

static CARGO_RESULT: OnceLock<Regex> = OnceLock::new();
static CARGO_FAILING: OnceLock<Regex> = OnceLock::new();
static PYTEST_RESULT: OnceLock<Regex> = OnceLock::new();
static PYTEST_FAILING: OnceLock<Regex> = OnceLock::new();
static JEST_RESULT: OnceLock<Regex> = OnceLock::new();
static GO_FAILING: OnceLock<Regex> = OnceLock::new();

/// Parse pass/fail counts and failing-test names from runner output
pub fn parse_summary(runner: TestRunner, output: &str) -> TestSummary {
    let mut summary = TestSummary::default();

    match runner {
        TestRunner::Cargo => {
            let result = CARGO_RESULT.get_or_init(|| {
                Regex::new(r"test result: \w+\. (\d+) passed; (\d+) failed")
                    .unwrap_or_else(|_| unreachable!())
            });
            let failing = CARGO_FAILING.get_or_init(|| {
                Regex::new(r"(?m)^test (\S+) \.\.\. FAILED").unwrap_or_else(|_| unreachable!())
            });
            for capture in result.captures_iter(output) {
                summary.passed += capture[1].parse().unwrap_or(0);
                summary.failed += capture[2].parse().unwrap_or(0);
            }
            for capture in failing.captures_iter(output) {
                summary.failing_tests.push(capture[1].to_string());
            }
        }
        TestRunner::Pytest => {
            let result = PYTEST_RESULT.get_or_init(|| {
                Regex::new(r"=+ (?:(\d+) failed, )?(\d+) passed").unwrap_or_else(|_| unreachable!())
            });
            let failing = PYTEST_FAILING.get_or_init(|| {
                Regex::new(r"(?m)^FAILED (\S+)").unwrap_or_else(|_| unreachable!())
            });
            if let Some(capture) = result.captures(output) {
                summary.failed = capture.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
                summary.passed = capture[2].parse().unwrap_or(0);
            }
            for capture in failing.captures_iter(output) {
                summary.failing_tests.push(capture[1].to_string());
            }
        }
        TestRunner::Npm => {
            let result = JEST_RESULT.get_or_init(|| {
                Regex::new(r"Tests:\s+(?:(\d+) failed, )?(\d+) passed")
                    .unwrap_or_else(|_| unreachable!())
            });
            if let Some(capture) = result.captures(output) {
                summary.failed = capture.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
                summary.passed = capture[2].parse().unwrap_or(0);
            }
            for line in output.lines() {
                if let Some(name) = line.trim().strip_prefix("✕ ") {
                    summary.failing_tests.push(name.to_string());
                }
            }
        }
        TestRunner::Go => {
            let failing = GO_FAILING.get_or_init(|| {
                Regex::new(r"(?m)^--- FAIL: (\S+)").unwrap_or_else(|_| unreachable!())
            });
            for capture in failing.captures_iter(output) {
                summary.failing_tests.push(capture[1].to_string());
            }
            summary.failed = summary.failing_tests.len() as u32;
            summary.passed = output.matches("--- PASS:").count() as u32;
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cargo_summary_parsing() {
        let output = "\
test phase_1::test_widget ... ok
test phase_1::test_gadget ... FAILED

failures:
    phase_1::test_gadget

test result: FAILED. 3 passed; 1 failed; 0 ignored
";
        let summary = parse_summary(TestRunner::Cargo, output);
        assert_eq!(summary.passed, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failing_tests, vec!["phase_1::test_gadget"]);
        assert!(!summary.all_passed());
    }

    #[test]
    fn test_cargo_all_green() {
        let output = "test result: ok. 12 passed; 0 failed; 0 ignored";
        let summary = parse_summary(TestRunner::Cargo, output);
        assert_eq!(summary.passed, 12);
        assert!(summary.all_passed());
    }

    #[test]
    fn test_pytest_summary_parsing() {
        let output = "\
FAILED tests/phase-1/test_api.py::test_latency
=================== 2 failed, 7 passed in 1.24s ===================
";
        let summary = parse_summary(TestRunner::Pytest, output);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.passed, 7);
        assert_eq!(summary.failing_tests, vec!["tests/phase-1/test_api.py::test_latency"]);
    }

    #[test]
    fn test_pytest_all_passed_without_failed_group() {
        let output = "=================== 9 passed in 0.5s ===================";
        let summary = parse_summary(TestRunner::Pytest, output);
        assert_eq!(summary.passed, 9);
        assert_eq!(summary.failed, 0);
    }

    #[test]
    fn test_jest_summary_parsing() {
        let output = "\
  ✕ renders the header
Tests:       1 failed, 5 passed, 6 total
";
        let summary = parse_summary(TestRunner::Npm, output);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.passed, 5);
        assert_eq!(summary.failing_tests, vec!["renders the header"]);
    }

    #[test]
    fn test_go_summary_parsing() {
        let output = "\
--- PASS: TestAlpha (0.00s)
--- FAIL: TestBeta (0.01s)
FAIL
";
        let summary = parse_summary(TestRunner::Go, output);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failing_tests, vec!["TestBeta"]);
    }

    #[test]
    fn test_runner_detection_order() {
        let dir = TempDir::new().unwrap();
        assert_eq!(TestRunner::detect(dir.path()), None);

        std::fs::write(dir.path().join("go.mod"), "module example").unwrap();
        assert_eq!(TestRunner::detect(dir.path()), Some(TestRunner::Go));

        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        assert_eq!(TestRunner::detect(dir.path()), Some(TestRunner::Npm));

        std::fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        assert_eq!(TestRunner::detect(dir.path()), Some(TestRunner::Cargo));
    }

    #[test]
    fn test_phase_dir_discovery_with_variants() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("tests/phase-1")).unwrap();
        std::fs::create_dir_all(dir.path().join("tests/phase_2")).unwrap();
        std::fs::create_dir_all(dir.path().join("test/phase-3")).unwrap();

        let runner = DriftRunner::new(dir.path());
        let dirs = runner.phase_test_dirs(4);
        assert_eq!(dirs.len(), 3);
        assert_eq!(dirs[0].0, 1);
        assert_eq!(dirs[1].0, 2);
        assert_eq!(dirs[2].0, 3);

        // Only phases strictly before the current one
        assert_eq!(runner.phase_test_dirs(2).len(), 1);
        assert!(runner.phase_test_dirs(1).is_empty());
    }

    #[test]
    fn test_repair_instruction_names_failing_tests() {
        let report = DriftReport {
            checked_phases: vec![1],
            failures: vec![DriftFailure {
                phase: 1,
                summary: TestSummary {
                    passed: 3,
                    failed: 1,
                    failing_tests: vec!["phase_1::test_gadget".to_string()],
                },
            }],
        };
        let instruction = report.repair_instruction();
        assert!(instruction.contains("phase 1"));
        assert!(instruction.contains("phase_1::test_gadget"));
    }
}
