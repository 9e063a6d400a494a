//! Host tool checks
//!
//! Reports which external tools the pipeline needs are present, grouped by
//! the stage that uses them.

use serde::Serialize;

use crate::infra::executor::{host_supports_native, ContainerRuntime};

/// Result of a single tool check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    /// Tool or capability name
    pub name: String,
    pub passed: bool,
    /// Resolved path, when found
    pub path: Option<String>,
    pub error: Option<String>,
    pub suggestion: Option<String>,
    /// Whether the pipeline cannot run without it
    pub required: bool,
}

impl CheckResult {
    pub fn pass(name: &str, path: Option<String>, required: bool) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            path,
            error: None,
            suggestion: None,
            required,
        }
    }

    pub fn fail(name: &str, error: &str, suggestion: Option<&str>, required: bool) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            path: None,
            error: Some(error.to_string()),
            suggestion: suggestion.map(String::from),
            required,
        }
    }
}

/// Overall doctor report
#[derive(Debug, Default, Serialize)]
pub struct DoctorReport {
    pub checks: Vec<CheckResult>,
}

impl DoctorReport {
    pub fn add_check(&mut self, result: CheckResult) {
        self.checks.push(result);
    }

    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn passed_count(&self) -> usize {
        self.checks.iter().filter(|c| c.passed).count()
    }

    pub fn failed_required(&self) -> Vec<&CheckResult> {
        self.checks.iter().filter(|c| c.required && !c.passed).collect()
    }
}

/// Tools used on the host: (name, package hint, required)
const HOST_TOOLS: &[(&str, &str, bool)] = &[
    ("xz", "xz-utils", true),
    ("ssh", "openssh-client", true),
    ("scp", "openssh-client", true),
    ("rsync", "rsync", false),
    ("sshpass", "sshpass", false),
];

/// Tools the disk engine runs natively
const DISK_TOOLS: &[&str] = &["kpartx", "losetup", "dmsetup", "mount", "umount", "blkid", "base64"];

/// Look a tool up in PATH
pub fn check_tool(name: &str, package: &str, required: bool) -> CheckResult {
    match which::which(name) {
        Ok(path) => CheckResult::pass(name, Some(path.display().to_string()), required),
        Err(_) => CheckResult::fail(
            name,
            &format!("{name} not found in PATH"),
            Some(&format!("Install the '{package}' package")),
            required,
        ),
    }
}

/// Disk tools are only required when no container runtime can stand in
/// for them
pub fn check_disk_backend() -> Vec<CheckResult> {
    let runtime = ContainerRuntime::detect();
    let mut checks: Vec<CheckResult> = DISK_TOOLS
        .iter()
        .map(|tool| check_tool(tool, "kpartx / util-linux", runtime.is_none()))
        .collect();
    checks.push(match runtime {
        Some(runtime) => CheckResult::pass(&format!("container runtime ({})", runtime.command()), None, false),
        None if host_supports_native() => CheckResult::fail(
            "container runtime",
            "Neither Docker nor Podman found in PATH",
            Some("Optional: install Docker or Podman to run image work in a sandbox"),
            false,
        ),
        None => CheckResult::fail(
            "container runtime",
            "Neither Docker nor Podman found and native disk tools are incomplete",
            Some("Install Docker or Podman, or kpartx and util-linux"),
            true,
        ),
    });
    checks
}

/// Run all checks
pub fn run_doctor() -> DoctorReport {
    let mut report = DoctorReport::default();
    for (name, package, required) in HOST_TOOLS {
        report.add_check(check_tool(name, package, *required));
    }
    for check in check_disk_backend() {
        report.add_check(check);
    }
    report
}
