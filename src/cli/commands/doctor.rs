//! CLI command for `nodeprov doctor`
//!
//! Checks host tools and reports missing ones with install suggestions.

use anyhow::Result;

use crate::cli::output::{is_json, is_quiet, print_detail, print_info, print_json, print_success, print_warning, status};
use crate::core::doctor::run_doctor;

/// Execute the doctor command
pub async fn execute() -> Result<()> {
    let report = run_doctor();
    let failed_required = report.failed_required();

    if is_json() {
        print_json(&report)?;
        if !failed_required.is_empty() {
            return Err(anyhow::anyhow!("Missing required tools"));
        }
        return Ok(());
    }

    if is_quiet() {
        if !failed_required.is_empty() {
            for check in failed_required {
                eprintln!("{} Missing required: {}", status::ERROR, check.name);
            }
            return Err(anyhow::anyhow!("Missing required tools"));
        }
        return Ok(());
    }

    print_info("Checking host tools...");
    println!();
    for check in &report.checks {
        let required_str = if check.required { "" } else { " [optional]" };
        if check.passed {
            let path = check.path.as_ref().map(|p| format!(" ({p})")).unwrap_or_default();
            println!("  {} {}{path}{required_str}", status::SUCCESS, check.name);
        } else {
            println!("  {} {}{required_str}", status::ERROR, check.name);
            if let Some(suggestion) = &check.suggestion {
                print_detail(&format!("Suggestion: {suggestion}"));
            }
        }
    }

    println!();
    let passed = report.passed_count();
    let total = report.checks.len();
    if report.all_passed() {
        print_success(&format!("All checks passed ({passed}/{total})"));
    } else if failed_required.is_empty() {
        print_warning(&format!("{passed}/{total} checks passed (optional tools missing)"));
    } else {
        println!("{} {passed}/{total} checks passed", status::ERROR);
        return Err(anyhow::anyhow!(
            "Missing required tools. Run 'nodeprov doctor' for details."
        ));
    }
    Ok(())
}
