//! `acpx-host probe` and `acpx-host doctor`.

use anyhow::{Result, bail};

use acpx_runtime::{AcpRuntime, DoctorReport, HealthState};

/// Run the availability probe and report the outcome.
pub async fn run_probe(runtime: &dyn AcpRuntime) -> Result<()> {
    let state = runtime.probe_availability().await;
    let label = health_label(state);
    println!("acpx backend: {label}");
    if state != HealthState::Healthy {
        bail!("acpx backend is {label}; run `acpx-host doctor` for details");
    }
    Ok(())
}

/// Run the doctor checks and print the report.
pub async fn run_doctor(runtime: &dyn AcpRuntime) -> Result<()> {
    let report = runtime.doctor().await;
    for line in render_report(&report) {
        println!("{line}");
    }
    if !report.ok {
        bail!("{}", report.message);
    }
    Ok(())
}

fn health_label(state: HealthState) -> &'static str {
    match state {
        HealthState::Unknown => "unknown",
        HealthState::Healthy => "healthy",
        HealthState::Unavailable => "unavailable",
    }
}

fn render_report(report: &DoctorReport) -> Vec<String> {
    let mut lines = vec![format!(
        "[{}] {}",
        if report.ok { "OK" } else { "FAIL" },
        report.message
    )];
    if let Some(code) = &report.code {
        lines.push(format!("  code: {code}"));
    }
    lines.extend(report.details.iter().map(|d| format!("  {d}")));
    if let Some(install) = &report.install_command {
        lines.push(format!("  install: {install}"));
    }
    lines
}
