#![forbid(unsafe_code)]

use std::path::PathBuf;

use dq_conformance::{HarnessConfig, emit_gradcheck_report};
use dq_core::ExecutionMode;
use dq_dispatch::QuatOp;
use serde_json::json;

const USAGE: &str = "usage: run_gradcheck_report [--mode strict|hardened|both] [--op name]... [--batch N]... [--output path] [--print-full-report]";

fn main() -> Result<(), String> {
    let mut mode = String::from("strict");
    let mut ops = Vec::new();
    let mut batch_sizes = Vec::new();
    let mut output: Option<PathBuf> = None;
    let mut print_full_report = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--mode" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--mode requires one of: strict|hardened|both".to_string())?;
                mode = value;
            }
            "--op" => {
                let value = args.next().ok_or_else(|| {
                    "--op requires an operator name (e.g., dual_sclerp)".to_string()
                })?;
                let op = QuatOp::from_name(value.as_str())
                    .ok_or_else(|| format!("unknown operator '{value}'"))?;
                ops.push(op);
            }
            "--batch" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--batch requires a lane count".to_string())?;
                let batch = value
                    .parse::<usize>()
                    .map_err(|error| format!("invalid --batch '{value}': {error}"))?;
                batch_sizes.push(batch);
            }
            "--output" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--output requires a file path".to_string())?;
                output = Some(PathBuf::from(value));
            }
            "--print-full-report" => {
                print_full_report = true;
            }
            other => {
                return Err(format!("unknown arg '{other}'. {USAGE}"));
            }
        }
    }

    let config = HarnessConfig::default_paths();
    let modes = parse_modes(mode.as_str())?;
    if ops.is_empty() {
        ops.extend_from_slice(QuatOp::all());
    }
    if batch_sizes.is_empty() {
        batch_sizes.clone_from(&config.gradcheck.batch_sizes);
    }

    let report = emit_gradcheck_report(
        &config,
        output.as_deref(),
        modes.as_slice(),
        ops.as_slice(),
        batch_sizes.as_slice(),
    )?;

    if print_full_report {
        println!(
            "{}",
            serde_json::to_string_pretty(&report)
                .map_err(|error| format!("failed to serialize gradcheck report: {error}"))?
        );
        return Ok(());
    }

    let failing = report
        .cases
        .iter()
        .filter(|case| !case.passed)
        .map(|case| {
            json!({
                "op": case.op,
                "batch": case.batch,
                "mode": case.mode,
                "failures": case.failures,
                "max_abs_error": case.max_abs_error,
            })
        })
        .collect::<Vec<_>>();

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "status": if report.failed_checks == 0 { "ok" } else { "needs_attention" },
            "output_path": output.as_ref().map(|path| path.display().to_string()),
            "total_checks": report.total_checks,
            "passed_checks": report.passed_checks,
            "failed_checks": report.failed_checks,
            "failing": failing,
        }))
        .map_err(|error| format!("failed to serialize gradcheck summary: {error}"))?
    );

    Ok(())
}

fn parse_modes(raw: &str) -> Result<Vec<ExecutionMode>, String> {
    match raw {
        "strict" => Ok(vec![ExecutionMode::Strict]),
        "hardened" => Ok(vec![ExecutionMode::Hardened]),
        "both" => Ok(vec![ExecutionMode::Strict, ExecutionMode::Hardened]),
        _ => Err(format!(
            "unsupported mode '{raw}', expected strict|hardened|both"
        )),
    }
}
