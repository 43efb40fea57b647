#![forbid(unsafe_code)]

mod logging;
mod sampling;

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use dq_api::QuatSession;
use dq_core::{DType, DenseTensor, Device, ExecutionMode, Real, TensorMeta};
use dq_dispatch::{
    DispatchKey, DispatchKeySet, QuatOp, dispatch_forward, dispatch_forward_with_keyset,
};
use dq_kernel_cpu::{LaunchConfig, Operand};
use dq_runtime::{EvidenceEntry, EvidenceKind};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub use logging::{REQUIRED_LOG_FIELDS, StructuredCaseLog, det_seed, mode_label};

const MAX_FIXTURE_BYTES: u64 = 1 << 20;
/// Largest gradcheck batch the smoke run exercises; full sizes run on demand.
const SMOKE_GRADCHECK_MAX_BATCH: usize = 17;
const GRADCHECK_REPORT_SCHEMA_VERSION: &str = "dq-gradcheck-report-v1";
/// Allowed `|g32 - g64|` per unit of the lane's largest f64 gradient;
/// about 1700 f32 ulps.
const F32_AGREEMENT_TOLERANCE: f64 = 2e-4;

#[derive(Debug, Clone, PartialEq)]
pub struct GradcheckConfig {
    pub step: f64,
    pub abs_tolerance: f64,
    pub rel_tolerance: f64,
    pub batch_sizes: Vec<usize>,
}

impl Default for GradcheckConfig {
    fn default() -> Self {
        Self {
            step: 1e-6,
            abs_tolerance: 1e-6,
            rel_tolerance: 1e-6,
            batch_sizes: vec![1, 17, 100_000],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    pub strict_mode: bool,
    pub seed: u64,
    /// Lanes per randomized invariant case.
    pub property_lanes: usize,
    /// Lanes of the batched side of each broadcast case.
    pub broadcast_lanes: usize,
    pub gradcheck: GradcheckConfig,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            strict_mode: true,
            seed: 0x5eed_0d0a_1b2c_3d4e,
            property_lanes: 257,
            broadcast_lanes: 17,
            gradcheck: GradcheckConfig::default(),
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub fixture_count: usize,
    pub strict_mode: bool,
    pub cases_total: usize,
    pub cases_passed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForwardCaseReport {
    pub name: String,
    pub mode: ExecutionMode,
    pub shape_ok: bool,
    pub output_ok: bool,
    pub error_ok: bool,
    pub forensic_log: StructuredCaseLog,
}

impl ForwardCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.shape_ok && self.output_ok && self.error_ok
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchCaseReport {
    pub name: String,
    pub mode: ExecutionMode,
    pub selected_key_ok: bool,
    pub backend_key_ok: bool,
    pub kernel_ok: bool,
    pub fallback_ok: bool,
    pub error_ok: bool,
    pub forensic_log: StructuredCaseLog,
}

impl DispatchCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.selected_key_ok
            && self.backend_key_ok
            && self.kernel_ok
            && self.fallback_ok
            && self.error_ok
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradcheckCaseReport {
    pub op: QuatOp,
    pub batch: usize,
    pub mode: ExecutionMode,
    /// Lane components compared against a central difference.
    pub checked_components: usize,
    pub failures: usize,
    pub max_abs_error: f64,
    pub forensic_log: StructuredCaseLog,
}

impl GradcheckCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.failures == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastCaseReport {
    pub op: QuatOp,
    pub broadcast_input: &'static str,
    pub mode: ExecutionMode,
    pub output_ok: bool,
    pub grad_ok: bool,
    pub forensic_log: StructuredCaseLog,
}

impl BroadcastCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.output_ok && self.grad_ok
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvariantCaseReport {
    pub name: &'static str,
    pub mode: ExecutionMode,
    pub lanes: usize,
    pub max_error: f64,
    pub passed: bool,
    pub forensic_log: StructuredCaseLog,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrecisionCaseReport {
    pub op: QuatOp,
    pub mode: ExecutionMode,
    pub lanes: usize,
    /// Gradient components compared between the f32 and f64 backward.
    pub checked_components: usize,
    pub failures: usize,
    pub max_scaled_error: f64,
    pub forensic_log: StructuredCaseLog,
}

impl PrecisionCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.failures == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradcheckReportCase {
    pub op: &'static str,
    pub batch: usize,
    pub mode: &'static str,
    pub checked_components: usize,
    pub failures: usize,
    pub max_abs_error: f64,
    pub passed: bool,
    pub forensic_log: StructuredCaseLog,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradcheckReport {
    pub schema_version: &'static str,
    pub generated_unix_ms: u128,
    pub step: f64,
    pub abs_tolerance: f64,
    pub rel_tolerance: f64,
    pub total_checks: usize,
    pub passed_checks: usize,
    pub failed_checks: usize,
    pub cases: Vec<GradcheckReportCase>,
}

#[derive(Debug, Clone, Deserialize)]
struct FixtureTensor {
    shape: Vec<usize>,
    values: Vec<f64>,
}

impl FixtureTensor {
    fn to_dense(&self) -> Result<DenseTensor, String> {
        DenseTensor::from_values(self.shape.clone(), self.values.clone(), Device::Cpu)
            .map_err(|error| format!("invalid fixture tensor {:?}: {error}", self.shape))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ForwardFixtureFile {
    cases: Vec<ForwardCase>,
}

#[derive(Debug, Clone, Deserialize)]
struct ForwardCase {
    name: String,
    op: String,
    inputs: Vec<FixtureTensor>,
    #[serde(default)]
    expected_outputs: Vec<FixtureTensor>,
    expect_error: Option<bool>,
    tolerance: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct DispatchFixtureFile {
    cases: Vec<DispatchCase>,
}

#[derive(Debug, Clone, Deserialize)]
struct DispatchCase {
    name: String,
    op: String,
    device: Option<String>,
    requires_grad: bool,
    keyset: Option<Vec<String>>,
    strict: DispatchModeExpectation,
    hardened: DispatchModeExpectation,
}

#[derive(Debug, Clone, Deserialize)]
struct DispatchModeExpectation {
    expected_selected_key: Option<String>,
    expected_backend_key: Option<String>,
    expected_kernel: Option<String>,
    expected_fallback: Option<bool>,
    expect_error: Option<bool>,
}

pub fn run_smoke(config: &HarnessConfig) -> HarnessReport {
    let fixture_count = fs::read_dir(&config.fixture_root)
        .ok()
        .into_iter()
        .flat_map(|it| it.filter_map(Result::ok))
        .count();

    let mode = if config.strict_mode {
        ExecutionMode::Strict
    } else {
        ExecutionMode::Hardened
    };

    let (forward_total, forward_passed) = run_forward_conformance(config, mode)
        .map_or((0, 0), |(_, cases)| {
            summarize_passes(cases.iter().map(ForwardCaseReport::passed))
        });
    let (dispatch_total, dispatch_passed) = run_dispatch_conformance(config, mode)
        .map_or((0, 0), |(_, cases)| {
            summarize_passes(cases.iter().map(DispatchCaseReport::passed))
        });
    let (broadcast_total, broadcast_passed) = run_broadcast_conformance(config, mode)
        .map_or((0, 0), |(_, cases)| {
            summarize_passes(cases.iter().map(BroadcastCaseReport::passed))
        });
    let (invariant_total, invariant_passed) = run_invariant_conformance(config, mode)
        .map_or((0, 0), |(_, cases)| {
            summarize_passes(cases.iter().map(|case| case.passed))
        });
    let (precision_total, precision_passed) = run_precision_agreement(config, mode)
        .map_or((0, 0), |(_, cases)| {
            summarize_passes(cases.iter().map(PrecisionCaseReport::passed))
        });
    let smoke_batches = config
        .gradcheck
        .batch_sizes
        .iter()
        .copied()
        .filter(|batch| *batch <= SMOKE_GRADCHECK_MAX_BATCH)
        .collect::<Vec<_>>();
    let (gradcheck_total, gradcheck_passed) =
        run_gradcheck_filtered(config, mode, QuatOp::all(), &smoke_batches).map_or(
            (0, 0),
            |(_, cases)| summarize_passes(cases.iter().map(GradcheckCaseReport::passed)),
        );

    HarnessReport {
        suite: "smoke",
        fixture_count,
        strict_mode: config.strict_mode,
        cases_total: forward_total
            + dispatch_total
            + broadcast_total
            + invariant_total
            + precision_total
            + gradcheck_total,
        cases_passed: forward_passed
            + dispatch_passed
            + broadcast_passed
            + invariant_passed
            + precision_passed
            + gradcheck_passed,
    }
}

pub fn run_forward_conformance(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<ForwardCaseReport>), String> {
    let fixture_path = config.fixture_root.join("forward_cases.json");
    let fixture: ForwardFixtureFile = load_fixture(&fixture_path)?;

    let mut case_reports = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        case_reports.push(run_forward_case(case, mode)?);
    }

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(ForwardCaseReport::passed));
    let report = HarnessReport {
        suite: "forward",
        fixture_count: 1,
        strict_mode: mode == ExecutionMode::Strict,
        cases_total,
        cases_passed,
    };
    Ok((report, case_reports))
}

pub fn run_dispatch_conformance(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<DispatchCaseReport>), String> {
    let fixture_path = config.fixture_root.join("dispatch_cases.json");
    let fixture: DispatchFixtureFile = load_fixture(&fixture_path)?;

    let mut case_reports = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        case_reports.push(run_dispatch_case(case, mode)?);
    }

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(DispatchCaseReport::passed));
    let report = HarnessReport {
        suite: "dispatch",
        fixture_count: 1,
        strict_mode: mode == ExecutionMode::Strict,
        cases_total,
        cases_passed,
    };
    Ok((report, case_reports))
}

/// Finite-difference check of every catalogue operator at every configured
/// batch size.
pub fn run_gradcheck(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<GradcheckCaseReport>), String> {
    run_gradcheck_filtered(config, mode, QuatOp::all(), &config.gradcheck.batch_sizes)
}

pub fn run_gradcheck_filtered(
    config: &HarnessConfig,
    mode: ExecutionMode,
    ops: &[QuatOp],
    batch_sizes: &[usize],
) -> Result<(HarnessReport, Vec<GradcheckCaseReport>), String> {
    let mut case_reports = Vec::with_capacity(ops.len() * batch_sizes.len());
    for &op in ops {
        for &batch in batch_sizes {
            case_reports.push(gradcheck_case(config, mode, op, batch)?);
        }
    }

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(GradcheckCaseReport::passed));
    let report = HarnessReport {
        suite: "gradcheck",
        fixture_count: 0,
        strict_mode: mode == ExecutionMode::Strict,
        cases_total,
        cases_passed,
    };
    Ok((report, case_reports))
}

/// `op(batch, single)` against `op(batch, replicated)` for every input of
/// every multi-input operator, forward values and reduced gradients.
pub fn run_broadcast_conformance(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<BroadcastCaseReport>), String> {
    let mut case_reports = Vec::new();
    for &op in QuatOp::all() {
        let arity = op.schema().arity();
        if arity < 2 {
            continue;
        }
        for input_idx in 0..arity {
            case_reports.push(broadcast_case(config, mode, op, input_idx)?);
        }
    }

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(BroadcastCaseReport::passed));
    let report = HarnessReport {
        suite: "broadcast",
        fixture_count: 0,
        strict_mode: mode == ExecutionMode::Strict,
        cases_total,
        cases_passed,
    };
    Ok((report, case_reports))
}

/// Algebraic identities over randomized batches.
pub fn run_invariant_conformance(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<InvariantCaseReport>), String> {
    let lanes = config.property_lanes;
    let case_reports = vec![
        unit_product_is_unit(config, mode, lanes)?,
        mul_conjugate_is_norm_squared(config, mode, lanes)?,
        rigid_round_trip(config, mode, lanes)?,
        sclerp_endpoints(config, mode, lanes)?,
        matrix_round_trip_up_to_sign(config, mode, lanes)?,
        dual_normalize_unit_and_orthogonal(config, mode, lanes)?,
        degenerate_normalize_fallback(config, mode, lanes)?,
    ];

    let (cases_total, cases_passed) = summarize_passes(case_reports.iter().map(|case| case.passed));
    let report = HarnessReport {
        suite: "invariants",
        fixture_count: 0,
        strict_mode: mode == ExecutionMode::Strict,
        cases_total,
        cases_passed,
    };
    Ok((report, case_reports))
}

/// Backward of every catalogue operator in f32 against f64 on the same
/// f32-representable inputs and output gradients.
pub fn run_precision_agreement(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<PrecisionCaseReport>), String> {
    let case_reports = QuatOp::all()
        .iter()
        .map(|&op| precision_case(config, mode, op))
        .collect::<Result<Vec<_>, _>>()?;

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(PrecisionCaseReport::passed));
    let report = HarnessReport {
        suite: "precision",
        fixture_count: 0,
        strict_mode: mode == ExecutionMode::Strict,
        cases_total,
        cases_passed,
    };
    Ok((report, case_reports))
}

/// Runs the gradient check for each mode and writes the JSON report to
/// `output_path` when one is given.
pub fn emit_gradcheck_report(
    config: &HarnessConfig,
    output_path: Option<&Path>,
    modes: &[ExecutionMode],
    ops: &[QuatOp],
    batch_sizes: &[usize],
) -> Result<GradcheckReport, String> {
    let mut cases = Vec::new();
    for &mode in modes {
        let (_, reports) = run_gradcheck_filtered(config, mode, ops, batch_sizes)?;
        cases.extend(reports.into_iter().map(|report| GradcheckReportCase {
            op: report.op.name(),
            batch: report.batch,
            mode: mode_label(report.mode),
            checked_components: report.checked_components,
            failures: report.failures,
            max_abs_error: report.max_abs_error,
            passed: report.passed(),
            forensic_log: report.forensic_log,
        }));
    }

    let (total_checks, passed_checks) = summarize_passes(cases.iter().map(|case| case.passed));
    let report = GradcheckReport {
        schema_version: GRADCHECK_REPORT_SCHEMA_VERSION,
        generated_unix_ms: logging::now_unix_ms(),
        step: config.gradcheck.step,
        abs_tolerance: config.gradcheck.abs_tolerance,
        rel_tolerance: config.gradcheck.rel_tolerance,
        total_checks,
        passed_checks,
        failed_checks: total_checks - passed_checks,
        cases,
    };

    if let Some(path) = output_path {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| {
                format!("failed creating report dir {}: {error}", parent.display())
            })?;
        }
        let raw = serde_json::to_string_pretty(&report)
            .map_err(|error| format!("failed to serialize gradcheck report: {error}"))?;
        fs::write(path, raw)
            .map_err(|error| format!("failed writing report {}: {error}", path.display()))?;
    }

    Ok(report)
}

fn run_forward_case(case: &ForwardCase, mode: ExecutionMode) -> Result<ForwardCaseReport, String> {
    let op = parse_op(&case.op)?;
    let inputs = case
        .inputs
        .iter()
        .map(FixtureTensor::to_dense)
        .collect::<Result<Vec<_>, _>>()?;
    let input_refs = inputs.iter().collect::<Vec<_>>();

    let mut session = QuatSession::new(mode);
    let result = session.forward(op.name(), &input_refs);
    let input_shapes = case
        .inputs
        .iter()
        .map(|input| input.shape.clone())
        .collect::<Vec<_>>();

    if case.expect_error.unwrap_or(false) {
        let error_message = result.as_ref().err().map(ToString::to_string);
        // A rejected call must not have reached a kernel.
        let error_ok = result.is_err() && session.dispatch_count() == 0;
        let reason_code = if error_ok {
            "expected_error_observed"
        } else {
            "expected_error_missing"
        };
        let mut extra_fields = BTreeMap::new();
        extra_fields.insert("op".to_string(), json!(op.name()));
        extra_fields.insert("input_shapes".to_string(), json!(input_shapes));
        extra_fields.insert("error_message".to_string(), json!(error_message));
        extra_fields.insert(
            "runtime_evidence".to_string(),
            runtime_evidence_field(session.evidence()),
        );
        return Ok(ForwardCaseReport {
            name: case.name.clone(),
            mode,
            shape_ok: true,
            output_ok: true,
            error_ok,
            forensic_log: forward_case_log(case, mode, pass_label(error_ok), reason_code)
                .with_extra_fields(extra_fields),
        });
    }

    let result =
        result.map_err(|error| format!("forward case '{}' failed: {error}", case.name))?;
    let tolerance = case.tolerance.unwrap_or(1e-12);

    let actual = result
        .outputs
        .iter()
        .map(tensor_values)
        .collect::<Result<Vec<_>, _>>()?;
    let actual_shapes = result
        .outputs
        .iter()
        .map(|output| output.shape().to_vec())
        .collect::<Vec<_>>();
    let shape_ok = actual_shapes.len() == case.expected_outputs.len()
        && actual_shapes
            .iter()
            .zip(&case.expected_outputs)
            .all(|(shape, expected)| *shape == expected.shape);
    let output_ok = actual.len() == case.expected_outputs.len()
        && actual
            .iter()
            .zip(&case.expected_outputs)
            .all(|(values, expected)| vec_within(values, &expected.values, tolerance));
    let passed = shape_ok && output_ok;
    let reason_code = if passed {
        "forward_parity_ok"
    } else if shape_ok {
        "forward_value_mismatch"
    } else {
        "forward_shape_mismatch"
    };

    let mut extra_fields = BTreeMap::new();
    extra_fields.insert("op".to_string(), json!(op.name()));
    extra_fields.insert("input_shapes".to_string(), json!(input_shapes));
    extra_fields.insert("output_shapes".to_string(), json!(actual_shapes));
    extra_fields.insert("actual_outputs".to_string(), json!(actual));
    extra_fields.insert("tolerance".to_string(), json!(tolerance));
    extra_fields.insert(
        "degenerate_lanes".to_string(),
        json!(result.degenerate_lanes),
    );
    extra_fields.insert("kernel".to_string(), json!(result.decision.kernel));
    extra_fields.insert(
        "runtime_evidence".to_string(),
        runtime_evidence_field(session.evidence()),
    );

    Ok(ForwardCaseReport {
        name: case.name.clone(),
        mode,
        shape_ok,
        output_ok,
        error_ok: true,
        forensic_log: forward_case_log(case, mode, pass_label(passed), reason_code)
            .with_extra_fields(extra_fields),
    })
}

fn forward_case_log(
    case: &ForwardCase,
    mode: ExecutionMode,
    outcome: &'static str,
    reason_code: &str,
) -> StructuredCaseLog {
    StructuredCaseLog::new(
        "forward",
        "forward_cases.json",
        case.name.as_str(),
        mode,
        vec!["crates/dq-conformance/fixtures/forward_cases.json".to_string()],
        format!(
            "cargo test -p dq-conformance forward_fixture_executes_in_both_modes -- --nocapture # mode={}",
            mode_label(mode)
        ),
        outcome,
        reason_code,
    )
}

fn run_dispatch_case(
    case: &DispatchCase,
    mode: ExecutionMode,
) -> Result<DispatchCaseReport, String> {
    let expectation = match mode {
        ExecutionMode::Strict => &case.strict,
        ExecutionMode::Hardened => &case.hardened,
    };

    let op = parse_op(&case.op)?;
    let device = case
        .device
        .as_deref()
        .map_or(Ok(Device::Cpu), parse_device)?;

    let widths = op.schema().input_widths;
    let buffers = widths
        .iter()
        .map(|&width| (unit_lane(width), TensorMeta::from_shape(vec![width], DType::F64, device)))
        .collect::<Vec<_>>();
    let operands = buffers
        .iter()
        .map(|(values, meta)| Operand::new(values.as_slice(), meta))
        .collect::<Vec<_>>();

    let result = if let Some(keys) = &case.keyset {
        match parse_keyset(keys) {
            Ok(keyset) => dispatch_forward_with_keyset(
                op,
                mode,
                &operands,
                keyset,
                LaunchConfig::default(),
            )
            .map_err(|error| error.to_string()),
            Err(error) => Err(error),
        }
    } else {
        dispatch_forward(
            op,
            mode,
            &operands,
            case.requires_grad,
            LaunchConfig::default(),
        )
        .map_err(|error| error.to_string())
    };

    let mut extra_fields = BTreeMap::new();
    extra_fields.insert("op".to_string(), json!(op.name()));
    extra_fields.insert("device".to_string(), json!(format!("{device:?}")));
    extra_fields.insert("requires_grad".to_string(), json!(case.requires_grad));
    extra_fields.insert("keyset".to_string(), json!(case.keyset));

    if expectation.expect_error.unwrap_or(false) {
        let error_ok = result.is_err();
        let reason_code = if error_ok {
            "expected_error_observed"
        } else {
            "expected_error_missing"
        };
        extra_fields.insert(
            "error_message".to_string(),
            json!(result.as_ref().err()),
        );
        return Ok(DispatchCaseReport {
            name: case.name.clone(),
            mode,
            selected_key_ok: true,
            backend_key_ok: true,
            kernel_ok: true,
            fallback_ok: true,
            error_ok,
            forensic_log: dispatch_case_log(case, mode, pass_label(error_ok), reason_code)
                .with_extra_fields(extra_fields),
        });
    }

    let outcome =
        result.map_err(|error| format!("dispatch case '{}' failed: {error}", case.name))?;
    let decision = outcome.decision;

    let selected_key_ok = expectation
        .expected_selected_key
        .as_deref()
        .and_then(parse_dispatch_key)
        .is_none_or(|expected| expected == decision.selected_key);
    let backend_key_ok = expectation
        .expected_backend_key
        .as_deref()
        .and_then(parse_dispatch_key)
        .is_none_or(|expected| expected == decision.backend_key);
    let kernel_ok = expectation
        .expected_kernel
        .as_deref()
        .is_none_or(|expected| expected == decision.kernel);
    let fallback_ok = expectation
        .expected_fallback
        .is_none_or(|expected| expected == decision.fallback_used);
    let passed = selected_key_ok && backend_key_ok && kernel_ok && fallback_ok;
    let reason_code = if passed {
        "dispatch_route_ok"
    } else {
        "dispatch_route_mismatch"
    };

    extra_fields.insert(
        "selected_key".to_string(),
        json!(format!("{:?}", decision.selected_key)),
    );
    extra_fields.insert(
        "backend_key".to_string(),
        json!(format!("{:?}", decision.backend_key)),
    );
    extra_fields.insert("kernel".to_string(), json!(decision.kernel));
    extra_fields.insert(
        "keyset_bits".to_string(),
        json!(format!("0x{:016x}", decision.keyset_bits)),
    );
    extra_fields.insert("fallback_used".to_string(), json!(decision.fallback_used));

    Ok(DispatchCaseReport {
        name: case.name.clone(),
        mode,
        selected_key_ok,
        backend_key_ok,
        kernel_ok,
        fallback_ok,
        error_ok: true,
        forensic_log: dispatch_case_log(case, mode, pass_label(passed), reason_code)
            .with_extra_fields(extra_fields),
    })
}

fn dispatch_case_log(
    case: &DispatchCase,
    mode: ExecutionMode,
    outcome: &'static str,
    reason_code: &str,
) -> StructuredCaseLog {
    StructuredCaseLog::new(
        "dispatch",
        "dispatch_cases.json",
        case.name.as_str(),
        mode,
        vec!["crates/dq-conformance/fixtures/dispatch_cases.json".to_string()],
        format!(
            "cargo test -p dq-conformance dispatch_fixture_executes_in_both_modes -- --nocapture # mode={}",
            mode_label(mode)
        ),
        outcome,
        reason_code,
    )
}

/// Inputs of one gradcheck run, shared by every perturbed forward.
struct ShiftedForward<'a> {
    op: QuatOp,
    inputs: &'a [Vec<f64>],
    batch: usize,
}

impl ShiftedForward<'_> {
    /// Forward outputs with `delta` added to `component` of input
    /// `input_idx` in every lane at once.
    fn shifted_outputs(
        &self,
        session: &mut QuatSession,
        input_idx: usize,
        component: usize,
        delta: f64,
    ) -> Result<Vec<Vec<f64>>, String> {
        let widths = self.op.schema().input_widths;
        let width = widths[input_idx];
        let mut shifted = self.inputs[input_idx].clone();
        for lane in 0..self.batch {
            shifted[lane * width + component] += delta;
        }

        let mut tensors = Vec::with_capacity(widths.len());
        for (idx, &input_width) in widths.iter().enumerate() {
            let values = if idx == input_idx {
                shifted.clone()
            } else {
                self.inputs[idx].clone()
            };
            tensors.push(batched_tensor(values, self.batch, input_width)?);
        }
        let result = session
            .forward(self.op.name(), &tensors.iter().collect::<Vec<_>>())
            .map_err(|error| format!("gradcheck forward of {} failed: {error}", self.op))?;
        result.outputs.iter().map(tensor_values).collect()
    }
}

fn gradcheck_case(
    config: &HarnessConfig,
    mode: ExecutionMode,
    op: QuatOp,
    batch: usize,
) -> Result<GradcheckCaseReport, String> {
    let schema = op.schema();
    let case_name = format!("{}_batch_{batch}", op.name());
    let seed = config.seed ^ det_seed(&["gradcheck", case_name.as_str()]);
    let mut rng = StdRng::seed_from_u64(seed);

    let inputs = sampling::sample_batch(op, batch, &mut rng);
    let grad_outputs = schema
        .output_widths
        .iter()
        .map(|width| sampling::uniform_buffer(&mut rng, width * batch, 1.0))
        .collect::<Vec<_>>();

    let mut session = QuatSession::new(mode);
    let input_tensors = inputs
        .iter()
        .zip(schema.input_widths)
        .map(|(values, &width)| batched_tensor(values.clone(), batch, width))
        .collect::<Result<Vec<_>, _>>()?;
    let forward = session
        .forward(op.name(), &input_tensors.iter().collect::<Vec<_>>())
        .map_err(|error| format!("gradcheck forward of {op} failed: {error}"))?;
    let grad_tensors = grad_outputs
        .iter()
        .zip(schema.output_widths)
        .map(|(values, &width)| batched_tensor(values.clone(), batch, width))
        .collect::<Result<Vec<_>, _>>()?;
    let backward = session
        .backward(&forward.saved, &grad_tensors.iter().collect::<Vec<_>>())
        .map_err(|error| format!("gradcheck backward of {op} failed: {error}"))?;
    let analytic = backward
        .grads
        .iter()
        .map(tensor_values)
        .collect::<Result<Vec<_>, _>>()?;

    let step = config.gradcheck.step;
    let shifted = ShiftedForward {
        op,
        inputs: &inputs,
        batch,
    };
    let mut checked_components = 0usize;
    let mut failures = 0usize;
    let mut max_abs_error = 0.0f64;
    let mut worst: Option<(&'static str, usize, usize)> = None;

    for (input_idx, &width) in schema.input_widths.iter().enumerate() {
        for component in 0..width {
            let plus = shifted.shifted_outputs(&mut session, input_idx, component, step)?;
            let minus = shifted.shifted_outputs(&mut session, input_idx, component, -step)?;
            for lane in 0..batch {
                let numeric =
                    directional_difference(&grad_outputs, &plus, &minus, schema.output_widths, lane)
                        / (2.0 * step);
                let analytic_value = analytic[input_idx][lane * width + component];
                let error = (analytic_value - numeric).abs();
                let bound = config.gradcheck.abs_tolerance
                    + config.gradcheck.rel_tolerance * numeric.abs();
                checked_components += 1;
                if error.is_nan() || error > bound {
                    failures += 1;
                }
                if error.is_nan() || error > max_abs_error {
                    max_abs_error = if error.is_nan() { f64::INFINITY } else { error };
                    worst = Some((schema.input_names[input_idx], lane, component));
                }
            }
        }
    }

    let passed = failures == 0;
    let reason_code = if passed {
        "gradcheck_ok"
    } else {
        "gradcheck_mismatch"
    };
    let mut extra_fields = BTreeMap::new();
    extra_fields.insert("op".to_string(), json!(op.name()));
    extra_fields.insert("batch".to_string(), json!(batch));
    extra_fields.insert("step".to_string(), json!(step));
    extra_fields.insert("checked_components".to_string(), json!(checked_components));
    extra_fields.insert("failures".to_string(), json!(failures));
    extra_fields.insert("max_abs_error".to_string(), json!(max_abs_error));
    extra_fields.insert(
        "worst".to_string(),
        json!(worst.map(|(input, lane, component)| json!({
            "input": input,
            "lane": lane,
            "component": component,
        }))),
    );
    extra_fields.insert(
        "runtime_evidence".to_string(),
        runtime_evidence_summary(session.evidence()),
    );

    Ok(GradcheckCaseReport {
        op,
        batch,
        mode,
        checked_components,
        failures,
        max_abs_error,
        forensic_log: StructuredCaseLog::new(
            "gradcheck",
            "generated",
            case_name.as_str(),
            mode,
            Vec::new(),
            format!(
                "cargo run -p dq-conformance --bin run_gradcheck_report -- --mode {} --op {} --batch {batch}",
                mode_label(mode),
                op.name()
            ),
            pass_label(passed),
            reason_code,
        )
        .with_seed(seed)
        .with_extra_fields(extra_fields),
    })
}

/// Input gradients of one forward/backward round trip at precision `T`.
fn backward_grads<T: Real>(
    session: &mut QuatSession,
    op: QuatOp,
    inputs: &[Vec<f64>],
    grad_outputs: &[Vec<f64>],
    lanes: usize,
) -> Result<Vec<Vec<f64>>, String> {
    let schema = op.schema();
    let narrow = |values: &Vec<f64>, width: usize| {
        batched_tensor(values.iter().map(|v| T::lit(*v)).collect(), lanes, width)
    };
    let input_tensors = inputs
        .iter()
        .zip(schema.input_widths)
        .map(|(values, &width)| narrow(values, width))
        .collect::<Result<Vec<_>, _>>()?;
    let grad_tensors = grad_outputs
        .iter()
        .zip(schema.output_widths)
        .map(|(values, &width)| narrow(values, width))
        .collect::<Result<Vec<_>, _>>()?;

    let forward = session
        .forward(op.name(), &input_tensors.iter().collect::<Vec<_>>())
        .map_err(|error| format!("{:?} forward of {op} failed: {error}", T::DTYPE))?;
    let backward = session
        .backward(&forward.saved, &grad_tensors.iter().collect::<Vec<_>>())
        .map_err(|error| format!("{:?} backward of {op} failed: {error}", T::DTYPE))?;
    backward.grads.iter().map(widened_values::<T>).collect()
}

fn precision_case(
    config: &HarnessConfig,
    mode: ExecutionMode,
    op: QuatOp,
) -> Result<PrecisionCaseReport, String> {
    let schema = op.schema();
    let lanes = config.property_lanes;
    let case_name = format!("{}_f32_backward", op.name());
    let seed = config.seed ^ det_seed(&["precision", case_name.as_str()]);
    let mut rng = StdRng::seed_from_u64(seed);

    // Both precisions must see bit-identical operands.
    let to_f32_grid = |values: Vec<f64>| {
        values
            .into_iter()
            .map(|v| f64::from(v as f32))
            .collect::<Vec<_>>()
    };
    let inputs = sampling::sample_batch(op, lanes, &mut rng)
        .into_iter()
        .map(to_f32_grid)
        .collect::<Vec<_>>();
    let grad_outputs = schema
        .output_widths
        .iter()
        .map(|width| to_f32_grid(sampling::uniform_buffer(&mut rng, width * lanes, 1.0)))
        .collect::<Vec<_>>();

    let mut session = QuatSession::new(mode);
    let wide = backward_grads::<f64>(&mut session, op, &inputs, &grad_outputs, lanes)?;
    let narrow = backward_grads::<f32>(&mut session, op, &inputs, &grad_outputs, lanes)?;

    let mut checked_components = 0usize;
    let mut failures = 0usize;
    let mut max_scaled_error = 0.0f64;
    for lane in 0..lanes {
        let lane_scale = schema
            .input_widths
            .iter()
            .zip(&wide)
            .flat_map(|(&width, grads)| &grads[lane * width..(lane + 1) * width])
            .fold(1.0f64, |acc, g| acc.max(g.abs()));
        let per_input = schema.input_widths.iter().zip(&wide).zip(&narrow);
        for ((&width, wide_grads), narrow_grads) in per_input {
            let span = lane * width..(lane + 1) * width;
            for (w, n) in wide_grads[span.clone()].iter().zip(&narrow_grads[span]) {
                let scaled = (w - n).abs() / lane_scale;
                checked_components += 1;
                if scaled.is_nan() || scaled > F32_AGREEMENT_TOLERANCE {
                    failures += 1;
                }
                max_scaled_error = worst_error(max_scaled_error, scaled);
            }
        }
    }

    let passed = failures == 0;
    let mut extra_fields = BTreeMap::new();
    extra_fields.insert("op".to_string(), json!(op.name()));
    extra_fields.insert("lanes".to_string(), json!(lanes));
    extra_fields.insert("checked_components".to_string(), json!(checked_components));
    extra_fields.insert("failures".to_string(), json!(failures));
    extra_fields.insert("max_scaled_error".to_string(), json!(max_scaled_error));
    extra_fields.insert("tolerance".to_string(), json!(F32_AGREEMENT_TOLERANCE));
    extra_fields.insert(
        "runtime_evidence".to_string(),
        runtime_evidence_summary(session.evidence()),
    );

    Ok(PrecisionCaseReport {
        op,
        mode,
        lanes,
        checked_components,
        failures,
        max_scaled_error,
        forensic_log: StructuredCaseLog::new(
            "precision",
            "generated",
            case_name.as_str(),
            mode,
            Vec::new(),
            format!(
                "cargo test -p dq-conformance f32_backward_agrees_with_f64 -- --nocapture # mode={}",
                mode_label(mode)
            ),
            pass_label(passed),
            if passed {
                "precision_agreement_ok"
            } else {
                "precision_agreement_mismatch"
            },
        )
        .with_seed(seed)
        .with_extra_fields(extra_fields),
    })
}

/// `sum_k g[lane, k] * (plus[lane, k] - minus[lane, k])` over every output.
fn directional_difference(
    grad_outputs: &[Vec<f64>],
    plus: &[Vec<f64>],
    minus: &[Vec<f64>],
    widths: &[usize],
    lane: usize,
) -> f64 {
    let mut total = 0.0;
    for (((grad, plus), minus), &width) in grad_outputs.iter().zip(plus).zip(minus).zip(widths) {
        let span = lane * width..(lane + 1) * width;
        total += grad[span.clone()]
            .iter()
            .zip(&plus[span.clone()])
            .zip(&minus[span])
            .map(|((g, p), m)| g * (p - m))
            .sum::<f64>();
    }
    total
}

fn broadcast_case(
    config: &HarnessConfig,
    mode: ExecutionMode,
    op: QuatOp,
    input_idx: usize,
) -> Result<BroadcastCaseReport, String> {
    let schema = op.schema();
    let lanes = config.broadcast_lanes;
    let input_name = schema.input_names[input_idx];
    let case_name = format!("{}_single_{input_name}", op.name());
    let seed = config.seed ^ det_seed(&["broadcast", case_name.as_str()]);
    let mut rng = StdRng::seed_from_u64(seed);

    let inputs = sampling::sample_batch(op, lanes, &mut rng);
    let width = schema.input_widths[input_idx];
    let single = inputs[input_idx][..width].to_vec();
    let replicated = single
        .iter()
        .copied()
        .cycle()
        .take(width * lanes)
        .collect::<Vec<_>>();
    let grad_outputs = schema
        .output_widths
        .iter()
        .map(|output_width| sampling::uniform_buffer(&mut rng, output_width * lanes, 1.0))
        .collect::<Vec<_>>();

    let mut broadcast_inputs = Vec::with_capacity(inputs.len());
    let mut replicated_inputs = Vec::with_capacity(inputs.len());
    for (idx, (values, &input_width)) in inputs.iter().zip(schema.input_widths).enumerate() {
        if idx == input_idx {
            broadcast_inputs.push(
                DenseTensor::from_values(vec![input_width], single.clone(), Device::Cpu)
                    .map_err(|error| format!("single-element tensor failed: {error}"))?,
            );
            replicated_inputs.push(batched_tensor(replicated.clone(), lanes, input_width)?);
        } else {
            broadcast_inputs.push(batched_tensor(values.clone(), lanes, input_width)?);
            replicated_inputs.push(batched_tensor(values.clone(), lanes, input_width)?);
        }
    }
    let grad_tensors = grad_outputs
        .iter()
        .zip(schema.output_widths)
        .map(|(values, &output_width)| batched_tensor(values.clone(), lanes, output_width))
        .collect::<Result<Vec<_>, _>>()?;
    let grad_refs = grad_tensors.iter().collect::<Vec<_>>();

    let mut session = QuatSession::new(mode);
    let broadcast = session
        .forward(op.name(), &broadcast_inputs.iter().collect::<Vec<_>>())
        .map_err(|error| format!("broadcast forward of {case_name} failed: {error}"))?;
    let expanded = session
        .forward(op.name(), &replicated_inputs.iter().collect::<Vec<_>>())
        .map_err(|error| format!("replicated forward of {case_name} failed: {error}"))?;

    let mut output_ok = broadcast.outputs.len() == expanded.outputs.len();
    for (lhs, rhs) in broadcast.outputs.iter().zip(&expanded.outputs) {
        output_ok &= lhs.shape() == rhs.shape();
        output_ok &= vec_within(&tensor_values(lhs)?, &tensor_values(rhs)?, 0.0);
    }

    let broadcast_grads = session
        .backward(&broadcast.saved, &grad_refs)
        .map_err(|error| format!("broadcast backward of {case_name} failed: {error}"))?;
    let expanded_grads = session
        .backward(&expanded.saved, &grad_refs)
        .map_err(|error| format!("replicated backward of {case_name} failed: {error}"))?;

    let mut grad_ok = broadcast_grads.grads.len() == expanded_grads.grads.len();
    let mut max_grad_error = 0.0f64;
    for (idx, (lhs, rhs)) in broadcast_grads
        .grads
        .iter()
        .zip(&expanded_grads.grads)
        .enumerate()
    {
        let lhs_values = tensor_values(lhs)?;
        let rhs_values = tensor_values(rhs)?;
        let expected = if idx == input_idx {
            grad_ok &= lhs.shape() == [width].as_slice();
            lane_sum(&rhs_values, width)
        } else {
            grad_ok &= lhs.shape() == rhs.shape();
            rhs_values
        };
        for (actual, expected) in lhs_values.iter().zip(&expected) {
            let error = (actual - expected).abs();
            max_grad_error = max_grad_error.max(error);
            grad_ok &= error <= 1e-10 * (1.0 + expected.abs());
        }
        grad_ok &= lhs_values.len() == expected.len();
    }

    let passed = output_ok && grad_ok;
    let reason_code = if passed {
        "broadcast_parity_ok"
    } else if output_ok {
        "broadcast_grad_reduction_mismatch"
    } else {
        "broadcast_output_mismatch"
    };
    let mut extra_fields = BTreeMap::new();
    extra_fields.insert("op".to_string(), json!(op.name()));
    extra_fields.insert("broadcast_input".to_string(), json!(input_name));
    extra_fields.insert("lanes".to_string(), json!(lanes));
    extra_fields.insert("max_grad_error".to_string(), json!(max_grad_error));
    extra_fields.insert(
        "runtime_evidence".to_string(),
        runtime_evidence_summary(session.evidence()),
    );

    Ok(BroadcastCaseReport {
        op,
        broadcast_input: input_name,
        mode,
        output_ok,
        grad_ok,
        forensic_log: StructuredCaseLog::new(
            "broadcast",
            "generated",
            case_name.as_str(),
            mode,
            Vec::new(),
            format!(
                "cargo test -p dq-conformance broadcast_suite_matches_replicated_operands -- --nocapture # mode={}",
                mode_label(mode)
            ),
            pass_label(passed),
            reason_code,
        )
        .with_seed(seed)
        .with_extra_fields(extra_fields),
    })
}

/// Sums a `[lanes, width]` buffer over its lanes.
fn lane_sum(values: &[f64], width: usize) -> Vec<f64> {
    let mut total = vec![0.0; width];
    for lane in values.chunks_exact(width) {
        for (acc, value) in total.iter_mut().zip(lane) {
            *acc += value;
        }
    }
    total
}

fn invariant_rng(config: &HarnessConfig, name: &str) -> (u64, StdRng) {
    let seed = config.seed ^ det_seed(&["invariants", name]);
    (seed, StdRng::seed_from_u64(seed))
}

fn invariant_report(
    name: &'static str,
    mode: ExecutionMode,
    lanes: usize,
    seed: u64,
    max_error: f64,
    tolerance: f64,
    session: &QuatSession,
) -> InvariantCaseReport {
    let passed = max_error <= tolerance;
    let mut extra_fields = BTreeMap::new();
    extra_fields.insert("lanes".to_string(), json!(lanes));
    extra_fields.insert("max_error".to_string(), json!(max_error));
    extra_fields.insert("tolerance".to_string(), json!(tolerance));
    extra_fields.insert(
        "runtime_evidence".to_string(),
        runtime_evidence_field(session.evidence()),
    );
    InvariantCaseReport {
        name,
        mode,
        lanes,
        max_error,
        passed,
        forensic_log: StructuredCaseLog::new(
            "invariants",
            "generated",
            name,
            mode,
            Vec::new(),
            format!(
                "cargo test -p dq-conformance invariant_suite_holds_in_both_modes -- --nocapture # mode={}",
                mode_label(mode)
            ),
            pass_label(passed),
            if passed {
                "invariant_holds"
            } else {
                "invariant_violated"
            },
        )
        .with_seed(seed)
        .with_extra_fields(extra_fields),
    }
}

/// Folds an error into a running maximum; NaN poisons the result.
fn worst_error(acc: f64, error: f64) -> f64 {
    if error.is_nan() {
        f64::INFINITY
    } else {
        acc.max(error)
    }
}

fn single_output(
    session: &mut QuatSession,
    op: QuatOp,
    inputs: &[&DenseTensor],
) -> Result<DenseTensor, String> {
    let mut result = session
        .forward(op.name(), inputs)
        .map_err(|error| format!("{op} failed: {error}"))?;
    result
        .outputs
        .drain(..)
        .next()
        .ok_or_else(|| format!("{op} produced no output"))
}

fn unit_product_is_unit(
    config: &HarnessConfig,
    mode: ExecutionMode,
    lanes: usize,
) -> Result<InvariantCaseReport, String> {
    let (seed, mut rng) = invariant_rng(config, "unit_product_is_unit");
    let a = quat_batch(lanes, || sampling::unit_quat(&mut rng).to_array())?;
    let b = quat_batch(lanes, || sampling::unit_quat(&mut rng).to_array())?;

    let mut session = QuatSession::new(mode);
    let product = single_output(&mut session, QuatOp::QuatMul, &[&a, &b])?;
    let norms = single_output(&mut session, QuatOp::QuatNormSquared, &[&product])?;
    let max_error = tensor_values(&norms)?
        .iter()
        .fold(0.0, |acc, n| worst_error(acc, (n - 1.0).abs()));
    Ok(invariant_report(
        "unit_product_is_unit",
        mode,
        lanes,
        seed,
        max_error,
        1e-12,
        &session,
    ))
}

fn mul_conjugate_is_norm_squared(
    config: &HarnessConfig,
    mode: ExecutionMode,
    lanes: usize,
) -> Result<InvariantCaseReport, String> {
    let (seed, mut rng) = invariant_rng(config, "mul_conjugate_is_norm_squared");
    let a = quat_batch(lanes, || sampling::any_quat(&mut rng))?;

    let mut session = QuatSession::new(mode);
    let conjugate = single_output(&mut session, QuatOp::QuatConjugate, &[&a])?;
    let product = single_output(&mut session, QuatOp::QuatMul, &[&a, &conjugate])?;
    let norms = single_output(&mut session, QuatOp::QuatNormSquared, &[&a])?;

    let product = tensor_values(&product)?;
    let norms = tensor_values(&norms)?;
    let mut max_error = 0.0;
    for (lane, n) in product.chunks_exact(4).zip(&norms) {
        max_error = worst_error(max_error, (lane[0] - n).abs());
        for component in &lane[1..] {
            max_error = worst_error(max_error, component.abs());
        }
    }
    Ok(invariant_report(
        "mul_conjugate_is_norm_squared",
        mode,
        lanes,
        seed,
        max_error,
        1e-12,
        &session,
    ))
}

fn rigid_round_trip(
    config: &HarnessConfig,
    mode: ExecutionMode,
    lanes: usize,
) -> Result<InvariantCaseReport, String> {
    let (seed, mut rng) = invariant_rng(config, "rigid_round_trip");
    let transforms = dual_batch(lanes, || sampling::rigid(&mut rng).to_array())?;

    let mut session = QuatSession::new(mode);
    let rigid = session
        .dual_to_rigid(&transforms)
        .map_err(|error| format!("dual_to_rigid failed: {error}"))?;
    let [rotation, translation] = rigid.outputs.as_slice() else {
        return Err("dual_to_rigid must produce rotation and translation".to_string());
    };
    let rebuilt = single_output(
        &mut session,
        QuatOp::DualFromRigid,
        &[rotation, translation],
    )?;

    let max_error = max_abs_diff(&tensor_values(&transforms)?, &tensor_values(&rebuilt)?);
    Ok(invariant_report(
        "rigid_round_trip",
        mode,
        lanes,
        seed,
        max_error,
        1e-12,
        &session,
    ))
}

fn sclerp_endpoints(
    config: &HarnessConfig,
    mode: ExecutionMode,
    lanes: usize,
) -> Result<InvariantCaseReport, String> {
    let (seed, mut rng) = invariant_rng(config, "sclerp_endpoints");
    let pairs = (0..lanes)
        .map(|_| sampling::screw_pair(&mut rng))
        .collect::<Vec<_>>();
    let a = dual_batch(lanes, {
        let mut iter = pairs.iter();
        move || iter.next().map_or([0.0; 8], |(a, _)| a.to_array())
    })?;
    let b = dual_batch(lanes, {
        let mut iter = pairs.iter();
        move || iter.next().map_or([0.0; 8], |(_, b)| b.to_array())
    })?;

    let mut session = QuatSession::new(mode);
    let mut max_error = 0.0f64;
    for (t, endpoint) in [(0.0, &a), (1.0, &b)] {
        let t = DenseTensor::from_values(vec![1], vec![t], Device::Cpu)
            .map_err(|error| format!("interpolation parameter tensor failed: {error}"))?;
        let out = single_output(&mut session, QuatOp::DualSclerp, &[&a, &b, &t])?;
        max_error = worst_error(
            max_error,
            max_abs_diff(&tensor_values(&out)?, &tensor_values(endpoint)?),
        );
    }
    Ok(invariant_report(
        "sclerp_endpoints",
        mode,
        lanes,
        seed,
        max_error,
        1e-10,
        &session,
    ))
}

fn matrix_round_trip_up_to_sign(
    config: &HarnessConfig,
    mode: ExecutionMode,
    lanes: usize,
) -> Result<InvariantCaseReport, String> {
    let (seed, mut rng) = invariant_rng(config, "matrix_round_trip_up_to_sign");
    let q = quat_batch(lanes, || sampling::unit_quat(&mut rng).to_array())?;

    let mut session = QuatSession::new(mode);
    let matrices = single_output(&mut session, QuatOp::QuatToMatrix, &[&q])?;
    let recovered = single_output(&mut session, QuatOp::QuatFromMatrix, &[&matrices])?;

    let original = tensor_values(&q)?;
    let recovered = tensor_values(&recovered)?;
    let mut max_error = 0.0;
    for (lhs, rhs) in original.chunks_exact(4).zip(recovered.chunks_exact(4)) {
        let same = lhs.iter().zip(rhs).map(|(l, r)| (l - r).abs()).fold(0.0, worst_error);
        let flipped = lhs.iter().zip(rhs).map(|(l, r)| (l + r).abs()).fold(0.0, worst_error);
        max_error = worst_error(max_error, same.min(flipped));
    }
    Ok(invariant_report(
        "matrix_round_trip_up_to_sign",
        mode,
        lanes,
        seed,
        max_error,
        1e-12,
        &session,
    ))
}

fn dual_normalize_unit_and_orthogonal(
    config: &HarnessConfig,
    mode: ExecutionMode,
    lanes: usize,
) -> Result<InvariantCaseReport, String> {
    let (seed, mut rng) = invariant_rng(config, "dual_normalize_unit_and_orthogonal");
    let a = dual_batch(lanes, || sampling::scaled_dual(&mut rng).to_array())?;

    let mut session = QuatSession::new(mode);
    let unit = single_output(&mut session, QuatOp::DualNormalize, &[&a])?;
    let mut max_error = 0.0;
    for lane in tensor_values(&unit)?.chunks_exact(8) {
        let (real, dual) = lane.split_at(4);
        let norm_squared = real.iter().map(|r| r * r).sum::<f64>();
        let dot = real.iter().zip(dual).map(|(r, d)| r * d).sum::<f64>();
        max_error = worst_error(max_error, (norm_squared - 1.0).abs());
        max_error = worst_error(max_error, dot.abs());
    }
    Ok(invariant_report(
        "dual_normalize_unit_and_orthogonal",
        mode,
        lanes,
        seed,
        max_error,
        1e-12,
        &session,
    ))
}

/// Sub-epsilon inputs come back as the identity with zero gradients, and
/// every lane is counted as degenerate.
fn degenerate_normalize_fallback(
    config: &HarnessConfig,
    mode: ExecutionMode,
    lanes: usize,
) -> Result<InvariantCaseReport, String> {
    let (seed, mut rng) = invariant_rng(config, "degenerate_normalize_fallback");
    let tiny = quat_batch(lanes, || sampling::any_quat(&mut rng).map(|v| v * 1e-14))?;
    let tiny_dual = dual_batch(lanes, || {
        let mut lane = sampling::any_dual(&mut rng);
        for value in &mut lane[..4] {
            *value *= 1e-14;
        }
        lane
    })?;

    let mut session = QuatSession::new(mode);
    let mut max_error = 0.0f64;
    for (op, input, identity) in [
        (QuatOp::QuatNormalize, &tiny, vec![1.0, 0.0, 0.0, 0.0]),
        (
            QuatOp::DualNormalize,
            &tiny_dual,
            vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        ),
    ] {
        let forward = session
            .forward(op.name(), &[input])
            .map_err(|error| format!("{op} failed: {error}"))?;
        if forward.degenerate_lanes != lanes {
            max_error = f64::INFINITY;
        }
        let output = forward
            .outputs
            .first()
            .ok_or_else(|| format!("{op} produced no output"))?;
        for lane in tensor_values(output)?.chunks_exact(identity.len()) {
            max_error = worst_error(max_error, max_abs_diff(lane, &identity));
        }

        let width = identity.len();
        let ones = batched_tensor(vec![1.0; lanes * width], lanes, width)?;
        let backward = session
            .backward(&forward.saved, &[&ones])
            .map_err(|error| format!("{op} backward failed: {error}"))?;
        for grad in &backward.grads {
            for value in tensor_values(grad)? {
                // Zero, and finite: NaN folds to infinity.
                max_error = worst_error(max_error, value.abs());
            }
        }
    }
    if session.evidence().iter().all(|entry| entry.kind != EvidenceKind::Degeneracy) {
        max_error = f64::INFINITY;
    }
    Ok(invariant_report(
        "degenerate_normalize_fallback",
        mode,
        lanes,
        seed,
        max_error,
        0.0,
        &session,
    ))
}

fn quat_batch(lanes: usize, mut next: impl FnMut() -> [f64; 4]) -> Result<DenseTensor, String> {
    let values = (0..lanes).flat_map(|_| next()).collect::<Vec<_>>();
    batched_tensor(values, lanes, 4)
}

fn dual_batch(lanes: usize, mut next: impl FnMut() -> [f64; 8]) -> Result<DenseTensor, String> {
    let values = (0..lanes).flat_map(|_| next()).collect::<Vec<_>>();
    batched_tensor(values, lanes, 8)
}

fn batched_tensor<T: Real>(
    values: Vec<T>,
    lanes: usize,
    width: usize,
) -> Result<DenseTensor, String> {
    DenseTensor::from_values(vec![lanes, width], values, Device::Cpu)
        .map_err(|error| format!("failed building [{lanes}, {width}] tensor: {error}"))
}

fn tensor_values(tensor: &DenseTensor) -> Result<Vec<f64>, String> {
    tensor
        .contiguous_values::<f64>()
        .map(Cow::into_owned)
        .map_err(|error| format!("tensor {} is not readable as f64: {error}", tensor.id()))
}

fn widened_values<T: Real>(tensor: &DenseTensor) -> Result<Vec<f64>, String> {
    tensor
        .contiguous_values::<T>()
        .map(|values| values.iter().map(|v| v.as_f64()).collect())
        .map_err(|error| {
            format!("tensor {} is not readable as {:?}: {error}", tensor.id(), T::DTYPE)
        })
}

fn max_abs_diff(lhs: &[f64], rhs: &[f64]) -> f64 {
    if lhs.len() != rhs.len() {
        return f64::INFINITY;
    }
    lhs.iter()
        .zip(rhs)
        .map(|(l, r)| (l - r).abs())
        .fold(0.0, worst_error)
}

/// `[1, 0, ..]`: every catalogue operator is total on it.
fn unit_lane(width: usize) -> Vec<f64> {
    let mut values = vec![0.0; width];
    values[0] = 1.0;
    values
}

fn pass_label(passed: bool) -> &'static str {
    if passed { "pass" } else { "fail" }
}

fn parse_op(raw: &str) -> Result<QuatOp, String> {
    QuatOp::from_name(raw).ok_or_else(|| format!("unsupported operation '{raw}'"))
}

fn parse_device(raw: &str) -> Result<Device, String> {
    match raw {
        "Cpu" | "CPU" => Ok(Device::Cpu),
        "Cuda" | "CUDA" => Ok(Device::Cuda),
        _ => Err(format!("unsupported device '{raw}'")),
    }
}

fn parse_dispatch_key(raw: &str) -> Option<DispatchKey> {
    match raw {
        "Undefined" => Some(DispatchKey::Undefined),
        "BackendSelect" => Some(DispatchKey::BackendSelect),
        "CPU" => Some(DispatchKey::CPU),
        "CUDA" => Some(DispatchKey::CUDA),
        "AutogradCPU" => Some(DispatchKey::AutogradCPU),
        _ => None,
    }
}

fn parse_keyset(keys: &[String]) -> Result<DispatchKeySet, String> {
    let mut parsed = Vec::with_capacity(keys.len());
    for key in keys {
        let parsed_key =
            parse_dispatch_key(key).ok_or_else(|| format!("unknown dispatch key '{key}'"))?;
        parsed.push(parsed_key);
    }
    Ok(DispatchKeySet::from_keys(parsed.as_slice()))
}

fn runtime_evidence_field(entries: &[EvidenceEntry]) -> Value {
    let mut fields = runtime_evidence_summary(entries);
    if let Value::Object(map) = &mut fields {
        map.insert(
            "entries".to_string(),
            entries
                .iter()
                .map(|entry| {
                    json!({
                        "ts_unix_ms": entry.ts_unix_ms,
                        "kind": runtime_evidence_kind_label(entry.kind),
                        "summary": entry.summary,
                    })
                })
                .collect(),
        );
    }
    fields
}

/// Counts only; the gradcheck ledger holds one entry per perturbed forward.
fn runtime_evidence_summary(entries: &[EvidenceEntry]) -> Value {
    let mut kind_counts: BTreeMap<String, usize> = BTreeMap::new();
    for entry in entries {
        kind_counts
            .entry(runtime_evidence_kind_label(entry.kind).to_string())
            .and_modify(|count| *count += 1)
            .or_insert(1);
    }
    json!({
        "total_entries": entries.len(),
        "kind_counts": kind_counts,
    })
}

fn runtime_evidence_kind_label(kind: EvidenceKind) -> &'static str {
    match kind {
        EvidenceKind::Dispatch => "dispatch",
        EvidenceKind::Backward => "backward",
        EvidenceKind::Policy => "policy",
        EvidenceKind::Degeneracy => "degeneracy",
    }
}

fn load_fixture<T>(path: &Path) -> Result<T, String>
where
    T: for<'de> Deserialize<'de>,
{
    let metadata = fs::metadata(path).map_err(|error| {
        format!(
            "failed reading fixture metadata {}: {error}",
            path.display()
        )
    })?;
    let size = metadata.len();
    if size > MAX_FIXTURE_BYTES {
        return Err(format!(
            "fixture {} exceeds max bytes: actual={size} max={MAX_FIXTURE_BYTES}",
            path.display()
        ));
    }

    let raw = fs::read_to_string(path)
        .map_err(|error| format!("failed reading fixture {}: {error}", path.display()))?;
    serde_json::from_str::<T>(&raw)
        .map_err(|error| format!("failed parsing fixture {}: {error}", path.display()))
}

fn summarize_passes<I>(iter: I) -> (usize, usize)
where
    I: Iterator<Item = bool>,
{
    let mut total = 0usize;
    let mut passed = 0usize;
    for is_passed in iter {
        total += 1;
        if is_passed {
            passed += 1;
        }
    }
    (total, passed)
}

fn within(actual: f64, expected: f64, tolerance: f64) -> bool {
    (actual - expected).abs() <= tolerance
}

fn vec_within(actual: &[f64], expected: &[f64], tolerance: f64) -> bool {
    actual.len() == expected.len()
        && actual
            .iter()
            .zip(expected.iter())
            .all(|(actual, expected)| within(*actual, *expected, tolerance))
}
