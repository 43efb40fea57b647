#![forbid(unsafe_code)]

use std::fmt;

use dq_core::{Device, ExecutionMode, Real, TensorMeta};
use dq_kernel_cpu::{
    ElementwiseKernel, KernelError, LaunchConfig, Operand, lanes, launch_backward, launch_forward,
    pack_lanes, split_lanes,
};

/// Fixed argument layout of one catalogue operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpSchema {
    pub name: &'static str,
    pub input_names: &'static [&'static str],
    pub input_widths: &'static [usize],
    pub output_names: &'static [&'static str],
    pub output_widths: &'static [usize],
}

impl OpSchema {
    #[must_use]
    pub fn arity(&self) -> usize {
        self.input_widths.len()
    }

    #[must_use]
    pub fn packed_output_width(&self) -> usize {
        self.output_widths.iter().sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pass {
    Forward,
    Backward,
}

impl Pass {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Backward => "backward",
        }
    }
}

macro_rules! quat_ops {
    ($(
        $variant:ident => $forward:ident / $backward:ident {
            inputs: [$($input:literal : $input_width:literal),+],
            outputs: [$($output:literal : $output_width:literal),+] $(,)?
        }
    )+) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum QuatOp {
            $($variant),+
        }

        impl QuatOp {
            #[must_use]
            pub const fn all() -> &'static [QuatOp] {
                &[$(QuatOp::$variant),+]
            }

            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(QuatOp::$variant => stringify!($forward)),+
                }
            }

            #[must_use]
            pub const fn schema(self) -> OpSchema {
                match self {
                    $(QuatOp::$variant => OpSchema {
                        name: stringify!($forward),
                        input_names: &[$($input),+],
                        input_widths: &[$($input_width),+],
                        output_names: &[$($output),+],
                        output_widths: &[$($output_width),+],
                    }),+
                }
            }

            /// Lane kernel pair with outputs packed back to back.
            #[must_use]
            pub fn kernel<T: Real>(self) -> ElementwiseKernel<T> {
                match self {
                    $(QuatOp::$variant => ElementwiseKernel {
                        name: stringify!($forward),
                        input_widths: &[$($input_width),+],
                        output_width: 0 $(+ $output_width)+,
                        forward: lanes::$forward::<T>,
                        backward: lanes::$backward::<T>,
                    }),+
                }
            }

            /// Registered kernel label for a resolved key, if one exists.
            #[must_use]
            pub const fn kernel_label(self, key: DispatchKey, pass: Pass) -> Option<&'static str> {
                match (self, key, pass) {
                    $(
                        (QuatOp::$variant, DispatchKey::CPU, Pass::Forward) => {
                            Some(concat!("cpu::", stringify!($forward)))
                        }
                        (QuatOp::$variant, DispatchKey::CPU, Pass::Backward) => {
                            Some(concat!("cpu::", stringify!($backward)))
                        }
                        (QuatOp::$variant, DispatchKey::AutogradCPU, Pass::Forward) => {
                            Some(concat!("autograd_cpu::", stringify!($forward)))
                        }
                        (QuatOp::$variant, DispatchKey::AutogradCPU, Pass::Backward) => {
                            Some(concat!("autograd_cpu::", stringify!($backward)))
                        }
                    )+
                    _ => None,
                }
            }
        }
    };
}

quat_ops! {
    QuatMul => quat_mul / quat_mul_backward {
        inputs: ["a": 4, "b": 4],
        outputs: ["c": 4],
    }
    QuatConjugate => quat_conjugate / quat_conjugate_backward {
        inputs: ["q": 4],
        outputs: ["c": 4],
    }
    QuatNormSquared => quat_norm_squared / quat_norm_squared_backward {
        inputs: ["q": 4],
        outputs: ["n": 1],
    }
    QuatNormalize => quat_normalize / quat_normalize_backward {
        inputs: ["q": 4],
        outputs: ["u": 4],
    }
    QuatRotate => quat_rotate / quat_rotate_backward {
        inputs: ["q": 4, "v": 3],
        outputs: ["v_rotated": 3],
    }
    QuatExp => quat_exp / quat_exp_backward {
        inputs: ["v": 3],
        outputs: ["q": 4],
    }
    QuatLog => quat_log / quat_log_backward {
        inputs: ["q": 4],
        outputs: ["v": 3],
    }
    QuatFromAxisAngle => quat_from_axis_angle / quat_from_axis_angle_backward {
        inputs: ["r": 3],
        outputs: ["q": 4],
    }
    QuatToAxisAngle => quat_to_axis_angle / quat_to_axis_angle_backward {
        inputs: ["q": 4],
        outputs: ["r": 3],
    }
    QuatToMatrix => quat_to_matrix / quat_to_matrix_backward {
        inputs: ["q": 4],
        outputs: ["m": 9],
    }
    QuatFromMatrix => quat_from_matrix / quat_from_matrix_backward {
        inputs: ["m": 9],
        outputs: ["q": 4],
    }
    QuatStandardize => quat_standardize / quat_standardize_backward {
        inputs: ["q": 4],
        outputs: ["q_standard": 4],
    }
    DualMul => dual_mul / dual_mul_backward {
        inputs: ["a": 8, "b": 8],
        outputs: ["c": 8],
    }
    DualConjugate => dual_conjugate / dual_conjugate_backward {
        inputs: ["a": 8],
        outputs: ["c": 8],
    }
    DualNumberConjugate => dual_number_conjugate / dual_number_conjugate_backward {
        inputs: ["a": 8],
        outputs: ["c": 8],
    }
    DualFullConjugate => dual_full_conjugate / dual_full_conjugate_backward {
        inputs: ["a": 8],
        outputs: ["c": 8],
    }
    DualNormalize => dual_normalize / dual_normalize_backward {
        inputs: ["a": 8],
        outputs: ["u": 8],
    }
    DualFromRigid => dual_from_rigid / dual_from_rigid_backward {
        inputs: ["q": 4, "t": 3],
        outputs: ["a": 8],
    }
    DualToRigid => dual_to_rigid / dual_to_rigid_backward {
        inputs: ["a": 8],
        outputs: ["q": 4, "t": 3],
    }
    DualToMatrix => dual_to_matrix / dual_to_matrix_backward {
        inputs: ["a": 8],
        outputs: ["m": 16],
    }
    DualFromMatrix => dual_from_matrix / dual_from_matrix_backward {
        inputs: ["m": 16],
        outputs: ["a": 8],
    }
    DualApply => dual_apply / dual_apply_backward {
        inputs: ["a": 8, "p": 3],
        outputs: ["p_moved": 3],
    }
    DualSclerp => dual_sclerp / dual_sclerp_backward {
        inputs: ["a": 8, "b": 8, "t": 1],
        outputs: ["c": 8],
    }
}

impl QuatOp {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|op| op.name() == name)
    }
}

impl fmt::Display for QuatOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DispatchKey {
    Undefined = 0,
    BackendSelect = 1,
    CPU = 2,
    CUDA = 3,
    AutogradCPU = 4,
}

impl DispatchKey {
    #[must_use]
    pub const fn bit(self) -> u64 {
        1u64 << (self as u8)
    }

    #[must_use]
    pub const fn for_device(device: Device) -> Self {
        match device {
            Device::Cpu => DispatchKey::CPU,
            Device::Cuda => DispatchKey::CUDA,
        }
    }
}

const TYPE_PRIORITY: [DispatchKey; 4] = [
    DispatchKey::AutogradCPU,
    DispatchKey::BackendSelect,
    DispatchKey::CUDA,
    DispatchKey::CPU,
];

const BACKEND_PRIORITY: [DispatchKey; 2] = [DispatchKey::CPU, DispatchKey::CUDA];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DispatchKeySet {
    bits: u64,
}

impl DispatchKeySet {
    #[must_use]
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    #[must_use]
    pub fn from_keys(keys: &[DispatchKey]) -> Self {
        let mut out = Self::empty();
        for key in keys {
            out.add(*key);
        }
        out
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.bits
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.bits == 0
    }

    pub fn add(&mut self, key: DispatchKey) {
        self.bits |= key.bit();
    }

    #[must_use]
    pub const fn has(self, key: DispatchKey) -> bool {
        (self.bits & key.bit()) != 0
    }

    pub fn highest_priority_type_id(self) -> Result<DispatchKey, DispatchKeyError> {
        if self.is_empty() {
            return Err(DispatchKeyError::EmptySet);
        }
        TYPE_PRIORITY
            .iter()
            .find(|&&key| self.has(key))
            .copied()
            .ok_or(DispatchKeyError::NoTypeKey)
    }

    pub fn highest_priority_backend_type_id(self) -> Result<DispatchKey, DispatchKeyError> {
        if self.is_empty() {
            return Err(DispatchKeyError::EmptySet);
        }
        BACKEND_PRIORITY
            .iter()
            .find(|&&key| self.has(key))
            .copied()
            .ok_or(DispatchKeyError::NoBackendKey)
    }

    pub fn validate_for_elementwise(self) -> Result<(), DispatchKeyError> {
        if self.is_empty() {
            return Err(DispatchKeyError::EmptySet);
        }
        if self.has(DispatchKey::AutogradCPU) && !self.has(DispatchKey::CPU) {
            return Err(DispatchKeyError::IncompatibleSet {
                reason: "AutogradCPU requires CPU backend availability",
            });
        }
        if self.has(DispatchKey::CPU) && self.has(DispatchKey::CUDA) {
            return Err(DispatchKeyError::IncompatibleSet {
                reason: "operands span more than one backend",
            });
        }
        self.highest_priority_type_id()?;
        self.highest_priority_backend_type_id()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKeyError {
    EmptySet,
    NoTypeKey,
    NoBackendKey,
    IncompatibleSet { reason: &'static str },
    NoKernel { key: DispatchKey },
}

impl fmt::Display for DispatchKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptySet => write!(f, "dispatch keyset is empty"),
            Self::NoTypeKey => write!(f, "dispatch keyset has no resolvable type key"),
            Self::NoBackendKey => write!(f, "dispatch keyset has no backend key"),
            Self::IncompatibleSet { reason } => {
                write!(f, "incompatible dispatch keyset: {reason}")
            }
            Self::NoKernel { key } => {
                write!(f, "no kernel registered for dispatch key {key:?}")
            }
        }
    }
}

impl std::error::Error for DispatchKeyError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchDecision {
    pub op: QuatOp,
    pub pass: Pass,
    pub mode: ExecutionMode,
    pub kernel: &'static str,
    pub selected_key: DispatchKey,
    pub backend_key: DispatchKey,
    pub keyset_bits: u64,
    pub fallback_used: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome<T> {
    /// One contiguous buffer per schema output.
    pub outputs: Vec<Vec<T>>,
    pub batch_shape: Vec<usize>,
    pub degenerate_lanes: usize,
    pub decision: DispatchDecision,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackwardOutcome<T> {
    /// One gradient per schema input, shaped like that input.
    pub grads: Vec<Vec<T>>,
    pub degenerate_lanes: usize,
    pub decision: DispatchDecision,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    Kernel(KernelError),
    Key(DispatchKeyError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kernel(error) => write!(f, "kernel dispatch failure: {error}"),
            Self::Key(error) => write!(f, "dispatch key failure: {error}"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<KernelError> for DispatchError {
    fn from(value: KernelError) -> Self {
        Self::Kernel(value)
    }
}

impl From<DispatchKeyError> for DispatchError {
    fn from(value: DispatchKeyError) -> Self {
        Self::Key(value)
    }
}

#[must_use]
pub fn dispatch_keyset_for_operands(metas: &[&TensorMeta], requires_grad: bool) -> DispatchKeySet {
    let mut keyset = DispatchKeySet::empty();
    for meta in metas {
        keyset.add(DispatchKey::for_device(meta.device()));
    }
    if requires_grad && keyset.has(DispatchKey::CPU) {
        keyset.add(DispatchKey::AutogradCPU);
    }
    keyset
}

fn resolve_decision(
    op: QuatOp,
    pass: Pass,
    mode: ExecutionMode,
    keyset: DispatchKeySet,
) -> Result<DispatchDecision, DispatchKeyError> {
    keyset.validate_for_elementwise()?;
    let selected_key = keyset.highest_priority_type_id()?;
    let backend_key = keyset.highest_priority_backend_type_id()?;

    let (effective_key, fallback_used) = match selected_key {
        DispatchKey::AutogradCPU | DispatchKey::CPU | DispatchKey::CUDA => (selected_key, false),
        DispatchKey::BackendSelect => match mode {
            ExecutionMode::Strict => {
                return Err(DispatchKeyError::IncompatibleSet {
                    reason: "strict mode forbids backend fallback routing",
                });
            }
            ExecutionMode::Hardened => (backend_key, true),
        },
        DispatchKey::Undefined => return Err(DispatchKeyError::NoTypeKey),
    };

    let kernel = op
        .kernel_label(effective_key, pass)
        .ok_or(DispatchKeyError::NoKernel { key: effective_key })?;

    if effective_key != backend_key && effective_key != DispatchKey::AutogradCPU {
        return Err(DispatchKeyError::IncompatibleSet {
            reason: "resolved key/backend key drifted to incompatible pair",
        });
    }

    Ok(DispatchDecision {
        op,
        pass,
        mode,
        kernel,
        selected_key,
        backend_key,
        keyset_bits: keyset.bits(),
        fallback_used,
    })
}

pub fn dispatch_forward<T: Real>(
    op: QuatOp,
    mode: ExecutionMode,
    inputs: &[Operand<'_, T>],
    requires_grad: bool,
    config: LaunchConfig,
) -> Result<DispatchOutcome<T>, DispatchError> {
    let metas = inputs.iter().map(|operand| operand.meta).collect::<Vec<_>>();
    let keyset = dispatch_keyset_for_operands(&metas, requires_grad);
    dispatch_forward_with_keyset(op, mode, inputs, keyset, config)
}

pub fn dispatch_forward_with_keyset<T: Real>(
    op: QuatOp,
    mode: ExecutionMode,
    inputs: &[Operand<'_, T>],
    keyset: DispatchKeySet,
    config: LaunchConfig,
) -> Result<DispatchOutcome<T>, DispatchError> {
    let decision = resolve_decision(op, Pass::Forward, mode, keyset)?;
    let output = launch_forward(&op.kernel::<T>(), inputs, config)?;
    Ok(DispatchOutcome {
        outputs: split_lanes(&output.values, op.schema().output_widths),
        batch_shape: output.batch_shape,
        degenerate_lanes: output.degenerate_lanes,
        decision,
    })
}

/// Backward always routes through the autograd key of the operands' backend.
pub fn dispatch_backward<T: Real>(
    op: QuatOp,
    mode: ExecutionMode,
    inputs: &[Operand<'_, T>],
    grad_outputs: &[Operand<'_, T>],
    config: LaunchConfig,
) -> Result<BackwardOutcome<T>, DispatchError> {
    let metas = inputs.iter().map(|operand| operand.meta).collect::<Vec<_>>();
    let keyset = dispatch_keyset_for_operands(&metas, true);
    dispatch_backward_with_keyset(op, mode, inputs, grad_outputs, keyset, config)
}

pub fn dispatch_backward_with_keyset<T: Real>(
    op: QuatOp,
    mode: ExecutionMode,
    inputs: &[Operand<'_, T>],
    grad_outputs: &[Operand<'_, T>],
    keyset: DispatchKeySet,
    config: LaunchConfig,
) -> Result<BackwardOutcome<T>, DispatchError> {
    let decision = resolve_decision(op, Pass::Backward, mode, keyset)?;
    let kernel = op.kernel::<T>();
    let schema = op.schema();

    let output = match grad_outputs {
        [single] if schema.output_widths.len() == 1 => {
            launch_backward(&kernel, inputs, *single, config)?
        }
        parts => {
            let (packed, mut shape) = pack_lanes(parts, schema.output_widths)?;
            shape.push(schema.packed_output_width());
            let device = parts
                .first()
                .map_or(Device::Cpu, |part| part.meta.device());
            let packed_meta = TensorMeta::from_shape(shape, T::DTYPE, device);
            launch_backward(&kernel, inputs, Operand::new(&packed, &packed_meta), config)?
        }
    };

    Ok(BackwardOutcome {
        grads: output.grads,
        degenerate_lanes: output.degenerate_lanes,
        decision,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use dq_core::{DType, Device, ExecutionMode, TensorMeta};
    use dq_kernel_cpu::{KernelError, LaunchConfig, MAX_ARITY, Operand};
    use proptest::prelude::*;

    use super::{
        DispatchError, DispatchKey, DispatchKeyError, DispatchKeySet, Pass, QuatOp, TYPE_PRIORITY,
        dispatch_backward, dispatch_backward_with_keyset, dispatch_forward,
        dispatch_forward_with_keyset, dispatch_keyset_for_operands,
    };

    fn det_seed(parts: &[u64]) -> u64 {
        let mut hash = 0xcbf2_9ce4_8422_2325u64;
        for value in parts {
            for byte in value.to_le_bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
        }
        hash
    }

    fn build_property_log(
        test_id: &str,
        mode: &str,
        seed: u64,
        input_digest: u64,
        output_digest: u64,
        reason_code: &str,
    ) -> BTreeMap<String, String> {
        let mut log = BTreeMap::new();
        let scenario_id = format!("dispatch_key/{mode}:{test_id}");
        log.insert("ts_utc".to_string(), "1970-01-01T00:00:00Z".to_string());
        log.insert("suite_id".to_string(), "dq_dispatch_property".to_string());
        log.insert("test_id".to_string(), test_id.to_string());
        log.insert(
            "fixture_id".to_string(),
            "dq_dispatch_property_generated".to_string(),
        );
        log.insert("scenario_id".to_string(), scenario_id);
        log.insert("mode".to_string(), mode.to_string());
        log.insert("seed".to_string(), seed.to_string());
        log.insert(
            "input_digest".to_string(),
            format!("det64:{input_digest:016x}"),
        );
        log.insert(
            "output_digest".to_string(),
            format!("det64:{output_digest:016x}"),
        );
        log.insert(
            "env_fingerprint".to_string(),
            "det64:dq-dispatch-test".to_string(),
        );
        log.insert(
            "replay_command".to_string(),
            format!("cargo test -p dq-dispatch {test_id} -- --nocapture"),
        );
        log.insert("duration_ms".to_string(), "0".to_string());
        log.insert("outcome".to_string(), "pass".to_string());
        log.insert("reason_code".to_string(), reason_code.to_string());
        log
    }

    fn assert_log_contract(log: &BTreeMap<String, String>) {
        for key in [
            "ts_utc",
            "suite_id",
            "test_id",
            "fixture_id",
            "scenario_id",
            "mode",
            "seed",
            "input_digest",
            "output_digest",
            "env_fingerprint",
            "replay_command",
            "duration_ms",
            "outcome",
            "reason_code",
        ] {
            assert!(
                log.contains_key(key),
                "property log missing required key '{key}'"
            );
        }
    }

    fn keyset_from_flags(
        backend_select: bool,
        cpu: bool,
        cuda: bool,
        autograd_cpu: bool,
    ) -> DispatchKeySet {
        let mut keyset = DispatchKeySet::empty();
        if backend_select {
            keyset.add(DispatchKey::BackendSelect);
        }
        if cpu {
            keyset.add(DispatchKey::CPU);
        }
        if cuda {
            keyset.add(DispatchKey::CUDA);
        }
        if autograd_cpu {
            keyset.add(DispatchKey::AutogradCPU);
        }
        keyset
    }

    fn meta(shape: &[usize]) -> TensorMeta {
        TensorMeta::from_shape(shape.to_vec(), DType::F64, Device::Cpu)
    }

    const QUARTER_TURN_Z: [f64; 4] = [
        std::f64::consts::FRAC_1_SQRT_2,
        0.0,
        0.0,
        std::f64::consts::FRAC_1_SQRT_2,
    ];

    #[test]
    fn catalogue_names_round_trip_and_match_kernels() {
        assert_eq!(QuatOp::all().len(), 23);
        for op in QuatOp::all() {
            assert_eq!(QuatOp::from_name(op.name()), Some(*op));
            let schema = op.schema();
            let kernel = op.kernel::<f64>();
            assert_eq!(schema.name, op.name());
            assert_eq!(kernel.name, op.name());
            assert_eq!(kernel.input_widths, schema.input_widths);
            assert_eq!(kernel.output_width, schema.packed_output_width());
            assert_eq!(schema.input_names.len(), schema.input_widths.len());
            assert_eq!(schema.output_names.len(), schema.output_widths.len());
            assert!(schema.arity() <= MAX_ARITY);
        }
        assert_eq!(QuatOp::from_name("quat_slerp"), None);
    }

    #[test]
    fn kernel_labels_exist_only_for_cpu_keys() {
        assert_eq!(
            QuatOp::DualSclerp.kernel_label(DispatchKey::CPU, Pass::Forward),
            Some("cpu::dual_sclerp")
        );
        assert_eq!(
            QuatOp::DualSclerp.kernel_label(DispatchKey::AutogradCPU, Pass::Backward),
            Some("autograd_cpu::dual_sclerp_backward")
        );
        assert_eq!(
            QuatOp::QuatMul.kernel_label(DispatchKey::CUDA, Pass::Forward),
            None
        );
        assert_eq!(
            QuatOp::QuatMul.kernel_label(DispatchKey::BackendSelect, Pass::Forward),
            None
        );
    }

    #[test]
    fn priority_resolution_prefers_autograd_cpu() {
        let keys = DispatchKeySet::from_keys(&[
            DispatchKey::BackendSelect,
            DispatchKey::CPU,
            DispatchKey::AutogradCPU,
        ]);
        let selected = keys
            .highest_priority_type_id()
            .expect("priority resolution should succeed");
        assert_eq!(selected, DispatchKey::AutogradCPU);
    }

    #[test]
    fn keyset_for_operands_tracks_device_and_requires_grad() {
        let cpu = meta(&[4]);
        let no_grad = dispatch_keyset_for_operands(&[&cpu, &cpu], false);
        assert!(no_grad.has(DispatchKey::CPU));
        assert!(!no_grad.has(DispatchKey::AutogradCPU));
        assert!(!no_grad.has(DispatchKey::BackendSelect));

        let with_grad = dispatch_keyset_for_operands(&[&cpu], true);
        assert!(with_grad.has(DispatchKey::AutogradCPU));

        let cuda = TensorMeta::from_shape(vec![4], DType::F64, Device::Cuda);
        let cuda_grad = dispatch_keyset_for_operands(&[&cuda], true);
        assert!(cuda_grad.has(DispatchKey::CUDA));
        assert!(!cuda_grad.has(DispatchKey::AutogradCPU));
    }

    #[test]
    fn validate_rejects_mixed_backends_and_orphan_autograd() {
        let mixed = DispatchKeySet::from_keys(&[DispatchKey::CPU, DispatchKey::CUDA]);
        assert!(matches!(
            mixed.validate_for_elementwise(),
            Err(DispatchKeyError::IncompatibleSet { .. })
        ));
        let orphan = DispatchKeySet::from_keys(&[DispatchKey::AutogradCPU]);
        assert!(matches!(
            orphan.validate_for_elementwise(),
            Err(DispatchKeyError::IncompatibleSet { .. })
        ));
    }

    #[test]
    fn forward_dispatch_returns_kernel_metadata() {
        let identity = [1.0, 0.0, 0.0, 0.0];
        let a_meta = meta(&[4]);
        let outcome = dispatch_forward(
            QuatOp::QuatMul,
            ExecutionMode::Strict,
            &[
                Operand::new(&identity, &a_meta),
                Operand::new(&QUARTER_TURN_Z, &a_meta),
            ],
            true,
            LaunchConfig::default(),
        )
        .expect("dispatch should succeed");

        assert_eq!(outcome.outputs, vec![QUARTER_TURN_Z.to_vec()]);
        assert!(outcome.batch_shape.is_empty());
        assert_eq!(outcome.decision.kernel, "autograd_cpu::quat_mul");
        assert_eq!(outcome.decision.pass, Pass::Forward);
        assert_eq!(outcome.decision.selected_key, DispatchKey::AutogradCPU);
        assert_eq!(outcome.decision.backend_key, DispatchKey::CPU);
        assert!(!outcome.decision.fallback_used);
    }

    #[test]
    fn multi_output_forward_is_split_per_schema() {
        let transform = [1.0, 0.0, 0.0, 0.0, 0.0, 0.5, -1.0, 1.5];
        let stacked = [transform, transform].concat();
        let a_meta = meta(&[2, 8]);
        let outcome = dispatch_forward(
            QuatOp::DualToRigid,
            ExecutionMode::Strict,
            &[Operand::new(&stacked, &a_meta)],
            false,
            LaunchConfig::default(),
        )
        .expect("dispatch should succeed");

        assert_eq!(outcome.outputs.len(), 2);
        assert_eq!(outcome.outputs[0], vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
        assert_eq!(outcome.outputs[1], vec![1.0, -2.0, 3.0, 1.0, -2.0, 3.0]);
        assert_eq!(outcome.decision.kernel, "cpu::dual_to_rigid");
    }

    #[test]
    fn multi_output_backward_packs_grad_outputs() {
        let transform = [0.6, -0.2, 0.5, 0.3, 0.1, 0.7, -0.4, 0.2];
        let a_meta = meta(&[8]);
        let grad_q = [0.3, -0.1, 0.5, 0.2];
        let grad_t = [-0.7, 0.4, 0.6];
        let grad_q_meta = meta(&[4]);
        let grad_t_meta = meta(&[3]);
        let outcome = dispatch_backward(
            QuatOp::DualToRigid,
            ExecutionMode::Strict,
            &[Operand::new(&transform, &a_meta)],
            &[
                Operand::new(&grad_q, &grad_q_meta),
                Operand::new(&grad_t, &grad_t_meta),
            ],
            LaunchConfig::default(),
        )
        .expect("backward should succeed");

        assert_eq!(outcome.grads.len(), 1);
        assert_eq!(outcome.grads[0].len(), 8);
        assert_eq!(outcome.decision.kernel, "autograd_cpu::dual_to_rigid_backward");
        // Rotation gradient passes straight through when the translation
        // gradient's contribution is removed.
        let rotation_only = dispatch_backward(
            QuatOp::DualToRigid,
            ExecutionMode::Strict,
            &[Operand::new(&transform, &a_meta)],
            &[
                Operand::new(&grad_q, &grad_q_meta),
                Operand::new(&[0.0; 3], &grad_t_meta),
            ],
            LaunchConfig::default(),
        )
        .expect("backward should succeed");
        assert_eq!(&rotation_only.grads[0][..4], &grad_q);
        assert_eq!(&rotation_only.grads[0][4..], &[0.0; 4]);
    }

    #[test]
    fn backward_rejects_wrong_grad_output_count() {
        let transform = [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let a_meta = meta(&[8]);
        let grad_q_meta = meta(&[4]);
        let err = dispatch_backward(
            QuatOp::DualToRigid,
            ExecutionMode::Strict,
            &[Operand::new(&transform, &a_meta)],
            &[Operand::new(&[0.0; 4], &grad_q_meta)],
            LaunchConfig::default(),
        )
        .expect_err("missing translation gradient must fail");
        assert!(matches!(
            err,
            DispatchError::Kernel(KernelError::ArityMismatch {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn cuda_operands_have_no_kernel() {
        let values = [1.0, 0.0, 0.0, 0.0];
        let cuda = TensorMeta::from_shape(vec![4], DType::F64, Device::Cuda);
        let err = dispatch_forward(
            QuatOp::QuatNormalize,
            ExecutionMode::Hardened,
            &[Operand::new(&values, &cuda)],
            false,
            LaunchConfig::default(),
        )
        .expect_err("cuda has no registered kernel");
        assert_eq!(
            err,
            DispatchError::Key(DispatchKeyError::NoKernel {
                key: DispatchKey::CUDA
            })
        );
    }

    #[test]
    fn strict_mode_rejects_backend_select_fallback() {
        let values = [0.0, 0.0, 0.0, 2.0];
        let q_meta = meta(&[4]);
        let keyset = DispatchKeySet::from_keys(&[DispatchKey::BackendSelect, DispatchKey::CPU]);
        let err = dispatch_forward_with_keyset(
            QuatOp::QuatNormalize,
            ExecutionMode::Strict,
            &[Operand::new(&values, &q_meta)],
            keyset,
            LaunchConfig::default(),
        )
        .expect_err("strict mode must fail closed");
        assert!(err.to_string().contains("strict mode forbids"));
    }

    #[test]
    fn hardened_mode_falls_back_to_cpu() {
        let values = [0.0, 0.0, 0.0, 2.0];
        let q_meta = meta(&[4]);
        let keyset = DispatchKeySet::from_keys(&[DispatchKey::BackendSelect, DispatchKey::CPU]);
        let out = dispatch_forward_with_keyset(
            QuatOp::QuatNormalize,
            ExecutionMode::Hardened,
            &[Operand::new(&values, &q_meta)],
            keyset,
            LaunchConfig::default(),
        )
        .expect("hardened mode should fall back");
        assert_eq!(out.outputs, vec![vec![0.0, 0.0, 0.0, 1.0]]);
        assert!(out.decision.fallback_used);
        assert_eq!(out.decision.selected_key, DispatchKey::BackendSelect);
        assert_eq!(out.decision.backend_key, DispatchKey::CPU);
        assert_eq!(out.decision.kernel, "cpu::quat_normalize");

        let grad = [1.0, 0.0, 0.0, 0.0];
        let back = dispatch_backward_with_keyset(
            QuatOp::QuatNormalize,
            ExecutionMode::Hardened,
            &[Operand::new(&values, &q_meta)],
            &[Operand::new(&grad, &q_meta)],
            keyset,
            LaunchConfig::default(),
        )
        .expect("hardened backward should fall back");
        assert_eq!(back.decision.kernel, "cpu::quat_normalize_backward");
        assert_eq!(back.grads, vec![vec![0.5, 0.0, 0.0, 0.0]]);
    }

    #[test]
    fn key_errors_surface_before_kernel_errors() {
        let values = [1.0, 0.0, 0.0];
        let bad_meta = meta(&[3]);
        let err = dispatch_forward_with_keyset(
            QuatOp::QuatNormalize,
            ExecutionMode::Strict,
            &[Operand::new(&values, &bad_meta)],
            DispatchKeySet::empty(),
            LaunchConfig::default(),
        )
        .expect_err("empty keyset must fail");
        assert_eq!(err, DispatchError::Key(DispatchKeyError::EmptySet));
    }

    #[test]
    fn property_log_contract_maps_to_dispatch_scenarios() {
        let seed = det_seed(&[0x13, 0x5, 0x2]);
        let log = build_property_log(
            "prop_contract_mapping",
            "strict",
            seed,
            0xdead_beef,
            0xbead_1337,
            "dispatch_property_contract_mapping_ok",
        );
        assert_log_contract(&log);
        let replay = log
            .get("replay_command")
            .expect("replay command must be present in property logs");
        assert!(replay.contains("cargo test -p dq-dispatch"));
    }

    proptest! {
        #[test]
        fn prop_priority_matches_explicit_table(
            backend_select in any::<bool>(),
            cpu in any::<bool>(),
            cuda in any::<bool>(),
            autograd_cpu in any::<bool>(),
        ) {
            let keyset = keyset_from_flags(backend_select, cpu, cuda, autograd_cpu);
            let result = keyset.highest_priority_type_id();
            if keyset.is_empty() {
                prop_assert!(matches!(result, Err(DispatchKeyError::EmptySet)));
            } else {
                let expected = TYPE_PRIORITY
                    .iter()
                    .copied()
                    .find(|key| keyset.has(*key))
                    .expect("non-empty keyset should have a type key");
                prop_assert_eq!(result.expect("type key should resolve"), expected);
            }
        }

        #[test]
        fn prop_validate_contract(
            backend_select in any::<bool>(),
            cpu in any::<bool>(),
            cuda in any::<bool>(),
            autograd_cpu in any::<bool>(),
        ) {
            let keyset = keyset_from_flags(backend_select, cpu, cuda, autograd_cpu);
            let validation = keyset.validate_for_elementwise();
            if keyset.is_empty() {
                prop_assert!(matches!(validation, Err(DispatchKeyError::EmptySet)));
            } else if (autograd_cpu && !cpu) || (cpu && cuda) {
                prop_assert!(matches!(
                    validation,
                    Err(DispatchKeyError::IncompatibleSet { .. })),
                    "expected IncompatibleSet, got {:?}", validation
                );
            } else if !cpu && !cuda {
                prop_assert!(matches!(validation, Err(DispatchKeyError::NoBackendKey)));
            } else {
                prop_assert!(validation.is_ok());
            }

            let bits = keyset.bits();
            let outcome = u64::from(validation.is_ok());
            let seed = det_seed(&[bits, outcome]);
            let log = build_property_log(
                "prop_validate_contract",
                "strict",
                seed,
                bits,
                outcome,
                "dispatch_validate_contract_ok",
            );
            assert_log_contract(&log);
        }

        #[test]
        fn prop_mode_split_for_backend_select(
            w in -10.0f64..10.0,
            x in -10.0f64..10.0,
            y in -10.0f64..10.0,
            z in -10.0f64..10.0,
        ) {
            let values = [w, x, y, z];
            let q_meta = meta(&[4]);
            let keyset = DispatchKeySet::from_keys(&[DispatchKey::BackendSelect, DispatchKey::CPU]);
            let operands = [Operand::new(&values, &q_meta)];

            let strict_err = dispatch_forward_with_keyset(
                QuatOp::QuatConjugate,
                ExecutionMode::Strict,
                &operands,
                keyset,
                LaunchConfig::default(),
            )
            .expect_err("strict mode must reject backend fallback");
            prop_assert!(strict_err.to_string().contains("strict mode forbids"));

            let hardened = dispatch_forward_with_keyset(
                QuatOp::QuatConjugate,
                ExecutionMode::Hardened,
                &operands,
                keyset,
                LaunchConfig::default(),
            )
            .expect("hardened mode should allow bounded fallback");
            prop_assert!(hardened.decision.fallback_used);
            prop_assert_eq!(&hardened.outputs[0], &vec![w, -x, -y, -z]);

            let seed = det_seed(&[w.to_bits(), x.to_bits(), y.to_bits(), z.to_bits()]);
            let log = build_property_log(
                "prop_mode_split_for_backend_select",
                "hardened",
                seed,
                q_meta.fingerprint64(),
                hardened.decision.keyset_bits,
                "dispatch_mode_split_contract_ok",
            );
            assert_log_contract(&log);
        }
    }
}
