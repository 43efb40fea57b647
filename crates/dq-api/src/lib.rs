#![forbid(unsafe_code)]

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use dq_core::{
    DType, DenseTensor, Device, ExecutionMode, Real, TensorCompatError, TensorMeta,
    TensorMetaError,
};
use dq_device::{DeviceError, DeviceGuard};
use dq_dispatch::{dispatch_backward, dispatch_forward};
use dq_kernel_cpu::{KernelError, LaunchConfig, Operand};
use dq_runtime::{EvidenceEntry, EvidenceKind, RuntimeContext};

pub use dq_dispatch::{DispatchDecision, DispatchError, DispatchKey, OpSchema, Pass, QuatOp};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    UnsupportedDtype { operand: usize, dtype: DType },
    DeviceMismatch(DeviceError),
    UnknownOperator { name: String },
    DuplicateOperator { name: &'static str },
    Dispatch(DispatchError),
    Meta(TensorMetaError),
    SavedContextMismatch {
        expected: &'static str,
        actual: &'static str,
    },
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedDtype { operand, dtype } => {
                write!(f, "operand {operand} has unsupported dtype {dtype:?}")
            }
            Self::DeviceMismatch(error) => write!(f, "bridge device failure: {error}"),
            Self::UnknownOperator { name } => write!(f, "unknown operator '{name}'"),
            Self::DuplicateOperator { name } => {
                write!(f, "operator '{name}' is already registered")
            }
            Self::Dispatch(error) => write!(f, "bridge dispatch failure: {error}"),
            Self::Meta(error) => write!(f, "bridge tensor metadata failure: {error}"),
            Self::SavedContextMismatch { expected, actual } => write!(
                f,
                "saved context belongs to '{actual}', operator '{expected}' cannot consume it"
            ),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<DeviceError> for BridgeError {
    fn from(value: DeviceError) -> Self {
        Self::DeviceMismatch(value)
    }
}

impl From<DispatchError> for BridgeError {
    fn from(value: DispatchError) -> Self {
        Self::Dispatch(value)
    }
}

impl From<KernelError> for BridgeError {
    fn from(value: KernelError) -> Self {
        Self::Dispatch(DispatchError::Kernel(value))
    }
}

impl From<TensorCompatError> for BridgeError {
    fn from(value: TensorCompatError) -> Self {
        Self::Dispatch(DispatchError::Kernel(KernelError::Incompatible(value)))
    }
}

impl From<TensorMetaError> for BridgeError {
    fn from(value: TensorMetaError) -> Self {
        Self::Meta(value)
    }
}

/// Per-call settings the session hands to an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    pub mode: ExecutionMode,
    pub device: Device,
    pub requires_grad: bool,
    pub launch: LaunchConfig,
}

impl CallOptions {
    #[must_use]
    pub fn new(mode: ExecutionMode, device: Device) -> Self {
        Self {
            mode,
            device,
            requires_grad: true,
            launch: LaunchConfig::default(),
        }
    }
}

/// What a forward call keeps for its backward: contiguous copies of every
/// input in schema order.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedContext {
    op: QuatOp,
    dtype: DType,
    device: Device,
    inputs: Vec<DenseTensor>,
    batch_shape: Vec<usize>,
}

impl SavedContext {
    #[must_use]
    pub fn op(&self) -> QuatOp {
        self.op
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn inputs(&self) -> &[DenseTensor] {
        &self.inputs
    }

    /// Broadcast batch shape of the forward outputs.
    #[must_use]
    pub fn batch_shape(&self) -> &[usize] {
        &self.batch_shape
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForwardResult {
    pub outputs: Vec<DenseTensor>,
    pub saved: SavedContext,
    pub decision: DispatchDecision,
    pub degenerate_lanes: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackwardResult {
    /// Mirrors the forward inputs: same count, order and shapes.
    pub grads: Vec<DenseTensor>,
    pub decision: DispatchDecision,
    pub degenerate_lanes: usize,
}

/// Contract a host autograd engine drives: forward saves what backward
/// needs, backward returns one gradient per forward input.
pub trait DifferentiableOperator: fmt::Debug + Send + Sync {
    fn schema(&self) -> OpSchema;

    fn forward(
        &self,
        options: CallOptions,
        inputs: &[&DenseTensor],
    ) -> Result<ForwardResult, BridgeError>;

    fn backward(
        &self,
        options: CallOptions,
        saved: &SavedContext,
        grad_outputs: &[&DenseTensor],
    ) -> Result<BackwardResult, BridgeError>;
}

/// Catalogue operator backed by the CPU lane kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelOperator {
    op: QuatOp,
}

impl KernelOperator {
    #[must_use]
    pub fn new(op: QuatOp) -> Self {
        Self { op }
    }

    #[must_use]
    pub fn op(&self) -> QuatOp {
        self.op
    }
}

impl DifferentiableOperator for KernelOperator {
    fn schema(&self) -> OpSchema {
        self.op.schema()
    }

    fn forward(
        &self,
        options: CallOptions,
        inputs: &[&DenseTensor],
    ) -> Result<ForwardResult, BridgeError> {
        let schema = self.op.schema();
        ensure_count(schema.arity(), inputs.len())?;
        DeviceGuard::new(options.device).ensure_all(inputs)?;
        match shared_dtype(inputs, None)? {
            DType::F32 => forward_typed::<f32>(self.op, options, inputs),
            _ => forward_typed::<f64>(self.op, options, inputs),
        }
    }

    fn backward(
        &self,
        options: CallOptions,
        saved: &SavedContext,
        grad_outputs: &[&DenseTensor],
    ) -> Result<BackwardResult, BridgeError> {
        if saved.op != self.op {
            return Err(BridgeError::SavedContextMismatch {
                expected: self.op.name(),
                actual: saved.op.name(),
            });
        }
        let schema = self.op.schema();
        ensure_count(schema.output_widths.len(), grad_outputs.len())?;
        if saved.device != options.device {
            return Err(DeviceError::Mismatch {
                expected: options.device,
                actual: saved.device,
            }
            .into());
        }
        DeviceGuard::new(options.device).ensure_all(grad_outputs)?;
        match shared_dtype(grad_outputs, Some(saved.dtype))? {
            DType::F32 => backward_typed::<f32>(self.op, options, saved, grad_outputs),
            _ => backward_typed::<f64>(self.op, options, saved, grad_outputs),
        }
    }
}

fn ensure_count(expected: usize, actual: usize) -> Result<(), BridgeError> {
    if expected != actual {
        return Err(KernelError::ArityMismatch { expected, actual }.into());
    }
    Ok(())
}

/// Single kernel dtype across `tensors`; `F32`/`F64` only.
fn shared_dtype(tensors: &[&DenseTensor], expected: Option<DType>) -> Result<DType, BridgeError> {
    let mut shared = expected;
    for (operand, tensor) in tensors.iter().enumerate() {
        let dtype = tensor.meta().dtype();
        if !dtype.is_kernel_supported() {
            return Err(BridgeError::UnsupportedDtype { operand, dtype });
        }
        match shared {
            Some(lhs) if lhs != dtype => {
                return Err(TensorCompatError::DTypeMismatch { lhs, rhs: dtype }.into());
            }
            _ => shared = Some(dtype),
        }
    }
    Ok(shared.unwrap_or(DType::F64))
}

/// Contiguous values plus a matching dense meta for each tensor.
fn gather<'a, T: Real>(
    tensors: &[&'a DenseTensor],
) -> Result<(Vec<Cow<'a, [T]>>, Vec<TensorMeta>), BridgeError> {
    let mut values = Vec::with_capacity(tensors.len());
    let mut metas = Vec::with_capacity(tensors.len());
    for tensor in tensors {
        values.push(tensor.contiguous_values::<T>()?);
        metas.push(TensorMeta::from_shape(
            tensor.shape().to_vec(),
            T::DTYPE,
            tensor.meta().device(),
        ));
    }
    Ok((values, metas))
}

fn operands<'a, T>(values: &'a [Cow<'_, [T]>], metas: &'a [TensorMeta]) -> Vec<Operand<'a, T>>
where
    T: Real,
{
    values
        .iter()
        .zip(metas)
        .map(|(values, meta)| Operand::new(&**values, meta))
        .collect()
}

fn forward_typed<T: Real>(
    op: QuatOp,
    options: CallOptions,
    inputs: &[&DenseTensor],
) -> Result<ForwardResult, BridgeError> {
    let (values, metas) = gather::<T>(inputs)?;
    let outcome = dispatch_forward(
        op,
        options.mode,
        &operands(&values, &metas),
        options.requires_grad,
        options.launch,
    )?;

    let mut outputs = Vec::with_capacity(outcome.outputs.len());
    for (buffer, width) in outcome.outputs.into_iter().zip(op.schema().output_widths) {
        let mut shape = outcome.batch_shape.clone();
        shape.push(*width);
        outputs.push(DenseTensor::from_values(shape, buffer, options.device)?);
    }

    let mut saved_inputs = Vec::with_capacity(inputs.len());
    for (buffer, meta) in values.into_iter().zip(&metas) {
        saved_inputs.push(DenseTensor::from_values(
            meta.shape().to_vec(),
            buffer.into_owned(),
            options.device,
        )?);
    }

    Ok(ForwardResult {
        outputs,
        saved: SavedContext {
            op,
            dtype: T::DTYPE,
            device: options.device,
            inputs: saved_inputs,
            batch_shape: outcome.batch_shape,
        },
        decision: outcome.decision,
        degenerate_lanes: outcome.degenerate_lanes,
    })
}

fn backward_typed<T: Real>(
    op: QuatOp,
    options: CallOptions,
    saved: &SavedContext,
    grad_outputs: &[&DenseTensor],
) -> Result<BackwardResult, BridgeError> {
    let saved_refs = saved.inputs.iter().collect::<Vec<_>>();
    let (input_values, input_metas) = gather::<T>(&saved_refs)?;
    let (grad_values, grad_metas) = gather::<T>(grad_outputs)?;
    let outcome = dispatch_backward(
        op,
        options.mode,
        &operands(&input_values, &input_metas),
        &operands(&grad_values, &grad_metas),
        options.launch,
    )?;

    let mut grads = Vec::with_capacity(outcome.grads.len());
    for (buffer, meta) in outcome.grads.into_iter().zip(&input_metas) {
        grads.push(DenseTensor::from_values(
            meta.shape().to_vec(),
            buffer,
            options.device,
        )?);
    }
    Ok(BackwardResult {
        grads,
        decision: outcome.decision,
        degenerate_lanes: outcome.degenerate_lanes,
    })
}

/// Name-keyed operator table.
#[derive(Debug, Clone, Default)]
pub struct OperatorRegistry {
    operators: BTreeMap<&'static str, Arc<dyn DifferentiableOperator>>,
}

impl OperatorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every catalogue operator.
    #[must_use]
    pub fn with_catalogue() -> Self {
        let operators = QuatOp::all()
            .iter()
            .map(|op| {
                let operator: Arc<dyn DifferentiableOperator> = Arc::new(KernelOperator::new(*op));
                (op.name(), operator)
            })
            .collect();
        Self { operators }
    }

    pub fn register(
        &mut self,
        operator: Arc<dyn DifferentiableOperator>,
    ) -> Result<(), BridgeError> {
        let name = operator.schema().name;
        if self.operators.contains_key(name) {
            return Err(BridgeError::DuplicateOperator { name });
        }
        self.operators.insert(name, operator);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn DifferentiableOperator>, BridgeError> {
        self.operators
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownOperator {
                name: name.to_string(),
            })
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.operators.keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operators.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }
}

/// Mode, placement, registry and evidence ledger behind one caller.
#[derive(Debug, Clone)]
pub struct QuatSession {
    runtime: RuntimeContext,
    registry: OperatorRegistry,
    device: Device,
    launch: LaunchConfig,
}

impl QuatSession {
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        Self::with_device(mode, Device::Cpu)
    }

    #[must_use]
    pub fn with_device(mode: ExecutionMode, device: Device) -> Self {
        Self {
            runtime: RuntimeContext::new(mode),
            registry: OperatorRegistry::with_catalogue(),
            device,
            launch: LaunchConfig::default(),
        }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.runtime.mode()
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.runtime.set_mode(mode);
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn set_launch_config(&mut self, launch: LaunchConfig) {
        self.launch = launch;
    }

    #[must_use]
    pub fn registry(&self) -> &OperatorRegistry {
        &self.registry
    }

    pub fn register_operator(
        &mut self,
        operator: Arc<dyn DifferentiableOperator>,
    ) -> Result<(), BridgeError> {
        self.registry.register(operator)
    }

    fn options(&self) -> CallOptions {
        CallOptions {
            launch: self.launch,
            ..CallOptions::new(self.mode(), self.device)
        }
    }

    pub fn forward(
        &mut self,
        name: &str,
        inputs: &[&DenseTensor],
    ) -> Result<ForwardResult, BridgeError> {
        let operator = self.registry.get(name)?;
        let result = operator.forward(self.options(), inputs)?;
        self.record_decision(EvidenceKind::Dispatch, &result.decision, result.saved.batch_shape());
        self.runtime.record_degenerate_lanes(
            name,
            result.decision.pass.as_str(),
            result.degenerate_lanes,
        );
        Ok(result)
    }

    pub fn backward(
        &mut self,
        saved: &SavedContext,
        grad_outputs: &[&DenseTensor],
    ) -> Result<BackwardResult, BridgeError> {
        let name = saved.op().name();
        let operator = self.registry.get(name)?;
        let result = operator.backward(self.options(), saved, grad_outputs)?;
        self.record_decision(EvidenceKind::Backward, &result.decision, saved.batch_shape());
        self.runtime.record_degenerate_lanes(
            name,
            result.decision.pass.as_str(),
            result.degenerate_lanes,
        );
        Ok(result)
    }

    fn call(&mut self, op: QuatOp, inputs: &[&DenseTensor]) -> Result<ForwardResult, BridgeError> {
        self.forward(op.name(), inputs)
    }

    pub fn quat_mul(
        &mut self,
        a: &DenseTensor,
        b: &DenseTensor,
    ) -> Result<ForwardResult, BridgeError> {
        self.call(QuatOp::QuatMul, &[a, b])
    }

    pub fn quat_conjugate(&mut self, q: &DenseTensor) -> Result<ForwardResult, BridgeError> {
        self.call(QuatOp::QuatConjugate, &[q])
    }

    pub fn quat_norm_squared(&mut self, q: &DenseTensor) -> Result<ForwardResult, BridgeError> {
        self.call(QuatOp::QuatNormSquared, &[q])
    }

    pub fn quat_normalize(&mut self, q: &DenseTensor) -> Result<ForwardResult, BridgeError> {
        self.call(QuatOp::QuatNormalize, &[q])
    }

    pub fn quat_rotate(
        &mut self,
        q: &DenseTensor,
        v: &DenseTensor,
    ) -> Result<ForwardResult, BridgeError> {
        self.call(QuatOp::QuatRotate, &[q, v])
    }

    pub fn quat_exp(&mut self, v: &DenseTensor) -> Result<ForwardResult, BridgeError> {
        self.call(QuatOp::QuatExp, &[v])
    }

    pub fn quat_log(&mut self, q: &DenseTensor) -> Result<ForwardResult, BridgeError> {
        self.call(QuatOp::QuatLog, &[q])
    }

    pub fn quat_from_axis_angle(&mut self, r: &DenseTensor) -> Result<ForwardResult, BridgeError> {
        self.call(QuatOp::QuatFromAxisAngle, &[r])
    }

    pub fn quat_to_axis_angle(&mut self, q: &DenseTensor) -> Result<ForwardResult, BridgeError> {
        self.call(QuatOp::QuatToAxisAngle, &[q])
    }

    pub fn quat_to_matrix(&mut self, q: &DenseTensor) -> Result<ForwardResult, BridgeError> {
        self.call(QuatOp::QuatToMatrix, &[q])
    }

    pub fn quat_from_matrix(&mut self, m: &DenseTensor) -> Result<ForwardResult, BridgeError> {
        self.call(QuatOp::QuatFromMatrix, &[m])
    }

    pub fn quat_standardize(&mut self, q: &DenseTensor) -> Result<ForwardResult, BridgeError> {
        self.call(QuatOp::QuatStandardize, &[q])
    }

    /// Applying the result equals applying `b` first, then `a`.
    pub fn dual_mul(
        &mut self,
        a: &DenseTensor,
        b: &DenseTensor,
    ) -> Result<ForwardResult, BridgeError> {
        self.call(QuatOp::DualMul, &[a, b])
    }

    pub fn dual_conjugate(&mut self, a: &DenseTensor) -> Result<ForwardResult, BridgeError> {
        self.call(QuatOp::DualConjugate, &[a])
    }

    pub fn dual_number_conjugate(&mut self, a: &DenseTensor) -> Result<ForwardResult, BridgeError> {
        self.call(QuatOp::DualNumberConjugate, &[a])
    }

    pub fn dual_full_conjugate(&mut self, a: &DenseTensor) -> Result<ForwardResult, BridgeError> {
        self.call(QuatOp::DualFullConjugate, &[a])
    }

    pub fn dual_normalize(&mut self, a: &DenseTensor) -> Result<ForwardResult, BridgeError> {
        self.call(QuatOp::DualNormalize, &[a])
    }

    pub fn dual_from_rigid(
        &mut self,
        q: &DenseTensor,
        t: &DenseTensor,
    ) -> Result<ForwardResult, BridgeError> {
        self.call(QuatOp::DualFromRigid, &[q, t])
    }

    /// Outputs are the rotation `[.., 4]` and the translation `[.., 3]`.
    pub fn dual_to_rigid(&mut self, a: &DenseTensor) -> Result<ForwardResult, BridgeError> {
        self.call(QuatOp::DualToRigid, &[a])
    }

    pub fn dual_to_matrix(&mut self, a: &DenseTensor) -> Result<ForwardResult, BridgeError> {
        self.call(QuatOp::DualToMatrix, &[a])
    }

    pub fn dual_from_matrix(&mut self, m: &DenseTensor) -> Result<ForwardResult, BridgeError> {
        self.call(QuatOp::DualFromMatrix, &[m])
    }

    pub fn dual_apply(
        &mut self,
        a: &DenseTensor,
        p: &DenseTensor,
    ) -> Result<ForwardResult, BridgeError> {
        self.call(QuatOp::DualApply, &[a, p])
    }

    /// `t` has shape `[.., 1]` and is never clamped.
    pub fn dual_sclerp(
        &mut self,
        a: &DenseTensor,
        b: &DenseTensor,
        t: &DenseTensor,
    ) -> Result<ForwardResult, BridgeError> {
        self.call(QuatOp::DualSclerp, &[a, b, t])
    }

    #[must_use]
    pub fn evidence(&self) -> &[EvidenceEntry] {
        self.runtime.ledger().entries()
    }

    #[must_use]
    pub fn evidence_len(&self) -> usize {
        self.runtime.ledger().len()
    }

    #[must_use]
    pub fn dispatch_count(&self) -> usize {
        self.runtime.ledger().count_kind(EvidenceKind::Dispatch)
    }

    fn record_decision(
        &mut self,
        kind: EvidenceKind,
        decision: &DispatchDecision,
        batch: &[usize],
    ) {
        self.runtime.ledger_mut().record(
            kind,
            format!(
                "op={} pass={} batch={:?} mode={:?} kernel={} key={:?} backend={:?} keyset=0x{:016x} fallback={}",
                decision.op,
                decision.pass.as_str(),
                batch,
                decision.mode,
                decision.kernel,
                decision.selected_key,
                decision.backend_key,
                decision.keyset_bits,
                decision.fallback_used
            ),
        );
    }
}
