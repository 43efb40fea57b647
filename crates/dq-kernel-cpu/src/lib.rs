#![forbid(unsafe_code)]

pub mod lanes;

use std::fmt;

use dq_core::{Real, TensorCompatError, TensorMeta, ensure_compatible};
use rayon::prelude::*;

/// Lanes below this count run on the calling thread as one task.
pub const MIN_LANES_PER_TASK: usize = 4096;

/// Upper bound on operator arity across the catalogue.
pub const MAX_ARITY: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    Incompatible(TensorCompatError),
    ShapeMismatch {
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    ComponentMismatch {
        operand: usize,
        expected: usize,
        actual: Option<usize>,
    },
    ArityMismatch {
        expected: usize,
        actual: usize,
    },
    UnsupportedLayout {
        operand: usize,
    },
    StorageSpanOverflow {
        operand: usize,
        storage_offset: usize,
        numel: usize,
    },
    InsufficientStorage {
        operand: usize,
        needed: usize,
        available: usize,
    },
    /// Broadcast lane count, or lanes times the packed lane width, exceeds
    /// `usize`.
    LaneCountOverflow {
        batch_shape: Vec<usize>,
        lane_width: usize,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incompatible(error) => write!(f, "incompatible tensors: {error}"),
            Self::ShapeMismatch { lhs, rhs } => {
                write!(f, "batch shape mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::ComponentMismatch {
                operand,
                expected,
                actual,
            } => write!(
                f,
                "component mismatch on operand {operand}: expected trailing dim {expected}, actual={actual:?}"
            ),
            Self::ArityMismatch { expected, actual } => {
                write!(f, "arity mismatch: expected={expected}, actual={actual}")
            }
            Self::UnsupportedLayout { operand } => {
                write!(f, "unsupported non-contiguous layout on operand {operand}")
            }
            Self::StorageSpanOverflow {
                operand,
                storage_offset,
                numel,
            } => write!(
                f,
                "storage span overflow on operand {operand}: storage_offset={storage_offset}, numel={numel}"
            ),
            Self::InsufficientStorage {
                operand,
                needed,
                available,
            } => write!(
                f,
                "insufficient storage on operand {operand}: needed={needed}, available={available}"
            ),
            Self::LaneCountOverflow {
                batch_shape,
                lane_width,
            } => write!(
                f,
                "lane count overflow: batch_shape={batch_shape:?}, lane_width={lane_width}"
            ),
        }
    }
}

impl std::error::Error for KernelError {}

impl From<TensorCompatError> for KernelError {
    fn from(value: TensorCompatError) -> Self {
        Self::Incompatible(value)
    }
}

/// Per-element forward body. Reads one element of each input and writes one
/// packed output element; returns `true` when the lane took a documented
/// fallback (degenerate normalize input).
pub type ForwardLane<T> = fn(inputs: &[&[T]], out: &mut [T]) -> bool;

/// Per-element backward body. Writes the gradients of all inputs packed one
/// after another in argument order.
pub type BackwardLane<T> = fn(inputs: &[&[T]], grad_out: &[T], grads: &mut [T]) -> bool;

/// Widths and lane bodies of one operator at one precision.
#[derive(Debug, Clone, Copy)]
pub struct ElementwiseKernel<T> {
    pub name: &'static str,
    pub input_widths: &'static [usize],
    pub output_width: usize,
    pub forward: ForwardLane<T>,
    pub backward: BackwardLane<T>,
}

impl<T> ElementwiseKernel<T> {
    #[must_use]
    pub fn arity(&self) -> usize {
        self.input_widths.len()
    }

    /// Width of one lane's packed input gradients.
    #[must_use]
    pub fn grad_width(&self) -> usize {
        self.input_widths.iter().sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    min_lanes_per_task: usize,
}

impl LaunchConfig {
    #[must_use]
    pub fn new(min_lanes_per_task: usize) -> Self {
        Self {
            min_lanes_per_task: min_lanes_per_task.max(1),
        }
    }

    #[must_use]
    pub fn min_lanes_per_task(&self) -> usize {
        self.min_lanes_per_task
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self::new(MIN_LANES_PER_TASK)
    }
}

/// One operand: its storage slice and the metadata describing it.
#[derive(Debug, Clone, Copy)]
pub struct Operand<'a, T> {
    pub values: &'a [T],
    pub meta: &'a TensorMeta,
}

impl<'a, T> Operand<'a, T> {
    #[must_use]
    pub fn new(values: &'a [T], meta: &'a TensorMeta) -> Self {
        Self { values, meta }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForwardOutput<T> {
    pub values: Vec<T>,
    pub batch_shape: Vec<usize>,
    pub degenerate_lanes: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackwardOutput<T> {
    /// One buffer per forward input, laid out in that input's shape.
    pub grads: Vec<Vec<T>>,
    pub degenerate_lanes: usize,
}

/// Combined batch shape under right-aligned broadcasting.
pub fn broadcast_batch_shapes(shapes: &[&[usize]]) -> Result<Vec<usize>, KernelError> {
    let rank = shapes.iter().map(|shape| shape.len()).max().unwrap_or(0);
    let mut out = vec![1usize; rank];
    for shape in shapes {
        let pad = rank - shape.len();
        for (dim, size) in shape.iter().copied().enumerate() {
            let slot = &mut out[pad + dim];
            if *slot == size || size == 1 {
                continue;
            }
            if *slot == 1 {
                *slot = size;
                continue;
            }
            return Err(KernelError::ShapeMismatch {
                lhs: out.clone(),
                rhs: shape.to_vec(),
            });
        }
    }
    Ok(out)
}

/// Maps an output lane to the element it reads from one operand.
#[derive(Debug, Clone)]
struct LaneIndexer {
    dims: Vec<usize>,
    /// Element strides of the operand in the broadcast rank; `0` on
    /// expanded dims.
    strides: Vec<usize>,
    direct: bool,
}

impl LaneIndexer {
    fn new(operand_batch: &[usize], batch_shape: &[usize]) -> Self {
        let direct =
            operand_batch.iter().product::<usize>() == batch_shape.iter().product::<usize>();
        let pad = batch_shape.len() - operand_batch.len();
        let mut strides = vec![0usize; batch_shape.len()];
        let mut running = 1usize;
        for dim in (0..operand_batch.len()).rev() {
            let size = operand_batch[dim];
            if size != 1 {
                strides[pad + dim] = running;
            }
            running *= size;
        }
        Self {
            dims: batch_shape.to_vec(),
            strides,
            direct,
        }
    }

    fn element(&self, lane: usize) -> usize {
        if self.direct {
            return lane;
        }
        let mut remaining = lane;
        let mut element = 0usize;
        for (size, stride) in self.dims.iter().zip(&self.strides).rev() {
            element += (remaining % size) * stride;
            remaining /= size;
        }
        element
    }
}

/// Validated, contiguous view of every operand of one launch.
struct LaunchPlan<'a, T> {
    windows: Vec<&'a [T]>,
    widths: Vec<usize>,
    indexers: Vec<LaneIndexer>,
    batch_shape: Vec<usize>,
    lanes: usize,
}

impl<'a, T: Real> LaunchPlan<'a, T> {
    /// Length of a buffer holding `lane_width` values per lane.
    fn buffer_len(&self, lane_width: usize) -> Result<usize, KernelError> {
        self.lanes
            .checked_mul(lane_width)
            .ok_or_else(|| KernelError::LaneCountOverflow {
                batch_shape: self.batch_shape.clone(),
                lane_width,
            })
    }

    fn lane_inputs(&self, lane: usize) -> [&'a [T]; MAX_ARITY] {
        let empty: &'a [T] = &[];
        let mut inputs = [empty; MAX_ARITY];
        for (slot, ((window, width), indexer)) in inputs
            .iter_mut()
            .zip(self.windows.iter().zip(&self.widths).zip(&self.indexers))
        {
            let window: &'a [T] = window;
            let start = indexer.element(lane) * *width;
            *slot = &window[start..start + *width];
        }
        inputs
    }
}

fn contiguous_window<'a, T: Real>(
    operand: &Operand<'a, T>,
    index: usize,
) -> Result<&'a [T], KernelError> {
    let meta = operand.meta;
    if !meta.is_contiguous() {
        return Err(KernelError::UnsupportedLayout { operand: index });
    }
    let numel = meta.numel();
    if numel == 0 {
        return Ok(&[]);
    }
    let end = meta
        .storage_offset()
        .checked_add(numel)
        .ok_or(KernelError::StorageSpanOverflow {
            operand: index,
            storage_offset: meta.storage_offset(),
            numel,
        })?;
    if operand.values.len() < end {
        return Err(KernelError::InsufficientStorage {
            operand: index,
            needed: end,
            available: operand.values.len(),
        });
    }
    Ok(&operand.values[meta.storage_offset()..end])
}

fn ensure_precision<T: Real>(meta: &TensorMeta) -> Result<(), KernelError> {
    if meta.dtype() != T::DTYPE {
        return Err(KernelError::Incompatible(
            TensorCompatError::DTypeMismatch {
                lhs: meta.dtype(),
                rhs: T::DTYPE,
            },
        ));
    }
    Ok(())
}

fn ensure_components(
    meta: &TensorMeta,
    operand: usize,
    expected: usize,
) -> Result<(), KernelError> {
    if meta.components() != Some(expected) {
        return Err(KernelError::ComponentMismatch {
            operand,
            expected,
            actual: meta.components(),
        });
    }
    Ok(())
}

fn plan_launch<'a, T: Real>(
    kernel: &ElementwiseKernel<T>,
    inputs: &[Operand<'a, T>],
) -> Result<LaunchPlan<'a, T>, KernelError> {
    if inputs.len() != kernel.arity() || inputs.len() > MAX_ARITY {
        return Err(KernelError::ArityMismatch {
            expected: kernel.arity(),
            actual: inputs.len(),
        });
    }

    let Some(first) = inputs.first() else {
        return Err(KernelError::ArityMismatch {
            expected: kernel.arity(),
            actual: 0,
        });
    };

    for (index, (operand, width)) in inputs.iter().zip(kernel.input_widths).enumerate() {
        ensure_compatible(first.meta, operand.meta)?;
        ensure_precision::<T>(operand.meta)?;
        ensure_components(operand.meta, index, *width)?;
    }

    let batch_shapes = inputs
        .iter()
        .map(|operand| operand.meta.batch_shape())
        .collect::<Vec<_>>();
    let batch_shape = broadcast_batch_shapes(&batch_shapes)?;
    // Checked before any window or buffer so an oversized broadcast never
    // reaches the allocator.
    let lane_width = kernel.output_width.max(kernel.grad_width());
    let lanes = batch_shape
        .iter()
        .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
        .filter(|lanes| lanes.checked_mul(lane_width).is_some())
        .ok_or_else(|| KernelError::LaneCountOverflow {
            batch_shape: batch_shape.clone(),
            lane_width,
        })?;

    let mut windows = Vec::with_capacity(inputs.len());
    for (index, operand) in inputs.iter().enumerate() {
        windows.push(contiguous_window(operand, index)?);
    }

    let indexers = batch_shapes
        .iter()
        .map(|shape| LaneIndexer::new(shape, &batch_shape))
        .collect();

    Ok(LaunchPlan {
        windows,
        widths: kernel.input_widths.to_vec(),
        indexers,
        batch_shape,
        lanes,
    })
}

/// Runs `kernel.forward` over every broadcast lane.
///
/// All validation happens before the first lane runs; on error no output is
/// produced.
pub fn launch_forward<T: Real>(
    kernel: &ElementwiseKernel<T>,
    inputs: &[Operand<'_, T>],
    config: LaunchConfig,
) -> Result<ForwardOutput<T>, KernelError> {
    let plan = plan_launch(kernel, inputs)?;
    let width = kernel.output_width;
    let arity = kernel.arity();
    let mut values = vec![T::zero(); plan.buffer_len(width)?];

    let degenerate_lanes = values
        .par_chunks_mut(width)
        .with_min_len(config.min_lanes_per_task())
        .enumerate()
        .map(|(lane, out)| {
            let lane_inputs = plan.lane_inputs(lane);
            (kernel.forward)(&lane_inputs[..arity], out)
        })
        .filter(|degenerate| *degenerate)
        .count();

    Ok(ForwardOutput {
        values,
        batch_shape: plan.batch_shape,
        degenerate_lanes,
    })
}

/// Runs `kernel.backward` over every broadcast lane and folds the
/// per-lane contributions back into each input's shape.
///
/// `grad_output` must carry the forward output batch shape and the packed
/// output width.
pub fn launch_backward<T: Real>(
    kernel: &ElementwiseKernel<T>,
    inputs: &[Operand<'_, T>],
    grad_output: Operand<'_, T>,
    config: LaunchConfig,
) -> Result<BackwardOutput<T>, KernelError> {
    let plan = plan_launch(kernel, inputs)?;
    let grad_index = inputs.len();
    if let Some(first) = inputs.first() {
        ensure_compatible(first.meta, grad_output.meta)?;
    }
    ensure_precision::<T>(grad_output.meta)?;
    ensure_components(grad_output.meta, grad_index, kernel.output_width)?;
    if grad_output.meta.batch_shape() != plan.batch_shape.as_slice() {
        return Err(KernelError::ShapeMismatch {
            lhs: plan.batch_shape.clone(),
            rhs: grad_output.meta.batch_shape().to_vec(),
        });
    }
    let grad_window = contiguous_window(&grad_output, grad_index)?;

    let out_width = kernel.output_width;
    let grad_width = kernel.grad_width();
    let arity = kernel.arity();
    let mut expanded = vec![T::zero(); plan.buffer_len(grad_width)?];

    let degenerate_lanes = expanded
        .par_chunks_mut(grad_width)
        .with_min_len(config.min_lanes_per_task())
        .enumerate()
        .map(|(lane, grads)| {
            let lane_inputs = plan.lane_inputs(lane);
            let grad_out = &grad_window[lane * out_width..(lane + 1) * out_width];
            (kernel.backward)(&lane_inputs[..arity], grad_out, grads)
        })
        .filter(|degenerate| *degenerate)
        .count();

    let mut offset = 0usize;
    let mut grads = Vec::with_capacity(arity);
    for ((operand, width), indexer) in inputs.iter().zip(&plan.widths).zip(&plan.indexers) {
        grads.push(reduce_lane_grads(
            &expanded,
            grad_width,
            offset,
            *width,
            operand.meta.numel(),
            indexer,
            plan.lanes,
        ));
        offset += width;
    }

    Ok(BackwardOutput {
        grads,
        degenerate_lanes,
    })
}

/// Gathers one input's slice of the packed lane gradients. Broadcast inputs
/// are summed sequentially in lane order so results do not depend on
/// scheduling.
fn reduce_lane_grads<T: Real>(
    expanded: &[T],
    grad_width: usize,
    offset: usize,
    width: usize,
    numel: usize,
    indexer: &LaneIndexer,
    lanes: usize,
) -> Vec<T> {
    let mut out = vec![T::zero(); numel];
    if indexer.direct {
        for (dst, lane) in out.chunks_exact_mut(width).zip(expanded.chunks_exact(grad_width)) {
            dst.copy_from_slice(&lane[offset..offset + width]);
        }
        return out;
    }
    for lane in 0..lanes {
        let src = &expanded[lane * grad_width + offset..lane * grad_width + offset + width];
        let start = indexer.element(lane) * width;
        for (dst, value) in out[start..start + width].iter_mut().zip(src) {
            *dst = *dst + *value;
        }
    }
    out
}

/// Splits a packed per-lane buffer into one buffer per output.
#[must_use]
pub fn split_lanes<T: Copy>(packed: &[T], widths: &[usize]) -> Vec<Vec<T>> {
    let lane_width: usize = widths.iter().sum();
    if widths.len() == 1 {
        return vec![packed.to_vec()];
    }
    let lanes = if lane_width == 0 {
        0
    } else {
        packed.len() / lane_width
    };
    let mut parts: Vec<Vec<T>> = widths
        .iter()
        .map(|width| Vec::with_capacity(lanes * width))
        .collect();
    for lane in packed.chunks_exact(lane_width.max(1)) {
        let mut offset = 0usize;
        for (part, width) in parts.iter_mut().zip(widths) {
            part.extend_from_slice(&lane[offset..offset + width]);
            offset += width;
        }
    }
    parts
}

/// Interleaves several per-output gradients into the packed lane layout
/// [`launch_backward`] consumes. Every part must share one batch shape.
///
/// Returns the packed values together with their batch shape.
pub fn pack_lanes<T: Real>(
    parts: &[Operand<'_, T>],
    widths: &[usize],
) -> Result<(Vec<T>, Vec<usize>), KernelError> {
    if parts.len() != widths.len() || parts.is_empty() {
        return Err(KernelError::ArityMismatch {
            expected: widths.len(),
            actual: parts.len(),
        });
    }
    let first = parts[0].meta;
    let batch_shape = first.batch_shape().to_vec();
    let mut windows = Vec::with_capacity(parts.len());
    for (index, (part, width)) in parts.iter().zip(widths).enumerate() {
        ensure_compatible(first, part.meta)?;
        ensure_precision::<T>(part.meta)?;
        ensure_components(part.meta, index, *width)?;
        if part.meta.batch_shape() != batch_shape.as_slice() {
            return Err(KernelError::ShapeMismatch {
                lhs: batch_shape,
                rhs: part.meta.batch_shape().to_vec(),
            });
        }
        windows.push(contiguous_window(part, index)?);
    }

    let lanes = first.batch_numel();
    let lane_width: usize = widths.iter().sum();
    let mut packed = Vec::with_capacity(lanes * lane_width);
    for lane in 0..lanes {
        for (window, width) in windows.iter().zip(widths) {
            packed.extend_from_slice(&window[lane * width..(lane + 1) * width]);
        }
    }
    Ok((packed, batch_shape))
}
