#![forbid(unsafe_code)]

use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use num_traits::{Float, FloatConst};

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F64,
    F32,
    F16,
    BF16,
    I64,
}

impl DType {
    /// Whether the kernels have a precision instantiation for this dtype.
    #[must_use]
    pub const fn is_kernel_supported(self) -> bool {
        matches!(self, Self::F64 | Self::F32)
    }

    #[must_use]
    pub const fn element_size(self) -> usize {
        match self {
            Self::F64 | Self::I64 => 8,
            Self::F32 => 4,
            Self::F16 | Self::BF16 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Strict,
    Hardened,
}

/// Floating-point precision a kernel can be instantiated with.
///
/// `NORM_EPS` is the norm below which `normalize` returns its identity
/// fallback. `SERIES_EPS` is the angle (or vector length) below which the
/// exp/log helpers switch to their Taylor expansions. `SCREW_SERIES_EPS` is
/// the screw angle below which the ScLERP power coefficients use theirs.
pub trait Real:
    Float + FloatConst + Default + Send + Sync + fmt::Debug + fmt::Display + 'static
{
    const DTYPE: DType;
    const NORM_EPS: Self;
    const SERIES_EPS: Self;
    const SCREW_SERIES_EPS: Self;

    fn lit(value: f64) -> Self;

    fn as_f64(self) -> f64;

    fn storage_view(storage: &TensorStorage) -> Option<&[Self]>;

    fn into_storage(values: Vec<Self>) -> TensorStorage;

    /// Value select; both arms are already evaluated by the caller.
    #[inline]
    #[must_use]
    fn select(cond: bool, when_true: Self, when_false: Self) -> Self {
        if cond { when_true } else { when_false }
    }

    #[inline]
    #[must_use]
    fn half() -> Self {
        Self::lit(0.5)
    }

    #[inline]
    #[must_use]
    fn two() -> Self {
        Self::lit(2.0)
    }
}

impl Real for f64 {
    const DTYPE: DType = DType::F64;
    const NORM_EPS: f64 = 1e-12;
    const SERIES_EPS: f64 = 1e-3;
    const SCREW_SERIES_EPS: f64 = 2e-2;

    #[inline]
    fn lit(value: f64) -> Self {
        value
    }

    #[inline]
    fn as_f64(self) -> f64 {
        self
    }

    fn storage_view(storage: &TensorStorage) -> Option<&[Self]> {
        match storage {
            TensorStorage::F64(values) => Some(values.as_slice()),
            _ => None,
        }
    }

    fn into_storage(values: Vec<Self>) -> TensorStorage {
        TensorStorage::F64(values)
    }
}

impl Real for f32 {
    const DTYPE: DType = DType::F32;
    const NORM_EPS: f32 = 1e-6;
    const SERIES_EPS: f32 = 1e-2;
    const SCREW_SERIES_EPS: f32 = 2e-1;

    #[inline]
    fn lit(value: f64) -> Self {
        value as f32
    }

    #[inline]
    fn as_f64(self) -> f64 {
        f64::from(self)
    }

    fn storage_view(storage: &TensorStorage) -> Option<&[Self]> {
        match storage {
            TensorStorage::F32(values) => Some(values.as_slice()),
            _ => None,
        }
    }

    fn into_storage(values: Vec<Self>) -> TensorStorage {
        TensorStorage::F32(values)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorMeta {
    shape: Vec<usize>,
    strides: Vec<usize>,
    storage_offset: usize,
    dtype: DType,
    device: Device,
}

impl TensorMeta {
    #[must_use]
    pub fn from_shape(shape: Vec<usize>, dtype: DType, device: Device) -> Self {
        let strides = contiguous_strides(&shape);
        Self {
            shape,
            strides,
            storage_offset: 0,
            dtype,
            device,
        }
    }

    pub fn from_shape_and_strides(
        shape: Vec<usize>,
        strides: Vec<usize>,
        storage_offset: usize,
        dtype: DType,
        device: Device,
    ) -> Result<Self, TensorMetaError> {
        let meta = Self {
            shape,
            strides,
            storage_offset,
            dtype,
            device,
        };
        meta.validate()?;
        Ok(meta)
    }

    #[must_use]
    pub fn with_storage_offset(mut self, storage_offset: usize) -> Self {
        self.storage_offset = storage_offset;
        self
    }

    #[must_use]
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn validate(&self) -> Result<(), TensorMetaError> {
        self.max_linear_offset().map(|_| ())
    }

    fn max_linear_offset(&self) -> Result<usize, TensorMetaError> {
        if self.shape.len() != self.strides.len() {
            return Err(TensorMetaError::RankStrideMismatch {
                rank: self.shape.len(),
                strides: self.strides.len(),
            });
        }

        let mut max_linear_offset = 0usize;
        for (size, stride) in self.shape.iter().copied().zip(self.strides.iter().copied()) {
            if size == 0 {
                continue;
            }

            let span = stride
                .checked_mul(size.saturating_sub(1))
                .ok_or(TensorMetaError::StrideOverflow { size, stride })?;
            max_linear_offset = max_linear_offset.checked_add(span).ok_or(
                TensorMetaError::StorageOffsetOverflow {
                    storage_offset: self.storage_offset,
                    max_linear_offset,
                },
            )?;
        }

        self.storage_offset.checked_add(max_linear_offset).ok_or(
            TensorMetaError::StorageOffsetOverflow {
                storage_offset: self.storage_offset,
                max_linear_offset,
            },
        )
    }

    /// Number of storage slots the view can touch, counted from index 0.
    pub fn required_storage_len(&self) -> Result<usize, TensorMetaError> {
        if self.numel() == 0 {
            return Ok(0);
        }
        let last = self.max_linear_offset()?;
        last.checked_add(1)
            .ok_or(TensorMetaError::StorageOffsetOverflow {
                storage_offset: self.storage_offset,
                max_linear_offset: last,
            })
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    #[must_use]
    pub fn storage_offset(&self) -> usize {
        self.storage_offset
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
    pub fn numel(&self) -> usize {
        self.shape.iter().copied().product()
    }

    /// Leading dimensions; every dim except the trailing component dim.
    #[must_use]
    pub fn batch_shape(&self) -> &[usize] {
        match self.shape.split_last() {
            Some((_, batch)) => batch,
            None => &[],
        }
    }

    /// Width of the trailing component dim, `None` for a 0-d tensor.
    #[must_use]
    pub fn components(&self) -> Option<usize> {
        self.shape.last().copied()
    }

    #[must_use]
    pub fn batch_numel(&self) -> usize {
        self.batch_shape().iter().copied().product()
    }

    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        if self.shape.len() != self.strides.len() {
            return false;
        }

        let mut expected_stride = 1usize;
        for (size, stride) in self
            .shape
            .iter()
            .copied()
            .zip(self.strides.iter().copied())
            .rev()
        {
            // Singleton dimensions are contiguous regardless of stride.
            if size == 1 {
                continue;
            }
            if stride != expected_stride {
                return false;
            }
            let Some(next_expected) = expected_stride.checked_mul(size) else {
                return false;
            };
            expected_stride = next_expected;
        }
        true
    }

    /// Storage index of the `linear`-th element in row-major logical order.
    ///
    /// Callers must have validated the meta and keep `linear < numel()`.
    #[must_use]
    pub fn storage_index_for_linear(&self, linear: usize) -> usize {
        let mut remaining = linear;
        let mut offset = self.storage_offset;
        for (size, stride) in self
            .shape
            .iter()
            .copied()
            .zip(self.strides.iter().copied())
            .rev()
        {
            if size == 0 {
                return offset;
            }
            offset += (remaining % size) * stride;
            remaining /= size;
        }
        offset
    }

    #[must_use]
    pub fn fingerprint64(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.shape.hash(&mut hasher);
        self.strides.hash(&mut hasher);
        self.storage_offset.hash(&mut hasher);
        self.dtype.hash(&mut hasher);
        self.device.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorMetaError {
    RankStrideMismatch {
        rank: usize,
        strides: usize,
    },
    StrideOverflow {
        size: usize,
        stride: usize,
    },
    StorageOffsetOverflow {
        storage_offset: usize,
        max_linear_offset: usize,
    },
    StorageDTypeMismatch {
        meta: DType,
        storage: DType,
    },
    InsufficientStorage {
        needed: usize,
        available: usize,
    },
}

impl fmt::Display for TensorMetaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RankStrideMismatch { rank, strides } => {
                write!(f, "shape rank {rank} does not match strides rank {strides}")
            }
            Self::StrideOverflow { size, stride } => {
                write!(f, "stride overflow for size={size}, stride={stride}")
            }
            Self::StorageOffsetOverflow {
                storage_offset,
                max_linear_offset,
            } => write!(
                f,
                "storage offset overflow for storage_offset={storage_offset}, max_linear_offset={max_linear_offset}"
            ),
            Self::StorageDTypeMismatch { meta, storage } => {
                write!(
                    f,
                    "storage dtype mismatch: meta={meta:?}, storage={storage:?}"
                )
            }
            Self::InsufficientStorage { needed, available } => {
                write!(
                    f,
                    "insufficient storage: needed={needed}, available={available}"
                )
            }
        }
    }
}

impl std::error::Error for TensorMetaError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorCompatError {
    DTypeMismatch { lhs: DType, rhs: DType },
    DeviceMismatch { lhs: Device, rhs: Device },
}

impl fmt::Display for TensorCompatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DTypeMismatch { lhs, rhs } => {
                write!(f, "dtype mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::DeviceMismatch { lhs, rhs } => {
                write!(f, "device mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
        }
    }
}

impl std::error::Error for TensorCompatError {}

/// Backing buffer of a [`DenseTensor`].
///
/// `Raw` holds storage in a dtype the kernels cannot read (half precision,
/// integers); it exists so the bridge can reject such tensors by dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorStorage {
    F64(Vec<f64>),
    F32(Vec<f32>),
    Raw { dtype: DType, bytes: Vec<u8> },
}

impl TensorStorage {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::F64(_) => DType::F64,
            Self::F32(_) => DType::F32,
            Self::Raw { dtype, .. } => *dtype,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::F64(values) => values.len(),
            Self::F32(values) => values.len(),
            Self::Raw { dtype, bytes } => bytes.len() / dtype.element_size(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Strided tensor as handed over by the host framework.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseTensor {
    id: u64,
    meta: TensorMeta,
    storage: TensorStorage,
}

impl DenseTensor {
    pub fn new(meta: TensorMeta, storage: TensorStorage) -> Result<Self, TensorMetaError> {
        if meta.dtype() != storage.dtype() {
            return Err(TensorMetaError::StorageDTypeMismatch {
                meta: meta.dtype(),
                storage: storage.dtype(),
            });
        }
        let needed = meta.required_storage_len()?;
        if storage.len() < needed {
            return Err(TensorMetaError::InsufficientStorage {
                needed,
                available: storage.len(),
            });
        }
        Ok(Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            meta,
            storage,
        })
    }

    /// Contiguous tensor of the given shape over `values`.
    pub fn from_values<T: Real>(
        shape: Vec<usize>,
        values: Vec<T>,
        device: Device,
    ) -> Result<Self, TensorMetaError> {
        let meta = TensorMeta::from_shape(shape, T::DTYPE, device);
        Self::new(meta, T::into_storage(values))
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    #[must_use]
    pub fn storage(&self) -> &TensorStorage {
        &self.storage
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.meta.shape()
    }

    /// Logical values in row-major order, borrowed when the view is
    /// contiguous and gathered otherwise.
    pub fn contiguous_values<T: Real>(&self) -> Result<Cow<'_, [T]>, TensorCompatError> {
        let storage = T::storage_view(&self.storage).ok_or(TensorCompatError::DTypeMismatch {
            lhs: self.meta.dtype(),
            rhs: T::DTYPE,
        })?;
        let numel = self.meta.numel();
        if numel == 0 {
            return Ok(Cow::Borrowed(&[]));
        }
        if self.meta.is_contiguous() {
            let start = self.meta.storage_offset();
            return Ok(Cow::Borrowed(&storage[start..start + numel]));
        }
        Ok(Cow::Owned(
            (0..numel)
                .map(|linear| storage[self.meta.storage_index_for_linear(linear)])
                .collect(),
        ))
    }

    #[must_use]
    pub fn evidence_fingerprint64(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.id.hash(&mut hasher);
        self.meta.fingerprint64().hash(&mut hasher);
        self.storage.len().hash(&mut hasher);
        hasher.finish()
    }
}

pub fn ensure_compatible(lhs: &TensorMeta, rhs: &TensorMeta) -> Result<(), TensorCompatError> {
    if lhs.dtype() != rhs.dtype() {
        return Err(TensorCompatError::DTypeMismatch {
            lhs: lhs.dtype(),
            rhs: rhs.dtype(),
        });
    }

    if lhs.device() != rhs.device() {
        return Err(TensorCompatError::DeviceMismatch {
            lhs: lhs.device(),
            rhs: rhs.device(),
        });
    }

    Ok(())
}

#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    if shape.is_empty() {
        return Vec::new();
    }

    let mut strides = vec![1; shape.len()];
    let mut running = 1usize;
    for idx in (0..shape.len()).rev() {
        strides[idx] = running;
        running = running.saturating_mul(shape[idx]);
    }
    strides
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::{
        DType, DenseTensor, Device, Real, TensorCompatError, TensorMeta, TensorMetaError,
        TensorStorage, contiguous_strides, ensure_compatible,
    };

    fn det_seed(parts: &[usize]) -> u64 {
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
        seed: u64,
        output_digest: u64,
        reason_code: &str,
    ) -> BTreeMap<String, String> {
        let mut log = BTreeMap::new();
        log.insert("suite_id".to_string(), "dq_core_property".to_string());
        log.insert("test_id".to_string(), test_id.to_string());
        log.insert(
            "scenario_id".to_string(),
            format!("dq_core_property/strict:{test_id}"),
        );
        log.insert("mode".to_string(), "strict".to_string());
        log.insert("seed".to_string(), seed.to_string());
        log.insert(
            "output_digest".to_string(),
            format!("det64:{output_digest:016x}"),
        );
        log.insert(
            "replay_command".to_string(),
            format!("cargo test -p dq-core {test_id} -- --nocapture"),
        );
        log.insert("outcome".to_string(), "pass".to_string());
        log.insert("reason_code".to_string(), reason_code.to_string());
        log
    }

    fn assert_log_contract(log: &BTreeMap<String, String>) {
        for key in [
            "suite_id",
            "test_id",
            "scenario_id",
            "mode",
            "seed",
            "output_digest",
            "replay_command",
            "outcome",
            "reason_code",
        ] {
            assert!(
                log.contains_key(key),
                "property log missing required key '{key}'"
            );
        }
    }

    #[test]
    fn shape_builds_contiguous_strides() {
        let meta = TensorMeta::from_shape(vec![2, 3, 4], DType::F64, Device::Cpu);
        assert_eq!(meta.strides(), &[12, 4, 1]);
        assert_eq!(meta.numel(), 24);
        assert!(meta.is_contiguous());
    }

    #[test]
    fn batch_shape_excludes_component_dim() {
        let meta = TensorMeta::from_shape(vec![5, 7, 8], DType::F32, Device::Cpu);
        assert_eq!(meta.batch_shape(), &[5, 7]);
        assert_eq!(meta.components(), Some(8));
        assert_eq!(meta.batch_numel(), 35);

        let single = TensorMeta::from_shape(vec![4], DType::F32, Device::Cpu);
        assert!(single.batch_shape().is_empty());
        assert_eq!(single.batch_numel(), 1);
    }

    #[test]
    fn singleton_dim_stride_variation_is_still_contiguous() {
        let meta =
            TensorMeta::from_shape_and_strides(vec![1, 4], vec![0, 1], 0, DType::F64, Device::Cpu)
                .expect("broadcast shape should validate");
        assert!(meta.is_contiguous());
    }

    #[test]
    fn transposed_view_is_not_contiguous() {
        let meta =
            TensorMeta::from_shape_and_strides(vec![4, 2], vec![1, 4], 0, DType::F64, Device::Cpu)
                .expect("meta should validate");
        assert!(!meta.is_contiguous());
        assert_eq!(meta.storage_index_for_linear(0), 0);
        assert_eq!(meta.storage_index_for_linear(1), 4);
        assert_eq!(meta.storage_index_for_linear(2), 1);
    }

    #[test]
    fn required_storage_len_accounts_for_offset() {
        let meta =
            TensorMeta::from_shape(vec![3, 4], DType::F64, Device::Cpu).with_storage_offset(2);
        assert_eq!(meta.required_storage_len().expect("len"), 14);

        let empty = TensorMeta::from_shape(vec![0, 4], DType::F64, Device::Cpu);
        assert_eq!(empty.required_storage_len().expect("len"), 0);
    }

    #[test]
    fn dense_tensor_rejects_short_storage() {
        let meta = TensorMeta::from_shape(vec![2, 4], DType::F64, Device::Cpu);
        let err = DenseTensor::new(meta, TensorStorage::F64(vec![0.0; 7]))
            .expect_err("short storage must fail closed");
        assert!(matches!(
            err,
            TensorMetaError::InsufficientStorage {
                needed: 8,
                available: 7
            }
        ));
    }

    #[test]
    fn dense_tensor_rejects_storage_dtype_drift() {
        let meta = TensorMeta::from_shape(vec![4], DType::F32, Device::Cpu);
        let err = DenseTensor::new(meta, TensorStorage::F64(vec![0.0; 4]))
            .expect_err("dtype drift must fail closed");
        assert!(matches!(
            err,
            TensorMetaError::StorageDTypeMismatch {
                meta: DType::F32,
                storage: DType::F64
            }
        ));
    }

    #[test]
    fn contiguous_values_borrow_or_gather() {
        let dense = DenseTensor::from_values(vec![2, 2], vec![1.0f64, 2.0, 3.0, 4.0], Device::Cpu)
            .expect("tensor");
        let values = dense.contiguous_values::<f64>().expect("values");
        assert!(matches!(values, Cow::Borrowed(_)));
        assert_eq!(values.as_ref(), &[1.0, 2.0, 3.0, 4.0]);

        let transposed_meta =
            TensorMeta::from_shape_and_strides(vec![2, 2], vec![1, 2], 0, DType::F64, Device::Cpu)
                .expect("meta");
        let transposed =
            DenseTensor::new(transposed_meta, TensorStorage::F64(vec![1.0, 2.0, 3.0, 4.0]))
                .expect("tensor");
        let gathered = transposed.contiguous_values::<f64>().expect("values");
        assert!(matches!(gathered, Cow::Owned(_)));
        assert_eq!(gathered.as_ref(), &[1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn contiguous_values_reject_wrong_precision() {
        let dense =
            DenseTensor::from_values(vec![4], vec![1.0f32; 4], Device::Cpu).expect("tensor");
        let err = dense
            .contiguous_values::<f64>()
            .expect_err("reading f32 storage as f64 must fail");
        assert!(matches!(
            err,
            TensorCompatError::DTypeMismatch {
                lhs: DType::F32,
                rhs: DType::F64
            }
        ));
    }

    #[test]
    fn compatibility_checks_dtype_and_device() {
        let cpu64 = TensorMeta::from_shape(vec![4], DType::F64, Device::Cpu);
        let cpu32 = TensorMeta::from_shape(vec![4], DType::F32, Device::Cpu);
        let cuda64 = TensorMeta::from_shape(vec![4], DType::F64, Device::Cuda);

        assert!(ensure_compatible(&cpu64, &cpu64).is_ok());
        assert!(matches!(
            ensure_compatible(&cpu64, &cpu32),
            Err(TensorCompatError::DTypeMismatch { .. })
        ));
        assert!(matches!(
            ensure_compatible(&cpu64, &cuda64),
            Err(TensorCompatError::DeviceMismatch { .. })
        ));
    }

    #[test]
    fn precision_constants_are_ordered() {
        assert!(f64::NORM_EPS < f64::SERIES_EPS);
        assert!(f32::NORM_EPS < f32::SERIES_EPS);
        assert!(f64::SERIES_EPS < f64::SCREW_SERIES_EPS);
        assert!(f32::SERIES_EPS < f32::SCREW_SERIES_EPS);
        assert_eq!(<f32 as Real>::DTYPE, DType::F32);
        assert!(DType::F64.is_kernel_supported());
        assert!(!DType::BF16.is_kernel_supported());
    }

    #[test]
    fn raw_storage_reports_element_count() {
        let storage = TensorStorage::Raw {
            dtype: DType::F16,
            bytes: vec![0u8; 16],
        };
        assert_eq!(storage.len(), 8);
        assert_eq!(storage.dtype(), DType::F16);
    }

    #[test]
    fn meta_fingerprint_changes_when_offset_changes() {
        let a = TensorMeta::from_shape(vec![2, 4], DType::F64, Device::Cpu);
        let b = a.clone().with_storage_offset(1);
        assert_ne!(a.fingerprint64(), b.fingerprint64());
    }

    proptest! {
        #[test]
        fn prop_contiguous_stride_contract(shape in prop::collection::vec(1usize..=4, 1..=4)) {
            let strides = contiguous_strides(shape.as_slice());
            prop_assert_eq!(strides.len(), shape.len());
            prop_assert_eq!(strides.last().copied(), Some(1));

            let seed = det_seed(shape.as_slice());
            let log = build_property_log(
                "prop_contiguous_stride_contract",
                seed,
                det_seed(strides.as_slice()),
                "contiguous_stride_contract_ok",
            );
            assert_log_contract(&log);
        }

        #[test]
        fn prop_linear_index_matches_multi_index(
            shape in prop::collection::vec(1usize..=4, 1..=4),
        ) {
            let meta = TensorMeta::from_shape(shape.clone(), DType::F64, Device::Cpu);
            let max_linear = shape
                .iter()
                .zip(meta.strides())
                .map(|(dim, stride)| (dim - 1) * stride)
                .sum::<usize>();

            prop_assert_eq!(max_linear, meta.numel() - 1);
            prop_assert_eq!(meta.storage_index_for_linear(meta.numel() - 1), max_linear);

            let seed = det_seed(shape.as_slice());
            let log = build_property_log(
                "prop_linear_index_matches_multi_index",
                seed,
                max_linear as u64,
                "linear_index_contract_ok",
            );
            assert_log_contract(&log);
        }

        #[test]
        fn prop_rank_stride_mismatch_fail_closed(
            shape in prop::collection::vec(1usize..=4, 1..=4),
            extra in 1usize..=3,
        ) {
            let strides = vec![1usize; shape.len() + extra];
            let err = TensorMeta::from_shape_and_strides(
                shape.clone(),
                strides,
                0,
                DType::F64,
                Device::Cpu,
            )
            .expect_err("rank/stride mismatch must fail");

            match err {
                TensorMetaError::RankStrideMismatch { .. } => {}
                other => prop_assert!(false, "expected RankStrideMismatch, got {other:?}"),
            }
        }
    }
}
