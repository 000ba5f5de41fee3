//! Core Tensor type

use super::copy;
use super::layout::{Shape, Strides};
use super::{Layout, Storage, TensorId, WeakTensor};
use crate::dispatch::{Backend, Context, DispatchKey, OperatorTable};
use crate::dtype::{DType, Element};
use crate::error::{Error, Result};
use crate::runtime::Device;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Reference-counted handle to an n-dimensional array
///
/// A defined `Tensor` points at a shared implementation made of:
/// - **Storage**: reference-counted, type-tagged memory
/// - **Layout**: shape, strides, and offset into the storage
/// - **OperatorTable**: the dispatch cell for its backend and element type
///
/// Cloning a handle shares the implementation, so an in-place geometry
/// change such as [`resize_`](Self::resize_) is seen through every clone.
/// View operations (`view`, `transpose`, `narrow`, ...) create a new
/// implementation over the same storage.
///
/// The undefined tensor (`Tensor::default()`) has no implementation; every
/// accessor on it fails with [`Error::UndefinedTensor`].
///
/// # Example
///
/// ```
/// use tessera::prelude::*;
///
/// let ctx = Context::default();
/// let a = Tensor::from_slice(&ctx, &[1.0f32, 2.0, 3.0, 4.0], &[2, 2], Device::cpu())?;
/// let b = a.transpose(0, 1)?; // shares storage with a
/// assert!(b.shares_storage(&a));
/// assert_eq!(b.to_vec::<f32>()?, vec![1.0, 3.0, 2.0, 4.0]);
/// # Ok::<(), tessera::error::Error>(())
/// ```
#[derive(Clone, Default)]
pub struct Tensor {
    inner: Option<Arc<TensorImpl>>,
}

pub(crate) struct TensorImpl {
    id: TensorId,
    storage: Storage,
    layout: RwLock<Layout>,
    table: Arc<OperatorTable>,
}

impl Tensor {
    /// The undefined tensor
    pub const fn undefined() -> Self {
        Self { inner: None }
    }

    /// Build a tensor over `storage` with the given geometry
    ///
    /// This is the only non-default constructor. Fails with
    /// `InvalidArgument` for a missing storage or a sentinel table, and
    /// with `OutOfBounds` if the layout reaches past the storage.
    pub fn new(storage: Option<Storage>, layout: Layout, table: Arc<OperatorTable>) -> Result<Self> {
        let Some(storage) = storage else {
            return Err(Error::invalid_argument(
                "storage",
                "cannot build a Tensor over a null storage",
            ));
        };
        if table.is_undefined() {
            return Err(Error::invalid_argument(
                "table",
                "a defined Tensor needs a defined dispatch cell",
            ));
        }
        if storage.dtype() != table.dtype() {
            return Err(Error::DTypeMismatch {
                lhs: table.dtype(),
                rhs: storage.dtype(),
            });
        }
        if table.backend().device_type() != Some(storage.device().kind()) {
            return Err(Error::invalid_argument(
                "storage",
                format!("{} cannot address memory on {}", table.name(), storage.device()),
            ));
        }
        layout.check_bounds(storage.numel())?;
        Ok(Self::from_impl(storage, layout, table))
    }

    fn from_impl(storage: Storage, layout: Layout, table: Arc<OperatorTable>) -> Self {
        Self {
            inner: Some(Arc::new(TensorImpl {
                id: TensorId::new(),
                storage,
                layout: RwLock::new(layout),
                table,
            })),
        }
    }

    pub(crate) fn from_arc(inner: Arc<TensorImpl>) -> Self {
        Self { inner: Some(inner) }
    }

    // ===== Factories =====

    /// Contiguous tensor with unspecified contents
    pub fn empty(ctx: &Context, sizes: &[usize], dtype: DType, device: Device) -> Result<Self> {
        ctx.get_operator_table_checked(Backend::from_device(device), dtype)?
            .empty(device, sizes)
    }

    /// Contiguous tensor of zeros
    pub fn zeros(ctx: &Context, sizes: &[usize], dtype: DType, device: Device) -> Result<Self> {
        Self::full(ctx, sizes, 0.0, dtype, device)
    }

    /// Contiguous tensor with every element set to `value`
    pub fn full(
        ctx: &Context,
        sizes: &[usize],
        value: f64,
        dtype: DType,
        device: Device,
    ) -> Result<Self> {
        ctx.get_operator_table_checked(Backend::from_device(device), dtype)?
            .full(device, sizes, value)
    }

    /// Contiguous tensor holding a copy of `data`
    pub fn from_slice<T: Element>(
        ctx: &Context,
        data: &[T],
        sizes: &[usize],
        device: Device,
    ) -> Result<Self> {
        let numel: usize = sizes.iter().product();
        if numel != data.len() {
            return Err(Error::shape_mismatch(sizes, &[data.len()]));
        }
        let tensor = Self::empty(ctx, sizes, T::DTYPE, device)?;
        copy::write_elements(&tensor, data)?;
        Ok(tensor)
    }

    // ===== Identity =====

    /// Whether this handle has an implementation
    #[inline]
    pub fn defined(&self) -> bool {
        self.inner.is_some()
    }

    fn imp(&self, op: &'static str) -> Result<&Arc<TensorImpl>> {
        self.inner.as_ref().ok_or(Error::undefined(op))
    }

    /// Unique id of the implementation
    pub fn id(&self) -> Result<TensorId> {
        Ok(self.imp("id")?.id)
    }

    /// Whether two handles share one implementation
    ///
    /// Two undefined handles are the same.
    pub fn is_same(&self, other: &Tensor) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Whether both handles read the same buffer
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => a.storage.is_same(&b.storage),
            _ => false,
        }
    }

    /// Number of strong handles to the implementation (0 when undefined)
    pub fn use_count(&self) -> usize {
        self.inner.as_ref().map_or(0, Arc::strong_count)
    }

    /// Create a handle that does not keep the implementation alive
    pub fn downgrade(&self) -> WeakTensor {
        WeakTensor::new(self.inner.as_ref().map(Arc::downgrade))
    }

    // ===== Metadata =====

    /// Dispatch cell; the sentinel for an undefined tensor
    pub fn table(&self) -> &Arc<OperatorTable> {
        match &self.inner {
            Some(imp) => &imp.table,
            None => OperatorTable::undefined(),
        }
    }

    /// Element type (`Undefined` for an undefined tensor)
    pub fn dtype(&self) -> DType {
        self.table().dtype()
    }

    /// Backend (`Undefined` for an undefined tensor)
    pub fn backend(&self) -> Backend {
        self.table().backend()
    }

    /// Full dispatch coordinate
    pub fn dispatch_key(&self) -> DispatchKey {
        self.table().key()
    }

    /// Copy of the geometry
    pub fn layout(&self) -> Result<Layout> {
        Ok(self.imp("layout")?.layout.read().clone())
    }

    /// Size along each dimension
    pub fn sizes(&self) -> Result<Shape> {
        Ok(self.imp("sizes")?.layout.read().shape().into())
    }

    /// Stride (in elements) along each dimension
    pub fn strides(&self) -> Result<Strides> {
        Ok(self.imp("strides")?.layout.read().strides().into())
    }

    /// Size along dimension `d` (negative counts from the end)
    pub fn size(&self, d: isize) -> Result<usize> {
        let layout = self.imp("size")?.layout.read();
        layout.dim(d).ok_or(Error::InvalidDimension {
            dim: d,
            ndim: layout.ndim(),
        })
    }

    /// Number of dimensions
    pub fn dim(&self) -> Result<usize> {
        Ok(self.imp("dim")?.layout.read().ndim())
    }

    /// Number of elements
    pub fn numel(&self) -> Result<usize> {
        Ok(self.imp("numel")?.layout.read().elem_count())
    }

    /// Shared handle to the backing buffer
    pub fn storage(&self) -> Result<Storage> {
        Ok(self.imp("storage")?.storage.clone())
    }

    /// Element offset of the first element in the storage
    pub fn storage_offset(&self) -> Result<usize> {
        Ok(self.imp("storage_offset")?.layout.read().offset())
    }

    /// Whether the strides are the default row-major strides
    pub fn is_contiguous(&self) -> Result<bool> {
        Ok(self.imp("is_contiguous")?.layout.read().is_contiguous())
    }

    /// Device holding the storage
    pub fn device(&self) -> Result<Device> {
        Ok(self.imp("device")?.storage.device())
    }

    /// Address of the first element
    pub fn data_ptr(&self) -> Result<u64> {
        let imp = self.imp("data_ptr")?;
        let offset = imp.layout.read().offset() * imp.storage.dtype().size_in_bytes();
        Ok(imp.storage.data_ptr() + offset as u64)
    }

    // ===== Views =====

    fn with_layout(&self, op: &'static str, layout: Layout) -> Result<Self> {
        let imp = self.imp(op)?;
        layout.check_bounds(imp.storage.numel())?;
        Ok(Self::from_impl(
            imp.storage.clone(),
            layout,
            Arc::clone(&imp.table),
        ))
    }

    /// Same elements with a new shape, without copying
    ///
    /// Fails with `UnrepresentableView` when the strides cannot express the
    /// new shape; use [`reshape`](Self::reshape) to fall back to a copy.
    pub fn view(&self, sizes: &[usize]) -> Result<Self> {
        let layout = self.imp("view")?.layout.read().view(sizes)?;
        self.with_layout("view", layout)
    }

    /// A view when possible, otherwise a contiguous copy with the new shape
    pub fn reshape(&self, sizes: &[usize]) -> Result<Self> {
        match self.view(sizes) {
            Err(Error::UnrepresentableView { .. }) => self.contiguous()?.view(sizes),
            other => other,
        }
    }

    /// View with explicit geometry over the same storage
    ///
    /// `offset` defaults to the current storage offset.
    pub fn as_strided(
        &self,
        sizes: &[usize],
        strides: &[isize],
        offset: Option<usize>,
    ) -> Result<Self> {
        let current = self.storage_offset()?;
        let layout = Layout::new(sizes, strides, offset.unwrap_or(current))?;
        self.with_layout("as_strided", layout)
    }

    /// Swap two dimensions
    pub fn transpose(&self, dim0: isize, dim1: isize) -> Result<Self> {
        let layout = self.imp("transpose")?.layout.read().transpose(dim0, dim1)?;
        self.with_layout("transpose", layout)
    }

    /// Reorder dimensions
    pub fn permute(&self, dims: &[usize]) -> Result<Self> {
        let layout = self.imp("permute")?.layout.read().permute(dims)?;
        self.with_layout("permute", layout)
    }

    /// Restrict dimension `dim` to `start..start + length`
    pub fn narrow(&self, dim: isize, start: usize, length: usize) -> Result<Self> {
        let layout = self.imp("narrow")?.layout.read().narrow(dim, start, length)?;
        self.with_layout("narrow", layout)
    }

    /// Drop size-1 dimensions (all of them, or just `dim`)
    pub fn squeeze(&self, dim: Option<isize>) -> Result<Self> {
        let layout = self.imp("squeeze")?.layout.read().squeeze(dim);
        self.with_layout("squeeze", layout)
    }

    /// Insert a size-1 dimension at `dim`
    pub fn unsqueeze(&self, dim: isize) -> Result<Self> {
        let layout = self.imp("unsqueeze")?.layout.read().unsqueeze(dim)?;
        self.with_layout("unsqueeze", layout)
    }

    /// Broadcast view with shape `sizes` (stride 0 on expanded dimensions)
    pub fn expand(&self, sizes: &[usize]) -> Result<Self> {
        let layout = {
            let current = self.imp("expand")?.layout.read();
            current
                .broadcast_to(sizes)
                .ok_or_else(|| Error::shape_mismatch(sizes, current.shape()))?
        };
        self.with_layout("expand", layout)
    }

    /// `self` if already contiguous, otherwise a contiguous copy
    pub fn contiguous(&self) -> Result<Self> {
        let imp = self.imp("contiguous")?;
        if imp.layout.read().is_contiguous() {
            return Ok(self.clone());
        }
        let sizes = self.sizes()?;
        let out = imp.table.empty(imp.storage.device(), &sizes)?;
        out.copy_(self)?;
        Ok(out)
    }

    // ===== In-place =====

    /// Resize to `sizes` with default strides
    pub fn resize_(&self, sizes: &[usize]) -> Result<()> {
        self.resize_nd_(sizes, None)
    }

    /// Resize to `sizes` with optional explicit strides
    ///
    /// A no-op when sizes and meaningful strides already match. Otherwise the
    /// geometry changes in place (visible through every clone of this handle)
    /// and the storage grows if the new geometry reaches past it. Existing
    /// elements are kept.
    pub fn resize_nd_(&self, sizes: &[usize], strides: Option<&[isize]>) -> Result<()> {
        let imp = self.imp("resize_")?;
        let mut layout = imp.layout.write();
        let mut resized = layout.clone();
        if !resized.resize_nd(sizes, strides)? {
            return Ok(());
        }
        let needed = resized.required_storage();
        if needed > imp.storage.numel() {
            imp.storage.resize(needed)?;
        }
        *layout = resized;
        Ok(())
    }

    /// Copy elements from `src` through this tensor's kernels
    pub fn copy_(&self, src: &Tensor) -> Result<()> {
        let table = &self.imp("copy_")?.table;
        if !src.defined() {
            return Err(Error::undefined("copy_"));
        }
        table.kernels()?.copy(self, src)
    }

    /// Set every element to `value`
    pub fn fill_(&self, value: f64) -> Result<()> {
        let table = &self.imp("fill_")?.table;
        table.kernels()?.fill(self, value)
    }

    // ===== Data access =====

    /// Elements in row-major order
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        copy::read_elements(self)
    }

    /// The single element of a one-element tensor
    pub fn item<T: Element>(&self) -> Result<T> {
        let numel = self.numel()?;
        if numel != 1 {
            return Err(Error::shape_mismatch(&[1], &self.sizes()?));
        }
        let values = copy::read_elements::<T>(self)?;
        values
            .into_iter()
            .next()
            .ok_or_else(|| Error::Internal("one-element read returned nothing".to_string()))
    }

    /// Elements as contiguous row-major bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        copy::gather_tensor_bytes(self)
    }

    /// Overwrite the elements from contiguous row-major bytes
    pub fn copy_from_bytes(&self, bytes: &[u8]) -> Result<()> {
        copy::scatter_tensor_bytes(self, bytes)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            None => f.write_str("Tensor(undefined)"),
            Some(imp) => f
                .debug_struct("Tensor")
                .field("id", &imp.id)
                .field("type", &format_args!("{}", imp.table.key()))
                .field("device", &imp.storage.device())
                .field("layout", &*imp.layout.read())
                .finish(),
        }
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            None => f.write_str("[ Tensor (undefined) ]"),
            Some(imp) => write!(
                f,
                "[ {}{} ]",
                imp.table.key(),
                imp.layout.read()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Context {
        Context::default()
    }

    #[test]
    fn test_undefined_accessors_fail() {
        let t = Tensor::undefined();
        assert!(!t.defined());
        assert_eq!(t.sizes().unwrap_err(), Error::undefined("sizes"));
        assert_eq!(t.dim().unwrap_err(), Error::undefined("dim"));
        assert_eq!(t.storage().unwrap_err(), Error::undefined("storage"));
        assert_eq!(t.dtype(), DType::Undefined);
        assert_eq!(t.backend(), Backend::Undefined);
        assert!(Arc::ptr_eq(t.table(), OperatorTable::undefined()));
        assert!(t.is_same(&Tensor::default()));
        assert_eq!(t.use_count(), 0);
    }

    #[test]
    fn test_new_rejects_null_storage() {
        let ctx = ctx();
        let table = ctx.get_operator_table_checked(Backend::Cpu, DType::F32).unwrap();
        assert!(matches!(
            Tensor::new(None, Layout::contiguous(&[2]), table),
            Err(Error::InvalidArgument { arg: "storage", .. })
        ));
    }

    #[test]
    fn test_new_checks_bounds_and_dtype() {
        let ctx = ctx();
        let table = ctx.get_operator_table_checked(Backend::Cpu, DType::F32).unwrap();
        let storage = table.storage(Device::cpu(), 4).unwrap();
        assert!(matches!(
            Tensor::new(Some(storage.clone()), Layout::contiguous(&[5]), table.clone()),
            Err(Error::OutOfBounds { .. })
        ));
        let other = ctx.get_operator_table_checked(Backend::Cpu, DType::I32).unwrap();
        assert!(matches!(
            Tensor::new(Some(storage), Layout::contiguous(&[4]), other),
            Err(Error::DTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_from_slice_and_metadata() {
        let ctx = ctx();
        let t = Tensor::from_slice(&ctx, &[1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3], Device::cpu())
            .unwrap();
        assert_eq!(t.sizes().unwrap().as_slice(), &[2, 3]);
        assert_eq!(t.strides().unwrap().as_slice(), &[3, 1]);
        assert_eq!(t.size(-1).unwrap(), 3);
        assert_eq!(t.numel().unwrap(), 6);
        assert_eq!(t.dtype(), DType::F64);
        assert_eq!(t.backend(), Backend::Cpu);
        assert!(t.is_contiguous().unwrap());
        assert!(
            Tensor::from_slice(&ctx, &[1.0f64], &[2], Device::cpu()).is_err()
        );
    }

    #[test]
    fn test_clone_shares_implementation() {
        let ctx = ctx();
        let a = Tensor::zeros(&ctx, &[2], DType::F32, Device::cpu()).unwrap();
        let b = a.clone();
        assert!(a.is_same(&b));
        b.resize_(&[4]).unwrap();
        assert_eq!(a.sizes().unwrap().as_slice(), &[4]);
    }

    #[test]
    fn test_views_share_storage_not_identity() {
        let ctx = ctx();
        let a = Tensor::zeros(&ctx, &[2, 3], DType::F32, Device::cpu()).unwrap();
        let v = a.view(&[3, 2]).unwrap();
        assert!(!a.is_same(&v));
        assert!(a.shares_storage(&v));
        assert_eq!(a.storage().unwrap().ref_count(), 2);
    }

    #[test]
    fn test_reshape_falls_back_to_copy() {
        let ctx = ctx();
        let a = Tensor::from_slice(&ctx, &[1i32, 2, 3, 4, 5, 6], &[2, 3], Device::cpu()).unwrap();
        let t = a.transpose(0, 1).unwrap();
        assert!(matches!(
            t.view(&[6]),
            Err(Error::UnrepresentableView { .. })
        ));
        let flat = t.reshape(&[6]).unwrap();
        assert!(!flat.shares_storage(&a));
        assert_eq!(flat.to_vec::<i32>().unwrap(), vec![1, 4, 2, 5, 3, 6]);
    }

    #[test]
    fn test_as_strided_bounds() {
        let ctx = ctx();
        let a = Tensor::from_slice(&ctx, &[0u8, 1, 2, 3, 4, 5], &[6], Device::cpu()).unwrap();
        let diag = a.as_strided(&[2], &[4], Some(1)).unwrap();
        assert_eq!(diag.to_vec::<u8>().unwrap(), vec![1, 5]);
        assert!(matches!(
            a.as_strided(&[3], &[3], None),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(matches!(
            a.as_strided(&[3], &[1, 1], None),
            Err(Error::StrideMismatch { .. })
        ));
    }

    #[test]
    fn test_resize_grows_storage_and_keeps_data() {
        let ctx = ctx();
        let t = Tensor::from_slice(&ctx, &[1i64, 2], &[2], Device::cpu()).unwrap();
        t.resize_(&[2, 3]).unwrap();
        assert_eq!(t.storage().unwrap().numel(), 6);
        assert_eq!(&t.to_vec::<i64>().unwrap()[..2], &[1, 2]);

        // Shrinking only changes the geometry
        t.resize_(&[1]).unwrap();
        assert_eq!(t.storage().unwrap().numel(), 6);
        assert_eq!(t.item::<i64>().unwrap(), 1);
    }

    #[test]
    fn test_resize_allocates_when_empty() {
        let ctx = ctx();
        let t = Tensor::empty(&ctx, &[0], DType::F32, Device::cpu()).unwrap();
        assert_eq!(t.data_ptr().unwrap(), 0);
        t.resize_(&[3]).unwrap();
        assert_ne!(t.data_ptr().unwrap(), 0);
    }

    #[test]
    fn test_contiguous_of_contiguous_is_same() {
        let ctx = ctx();
        let t = Tensor::zeros(&ctx, &[2, 2], DType::F32, Device::cpu()).unwrap();
        assert!(t.contiguous().unwrap().is_same(&t));
        let tt = t.transpose(0, 1).unwrap();
        let c = tt.contiguous().unwrap();
        assert!(c.is_contiguous().unwrap());
        assert!(!c.shares_storage(&t));
    }

    #[test]
    fn test_item_and_bytes() {
        let ctx = ctx();
        let t = Tensor::full(&ctx, &[], 2.5, DType::F32, Device::cpu()).unwrap();
        assert_eq!(t.item::<f32>().unwrap(), 2.5);
        assert!(t.item::<f64>().is_err());

        let v = Tensor::from_slice(&ctx, &[1u8, 2, 3, 4], &[2, 2], Device::cpu()).unwrap();
        let tv = v.transpose(0, 1).unwrap();
        assert_eq!(tv.to_bytes().unwrap(), vec![1, 3, 2, 4]);
        tv.copy_from_bytes(&[9, 8, 7, 6]).unwrap();
        assert_eq!(v.to_vec::<u8>().unwrap(), vec![9, 7, 8, 6]);
    }

    #[test]
    fn test_display() {
        let ctx = ctx();
        let t = Tensor::zeros(&ctx, &[2, 3], DType::F32, Device::cpu()).unwrap();
        assert_eq!(t.to_string(), "[ CPUFloatType[2, 3] ]");
        assert_eq!(Tensor::undefined().to_string(), "[ Tensor (undefined) ]");
    }
}
