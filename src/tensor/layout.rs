//! Layout: shape, strides, and offset for tensor memory layout

use crate::error::{Error, Result};
use smallvec::SmallVec;
use std::fmt;

/// Stack allocation threshold for dimensions
/// Most tensors have 4 or fewer dimensions, so we stack-allocate up to 4
const STACK_DIMS: usize = 4;

/// Shape type: dimensions of a tensor
pub type Shape = SmallVec<[usize; STACK_DIMS]>;

/// Strides type: element offsets between consecutive elements along each dimension
/// Signed to support negative strides
/// NOTE: Strides are in ELEMENTS, not bytes
pub type Strides = SmallVec<[isize; STACK_DIMS]>;

/// Layout describes the memory layout of a tensor
///
/// Address of element at indices [i0, i1, ..., in]:
///   offset + i0 * strides[0] + i1 * strides[1] + ... + in * strides[n]
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Layout {
    /// Shape: size along each dimension
    shape: Shape,
    /// Strides: offset (in elements) between consecutive elements along each dimension
    strides: Strides,
    /// Offset: starting element index in the underlying storage
    offset: usize,
}

impl Layout {
    /// Create a new contiguous (row-major/C-order) layout from a shape
    ///
    /// # Example
    /// ```
    /// use tessera::tensor::Layout;
    /// let layout = Layout::contiguous(&[2, 3, 4]);
    /// assert_eq!(layout.shape(), &[2, 3, 4]);
    /// assert_eq!(layout.strides(), &[12, 4, 1]);
    /// ```
    pub fn contiguous(shape: &[usize]) -> Self {
        Self {
            shape: shape.iter().copied().collect(),
            strides: Self::contiguous_strides(shape),
            offset: 0,
        }
    }

    /// Create a layout with explicit shape, strides, and offset
    pub fn new(shape: &[usize], strides: &[isize], offset: usize) -> Result<Self> {
        if shape.len() != strides.len() {
            return Err(Error::StrideMismatch {
                sizes: shape.len(),
                strides: strides.len(),
            });
        }
        Ok(Self {
            shape: shape.iter().copied().collect(),
            strides: strides.iter().copied().collect(),
            offset,
        })
    }

    /// Create a scalar (0-dimensional) layout
    pub fn scalar() -> Self {
        Self {
            shape: SmallVec::new(),
            strides: SmallVec::new(),
            offset: 0,
        }
    }

    /// Default monotonic strides: the last dimension has stride 1 and
    /// `stride[d] = max(shape[d+1], 1) * stride[d+1]`
    pub fn contiguous_strides(shape: &[usize]) -> Strides {
        let mut strides: Strides = SmallVec::from_elem(1, shape.len());
        for d in (0..shape.len().saturating_sub(1)).rev() {
            strides[d] = shape[d + 1].max(1) as isize * strides[d + 1];
        }
        strides
    }

    /// Get the shape
    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the strides
    #[inline]
    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    /// Get the offset
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Same shape and strides at a different offset
    pub fn with_offset(&self, offset: usize) -> Self {
        Self {
            offset,
            ..self.clone()
        }
    }

    /// Number of dimensions (rank)
    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements
    #[inline]
    pub fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Check if the tensor is a scalar (0 dimensions)
    #[inline]
    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }

    /// Check if the strides are the default monotonic strides
    ///
    /// Size-1 dimensions are ignored (any stride addresses the same element)
    /// and so is the offset. Empty tensors are always contiguous.
    pub fn is_contiguous(&self) -> bool {
        if self.elem_count() == 0 {
            return true;
        }
        let mut expected = 1isize;
        for (&size, &stride) in self.shape.iter().zip(self.strides.iter()).rev() {
            if size != 1 {
                if stride != expected {
                    return false;
                }
                expected *= size as isize;
            }
        }
        true
    }

    /// Returns true if two different indices address the same element
    pub fn has_internal_overlap(&self) -> bool {
        self.shape
            .iter()
            .zip(self.strides.iter())
            .any(|(&size, &stride)| size > 1 && stride == 0)
    }

    /// Get size along a specific dimension
    ///
    /// Supports negative indexing: -1 is the last dimension
    pub fn dim(&self, d: isize) -> Option<usize> {
        let idx = self.normalize_dim(d)?;
        Some(self.shape[idx])
    }

    /// Get stride along a specific dimension
    pub fn stride(&self, d: isize) -> Option<isize> {
        let idx = self.normalize_dim(d)?;
        Some(self.strides[idx])
    }

    /// Normalize a dimension index (handle negative indices)
    pub fn normalize_dim(&self, d: isize) -> Option<usize> {
        let ndim = self.ndim() as isize;
        let idx = if d < 0 { ndim + d } else { d };
        if idx >= 0 && idx < ndim {
            Some(idx as usize)
        } else {
            None
        }
    }

    fn require_dim(&self, d: isize) -> Result<usize> {
        self.normalize_dim(d).ok_or(Error::InvalidDimension {
            dim: d,
            ndim: self.ndim(),
        })
    }

    /// Compute the linear index (element offset) for given indices
    pub fn index(&self, indices: &[usize]) -> Option<usize> {
        if indices.len() != self.ndim() {
            return None;
        }

        // Check bounds
        for (idx, &dim) in indices.iter().zip(self.shape.iter()) {
            if *idx >= dim {
                return None;
            }
        }

        let mut linear = self.offset as isize;
        for (&idx, &stride) in indices.iter().zip(self.strides.iter()) {
            linear += idx as isize * stride;
        }

        usize::try_from(linear).ok()
    }

    /// Lowest and highest element index this layout addresses
    ///
    /// `None` for layouts with no elements.
    pub fn index_range(&self) -> Option<(isize, isize)> {
        if self.elem_count() == 0 {
            return None;
        }
        let mut low = self.offset as isize;
        let mut high = self.offset as isize;
        for (&size, &stride) in self.shape.iter().zip(self.strides.iter()) {
            let reach = (size as isize - 1) * stride;
            if reach < 0 {
                low += reach;
            } else {
                high += reach;
            }
        }
        Some((low, high))
    }

    /// Number of storage elements needed to hold every addressed element
    ///
    /// This is `offset + 1 + Σ (size[d]-1) * stride[d]` for non-negative
    /// strides, and 0 when the layout has no elements.
    pub fn required_storage(&self) -> usize {
        match self.index_range() {
            Some((_, high)) => high as usize + 1,
            None => 0,
        }
    }

    /// Check every addressed element lies in `[0, storage_len)`
    pub fn check_bounds(&self, storage_len: usize) -> Result<()> {
        let Some((low, high)) = self.index_range() else {
            return Ok(());
        };
        if low < 0 || high as usize >= storage_len {
            return Err(Error::OutOfBounds {
                required: (high + 1).max(0) as usize,
                available: storage_len,
            });
        }
        Ok(())
    }

    /// Set new sizes and strides in place
    ///
    /// Omitted strides (or negative entries in `strides`) get the default
    /// monotonic value. Returns `false` without touching the layout when
    /// the rank and sizes already match and every stride that matters
    /// (those of dimensions with size != 1) is unchanged.
    pub fn resize_nd(&mut self, sizes: &[usize], strides: Option<&[isize]>) -> Result<bool> {
        if let Some(strides) = strides {
            if strides.len() != sizes.len() {
                return Err(Error::StrideMismatch {
                    sizes: sizes.len(),
                    strides: strides.len(),
                });
            }
        }

        let mut new_strides: Strides = SmallVec::from_elem(1, sizes.len());
        for d in (0..sizes.len()).rev() {
            new_strides[d] = match strides {
                Some(strides) if strides[d] >= 0 => strides[d],
                _ if d + 1 == sizes.len() => 1,
                _ => sizes[d + 1].max(1) as isize * new_strides[d + 1],
            };
        }

        let unchanged = self.shape.as_slice() == sizes
            && sizes
                .iter()
                .zip(self.strides.iter().zip(new_strides.iter()))
                .all(|(&size, (old, new))| size == 1 || old == new);
        if unchanged {
            return Ok(false);
        }

        self.shape = sizes.iter().copied().collect();
        self.strides = new_strides;
        Ok(true)
    }

    /// Strides that present `old_shape`/`old_strides` as `new_shape` without a copy
    ///
    /// The old shape is split into chunks of dimensions that are contiguous
    /// with each other; the view is representable only if the new shape can
    /// be split into chunks with the same element counts. Empty tensors get
    /// default strides. Callers must check the element counts agree.
    pub fn compute_stride_for_reshape(
        old_shape: &[usize],
        old_strides: &[isize],
        new_shape: &[usize],
    ) -> Option<Strides> {
        if old_shape.is_empty() {
            return Some(SmallVec::from_elem(1, new_shape.len()));
        }

        let numel: usize = old_shape.iter().product();
        if numel == 0 {
            if old_shape == new_shape {
                return Some(old_strides.iter().copied().collect());
            }
            return Some(Self::contiguous_strides(new_shape));
        }

        let mut new_strides: Strides = SmallVec::from_elem(0, new_shape.len());
        let mut view_d = new_shape.len() as isize - 1;
        // Stride of the last dimension of the current chunk
        let mut chunk_base_stride = *old_strides.last()?;
        let mut tensor_numel = 1usize;
        let mut view_numel = 1usize;

        for tensor_d in (0..old_shape.len()).rev() {
            tensor_numel *= old_shape[tensor_d];
            let chunk_ends = tensor_d == 0
                || (old_shape[tensor_d - 1] != 1
                    && old_strides[tensor_d - 1] != tensor_numel as isize * chunk_base_stride);
            if !chunk_ends {
                continue;
            }

            while view_d >= 0
                && (view_numel < tensor_numel || new_shape[view_d as usize] == 1)
            {
                new_strides[view_d as usize] = view_numel as isize * chunk_base_stride;
                view_numel *= new_shape[view_d as usize];
                view_d -= 1;
            }
            if view_numel != tensor_numel {
                return None;
            }
            if tensor_d > 0 {
                chunk_base_stride = old_strides[tensor_d - 1];
                tensor_numel = 1;
                view_numel = 1;
            }
        }

        if view_d != -1 {
            return None;
        }
        Some(new_strides)
    }

    /// Layout of the same elements viewed with `new_shape`
    pub fn view(&self, new_shape: &[usize]) -> Result<Self> {
        if new_shape.iter().product::<usize>() != self.elem_count() {
            return Err(Error::shape_mismatch(self.shape(), new_shape));
        }
        let strides = Self::compute_stride_for_reshape(&self.shape, &self.strides, new_shape)
            .ok_or_else(|| Error::UnrepresentableView {
                from: self.shape.to_vec(),
                to: new_shape.to_vec(),
            })?;
        Ok(Self {
            shape: new_shape.iter().copied().collect(),
            strides,
            offset: self.offset,
        })
    }

    /// Create a transposed layout (swap two dimensions)
    pub fn transpose(&self, dim0: isize, dim1: isize) -> Result<Self> {
        let d0 = self.require_dim(dim0)?;
        let d1 = self.require_dim(dim1)?;

        let mut new_shape = self.shape.clone();
        let mut new_strides = self.strides.clone();

        new_shape.swap(d0, d1);
        new_strides.swap(d0, d1);

        Ok(Self {
            shape: new_shape,
            strides: new_strides,
            offset: self.offset,
        })
    }

    /// Reorder dimensions: dimension `i` of the result is `dims[i]` of `self`
    pub fn permute(&self, dims: &[usize]) -> Result<Self> {
        if dims.len() != self.ndim() {
            return Err(Error::invalid_argument(
                "dims",
                format!("expected {} dimensions, got {}", self.ndim(), dims.len()),
            ));
        }
        let mut seen: SmallVec<[bool; STACK_DIMS]> = SmallVec::from_elem(false, dims.len());
        for &d in dims {
            if d >= dims.len() || seen[d] {
                return Err(Error::invalid_argument(
                    "dims",
                    format!("{dims:?} is not a permutation"),
                ));
            }
            seen[d] = true;
        }
        Ok(Self {
            shape: dims.iter().map(|&d| self.shape[d]).collect(),
            strides: dims.iter().map(|&d| self.strides[d]).collect(),
            offset: self.offset,
        })
    }

    /// Restrict dimension `dim` to `start..start + length`
    pub fn narrow(&self, dim: isize, start: usize, length: usize) -> Result<Self> {
        let d = self.require_dim(dim)?;
        if start + length > self.shape[d] {
            return Err(Error::invalid_argument(
                "length",
                format!(
                    "range {start}..{} exceeds dimension {d} of size {}",
                    start + length,
                    self.shape[d]
                ),
            ));
        }
        let mut shape = self.shape.clone();
        shape[d] = length;
        let offset = self.offset as isize + start as isize * self.strides[d];
        Ok(Self {
            shape,
            strides: self.strides.clone(),
            offset: usize::try_from(offset).map_err(|_| {
                Error::invalid_argument("start", "narrowing moves the offset below zero")
            })?,
        })
    }

    /// Create a squeezed layout (remove dimensions of size 1)
    pub fn squeeze(&self, dim: Option<isize>) -> Self {
        match dim {
            Some(d) => {
                if let Some(idx) = self.normalize_dim(d) {
                    if self.shape[idx] == 1 {
                        let mut shape = self.shape.clone();
                        let mut strides = self.strides.clone();
                        shape.remove(idx);
                        strides.remove(idx);
                        return Self {
                            shape,
                            strides,
                            offset: self.offset,
                        };
                    }
                }
                self.clone()
            }
            None => {
                let mut shape = Shape::new();
                let mut strides = Strides::new();
                for (&s, &st) in self.shape.iter().zip(self.strides.iter()) {
                    if s != 1 {
                        shape.push(s);
                        strides.push(st);
                    }
                }
                Self {
                    shape,
                    strides,
                    offset: self.offset,
                }
            }
        }
    }

    /// Create an unsqueezed layout (add dimension of size 1)
    pub fn unsqueeze(&self, dim: isize) -> Result<Self> {
        let ndim = self.ndim();
        let idx = if dim < 0 {
            ndim as isize + dim + 1
        } else {
            dim
        };

        if idx < 0 || idx as usize > ndim {
            return Err(Error::InvalidDimension { dim, ndim });
        }
        let idx = idx as usize;

        let mut shape = self.shape.clone();
        let mut strides = self.strides.clone();

        // Stride for the new dimension: product of strides after this position
        let new_stride = if idx < ndim {
            strides[idx] * shape[idx] as isize
        } else {
            1
        };

        shape.insert(idx, 1);
        strides.insert(idx, new_stride);

        Ok(Self {
            shape,
            strides,
            offset: self.offset,
        })
    }

    /// Create a broadcast layout to a target shape
    ///
    /// Returns None if shapes are not broadcastable
    pub fn broadcast_to(&self, target: &[usize]) -> Option<Self> {
        if target.len() < self.ndim() {
            return None;
        }

        let mut shape = Shape::new();
        let mut strides = Strides::new();

        // Pad with leading 1s
        let pad = target.len() - self.ndim();
        for &t in &target[..pad] {
            shape.push(t);
            strides.push(0);
        }

        for ((&s, &st), &t) in self
            .shape
            .iter()
            .zip(self.strides.iter())
            .zip(&target[pad..])
        {
            if s == t {
                shape.push(t);
                strides.push(st);
            } else if s == 1 {
                shape.push(t);
                strides.push(0);
            } else {
                return None;
            }
        }

        Some(Self {
            shape,
            strides,
            offset: self.offset,
        })
    }

    /// Element indices in row-major order of the logical shape
    pub fn offsets(&self) -> Offsets<'_> {
        Offsets {
            layout: self,
            indices: SmallVec::from_elem(0, self.ndim()),
            current: self.offset as isize,
            remaining: self.elem_count(),
        }
    }
}

/// Iterator over the storage index of every element, in row-major order
pub struct Offsets<'a> {
    layout: &'a Layout,
    indices: SmallVec<[usize; STACK_DIMS]>,
    current: isize,
    remaining: usize,
}

impl Iterator for Offsets<'_> {
    type Item = isize;

    fn next(&mut self) -> Option<isize> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let out = self.current;

        // Increment indices (row-major order)
        for dim in (0..self.indices.len()).rev() {
            self.indices[dim] += 1;
            self.current += self.layout.strides[dim];
            if self.indices[dim] < self.layout.shape[dim] {
                break;
            }
            self.current -= self.layout.strides[dim] * self.layout.shape[dim] as isize;
            self.indices[dim] = 0;
        }
        Some(out)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Offsets<'_> {}

impl fmt::Debug for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Layout {{ shape: {:?}, strides: {:?}, offset: {} }}",
            self.shape.as_slice(),
            self.strides.as_slice(),
            self.offset
        )
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.shape.as_slice())
    }
}

/// Compute the broadcast shape of two shapes
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Shape> {
    let max_ndim = a.len().max(b.len());
    let mut result = Shape::with_capacity(max_ndim);

    for i in 0..max_ndim {
        let a_dim = if i < a.len() { a[a.len() - 1 - i] } else { 1 };
        let b_dim = if i < b.len() { b[b.len() - 1 - i] } else { 1 };

        if a_dim == b_dim {
            result.push(a_dim);
        } else if a_dim == 1 {
            result.push(b_dim);
        } else if b_dim == 1 {
            result.push(a_dim);
        } else {
            return None;
        }
    }

    result.reverse();
    Some(result)
}
