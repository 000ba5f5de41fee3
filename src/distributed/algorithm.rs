//! Collective algorithms over a [`CommContext`]

use super::transport::{CommContext, Tag};
use super::{AlgorithmKey, CollectiveType};
use crate::dtype::{DType, Element, dispatch_dtype};
use crate::error::{Error, Result};
use crate::tensor::Tensor;
use std::marker::PhantomData;
use std::ops::Range;
use std::sync::Arc;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Reductions below this many elements run on the calling thread
#[cfg(feature = "rayon")]
const PARALLEL_REDUCE_THRESHOLD: usize = 1 << 16;

/// Element types collectives accept
pub const COLLECTIVE_DTYPES: [DType; 7] = [
    DType::F32,
    DType::F64,
    DType::F16,
    DType::I8,
    DType::U8,
    DType::I32,
    DType::I64,
];

/// Fail with `UnsupportedDType` unless collectives handle `dtype`
pub fn check_collective_dtype(dtype: DType, op: &'static str) -> Result<()> {
    if COLLECTIVE_DTYPES.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::unsupported_dtype(dtype, op))
    }
}

/// Element-wise reduction
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// a + b
    #[default]
    Sum,
    /// a * b
    Product,
    /// min(a, b)
    Min,
    /// max(a, b)
    Max,
}

impl ReduceOp {
    /// Combine two elements
    #[inline]
    pub fn apply<T: Element>(self, a: T, b: T) -> T {
        match self {
            ReduceOp::Sum => a + b,
            ReduceOp::Product => a * b,
            ReduceOp::Min => {
                if b < a {
                    b
                } else {
                    a
                }
            }
            ReduceOp::Max => {
                if b > a {
                    b
                } else {
                    a
                }
            }
        }
    }

    /// `acc[i] = op(acc[i], other[i])`
    pub fn reduce_into<T: Element>(self, acc: &mut [T], other: &[T]) {
        #[cfg(feature = "rayon")]
        if acc.len() >= PARALLEL_REDUCE_THRESHOLD {
            acc.par_iter_mut()
                .zip(other.par_iter())
                .with_min_len(PARALLEL_REDUCE_THRESHOLD / 4)
                .for_each(|(a, &b)| *a = self.apply(*a, b));
            return;
        }
        for (a, &b) in acc.iter_mut().zip(other) {
            *a = self.apply(*a, b);
        }
    }
}

/// A constructed collective, bound to its staging tensors and transport slot
///
/// Algorithms are built once per cache entry and run once per call.
pub trait Algorithm: Send {
    /// Run the collective to completion on the staging tensors
    fn run(&mut self) -> Result<()>;
}

/// Builds the algorithm for a cache entry
///
/// Called by a worker thread while it holds the process group's queue lock,
/// so construction on one context is serialized.
pub trait AlgorithmFactory: Send + Sync {
    /// Build the algorithm for `key` over `staging`
    fn create(
        &self,
        key: &AlgorithmKey,
        context: &Arc<CommContext>,
        staging: &[Tensor],
    ) -> Result<Box<dyn Algorithm>>;
}

/// Default factory: ring allreduce, one-to-all broadcast, all-to-one barrier
#[derive(Clone, Copy, Debug, Default)]
pub struct MeshAlgorithms;

impl AlgorithmFactory for MeshAlgorithms {
    fn create(
        &self,
        key: &AlgorithmKey,
        context: &Arc<CommContext>,
        staging: &[Tensor],
    ) -> Result<Box<dyn Algorithm>> {
        if key.collective == CollectiveType::Barrier {
            return Ok(Box::new(BarrierAllToOne::new(Arc::clone(context))));
        }
        let dtype = key
            .dispatch
            .map(|dispatch| dispatch.dtype)
            .ok_or_else(|| Error::Internal(format!("{:?} key without a type", key.collective)))?;
        check_collective_dtype(dtype, "collective")?;

        dispatch_dtype!(dtype, T => {
            let algorithm: Box<dyn Algorithm> = match key.collective {
                CollectiveType::Allreduce => Box::new(AllreduceRing::<T>::new(
                    Arc::clone(context),
                    staging.to_vec(),
                    key.reduce_op,
                )?),
                CollectiveType::Broadcast => Box::new(BroadcastOneToAll::<T>::new(
                    Arc::clone(context),
                    staging.to_vec(),
                    key.src_rank,
                    key.src_tensor,
                )?),
                CollectiveType::Barrier => Box::new(BarrierAllToOne::new(Arc::clone(context))),
            };
            Ok(algorithm)
        }, "collective")
    }
}

fn check_buffers<T: Element>(buffers: &[Tensor]) -> Result<usize> {
    let first = buffers
        .first()
        .ok_or_else(|| Error::invalid_argument("buffers", "requires at least one buffer"))?;
    let numel = first.numel()?;
    for buffer in buffers {
        if buffer.dtype() != T::DTYPE {
            return Err(Error::DTypeMismatch {
                lhs: T::DTYPE,
                rhs: buffer.dtype(),
            });
        }
        if buffer.numel()? != numel {
            return Err(Error::invalid_argument(
                "buffers",
                "buffers must have the same number of elements",
            ));
        }
    }
    Ok(numel)
}

fn encode<T: Element>(values: &[T]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

fn decode<T: Element>(bytes: &[u8], expected: usize) -> Result<Vec<T>> {
    if bytes.len() != expected * std::mem::size_of::<T>() {
        return Err(Error::collective(format!(
            "expected {expected} elements, received {} bytes",
            bytes.len()
        )));
    }
    Ok(bytemuck::pod_collect_to_vec(bytes))
}

/// Ring allreduce: local reduction, reduce-scatter, then allgather
///
/// Each rank sends and receives `2 * (size - 1)` chunks of `numel / size`
/// elements, so bandwidth per rank does not grow with the group size.
pub struct AllreduceRing<T: Element> {
    context: Arc<CommContext>,
    tag: Tag,
    buffers: Vec<Tensor>,
    numel: usize,
    op: ReduceOp,
    _marker: PhantomData<T>,
}

impl<T: Element> AllreduceRing<T> {
    /// Reduce across `buffers` on every rank; results land in every buffer
    pub fn new(context: Arc<CommContext>, buffers: Vec<Tensor>, op: ReduceOp) -> Result<Self> {
        let numel = check_buffers::<T>(&buffers)?;
        let tag = context.next_slot();
        Ok(Self {
            context,
            tag,
            buffers,
            numel,
            op,
            _marker: PhantomData,
        })
    }

    fn chunk(&self, index: usize) -> Range<usize> {
        let size = self.context.size();
        (index * self.numel / size)..((index + 1) * self.numel / size)
    }

    fn exchange(&self, acc: &mut [T], send: usize, recv: usize, reduce: bool) -> Result<()> {
        let size = self.context.size();
        let rank = self.context.rank();
        let right = (rank + 1) % size;
        let left = (rank + size - 1) % size;

        let outgoing = encode(&acc[self.chunk(send)]);
        self.context.send(right, self.tag, outgoing)?;

        let range = self.chunk(recv);
        let incoming = decode::<T>(&self.context.recv(left, self.tag)?, range.len())?;
        if reduce {
            self.op.reduce_into(&mut acc[range], &incoming);
        } else {
            acc[range].copy_from_slice(&incoming);
        }
        Ok(())
    }
}

impl<T: Element> Algorithm for AllreduceRing<T> {
    fn run(&mut self) -> Result<()> {
        let mut acc = self.buffers[0].to_vec::<T>()?;
        for buffer in &self.buffers[1..] {
            self.op.reduce_into(&mut acc, &buffer.to_vec::<T>()?);
        }

        let size = self.context.size();
        let rank = self.context.rank();
        if size > 1 && self.numel > 0 {
            // After step s of the reduce-scatter, chunk (rank - s - 1) holds
            // the partial reduction of s + 2 ranks
            for step in 0..size - 1 {
                let send = (rank + size - step) % size;
                let recv = (rank + size - step - 1) % size;
                self.exchange(&mut acc, send, recv, true)?;
            }
            // Rank r now owns the full reduction of chunk r + 1
            for step in 0..size - 1 {
                let send = (rank + 1 + size - step) % size;
                let recv = (rank + size - step) % size;
                self.exchange(&mut acc, send, recv, false)?;
            }
        }

        let bytes = encode(&acc);
        for buffer in &self.buffers {
            buffer.copy_from_bytes(&bytes)?;
        }
        Ok(())
    }
}

/// Root sends its tensor to every other rank
pub struct BroadcastOneToAll<T: Element> {
    context: Arc<CommContext>,
    tag: Tag,
    buffers: Vec<Tensor>,
    numel: usize,
    root_rank: usize,
    root_tensor: usize,
    _marker: PhantomData<T>,
}

impl<T: Element> BroadcastOneToAll<T> {
    /// Copy `buffers[root_tensor]` of `root_rank` into every buffer of every rank
    pub fn new(
        context: Arc<CommContext>,
        buffers: Vec<Tensor>,
        root_rank: usize,
        root_tensor: usize,
    ) -> Result<Self> {
        let numel = check_buffers::<T>(&buffers)?;
        if root_rank >= context.size() {
            return Err(Error::invalid_argument(
                "root_rank",
                format!("{root_rank} is outside a group of size {}", context.size()),
            ));
        }
        if root_tensor >= buffers.len() {
            return Err(Error::invalid_argument(
                "root_tensor",
                format!("{root_tensor} is outside {} tensors", buffers.len()),
            ));
        }
        let tag = context.next_slot();
        Ok(Self {
            context,
            tag,
            buffers,
            numel,
            root_rank,
            root_tensor,
            _marker: PhantomData,
        })
    }
}

impl<T: Element> Algorithm for BroadcastOneToAll<T> {
    fn run(&mut self) -> Result<()> {
        let rank = self.context.rank();
        let payload = if rank == self.root_rank {
            let payload = self.buffers[self.root_tensor].to_bytes()?;
            for peer in (0..self.context.size()).filter(|&peer| peer != rank) {
                self.context.send(peer, self.tag, payload.clone())?;
            }
            payload
        } else {
            let payload = self.context.recv(self.root_rank, self.tag)?;
            // Validates the length
            decode::<T>(&payload, self.numel)?;
            payload
        };

        for (index, buffer) in self.buffers.iter().enumerate() {
            if rank == self.root_rank && index == self.root_tensor {
                continue;
            }
            buffer.copy_from_bytes(&payload)?;
        }
        Ok(())
    }
}

/// Every rank checks in with rank 0, which then releases them all
pub struct BarrierAllToOne {
    context: Arc<CommContext>,
    tag: Tag,
}

impl BarrierAllToOne {
    /// Barrier on `context`
    pub fn new(context: Arc<CommContext>) -> Self {
        let tag = context.next_slot();
        Self { context, tag }
    }
}

impl Algorithm for BarrierAllToOne {
    fn run(&mut self) -> Result<()> {
        let size = self.context.size();
        if self.context.rank() == 0 {
            for peer in 1..size {
                self.context.recv(peer, self.tag)?;
            }
            for peer in 1..size {
                self.context.send(peer, self.tag, Vec::new())?;
            }
        } else {
            self.context.send(0, self.tag, Vec::new())?;
            self.context.recv(0, self.tag)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_ops() {
        assert_eq!(ReduceOp::Sum.apply(2, 3), 5);
        assert_eq!(ReduceOp::Product.apply(2.0, 3.5), 7.0);
        assert_eq!(ReduceOp::Min.apply(-1i8, 4), -1);
        assert_eq!(ReduceOp::Max.apply(7u8, 4), 7);
    }

    #[test]
    fn test_reduce_into() {
        let mut acc = vec![1i64, 5, 3];
        ReduceOp::Max.reduce_into(&mut acc, &[4, 2, 3]);
        assert_eq!(acc, vec![4, 5, 3]);
    }

    #[test]
    fn test_collective_dtypes() {
        assert!(check_collective_dtype(DType::F16, "allreduce").is_ok());
        assert!(matches!(
            check_collective_dtype(DType::Bool, "allreduce"),
            Err(Error::UnsupportedDType { .. })
        ));
        assert!(check_collective_dtype(DType::I16, "allreduce").is_err());
    }

    #[test]
    fn test_decode_checks_length() {
        assert!(decode::<f32>(&[0u8; 8], 2).is_ok());
        assert!(decode::<f32>(&[0u8; 6], 2).is_err());
    }
}
