//! Collective options and algorithm cache keys

use super::ReduceOp;
use crate::dispatch::DispatchKey;
use crate::error::{Error, Result};
use crate::runtime::Device;
use crate::tensor::{Shape, Tensor};

/// Options for [`ProcessGroup::broadcast`](super::ProcessGroup::broadcast)
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastOptions {
    /// Rank holding the source data
    pub root_rank: usize,
    /// Index of the source tensor within the root's tensor list
    pub root_tensor: usize,
}

/// Options for [`ProcessGroup::allreduce`](super::ProcessGroup::allreduce)
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AllreduceOptions {
    /// Reduction applied element-wise
    pub reduce_op: ReduceOp,
}

/// Options for [`ProcessGroup::reduce`](super::ProcessGroup::reduce)
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ReduceOptions {
    /// Reduction applied element-wise
    pub reduce_op: ReduceOp,
    /// Rank receiving the result
    pub root_rank: usize,
    /// Index of the result tensor on the root
    pub root_tensor: usize,
}

/// Options for [`ProcessGroup::gather`](super::ProcessGroup::gather)
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct GatherOptions {
    /// Rank receiving every input
    pub root_rank: usize,
}

/// Options for [`ProcessGroup::scatter`](super::ProcessGroup::scatter)
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ScatterOptions {
    /// Rank providing the inputs
    pub root_rank: usize,
}

/// Kind of cached collective
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CollectiveType {
    /// One-to-all copy
    Broadcast,
    /// All-to-all reduction
    Allreduce,
    /// Synchronization without data
    Barrier,
}

/// Signature of a collective call
///
/// Calls with equal keys share cached [`AlgorithmEntry`](super::AlgorithmEntry)s
/// and so their staging tensors and algorithm objects.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AlgorithmKey {
    /// Collective kind
    pub collective: CollectiveType,
    /// Backend and element type of the tensors (`None` for a barrier)
    pub dispatch: Option<DispatchKey>,
    /// Device of each tensor
    pub devices: Vec<Device>,
    /// Shape of each tensor
    pub sizes: Vec<Shape>,
    /// Broadcast root rank
    pub src_rank: usize,
    /// Broadcast root tensor
    pub src_tensor: usize,
    /// Allreduce operation
    pub reduce_op: ReduceOp,
}

impl AlgorithmKey {
    fn for_tensors(collective: CollectiveType, tensors: &[Tensor]) -> Result<Self> {
        let first = tensors.first().ok_or_else(|| {
            Error::invalid_argument("tensors", "requires at least one tensor")
        })?;
        Ok(Self {
            collective,
            dispatch: Some(first.dispatch_key()),
            devices: tensors
                .iter()
                .map(Tensor::device)
                .collect::<Result<_>>()?,
            sizes: tensors.iter().map(Tensor::sizes).collect::<Result<_>>()?,
            src_rank: 0,
            src_tensor: 0,
            reduce_op: ReduceOp::default(),
        })
    }

    /// Key of a broadcast over `tensors`
    pub fn broadcast(tensors: &[Tensor], opts: &BroadcastOptions) -> Result<Self> {
        Ok(Self {
            src_rank: opts.root_rank,
            src_tensor: opts.root_tensor,
            ..Self::for_tensors(CollectiveType::Broadcast, tensors)?
        })
    }

    /// Key of an allreduce over `tensors`
    pub fn allreduce(tensors: &[Tensor], opts: &AllreduceOptions) -> Result<Self> {
        Ok(Self {
            reduce_op: opts.reduce_op,
            ..Self::for_tensors(CollectiveType::Allreduce, tensors)?
        })
    }

    /// Key of a barrier
    pub fn barrier() -> Self {
        Self {
            collective: CollectiveType::Barrier,
            dispatch: None,
            devices: Vec::new(),
            sizes: Vec::new(),
            src_rank: 0,
            src_tensor: 0,
            reduce_op: ReduceOp::default(),
        }
    }

    /// Whether the tensors live in device memory
    pub fn is_gpu(&self) -> bool {
        self.dispatch.is_some_and(|key| key.backend.is_gpu())
    }
}
