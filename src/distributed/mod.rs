//! Asynchronous collective operations
//!
//! ```text
//! caller thread                         worker pool
//! ─────────────                         ───────────
//! AlgorithmKey::allreduce(tensors)
//! checkout(key) ── blocks while busy
//! copy inputs → staging
//! enqueue ─────────── shared FIFO ────▶ pop (queue lock held)
//!   ◀── Arc<dyn Work>                   build algorithm if missing
//!                                       run (queue lock released)
//!                                       copy staging → tensors
//! work.wait() ◀──────────────────────── finish / finish_with_error
//! ```
//!
//! Point-to-point `send`/`recv` skip the queue and talk to the transport
//! directly.

mod algorithm;
mod entry;
mod key;
mod process_group;
mod store;
mod transport;
mod work;

pub use algorithm::{
    Algorithm, AlgorithmFactory, AllreduceRing, BarrierAllToOne, BroadcastOneToAll,
    COLLECTIVE_DTYPES, MeshAlgorithms, ReduceOp, check_collective_dtype,
};
pub use entry::AlgorithmEntry;
pub use key::{
    AlgorithmKey, AllreduceOptions, BroadcastOptions, CollectiveType, GatherOptions,
    ReduceOptions, ScatterOptions,
};
pub use process_group::{ProcessGroup, ProcessGroupMesh, ProcessGroupOptions};
pub use store::{DEFAULT_STORE_TIMEOUT, HashStore, Store};
pub use transport::{CommContext, Tag, TransportDevice, UnboundBuffer};
pub use work::{CollectiveWork, RecvWork, SendWork, Work};
