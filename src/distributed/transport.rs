//! Process-local full-mesh transport
//!
//! A [`TransportDevice`] is a hub that every rank of a group registers an
//! endpoint with. Ranks find each other's endpoints through a [`Store`],
//! then exchange byte messages through per-(source, tag) FIFO mailboxes.
//! Sends never block. A receive claims its message in posting order, so two
//! receives on the same source and tag get messages in the order they were
//! posted no matter which one is waited on first.

use super::Store;
use crate::error::{Error, Result};
use crate::tensor::Tensor;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Message tag
///
/// User tags come from point-to-point calls; collective tags are the slot
/// an algorithm was assigned when it was built.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Point-to-point tag chosen by the caller
    User(u32),
    /// Slot of a collective algorithm
    Collective(u64),
}

/// Hub the endpoints of one or more groups register with
pub struct TransportDevice {
    name: String,
    endpoints: Mutex<HashMap<u64, Arc<Endpoint>>>,
    next_id: AtomicU64,
}

impl TransportDevice {
    /// Create a hub
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            endpoints: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Hub name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of connected endpoints
    pub fn endpoints(&self) -> usize {
        self.endpoints.lock().len()
    }

    fn register(&self, rank: usize) -> Arc<Endpoint> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let endpoint = Arc::new(Endpoint {
            id,
            rank,
            inbox: Mutex::new(Inbox::default()),
        });
        self.endpoints.lock().insert(id, Arc::clone(&endpoint));
        endpoint
    }

    fn lookup(&self, id: u64) -> Option<Arc<Endpoint>> {
        self.endpoints.lock().get(&id).cloned()
    }

    fn unregister(&self, id: u64) {
        self.endpoints.lock().remove(&id);
    }
}

impl fmt::Debug for TransportDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportDevice")
            .field("name", &self.name)
            .field("endpoints", &self.endpoints())
            .finish()
    }
}

struct Endpoint {
    id: u64,
    rank: usize,
    inbox: Mutex<Inbox>,
}

#[derive(Default)]
struct Inbox {
    messages: HashMap<(usize, Tag), VecDeque<Vec<u8>>>,
    /// Receives waiting for a message, in posting order
    posted: VecDeque<Arc<PostedRecv>>,
    /// Peers that disconnected
    closed: HashSet<usize>,
}

impl Endpoint {
    /// Hand `payload` to the earliest posted receive that accepts it, or
    /// queue it in the mailbox
    fn deliver(&self, src: usize, tag: Tag, payload: Vec<u8>) {
        let mut inbox = self.inbox.lock();
        match inbox.posted.iter().position(|recv| recv.accepts(src, tag)) {
            Some(index) => {
                if let Some(recv) = inbox.posted.remove(index) {
                    recv.complete(Ok((src, payload)));
                }
            }
            None => inbox
                .messages
                .entry((src, tag))
                .or_default()
                .push_back(payload),
        }
    }

    fn close_peer(&self, peer: usize) {
        let mut inbox = self.inbox.lock();
        inbox.closed.insert(peer);
        let Inbox { posted, closed, .. } = &mut *inbox;
        posted.retain(|recv| {
            if recv.srcs.iter().all(|src| closed.contains(src)) {
                recv.complete(Err(Error::collective(format!(
                    "rank {} waiting on {:?}: peer(s) {:?} disconnected",
                    self.rank, recv.tag, recv.srcs
                ))));
                false
            } else {
                true
            }
        });
    }

    /// Claim the next message from any rank in `srcs`, checked in that order
    ///
    /// A message already in the mailbox completes the receive at once;
    /// otherwise the receive waits in line behind earlier posted ones.
    fn post(&self, srcs: Vec<usize>, tag: Tag) -> Arc<PostedRecv> {
        let recv = Arc::new(PostedRecv::new(srcs, tag));
        let mut inbox = self.inbox.lock();
        for &src in &recv.srcs {
            if let Some(payload) = inbox
                .messages
                .get_mut(&(src, tag))
                .and_then(VecDeque::pop_front)
            {
                recv.complete(Ok((src, payload)));
                return recv;
            }
        }
        if recv.srcs.iter().all(|src| inbox.closed.contains(src)) {
            recv.complete(Err(Error::collective(format!(
                "rank {} waiting on {tag:?}: peer(s) {:?} disconnected",
                self.rank, recv.srcs
            ))));
            return recv;
        }
        inbox.posted.push_back(Arc::clone(&recv));
        recv
    }

    fn take(&self, srcs: &[usize], tag: Tag) -> Result<(usize, Vec<u8>)> {
        self.post(srcs.to_vec(), tag).wait()
    }
}

/// A receive that claimed its place in the mailbox
///
/// Completed exactly once, either when posted or by the matching delivery.
pub(crate) struct PostedRecv {
    srcs: Vec<usize>,
    tag: Tag,
    ready: AtomicBool,
    slot: Mutex<Option<Result<(usize, Vec<u8>)>>>,
    arrived: Condvar,
}

impl PostedRecv {
    fn new(srcs: Vec<usize>, tag: Tag) -> Self {
        Self {
            srcs,
            tag,
            ready: AtomicBool::new(false),
            slot: Mutex::new(None),
            arrived: Condvar::new(),
        }
    }

    fn accepts(&self, src: usize, tag: Tag) -> bool {
        self.tag == tag && self.srcs.contains(&src)
    }

    fn complete(&self, received: Result<(usize, Vec<u8>)>) {
        {
            let mut slot = self.slot.lock();
            *slot = Some(received);
            self.ready.store(true, Ordering::Release);
        }
        self.arrived.notify_all();
    }

    /// Whether the receive has its message or failed; never blocks
    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Block until the receive completes and take its result
    ///
    /// Only the first call gets the message.
    pub(crate) fn wait(&self) -> Result<(usize, Vec<u8>)> {
        let mut slot = self.slot.lock();
        while !self.is_ready() {
            self.arrived.wait(&mut slot);
        }
        slot.take()
            .unwrap_or_else(|| Err(Error::Internal("receive result already taken".to_string())))
    }
}

impl fmt::Debug for PostedRecv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostedRecv")
            .field("srcs", &self.srcs)
            .field("tag", &self.tag)
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// One rank's connection to every other rank of a group
pub struct CommContext {
    rank: usize,
    size: usize,
    device: Arc<TransportDevice>,
    endpoint: Arc<Endpoint>,
    peers: Vec<Arc<Endpoint>>,
    next_slot: AtomicU64,
}

impl CommContext {
    /// Register with `device` and connect to every rank through `store`
    ///
    /// Each rank publishes its endpoint under `{prefix}/{rank}` and waits at
    /// most `timeout` for the others to do the same.
    pub fn connect_full_mesh(
        store: &dyn Store,
        device: &Arc<TransportDevice>,
        rank: usize,
        size: usize,
        timeout: Duration,
        prefix: &str,
    ) -> Result<Self> {
        if rank >= size {
            return Err(Error::invalid_argument(
                "rank",
                format!("rank {rank} is outside a group of size {size}"),
            ));
        }
        let endpoint = device.register(rank);
        let connected = Self::resolve_peers(store, device, rank, size, timeout, prefix, &endpoint);
        let peers = match connected {
            Ok(peers) => peers,
            Err(err) => {
                device.unregister(endpoint.id);
                return Err(err);
            }
        };
        tracing::info!(
            device = device.name(),
            rank,
            size,
            "connected full mesh"
        );
        Ok(Self {
            rank,
            size,
            device: Arc::clone(device),
            endpoint,
            peers,
            next_slot: AtomicU64::new(0),
        })
    }

    fn resolve_peers(
        store: &dyn Store,
        device: &TransportDevice,
        rank: usize,
        size: usize,
        timeout: Duration,
        prefix: &str,
        endpoint: &Endpoint,
    ) -> Result<Vec<Arc<Endpoint>>> {
        store.set(&format!("{prefix}/{rank}"), endpoint.id.to_le_bytes().to_vec())?;
        let keys: Vec<String> = (0..size).map(|r| format!("{prefix}/{r}")).collect();
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        store.wait(&key_refs, timeout)?;

        let peers = keys
            .iter()
            .enumerate()
            .map(|(peer, key)| {
                let bytes: [u8; 8] = store.get(key)?.as_slice().try_into().map_err(|_| {
                    Error::collective(format!("malformed address for rank {peer}"))
                })?;
                device.lookup(u64::from_le_bytes(bytes)).ok_or_else(|| {
                    Error::collective(format!(
                        "rank {peer} is not registered with transport '{}'",
                        device.name()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        // No rank may disconnect before every rank resolved its peers
        store.set(&format!("{prefix}/{rank}/connected"), Vec::new())?;
        let connected: Vec<String> = (0..size)
            .map(|r| format!("{prefix}/{r}/connected"))
            .collect();
        let connected_refs: Vec<&str> = connected.iter().map(String::as_str).collect();
        store.wait(&connected_refs, timeout)?;
        Ok(peers)
    }

    /// This process's rank
    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of ranks
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Reserve the tag for the next algorithm built on this context
    ///
    /// Ranks must build their algorithms in the same order.
    pub fn next_slot(&self) -> Tag {
        Tag::Collective(self.next_slot.fetch_add(1, Ordering::Relaxed))
    }

    fn check_rank(&self, rank: usize) -> Result<()> {
        if rank >= self.size {
            return Err(Error::invalid_argument(
                "rank",
                format!("rank {rank} is outside a group of size {}", self.size),
            ));
        }
        Ok(())
    }

    /// Queue `payload` for `dst`
    pub fn send(&self, dst: usize, tag: Tag, payload: Vec<u8>) -> Result<()> {
        self.check_rank(dst)?;
        tracing::trace!(src = self.rank, dst, ?tag, bytes = payload.len(), "send");
        self.peers[dst].deliver(self.rank, tag, payload);
        Ok(())
    }

    /// Next message from `src` with `tag`
    pub fn recv(&self, src: usize, tag: Tag) -> Result<Vec<u8>> {
        self.check_rank(src)?;
        Ok(self.endpoint.take(&[src], tag)?.1)
    }

    /// Next message with `tag` from any rank in `srcs`, and who sent it
    pub fn recv_any(&self, srcs: &[usize], tag: Tag) -> Result<(usize, Vec<u8>)> {
        self.post_recv(srcs, tag)?.wait()
    }

    /// Post a receive from any rank in `srcs` without waiting for it
    pub(crate) fn post_recv(&self, srcs: &[usize], tag: Tag) -> Result<Arc<PostedRecv>> {
        if srcs.is_empty() {
            return Err(Error::invalid_argument("srcs", "no source ranks given"));
        }
        for &src in srcs {
            self.check_rank(src)?;
        }
        Ok(self.endpoint.post(srcs.to_vec(), tag))
    }
}

impl Drop for CommContext {
    fn drop(&mut self) {
        for (peer, endpoint) in self.peers.iter().enumerate() {
            if peer != self.rank {
                endpoint.close_peer(self.rank);
            }
        }
        self.device.unregister(self.endpoint.id);
        tracing::debug!(rank = self.rank, "disconnected");
    }
}

impl fmt::Debug for CommContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommContext")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("device", &self.device.name())
            .finish()
    }
}

/// A tensor's bytes as the payload of point-to-point transfers
///
/// Holds the tensor so its memory stays alive until the transfer is done.
pub struct UnboundBuffer {
    context: Arc<CommContext>,
    tensor: Tensor,
}

impl UnboundBuffer {
    /// Wrap `tensor` for transfers on `context`
    pub fn new(context: Arc<CommContext>, tensor: Tensor) -> Self {
        Self { context, tensor }
    }

    /// The wrapped tensor
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// Send the tensor's current contents to `dst`
    pub fn send(&self, dst: usize, tag: u32) -> Result<()> {
        let payload = self.tensor.to_bytes()?;
        self.context.send(dst, Tag::User(tag), payload)
    }

    /// Block until a message from one of `srcs` lands in the tensor
    ///
    /// Returns the rank that sent it.
    pub fn recv(&self, srcs: &[usize], tag: u32) -> Result<usize> {
        let posted = self.post_recv(srcs, tag)?;
        self.land(posted.wait())
    }

    pub(crate) fn post_recv(&self, srcs: &[usize], tag: u32) -> Result<Arc<PostedRecv>> {
        self.context.post_recv(srcs, Tag::User(tag))
    }

    /// Copy a received message into the tensor
    pub(crate) fn land(&self, received: Result<(usize, Vec<u8>)>) -> Result<usize> {
        let (src, payload) = received?;
        let expected = self.tensor.numel()? * self.tensor.dtype().size_in_bytes();
        if payload.len() != expected {
            return Err(Error::collective(format!(
                "received {} bytes from rank {src} into a {expected}-byte tensor",
                payload.len()
            )));
        }
        self.tensor.copy_from_bytes(&payload)?;
        Ok(src)
    }
}

impl fmt::Debug for UnboundBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnboundBuffer")
            .field("rank", &self.context.rank())
            .field("tensor", &self.tensor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::HashStore;
    use std::thread;

    fn mesh(size: usize) -> Vec<CommContext> {
        let store = Arc::new(HashStore::new());
        let device = TransportDevice::new("test");
        let handles: Vec<_> = (0..size)
            .map(|rank| {
                let store = Arc::clone(&store);
                let device = Arc::clone(&device);
                thread::spawn(move || {
                    CommContext::connect_full_mesh(
                        store.as_ref(),
                        &device,
                        rank,
                        size,
                        Duration::from_secs(5),
                        "mesh",
                    )
                    .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_messages_are_fifo_per_source_and_tag() {
        let contexts = mesh(2);
        contexts[0].send(1, Tag::User(3), vec![1]).unwrap();
        contexts[0].send(1, Tag::User(4), vec![9]).unwrap();
        contexts[0].send(1, Tag::User(3), vec![2]).unwrap();
        assert_eq!(contexts[1].recv(0, Tag::User(3)).unwrap(), vec![1]);
        assert_eq!(contexts[1].recv(0, Tag::User(3)).unwrap(), vec![2]);
        assert_eq!(contexts[1].recv(0, Tag::User(4)).unwrap(), vec![9]);
    }

    #[test]
    fn test_recv_any_reports_sender() {
        let contexts = mesh(3);
        contexts[2].send(0, Tag::User(0), vec![5]).unwrap();
        let (src, payload) = contexts[0].recv_any(&[1, 2], Tag::User(0)).unwrap();
        assert_eq!((src, payload), (2, vec![5]));
    }

    #[test]
    fn test_disconnected_peer_fails_receive() {
        let mut contexts = mesh(2);
        let second = contexts.pop().unwrap();
        drop(second);
        assert!(matches!(
            contexts[0].recv(1, Tag::Collective(0)),
            Err(Error::Collective(_))
        ));
    }

    #[test]
    fn test_receives_claim_messages_in_posting_order() {
        let contexts = mesh(2);
        let first = contexts[1].post_recv(&[0], Tag::User(0)).unwrap();
        let second = contexts[1].post_recv(&[0], Tag::User(0)).unwrap();
        assert!(!first.is_ready());

        contexts[0].send(1, Tag::User(0), vec![1]).unwrap();
        contexts[0].send(1, Tag::User(0), vec![2]).unwrap();
        assert!(second.is_ready());
        assert_eq!(second.wait().unwrap(), (0, vec![2]));
        assert_eq!(first.wait().unwrap(), (0, vec![1]));
        // A message nobody posted for waits in the mailbox
        contexts[0].send(1, Tag::User(0), vec![3]).unwrap();
        assert_eq!(contexts[1].recv(0, Tag::User(0)).unwrap(), vec![3]);
    }

    #[test]
    fn test_disconnect_fails_posted_receive() {
        let mut contexts = mesh(2);
        let pending = contexts[0].post_recv(&[1], Tag::User(7)).unwrap();
        drop(contexts.pop());
        assert!(pending.is_ready());
        assert!(matches!(pending.wait(), Err(Error::Collective(_))));
    }

    #[test]
    fn test_rendezvous_timeout() {
        let store = HashStore::new();
        let device = TransportDevice::new("lonely");
        let err = CommContext::connect_full_mesh(
            &store,
            &device,
            0,
            2,
            Duration::from_millis(20),
            "t",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(device.endpoints(), 0);
    }

    #[test]
    fn test_slots_are_sequential() {
        let contexts = mesh(1);
        assert_eq!(contexts[0].next_slot(), Tag::Collective(0));
        assert_eq!(contexts[0].next_slot(), Tag::Collective(1));
        assert!(contexts[0].send(1, Tag::User(0), vec![]).is_err());
    }
}
