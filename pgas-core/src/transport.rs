//! The external-collaborator boundary: everything this crate needs from
//! "the underlying message-passing library" (spec.md §1), expressed as a
//! trait so that `pgas-core` never depends on a concrete transport. A
//! production build would implement [`RmaTransport`] over an MPI binding;
//! `pgas-transport-mem` implements it in-process for tests and examples.
//!
//! Grounded in the teacher's split between a thin, object-safe interface
//! and the "capability record" design note (spec.md §9): `lock`/`unlock`/
//! `flush` are exposed individually so [`crate::transfer`] can select a
//! per-operation or lock-all-and-flush policy without branching on the
//! transport's actual capabilities.

use crate::descriptor::ElementType;
use crate::error::CoreResult;

/// 1-based image index, per spec.md §6.
pub type ImageId = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId(pub u64);

/// Opaque address of a slave-token allocation inside the global dynamic
/// window, meaningful only on the image that attached it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DynAddr(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AtomicOp {
    Sum,
    BitAnd,
    BitOr,
    BitXor,
    /// Fetch-and-replace: used by mutex unlock and atomic_define.
    Replace,
    /// Fetch-and-no-op: used by atomic_ref and event_query.
    NoOp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Min,
    Max,
    /// A user-supplied reduction operator, adapted via the `by_value`/
    /// `by_reference` shims of spec.md §4.H. The transport identifies the
    /// operator by this opaque registration id.
    UserDefined(u32),
}

/// Everything the core needs from a one-sided-RMA transport.
///
/// Every data-moving method is a blocking call from the caller's point of
/// view (matching spec.md's synchronous `get`/`send` contract); a
/// transport that implements true non-blocking RMA under the hood is
/// free to complete it before returning.
pub trait RmaTransport: Send + Sync {
    fn this_image(&self) -> ImageId;
    fn num_images(&self) -> u32;

    /// Collective: every image must call this in the same program order
    /// so the resulting window is symmetric (spec.md §3 Token invariant).
    fn create_window(&self, bytes: usize) -> CoreResult<WindowId>;
    /// Collective; spec.md §4.C says a sync point must precede full
    /// teardown, which `crate::token` arranges by calling
    /// [`RmaTransport::barrier`] itself before calling this.
    fn free_window(&self, window: WindowId) -> CoreResult<()>;

    /// Attaches `bytes` to the process-wide dynamic window, returning the
    /// address a remote peer learns by dereferencing a component pointer
    /// (spec.md §3, slave token).
    fn attach_dynamic(&self, bytes: Vec<u8>) -> CoreResult<DynAddr>;
    /// Detaches and returns the backing memory (detach must precede free,
    /// per spec.md §5).
    fn detach_dynamic(&self, addr: DynAddr) -> CoreResult<Vec<u8>>;

    fn lock(&self, window: WindowId, image: ImageId, mode: LockMode) -> CoreResult<()>;
    fn unlock(&self, window: WindowId, image: ImageId) -> CoreResult<()>;
    /// Completes any outstanding RMA this image issued against `window`
    /// on `image` (no-op for transports without deferred completion).
    fn flush(&self, window: WindowId, image: ImageId) -> CoreResult<()>;

    fn get(&self, window: WindowId, image: ImageId, offset: usize, buf: &mut [u8]) -> CoreResult<()>;
    fn put(&self, window: WindowId, image: ImageId, offset: usize, data: &[u8]) -> CoreResult<()>;

    fn get_dynamic(&self, image: ImageId, addr: DynAddr, offset: usize, buf: &mut [u8]) -> CoreResult<()>;
    fn put_dynamic(&self, image: ImageId, addr: DynAddr, offset: usize, data: &[u8]) -> CoreResult<()>;

    /// 8-byte compare-and-swap, returns the value observed before the
    /// swap (used by mutex lock and the failure-steal path).
    fn compare_and_swap(
        &self,
        window: WindowId,
        image: ImageId,
        offset: usize,
        expected: i64,
        new: i64,
    ) -> CoreResult<i64>;

    /// Fetch-and-op, returns the value observed before the op (events,
    /// atomics).
    fn fetch_and_op(
        &self,
        window: WindowId,
        image: ImageId,
        offset: usize,
        operand: i64,
        op: AtomicOp,
    ) -> CoreResult<i64>;

    /// Full memory-fence barrier across every image (spec.md §4.F).
    fn barrier(&self) -> CoreResult<()>;

    /// Point-to-point send tagged with an integer tag (spec.md §6 reserves
    /// `424242` for subset sync).
    fn send_tagged(&self, image: ImageId, tag: i32, payload: &[u8]) -> CoreResult<()>;
    /// Blocking receive of the next message matching `tag`, from any
    /// sender.
    fn recv_tagged(&self, tag: i32) -> CoreResult<(ImageId, Vec<u8>)>;
    /// Non-blocking poll for a message matching `tag`, used by
    /// [`crate::sync::sync_images`]'s wait loop.
    fn try_recv_tagged(&self, tag: i32) -> CoreResult<Option<(ImageId, Vec<u8>)>>;

    /// `result_image == 0` means all-reduce (spec.md §4.H).
    fn collective_reduce(
        &self,
        buf: &mut [u8],
        elem_type: ElementType,
        elem_kind: u8,
        op: ReduceOp,
        result_image: ImageId,
    ) -> CoreResult<()>;
    fn collective_broadcast(&self, buf: &mut [u8], source_image: ImageId) -> CoreResult<()>;

    /// Images the transport currently believes have failed (empty unless
    /// failure-handling is enabled and a peer has actually died).
    fn failed_images(&self) -> Vec<ImageId>;
}
