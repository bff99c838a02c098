//! In-process, multi-image [`RmaTransport`] implementation.
//!
//! `spawn_images(n)` returns `n` handles sharing one [`MemWorld`]; each
//! handle behaves like a distinct image in the PGAS sense (its own
//! `this_image`, its own dynamic-window allocations, its own tagged-
//! message inbox) while windows, barriers, and collectives rendezvous
//! through the shared world. Intended for `pgas-core`'s tests and demos,
//! never for production use — a real deployment implements
//! [`RmaTransport`] over an actual one-sided-RMA library.
//!
//! Locking is simplified relative to a true RMA window: `lock`/`unlock`/
//! `flush` are no-ops, and each `get`/`put` instead takes a transient
//! internal lock on the addressed window slot for the duration of the
//! call. This preserves per-call atomicity (enough for every protocol in
//! `pgas-core`, which always brackets a *sequence* of calls with its own
//! `lock`/`unlock`) without modeling MPI's exposure-epoch semantics.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use pgas_core::descriptor::ElementType;
use pgas_core::error::{CoreError, CoreResult, ErrorKind};
use pgas_core::transport::{AtomicOp, DynAddr, ImageId, LockMode, ReduceOp, RmaTransport, WindowId};

/// Atomic operations in this transport act on a 4-byte (`i32`) word at
/// the given byte offset: `pgas-core`'s lock/event/atomic tokens always
/// space their slots by `size_of::<i32>()`, so this matches every caller
/// in the crate even though the trait's `i64` parameters could in
/// principle address a wider word.
const ATOMIC_WORD_BYTES: usize = 4;

struct WindowState {
    per_image: Vec<Mutex<Vec<u8>>>,
}

#[derive(Default)]
struct CreateRound {
    arrived: u32,
    bytes: usize,
    generation: u64,
    finished_id: Option<WindowId>,
}

#[derive(Default)]
struct BarrierRound {
    arrived: u32,
    generation: u64,
}

struct ReduceRound {
    arrived: u32,
    generation: u64,
    accum: Option<Vec<u8>>,
    elem_type: Option<ElementType>,
    elem_kind: u8,
    result_image: ImageId,
    error: Option<String>,
}

impl Default for ReduceRound {
    fn default() -> Self {
        ReduceRound { arrived: 0, generation: 0, accum: None, elem_type: None, elem_kind: 0, result_image: 0, error: None }
    }
}

#[derive(Default)]
struct BroadcastRound {
    arrived: u32,
    generation: u64,
    payload: Option<Vec<u8>>,
}

struct Inbox {
    queue: Mutex<VecDeque<(ImageId, i32, Vec<u8>)>>,
    cv: Condvar,
}

impl Default for Inbox {
    fn default() -> Self {
        Inbox { queue: Mutex::new(VecDeque::new()), cv: Condvar::new() }
    }
}

/// Shared state for a simulated multi-image world.
pub struct MemWorld {
    num_images: u32,
    windows: Mutex<HashMap<WindowId, WindowState>>,
    next_window_id: AtomicU64,
    dynamic: Mutex<HashMap<(ImageId, u64), Vec<u8>>>,
    next_dyn_id: AtomicU64,
    inboxes: Vec<Inbox>,
    create_round: Mutex<CreateRound>,
    create_cv: Condvar,
    barrier_round: Mutex<BarrierRound>,
    barrier_cv: Condvar,
    reduce_round: Mutex<ReduceRound>,
    reduce_cv: Condvar,
    broadcast_round: Mutex<BroadcastRound>,
    broadcast_cv: Condvar,
    failed: Mutex<HashSet<ImageId>>,
}

impl MemWorld {
    pub fn new(num_images: u32) -> Arc<MemWorld> {
        let inboxes = (0..num_images).map(|_| Inbox::default()).collect();
        Arc::new(MemWorld {
            num_images,
            windows: Mutex::new(HashMap::new()),
            next_window_id: AtomicU64::new(1),
            dynamic: Mutex::new(HashMap::new()),
            next_dyn_id: AtomicU64::new(1),
            inboxes,
            create_round: Mutex::new(CreateRound::default()),
            create_cv: Condvar::new(),
            barrier_round: Mutex::new(BarrierRound::default()),
            barrier_cv: Condvar::new(),
            reduce_round: Mutex::new(ReduceRound::default()),
            reduce_cv: Condvar::new(),
            broadcast_round: Mutex::new(BroadcastRound::default()),
            broadcast_cv: Condvar::new(),
            failed: Mutex::new(HashSet::new()),
        })
    }

    /// Test/demo hook: marks `image` as failed so `failed_images()` (and
    /// therefore `Runtime::poll_and_recover`) observes it. Never called
    /// by production code.
    pub fn inject_failure(&self, image: ImageId) {
        self.failed.lock().insert(image);
    }
}

/// One image's view of a [`MemWorld`].
pub struct MemTransport {
    world: Arc<MemWorld>,
    this_image: ImageId,
}

/// Builds a world of `num_images` images and returns one handle per
/// image, 1-based (`handles[0]` is image 1).
pub fn spawn_images(num_images: u32) -> Vec<MemTransport> {
    let world = MemWorld::new(num_images);
    (1..=num_images).map(|this_image| MemTransport { world: world.clone(), this_image }).collect()
}

fn oob(name: &str) -> CoreError {
    CoreError::new(ErrorKind::TransportError, format!("{name}: offset/length out of range"))
}

fn elem_byte_size(elem_type: ElementType, elem_kind: u8) -> usize {
    match elem_type {
        ElementType::Complex => elem_kind as usize * 2,
        _ => elem_kind as usize,
    }
}

fn combine_reduce(accum: &mut [u8], incoming: &[u8], elem_type: ElementType, elem_kind: u8, op: ReduceOp) -> CoreResult<()> {
    if let ReduceOp::UserDefined(_) = op {
        return Err(CoreError::new(
            ErrorKind::TypeConversionUnsupported,
            "pgas-transport-mem does not evaluate user-defined reduction operators",
        ));
    }
    let size = elem_byte_size(elem_type, elem_kind).max(1);
    let count = accum.len() / size;
    for i in 0..count {
        let a = &mut accum[i * size..(i + 1) * size];
        let b = &incoming[i * size..(i + 1) * size];
        match elem_type {
            ElementType::Real => {
                let av = read_f64(a);
                let bv = read_f64(b);
                let r = match op {
                    ReduceOp::Sum => av + bv,
                    ReduceOp::Min => av.min(bv),
                    ReduceOp::Max => av.max(bv),
                    ReduceOp::UserDefined(_) => unreachable!(),
                };
                write_f64(a, r);
            }
            _ => {
                let av = read_i64(a);
                let bv = read_i64(b);
                let r = match op {
                    ReduceOp::Sum => av.wrapping_add(bv),
                    ReduceOp::Min => av.min(bv),
                    ReduceOp::Max => av.max(bv),
                    ReduceOp::UserDefined(_) => unreachable!(),
                };
                write_i64(a, r);
            }
        }
    }
    Ok(())
}

fn read_i64(b: &[u8]) -> i64 {
    match b.len() {
        1 => b[0] as i8 as i64,
        2 => i16::from_le_bytes(b.try_into().unwrap()) as i64,
        4 => i32::from_le_bytes(b.try_into().unwrap()) as i64,
        8 => i64::from_le_bytes(b.try_into().unwrap()),
        _ => 0,
    }
}

fn write_i64(b: &mut [u8], v: i64) {
    match b.len() {
        1 => b[0] = v as i8 as u8,
        2 => b.copy_from_slice(&(v as i16).to_le_bytes()),
        4 => b.copy_from_slice(&(v as i32).to_le_bytes()),
        8 => b.copy_from_slice(&v.to_le_bytes()),
        _ => {}
    }
}

fn read_f64(b: &[u8]) -> f64 {
    match b.len() {
        4 => f32::from_le_bytes(b.try_into().unwrap()) as f64,
        8 => f64::from_le_bytes(b.try_into().unwrap()),
        _ => 0.0,
    }
}

fn write_f64(b: &mut [u8], v: f64) {
    match b.len() {
        4 => b.copy_from_slice(&(v as f32).to_le_bytes()),
        8 => b.copy_from_slice(&v.to_le_bytes()),
        _ => {}
    }
}

impl RmaTransport for MemTransport {
    fn this_image(&self) -> ImageId {
        self.this_image
    }

    fn num_images(&self) -> u32 {
        self.world.num_images
    }

    fn create_window(&self, bytes: usize) -> CoreResult<WindowId> {
        let mut round = self.world.create_round.lock();
        if round.arrived == 0 {
            round.bytes = bytes;
        }
        round.arrived += 1;
        if round.arrived == self.world.num_images {
            let id = WindowId(self.world.next_window_id.fetch_add(1, Ordering::SeqCst));
            let per_image = (0..self.world.num_images).map(|_| Mutex::new(vec![0u8; round.bytes])).collect();
            self.world.windows.lock().insert(id, WindowState { per_image });
            round.finished_id = Some(id);
            round.arrived = 0;
            round.generation += 1;
            self.world.create_cv.notify_all();
            Ok(id)
        } else {
            let gen = round.generation;
            while round.generation == gen {
                self.world.create_cv.wait(&mut round);
            }
            round.finished_id.ok_or_else(|| oob("create_window"))
        }
    }

    fn free_window(&self, window: WindowId) -> CoreResult<()> {
        self.world.windows.lock().remove(&window);
        Ok(())
    }

    fn attach_dynamic(&self, bytes: Vec<u8>) -> CoreResult<DynAddr> {
        let id = self.world.next_dyn_id.fetch_add(1, Ordering::SeqCst);
        self.world.dynamic.lock().insert((self.this_image, id), bytes);
        Ok(DynAddr(id))
    }

    fn detach_dynamic(&self, addr: DynAddr) -> CoreResult<Vec<u8>> {
        self.world
            .dynamic
            .lock()
            .remove(&(self.this_image, addr.0))
            .ok_or_else(|| oob("detach_dynamic"))
    }

    fn lock(&self, _window: WindowId, _image: ImageId, _mode: LockMode) -> CoreResult<()> {
        Ok(())
    }

    fn unlock(&self, _window: WindowId, _image: ImageId) -> CoreResult<()> {
        Ok(())
    }

    fn flush(&self, _window: WindowId, _image: ImageId) -> CoreResult<()> {
        Ok(())
    }

    fn get(&self, window: WindowId, image: ImageId, offset: usize, buf: &mut [u8]) -> CoreResult<()> {
        let windows = self.world.windows.lock();
        let state = windows.get(&window).ok_or_else(|| oob("get"))?;
        let slot = state.per_image.get(image as usize - 1).ok_or_else(|| oob("get"))?.lock();
        if offset + buf.len() > slot.len() {
            return Err(oob("get"));
        }
        buf.copy_from_slice(&slot[offset..offset + buf.len()]);
        Ok(())
    }

    fn put(&self, window: WindowId, image: ImageId, offset: usize, data: &[u8]) -> CoreResult<()> {
        let windows = self.world.windows.lock();
        let state = windows.get(&window).ok_or_else(|| oob("put"))?;
        let mut slot = state.per_image.get(image as usize - 1).ok_or_else(|| oob("put"))?.lock();
        if offset + data.len() > slot.len() {
            return Err(oob("put"));
        }
        slot[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn get_dynamic(&self, image: ImageId, addr: DynAddr, offset: usize, buf: &mut [u8]) -> CoreResult<()> {
        let dynamic = self.world.dynamic.lock();
        let mem = dynamic.get(&(image, addr.0)).ok_or_else(|| oob("get_dynamic"))?;
        if offset + buf.len() > mem.len() {
            return Err(oob("get_dynamic"));
        }
        buf.copy_from_slice(&mem[offset..offset + buf.len()]);
        Ok(())
    }

    fn put_dynamic(&self, image: ImageId, addr: DynAddr, offset: usize, data: &[u8]) -> CoreResult<()> {
        let mut dynamic = self.world.dynamic.lock();
        let mem = dynamic.get_mut(&(image, addr.0)).ok_or_else(|| oob("put_dynamic"))?;
        if offset + data.len() > mem.len() {
            return Err(oob("put_dynamic"));
        }
        mem[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn compare_and_swap(&self, window: WindowId, image: ImageId, offset: usize, expected: i64, new: i64) -> CoreResult<i64> {
        let windows = self.world.windows.lock();
        let state = windows.get(&window).ok_or_else(|| oob("compare_and_swap"))?;
        let mut slot = state.per_image.get(image as usize - 1).ok_or_else(|| oob("compare_and_swap"))?.lock();
        if offset + ATOMIC_WORD_BYTES > slot.len() {
            return Err(oob("compare_and_swap"));
        }
        let word = &mut slot[offset..offset + ATOMIC_WORD_BYTES];
        let current = i32::from_le_bytes(word.try_into().unwrap()) as i64;
        if current == expected {
            word.copy_from_slice(&(new as i32).to_le_bytes());
        }
        Ok(current)
    }

    fn fetch_and_op(&self, window: WindowId, image: ImageId, offset: usize, operand: i64, op: AtomicOp) -> CoreResult<i64> {
        let windows = self.world.windows.lock();
        let state = windows.get(&window).ok_or_else(|| oob("fetch_and_op"))?;
        let mut slot = state.per_image.get(image as usize - 1).ok_or_else(|| oob("fetch_and_op"))?.lock();
        if offset + ATOMIC_WORD_BYTES > slot.len() {
            return Err(oob("fetch_and_op"));
        }
        let word = &mut slot[offset..offset + ATOMIC_WORD_BYTES];
        let before = i32::from_le_bytes(word.try_into().unwrap());
        let after = match op {
            AtomicOp::Sum => before.wrapping_add(operand as i32),
            AtomicOp::BitAnd => before & (operand as i32),
            AtomicOp::BitOr => before | (operand as i32),
            AtomicOp::BitXor => before ^ (operand as i32),
            AtomicOp::Replace => operand as i32,
            AtomicOp::NoOp => before,
        };
        if !matches!(op, AtomicOp::NoOp) {
            word.copy_from_slice(&after.to_le_bytes());
        }
        Ok(before as i64)
    }

    fn barrier(&self) -> CoreResult<()> {
        let mut round = self.world.barrier_round.lock();
        round.arrived += 1;
        if round.arrived == self.world.num_images {
            round.arrived = 0;
            round.generation += 1;
            self.world.barrier_cv.notify_all();
        } else {
            let gen = round.generation;
            while round.generation == gen {
                self.world.barrier_cv.wait(&mut round);
            }
        }
        Ok(())
    }

    fn send_tagged(&self, image: ImageId, tag: i32, payload: &[u8]) -> CoreResult<()> {
        let inbox = self.world.inboxes.get(image as usize - 1).ok_or_else(|| oob("send_tagged"))?;
        inbox.queue.lock().push_back((self.this_image, tag, payload.to_vec()));
        inbox.cv.notify_all();
        Ok(())
    }

    fn recv_tagged(&self, tag: i32) -> CoreResult<(ImageId, Vec<u8>)> {
        let inbox = &self.world.inboxes[self.this_image as usize - 1];
        let mut queue = inbox.queue.lock();
        loop {
            if let Some(pos) = queue.iter().position(|(_, t, _)| *t == tag) {
                let (from, _, payload) = queue.remove(pos).unwrap();
                return Ok((from, payload));
            }
            inbox.cv.wait(&mut queue);
        }
    }

    fn try_recv_tagged(&self, tag: i32) -> CoreResult<Option<(ImageId, Vec<u8>)>> {
        let inbox = &self.world.inboxes[self.this_image as usize - 1];
        let mut queue = inbox.queue.lock();
        if let Some(pos) = queue.iter().position(|(_, t, _)| *t == tag) {
            let (from, _, payload) = queue.remove(pos).unwrap();
            Ok(Some((from, payload)))
        } else {
            Ok(None)
        }
    }

    fn collective_reduce(&self, buf: &mut [u8], elem_type: ElementType, elem_kind: u8, op: ReduceOp, result_image: ImageId) -> CoreResult<()> {
        let mut round = self.world.reduce_round.lock();
        if round.arrived == 0 {
            round.accum = Some(buf.to_vec());
            round.elem_type = Some(elem_type);
            round.elem_kind = elem_kind;
            round.result_image = result_image;
            round.error = None;
        } else if let Some(accum) = round.accum.as_mut() {
            if let Err(e) = combine_reduce(accum, buf, elem_type, elem_kind, op) {
                round.error = Some(e.message.clone());
            }
        }
        round.arrived += 1;
        if round.arrived == self.world.num_images {
            round.arrived = 0;
            round.generation += 1;
            self.world.reduce_cv.notify_all();
        } else {
            let gen = round.generation;
            while round.generation == gen {
                self.world.reduce_cv.wait(&mut round);
            }
        }
        if let Some(msg) = round.error.clone() {
            return Err(CoreError::new(ErrorKind::TypeConversionUnsupported, msg));
        }
        let result = round.accum.clone().ok_or_else(|| oob("collective_reduce"))?;
        if round.result_image == 0 || round.result_image == self.this_image {
            if result.len() != buf.len() {
                return Err(oob("collective_reduce"));
            }
            buf.copy_from_slice(&result);
        }
        Ok(())
    }

    fn collective_broadcast(&self, buf: &mut [u8], source_image: ImageId) -> CoreResult<()> {
        let mut round = self.world.broadcast_round.lock();
        if self.this_image == source_image {
            round.payload = Some(buf.to_vec());
        }
        round.arrived += 1;
        if round.arrived == self.world.num_images {
            round.arrived = 0;
            round.generation += 1;
            self.world.broadcast_cv.notify_all();
        } else {
            let gen = round.generation;
            while round.generation == gen {
                self.world.broadcast_cv.wait(&mut round);
            }
        }
        if self.this_image != source_image {
            let payload = round.payload.clone().ok_or_else(|| oob("collective_broadcast"))?;
            if payload.len() != buf.len() {
                return Err(oob("collective_broadcast"));
            }
            buf.copy_from_slice(&payload);
        }
        Ok(())
    }

    fn failed_images(&self) -> Vec<ImageId> {
        self.world.failed.lock().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn put_on_remote_then_get_back_round_trips() {
        let images = spawn_images(2);
        let window = thread::scope(|scope| {
            let h0 = scope.spawn(|| images[0].create_window(16).unwrap());
            let h1 = scope.spawn(|| images[1].create_window(16).unwrap());
            let w0 = h0.join().unwrap();
            let w1 = h1.join().unwrap();
            assert_eq!(w0, w1);
            w0
        });
        images[0].put(window, 2, 0, &42u32.to_le_bytes()).unwrap();
        let mut buf = [0u8; 4];
        images[1].get(window, 2, 0, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 42);
    }

    #[test]
    fn barrier_releases_every_waiting_thread() {
        let images = spawn_images(3);
        thread::scope(|scope| {
            for img in &images {
                scope.spawn(move || img.barrier().unwrap());
            }
        });
    }

    #[test]
    fn tagged_send_recv_round_trips() {
        let images = spawn_images(2);
        thread::scope(|scope| {
            let receiver = &images[1];
            let handle = scope.spawn(move || receiver.recv_tagged(7).unwrap());
            images[0].send_tagged(2, 7, b"hello").unwrap();
            let (from, payload) = handle.join().unwrap();
            assert_eq!(from, 1);
            assert_eq!(payload, b"hello");
        });
    }

    #[test]
    fn collective_sum_reduces_across_images() {
        let images = spawn_images(3);
        thread::scope(|scope| {
            for (i, img) in images.iter().enumerate() {
                let value = (i as i32 + 1).to_le_bytes();
                scope.spawn(move || {
                    let mut buf = value;
                    img.collective_reduce(&mut buf, ElementType::Integer, 4, ReduceOp::Sum, 0).unwrap();
                    assert_eq!(i32::from_le_bytes(buf), 6);
                });
            }
        });
    }
}
