//! Synchronization (component F): collective barriers, subset sync,
//! mutex, and event tokens.
//!
//! `sync_images` rides on a reserved point-to-point tag rather than a
//! dedicated transport primitive, since the transport trait only offers a
//! full-world [`crate::transport::RmaTransport::barrier`] (spec.md §6).

use crate::error::{CoreError, CoreResult, ErrorKind, Stat};
use crate::runtime::{ImageStatus, Runtime};
use crate::token::{Token, TokenKind};
use crate::transport::{AtomicOp, ImageId, LockMode};

pub(crate) const SYNC_IMAGES_TAG: i32 = 424242;

/// Full-world barrier, draining any deferred puts first so `sync_all`
/// also serves as the "complete outstanding RMA" point the config's
/// `non_blocking_put` mode relies on (spec.md §4.D.7/§4.F).
pub fn sync_all(rt: &Runtime, stat: Stat<'_>) -> CoreResult<()> {
    let result = (|| {
        rt.drain_deferred_puts()?;
        rt.transport().barrier()
    })();
    rt.report(stat, result)
}

/// Synchronizes with exactly the images in `set` (spec.md §4.F):
/// duplicates are rejected, an all-self set is a no-op, and `{*}`
/// (empty `set`) means "every other image" — implemented as a tagged
/// send to each target followed by a wait for one tagged message from
/// each.
pub fn sync_images(rt: &Runtime, set: &[ImageId], stat: Stat<'_>) -> CoreResult<()> {
    let result = (|| {
        let mut seen = std::collections::HashSet::new();
        for &img in set {
            if !seen.insert(img) {
                return Err(CoreError::new(ErrorKind::DuplicateSyncImage, format!("image {img} listed twice")));
            }
        }
        let this_image = rt.this_image();
        let targets: Vec<ImageId> = if set.is_empty() {
            rt.peers().to_vec()
        } else {
            set.iter().copied().filter(|&i| i != this_image).collect()
        };
        if targets.is_empty() {
            return Ok(());
        }
        rt.drain_deferred_puts()?;

        let transport = rt.transport().as_ref();
        // The payload carries this image's status, not its id: a stopped
        // image's `finalize_with_status` (runtime.rs) sends a status code
        // on this same tag, and a raw `ImageId` would collide with
        // `ImageStatus::Stopped`'s code for low-numbered images.
        let ping = ImageStatus::Running.to_i32().to_le_bytes();
        for &target in &targets {
            transport.send_tagged(target, SYNC_IMAGES_TAG, &ping)?;
        }
        let mut pending: std::collections::HashSet<ImageId> = targets.iter().copied().collect();
        while !pending.is_empty() {
            let (from, payload) = transport.recv_tagged(SYNC_IMAGES_TAG)?;
            if payload.len() == 4 {
                let code = i32::from_le_bytes(payload[..4].try_into().unwrap());
                if code == ImageStatus::Stopped.to_i32() {
                    return Err(CoreError::new(
                        ErrorKind::StoppedImage,
                        format!("image {from} stopped during sync_images"),
                    ));
                }
            }
            pending.remove(&from);
        }
        Ok(())
    })();
    rt.report(stat, result)
}

/// Creates a lock token: one `i32` slot per image, zero-initialized
/// (unlocked), per spec.md §4.F.
pub fn lock_init(rt: &Runtime) -> CoreResult<Token> {
    rt.tokens().register_master(rt.transport().as_ref(), rt.num_images() as usize, TokenKind::Lock, None)
}

/// Acquires the distributed mutex identified by `token` on `image` via
/// compare-and-swap against this image's id, retrying until it observes
/// zero. Self-deadlock (already holding the lock) is detected up front
/// and reported with `stat = 99` rather than spinning forever.
pub fn lock(rt: &Runtime, token: Token, image: ImageId, stat: Stat<'_>) -> CoreResult<()> {
    let result = (|| {
        let (window, _) = rt.tokens().lookup_master(token)?;
        let this_image = rt.this_image() as i64;
        let slot = (image as usize - 1) * std::mem::size_of::<i32>();
        let transport = rt.transport().as_ref();

        transport.lock(window, image, LockMode::Exclusive)?;
        let held = transport.compare_and_swap(window, image, slot, 0, this_image);
        transport.unlock(window, image)?;
        let mut held = held?;

        if held == this_image {
            return Err(CoreError::new(ErrorKind::MutexSelfDeadlock, "image already holds this lock"));
        }

        while held != 0 {
            if rt.config().failure_handling && rt.poll_and_recover()?.contains(&image) {
                // The lock holder died; steal the lock rather than spin
                // forever (spec.md §9 failure-handling note).
                transport.lock(window, image, LockMode::Exclusive)?;
                let cur = transport.compare_and_swap(window, image, slot, held, this_image);
                transport.unlock(window, image)?;
                held = cur?;
                continue;
            }
            transport.lock(window, image, LockMode::Exclusive)?;
            let cur = transport.compare_and_swap(window, image, slot, 0, this_image);
            transport.unlock(window, image)?;
            held = cur?;
            if held == this_image {
                return Err(CoreError::new(ErrorKind::MutexSelfDeadlock, "image already holds this lock"));
            }
        }
        Ok(())
    })();
    rt.report(stat, result)
}

pub fn unlock(rt: &Runtime, token: Token, image: ImageId, stat: Stat<'_>) -> CoreResult<()> {
    let result = (|| {
        let (window, _) = rt.tokens().lookup_master(token)?;
        let slot = (image as usize - 1) * std::mem::size_of::<i32>();
        let transport = rt.transport().as_ref();
        transport.lock(window, image, LockMode::Exclusive)?;
        let r = transport.fetch_and_op(window, image, slot, 0, AtomicOp::Replace);
        transport.unlock(window, image)?;
        r.map(|_| ())
    })();
    rt.report(stat, result)
}

/// Creates an event token: one `i32` counter per image, zero-initialized
/// (spec.md §4.F).
pub fn event_init(rt: &Runtime) -> CoreResult<Token> {
    rt.tokens().register_master(rt.transport().as_ref(), rt.num_images() as usize, TokenKind::Event, None)
}

/// Posts (increments by `count`, default 1) the event on `image`.
pub fn event_post(rt: &Runtime, token: Token, image: ImageId, count: i64, stat: Stat<'_>) -> CoreResult<()> {
    let result = (|| {
        let (window, _) = rt.tokens().lookup_master(token)?;
        let slot = (image as usize - 1) * std::mem::size_of::<i32>();
        let transport = rt.transport().as_ref();
        transport.lock(window, image, LockMode::Exclusive)?;
        let r = transport.fetch_and_op(window, image, slot, count, AtomicOp::Sum);
        transport.unlock(window, image)?;
        r.map(|_| ())
    })();
    rt.report(stat, result)
}

/// Waits until the local event's counter is at least `until_count`
/// (default 1), then decrements it by that amount (spec.md §4.F).
pub fn event_wait(rt: &Runtime, token: Token, until_count: i64, stat: Stat<'_>) -> CoreResult<()> {
    let result = (|| {
        let (window, _) = rt.tokens().lookup_master(token)?;
        let this_image = rt.this_image();
        let slot = (this_image as usize - 1) * std::mem::size_of::<i32>();
        let transport = rt.transport().as_ref();
        loop {
            transport.lock(window, this_image, LockMode::Shared)?;
            let mut buf = [0u8; 4];
            let r = transport.get(window, this_image, slot, &mut buf);
            transport.unlock(window, this_image)?;
            r?;
            if i32::from_le_bytes(buf) as i64 >= until_count {
                break;
            }
        }
        transport.lock(window, this_image, LockMode::Exclusive)?;
        let r = transport.fetch_and_op(window, this_image, slot, -until_count, AtomicOp::Sum);
        transport.unlock(window, this_image)?;
        r.map(|_| ())
    })();
    rt.report(stat, result)
}

/// Non-blocking read of the local event counter, leaving it unchanged.
pub fn event_query(rt: &Runtime, token: Token, stat: Stat<'_>) -> CoreResult<i64> {
    let eval = (|| {
        let (window, _) = rt.tokens().lookup_master(token)?;
        let this_image = rt.this_image();
        let slot = (this_image as usize - 1) * std::mem::size_of::<i32>();
        let transport = rt.transport().as_ref();
        transport.lock(window, this_image, LockMode::Shared)?;
        let r = transport.fetch_and_op(window, this_image, slot, 0, AtomicOp::NoOp);
        transport.unlock(window, this_image)?;
        r
    })();
    match eval {
        Ok(v) => {
            rt.report(stat, Ok(()))?;
            Ok(v)
        }
        Err(e) => {
            let _ = rt.report(stat, Err(e.clone()));
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_images_rejects_duplicates() {
        let set = [1u32, 2, 1];
        let mut seen = std::collections::HashSet::new();
        let mut dup = false;
        for img in set {
            if !seen.insert(img) {
                dup = true;
            }
        }
        assert!(dup);
    }
}
