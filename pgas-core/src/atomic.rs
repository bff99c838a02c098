//! Atomic subroutines (component G): `atomic_define`, `atomic_ref`,
//! `atomic_cas`, and the fetch-and-op family, all built directly on the
//! transport's single-word primitives (spec.md §4.G).

use crate::error::{CoreError, CoreResult, ErrorKind, Stat};
use crate::runtime::Runtime;
use crate::token::{Token, TokenKind};
use crate::transport::{AtomicOp, ImageId, LockMode};

/// Creates an atomic-variable token: `count` `i32` slots, one per
/// subscript value the caller intends to address (spec.md §4.G).
pub fn atomic_init(rt: &Runtime, count: usize) -> CoreResult<Token> {
    rt.tokens().register_master(rt.transport().as_ref(), count, TokenKind::Atomic, None)
}

/// Which fetch-and-op variant `atomic_op`/`atomic_fetch_op` requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AtomicIntent {
    Add,
    And,
    Or,
    Xor,
}

impl AtomicIntent {
    fn into_transport_op(self) -> AtomicOp {
        match self {
            AtomicIntent::Add => AtomicOp::Sum,
            AtomicIntent::And => AtomicOp::BitAnd,
            AtomicIntent::Or => AtomicOp::BitOr,
            AtomicIntent::Xor => AtomicOp::BitXor,
        }
    }
}

fn byte_offset(token_size: usize, offset: i64) -> CoreResult<usize> {
    if offset < 0 || offset as usize >= token_size {
        return Err(CoreError::new(ErrorKind::ExtentOutOfRange, "atomic variable offset out of range"));
    }
    Ok(offset as usize * std::mem::size_of::<i32>())
}

/// Unconditionally replaces the remote atomic variable's value
/// (spec.md §4.G).
pub fn atomic_define(rt: &Runtime, token: Token, offset: i64, image: ImageId, value: i64, stat: Stat<'_>) -> CoreResult<()> {
    let result = (|| {
        let (window, _) = rt.tokens().lookup_master(token)?;
        let size = rt.tokens().master_slot_count(token)?;
        let off = byte_offset(size, offset)?;
        let transport = rt.transport().as_ref();
        transport.lock(window, image, LockMode::Exclusive)?;
        let r = transport.fetch_and_op(window, image, off, value, AtomicOp::Replace);
        transport.unlock(window, image)?;
        r.map(|_| ())
    })();
    rt.report(stat, result)
}

/// Reads the remote atomic variable's current value without modifying it.
pub fn atomic_ref(rt: &Runtime, token: Token, offset: i64, image: ImageId, stat: Stat<'_>) -> CoreResult<i64> {
    atomic_fetch_and_op_raw(rt, token, offset, image, 0, AtomicOp::NoOp, stat)
}

/// Compare-and-swap: writes `new` if the remote value equals `expected`,
/// always returns the value observed before the attempt.
pub fn atomic_cas(
    rt: &Runtime,
    token: Token,
    offset: i64,
    image: ImageId,
    expected: i64,
    new: i64,
    stat: Stat<'_>,
) -> CoreResult<i64> {
    let eval = (|| {
        let (window, _) = rt.tokens().lookup_master(token)?;
        let size = rt.tokens().master_slot_count(token)?;
        let off = byte_offset(size, offset)?;
        let transport = rt.transport().as_ref();
        transport.lock(window, image, LockMode::Exclusive)?;
        let r = transport.compare_and_swap(window, image, off, expected, new);
        transport.unlock(window, image)?;
        r
    })();
    report_value(rt, stat, eval)
}

/// `atomic_op`: fetch-and-{add,and,or,xor}, returning the pre-op value
/// (spec.md §4.G treats this identically to `atomic_fetch_op` other than
/// discarding the result at the call site, which is left to the caller).
pub fn atomic_op(
    rt: &Runtime,
    token: Token,
    offset: i64,
    image: ImageId,
    operand: i64,
    intent: AtomicIntent,
    stat: Stat<'_>,
) -> CoreResult<i64> {
    atomic_fetch_and_op_raw(rt, token, offset, image, operand, intent.into_transport_op(), stat)
}

fn atomic_fetch_and_op_raw(
    rt: &Runtime,
    token: Token,
    offset: i64,
    image: ImageId,
    operand: i64,
    op: AtomicOp,
    stat: Stat<'_>,
) -> CoreResult<i64> {
    let eval = (|| {
        let (window, _) = rt.tokens().lookup_master(token)?;
        let size = rt.tokens().master_slot_count(token)?;
        let off = byte_offset(size, offset)?;
        let transport = rt.transport().as_ref();
        let mode = if op == AtomicOp::NoOp { LockMode::Shared } else { LockMode::Exclusive };
        transport.lock(window, image, mode)?;
        let r = transport.fetch_and_op(window, image, off, operand, op);
        transport.unlock(window, image)?;
        r
    })();
    report_value(rt, stat, eval)
}

fn report_value(rt: &Runtime, mut stat: Stat<'_>, eval: CoreResult<i64>) -> CoreResult<i64> {
    match &eval {
        Ok(_) => stat.record(&Ok(())),
        Err(e) => stat.record(&Err(e.clone())),
    }
    if let Err(ref err) = eval {
        if !stat.has_stat() && err.kind.is_fatal_unhandled() {
            let _ = rt.report(Stat::none(), Err(err.clone()));
        }
    }
    eval
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_maps_to_transport_op() {
        assert_eq!(AtomicIntent::Add.into_transport_op(), AtomicOp::Sum);
        assert_eq!(AtomicIntent::Xor.into_transport_op(), AtomicOp::BitXor);
    }
}
