//! Collective subroutines (component H): `co_sum`/`co_min`/`co_max` as
//! thin wrappers over `co_reduce`, plus `co_broadcast` (spec.md §4.H).
//!
//! Every collective here is a full-world operation — the transport trait
//! has no sub-team concept, matching spec.md's scope (image sets are
//! scoped to `sync_images`/`lock`/`event`, never to a collective).

use crate::descriptor::{Descriptor, ElementType};
use crate::error::{CoreError, CoreResult, ErrorKind, Stat};
use crate::runtime::Runtime;
use crate::transport::{ImageId, ReduceOp};

/// User-defined reduction operator, adapted to the transport's opaque
/// registration-id scheme via `by_value`/`by_reference` (spec.md §4.H):
/// the transport is the one place that actually invokes the operator
/// (typically by shipping a function pointer/id across the collective
/// library's own registration call), this crate only carries the id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserOperator {
    ByValue(u32),
    ByReference(u32),
}

impl UserOperator {
    fn registration_id(self) -> u32 {
        match self {
            UserOperator::ByValue(id) | UserOperator::ByReference(id) => id,
        }
    }
}

fn validate_reduce_section(desc: &Descriptor) -> CoreResult<()> {
    if desc.element_type == ElementType::Character {
        return Err(CoreError::new(
            ErrorKind::TypeConversionUnsupported,
            "character arrays are not supported by the reduction collectives",
        ));
    }
    if desc.element_type == ElementType::Derived {
        return Err(CoreError::new(
            ErrorKind::TypeConversionUnsupported,
            "derived-type reduction requires a user-defined operator",
        ));
    }
    Ok(())
}

/// `result_image = None` means every image receives the reduced value
/// (an all-reduce); `Some(image)` restricts the valid result to that one
/// image, per spec.md §4.H.
pub fn co_reduce(
    rt: &Runtime,
    buf: &mut [u8],
    desc: &Descriptor,
    op: ReduceOp,
    result_image: Option<ImageId>,
    stat: Stat<'_>,
) -> CoreResult<()> {
    let result = (|| {
        if !matches!(op, ReduceOp::UserDefined(_)) {
            validate_reduce_section(desc)?;
        }
        rt.transport()
            .collective_reduce(buf, desc.element_type, desc.element_kind, op, result_image.unwrap_or(0))
    })();
    rt.report(stat, result)
}

pub fn co_sum(rt: &Runtime, buf: &mut [u8], desc: &Descriptor, result_image: Option<ImageId>, stat: Stat<'_>) -> CoreResult<()> {
    co_reduce(rt, buf, desc, ReduceOp::Sum, result_image, stat)
}

pub fn co_min(rt: &Runtime, buf: &mut [u8], desc: &Descriptor, result_image: Option<ImageId>, stat: Stat<'_>) -> CoreResult<()> {
    co_reduce(rt, buf, desc, ReduceOp::Min, result_image, stat)
}

pub fn co_max(rt: &Runtime, buf: &mut [u8], desc: &Descriptor, result_image: Option<ImageId>, stat: Stat<'_>) -> CoreResult<()> {
    co_reduce(rt, buf, desc, ReduceOp::Max, result_image, stat)
}

/// A user-defined reduction: dispatches with `ReduceOp::UserDefined`, so
/// the type restrictions in [`validate_reduce_section`] (no Character, no
/// bare Derived) do not apply — the caller's operator is responsible for
/// the element's semantics.
pub fn co_reduce_user(
    rt: &Runtime,
    buf: &mut [u8],
    desc: &Descriptor,
    operator: UserOperator,
    result_image: Option<ImageId>,
    stat: Stat<'_>,
) -> CoreResult<()> {
    co_reduce(rt, buf, desc, ReduceOp::UserDefined(operator.registration_id()), result_image, stat)
}

/// `co_broadcast`: `source_image` sends, every other image overwrites its
/// local copy. Character scalars broadcast their length before the
/// payload so a differently-sized receive buffer can be resized first;
/// character arrays are rejected, matching spec.md §4.H's note that
/// `co_broadcast` of a `Character` array is unsupported.
pub fn co_broadcast(rt: &Runtime, buf: &mut [u8], desc: &Descriptor, source_image: ImageId, stat: Stat<'_>) -> CoreResult<()> {
    let result = (|| {
        if desc.element_type == ElementType::Character && desc.rank() > 0 {
            return Err(CoreError::new(
                ErrorKind::TypeConversionUnsupported,
                "co_broadcast does not support character arrays",
            ));
        }
        rt.transport().collective_broadcast(buf, source_image)
    })();
    rt.report(stat, result)
}

/// Broadcasts a `Character` scalar whose byte length may legitimately
/// differ between images: the source's length travels as a 4-element
/// header broadcast first, then the payload is (re)sized to match before
/// the actual broadcast (spec.md §4.H).
pub fn co_broadcast_character_scalar(
    rt: &Runtime,
    buf: &mut Vec<u8>,
    source_image: ImageId,
    stat: Stat<'_>,
) -> CoreResult<()> {
    let result = (|| {
        let transport = rt.transport().as_ref();
        let mut len_bytes = (buf.len() as u32).to_le_bytes();
        transport.collective_broadcast(&mut len_bytes, source_image)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if rt.this_image() != source_image {
            buf.resize(len, b' ');
        }
        transport.collective_broadcast(buf, source_image)
    })();
    rt.report(stat, result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn character_arrays_rejected_for_reduce() {
        let desc = Descriptor::new(
            1,
            ElementType::Character,
            1,
            &[crate::descriptor::Dim::unit(1, 4)],
        )
        .unwrap();
        assert!(validate_reduce_section(&desc).is_err());
    }

    #[test]
    fn derived_types_rejected_for_reduce() {
        let desc = Descriptor::scalar(16, ElementType::Derived, 0);
        assert!(validate_reduce_section(&desc).is_err());
    }

    #[test]
    fn integer_scalars_pass_validation() {
        let desc = Descriptor::scalar(4, ElementType::Integer, 4);
        assert!(validate_reduce_section(&desc).is_ok());
    }
}
