//! Multi-dimensional array shape metadata (component A of the core).
//!
//! A [`Descriptor`] is a pure data record: rank, per-dimension bounds and
//! stride, and element byte size/type/kind. The transfer engine and
//! reference walker are the only consumers; this module just owns the
//! shape math and the wire format used to ship a descriptor to a remote
//! image (`Descriptor::to_wire` / `from_wire`).

use crate::error::{CoreError, ErrorKind};

/// Upper bound on supported array rank, sized for the on-stack "remote
/// descriptor image" the reference walker fabricates when it fetches a
/// descriptor from a peer (spec §4.A).
pub const MAX_RANK: usize = 15;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementType {
    Integer,
    Real,
    Complex,
    Logical,
    Character,
    Derived,
}

impl ElementType {
    fn wire_tag(self) -> u8 {
        match self {
            ElementType::Integer => 0,
            ElementType::Real => 1,
            ElementType::Complex => 2,
            ElementType::Logical => 3,
            ElementType::Character => 4,
            ElementType::Derived => 5,
        }
    }

    fn from_wire_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => ElementType::Integer,
            1 => ElementType::Real,
            2 => ElementType::Complex,
            3 => ElementType::Logical,
            4 => ElementType::Character,
            5 => ElementType::Derived,
            _ => return None,
        })
    }
}

/// One dimension's lower bound, upper bound, and stride (element units,
/// not bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dim {
    pub lower: i64,
    pub upper: i64,
    pub stride: i64,
}

impl Dim {
    pub fn unit(lower: i64, upper: i64) -> Self {
        Dim { lower, upper, stride: 1 }
    }

    /// Element count along this dimension, per spec §4.E's planning pass
    /// formula: `num = (stride>0 ? ub+1-lb : lb+1-ub); num = 1 + (num-1)/|stride|`.
    /// For interpreting a raw Fortran subscript triplet `lb:ub:step` (the
    /// reference walker's `DimSelect::Range`/`OpenStart`/`OpenEnd`, which
    /// build a `Dim` straight from such a triplet) — not for a dim already
    /// carrying resolved bounds, see [`Dim::count`].
    pub fn extent(&self) -> i64 {
        if self.stride == 0 {
            return if self.upper >= self.lower { self.upper - self.lower + 1 } else { 0 };
        }
        let num = if self.stride > 0 {
            self.upper + 1 - self.lower
        } else {
            self.lower + 1 - self.upper
        };
        if num <= 0 {
            0
        } else {
            1 + (num - 1) / self.stride.abs()
        }
    }

    /// Element count along this dimension per spec §4.D.1: `max(0, ub -
    /// lb + 1)`. Every `Dim` the transfer engine and `Descriptor` itself
    /// deal with is already resolved — bounds directly span the dimension
    /// (`stride` is purely the memory-addressing multiplier `byte_offset`
    /// needs, not a subscript step), so counting is bound subtraction, not
    /// a stride division.
    pub fn count(&self) -> i64 {
        (self.upper - self.lower + 1).max(0)
    }
}

/// Shape and layout metadata for one array (or array section).
///
/// `base_addr` is an opaque offset tag meaningful only to the caller that
/// produced this descriptor (the token's window offset at which element
/// `(lower0, lower1, ...)` lives); this crate never dereferences it
/// directly, it only feeds it into [`crate::transfer`] byte-offset math.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Descriptor {
    pub base_addr: i64,
    pub element_byte_size: usize,
    pub element_type: ElementType,
    pub element_kind: u8,
    rank: usize,
    dims: [Dim; MAX_RANK],
}

impl Descriptor {
    pub fn scalar(element_byte_size: usize, element_type: ElementType, element_kind: u8) -> Self {
        Descriptor {
            base_addr: 0,
            element_byte_size,
            element_type,
            element_kind,
            rank: 0,
            dims: [Dim::unit(1, 1); MAX_RANK],
        }
    }

    pub fn new(
        element_byte_size: usize,
        element_type: ElementType,
        element_kind: u8,
        dims: &[Dim],
    ) -> Result<Self, CoreError> {
        if dims.len() > MAX_RANK {
            return Err(CoreError::new(
                ErrorKind::RankOutOfRange,
                format!("rank {} exceeds MAX_RANK {}", dims.len(), MAX_RANK),
            ));
        }
        let mut stored = [Dim::unit(1, 1); MAX_RANK];
        stored[..dims.len()].copy_from_slice(dims);
        Ok(Descriptor {
            base_addr: 0,
            element_byte_size,
            element_type,
            element_kind,
            rank: dims.len(),
            dims: stored,
        })
    }

    pub fn with_base_addr(mut self, base_addr: i64) -> Self {
        self.base_addr = base_addr;
        self
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn dims(&self) -> &[Dim] {
        &self.dims[..self.rank]
    }

    pub fn set_dims(&mut self, dims: &[Dim]) -> Result<(), CoreError> {
        if dims.len() > MAX_RANK {
            return Err(CoreError::new(ErrorKind::RankOutOfRange, "rank exceeds MAX_RANK"));
        }
        self.dims[..dims.len()].copy_from_slice(dims);
        self.rank = dims.len();
        Ok(())
    }

    /// Total element count: product of `max(0, ub - lb + 1)` over every
    /// dimension (spec §4.D.1). Rank 0 is a scalar, count 1.
    pub fn element_count(&self) -> usize {
        self.dims()
            .iter()
            .map(|d| d.count() as usize)
            .product::<usize>()
            .max(if self.rank == 0 { 1 } else { 0 })
    }

    /// True for rank 0 or for an array section whose strides imply a
    /// single run of bytes with no gaps (column-major: dim 0 varies
    /// fastest, `stride[i] == stride[i-1] * count(i-1)`, all unit base
    /// stride on dim 0).
    pub fn is_contiguous(&self) -> bool {
        if self.rank == 0 {
            return true;
        }
        let dims = self.dims();
        if dims[0].stride != 1 {
            return false;
        }
        let mut running = dims[0].count();
        for d in &dims[1..] {
            if d.stride != running {
                return false;
            }
            running *= d.count();
        }
        true
    }

    /// Byte offset (relative to `base_addr`) of element with multi-index
    /// `idx` (per-dimension 0-based position along the section, not the
    /// original lower-bound-relative subscript): `Σ idx_j * stride_j *
    /// element_byte_size`.
    pub fn byte_offset(&self, idx: &[i64]) -> i64 {
        debug_assert_eq!(idx.len(), self.rank);
        idx.iter()
            .zip(self.dims())
            .map(|(i, d)| i * d.stride * self.element_byte_size as i64)
            .sum()
    }

    /// Fixed header + `rank` dim triples, for shipping a descriptor to a
    /// remote image (reference walker's descriptor fetch, spec §4.A/§4.E).
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.rank * DIM_LEN);
        out.extend_from_slice(&self.base_addr.to_le_bytes());
        out.extend_from_slice(&(self.element_byte_size as u64).to_le_bytes());
        out.push(self.element_type.wire_tag());
        out.push(self.element_kind);
        out.extend_from_slice(&(self.rank as u16).to_le_bytes());
        for d in self.dims() {
            out.extend_from_slice(&d.lower.to_le_bytes());
            out.extend_from_slice(&d.upper.to_le_bytes());
            out.extend_from_slice(&d.stride.to_le_bytes());
        }
        out
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self, CoreError> {
        if bytes.len() < HEADER_LEN {
            return Err(CoreError::new(ErrorKind::TransportError, "descriptor wire buffer too short"));
        }
        let base_addr = i64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let element_byte_size = u64::from_le_bytes(bytes[8..16].try_into().unwrap()) as usize;
        let element_type = ElementType::from_wire_tag(bytes[16])
            .ok_or_else(|| CoreError::new(ErrorKind::InvalidReference, "unknown element type tag"))?;
        let element_kind = bytes[17];
        let rank = u16::from_le_bytes(bytes[18..20].try_into().unwrap()) as usize;
        if rank > MAX_RANK {
            return Err(CoreError::new(ErrorKind::RankOutOfRange, "decoded rank exceeds MAX_RANK"));
        }
        let need = HEADER_LEN + rank * DIM_LEN;
        if bytes.len() < need {
            return Err(CoreError::new(ErrorKind::TransportError, "descriptor wire buffer truncated"));
        }
        let mut dims = [Dim::unit(1, 1); MAX_RANK];
        let mut cur = HEADER_LEN;
        for d in dims.iter_mut().take(rank) {
            let lower = i64::from_le_bytes(bytes[cur..cur + 8].try_into().unwrap());
            let upper = i64::from_le_bytes(bytes[cur + 8..cur + 16].try_into().unwrap());
            let stride = i64::from_le_bytes(bytes[cur + 16..cur + 24].try_into().unwrap());
            *d = Dim { lower, upper, stride };
            cur += DIM_LEN;
        }
        Ok(Descriptor { base_addr, element_byte_size, element_type, element_kind, rank, dims })
    }
}

const HEADER_LEN: usize = 8 + 8 + 1 + 1 + 2;
const DIM_LEN: usize = 8 + 8 + 8;

/// Capacity of the on-stack "remote descriptor image" the reference
/// walker fabricates before it knows the remote descriptor's actual rank
/// (spec.md §4.A/§4.E).
pub fn wire_max_len() -> usize {
    HEADER_LEN + MAX_RANK * DIM_LEN
}

/// Row-major unravel of a linear element index into per-dimension
/// 0-based positions, the algorithmic core shared by the strided
/// transfer path and the collective per-element path (design note §9):
/// `idx_j = (i / Π_{k<j} extent_k) mod extent_j`.
pub fn unravel(mut linear: usize, extents: &[i64]) -> Vec<i64> {
    let mut out = vec![0i64; extents.len()];
    for (j, extent) in extents.iter().enumerate() {
        let extent = (*extent).max(1) as usize;
        out[j] = (linear % extent) as i64;
        linear /= extent;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extent_matches_unit_stride() {
        let d = Dim::unit(1, 10);
        assert_eq!(d.extent(), 10);
    }

    #[test]
    fn extent_handles_stride_two() {
        let d = Dim { lower: 1, upper: 9, stride: 2 };
        assert_eq!(d.extent(), 5);
    }

    #[test]
    fn extent_negative_stride() {
        let d = Dim { lower: 1, upper: 9, stride: -2 };
        assert_eq!(d.extent(), 5);
    }

    #[test]
    fn empty_section_is_zero_count() {
        let d = Dim::unit(10, 1);
        assert_eq!(d.extent(), 0);
    }

    #[test]
    fn contiguous_1d() {
        let d = Descriptor::new(4, ElementType::Integer, 4, &[Dim::unit(1, 10)]).unwrap();
        assert!(d.is_contiguous());
        assert_eq!(d.element_count(), 10);
    }

    #[test]
    fn strided_4x4_section_is_not_contiguous() {
        // a resolved 2x2 section of a natural 4x4 array with memory
        // strides (1, 4): every other row and every other column, so each
        // dim spans 2 resolved positions (bounds already give the count)
        // at memory strides (2, 8).
        let d = Descriptor::new(
            4,
            ElementType::Integer,
            4,
            &[Dim { lower: 1, upper: 2, stride: 2 }, Dim { lower: 1, upper: 2, stride: 8 }],
        )
        .unwrap();
        assert!(!d.is_contiguous());
        assert_eq!(d.element_count(), 4);
    }

    #[test]
    fn natural_4x4_array_counts_sixteen_elements() {
        // a natural (unsectioned) 4x4 array: dim 1's stride is the memory
        // multiplier `byte_offset` needs to skip a whole column, not a
        // subscript step, so `count()` (bound span) rather than `extent()`
        // (stride division) is what must back `element_count`.
        let d = Descriptor::new(
            4,
            ElementType::Integer,
            4,
            &[Dim { lower: 1, upper: 4, stride: 1 }, Dim { lower: 1, upper: 4, stride: 4 }],
        )
        .unwrap();
        assert!(d.is_contiguous());
        assert_eq!(d.element_count(), 16);
    }

    #[test]
    fn wire_round_trip() {
        let d = Descriptor::new(8, ElementType::Real, 8, &[Dim::unit(1, 3), Dim::unit(1, 5)])
            .unwrap()
            .with_base_addr(128);
        let bytes = d.to_wire();
        let back = Descriptor::from_wire(&bytes).unwrap();
        assert_eq!(d, back);
    }

    #[test]
    fn unravel_row_major_round_trip() {
        let extents = [3i64, 4, 2];
        let total: usize = extents.iter().map(|e| *e as usize).product();
        let mut seen = std::collections::HashSet::new();
        for linear in 0..total {
            let idx = unravel(linear, &extents);
            assert!(seen.insert(idx));
        }
        assert_eq!(seen.len(), total);
    }
}
