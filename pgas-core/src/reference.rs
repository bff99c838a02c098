//! Reference-chain walker (component E): `get_by_ref` / `is_present`
//! traversal of arbitrarily nested component and array references across
//! images, with dynamic reallocation of the destination.

use crate::descriptor::{unravel, Descriptor, Dim, ElementType};
use crate::error::{CoreError, CoreResult, ErrorKind, Stat};
use crate::runtime::Runtime;
use crate::token::Token;
use crate::transfer::convert_element;
use crate::transport::{DynAddr, ImageId, LockMode, WindowId};

/// One component (field) access: `{ offset, token_offset, item_size }`
/// (spec.md §4.E). `token_offset > 0` marks an allocatable/pointer
/// component whose current value must be dereferenced before the chain
/// continues.
#[derive(Clone, Debug)]
pub struct ComponentRef {
    pub offset: i64,
    pub token_offset: i64,
    pub item_size: usize,
}

/// A single underlying dimension's subscript. `Single` drops the
/// dimension from the destination's rank; every other variant keeps one.
#[derive(Clone, Debug)]
pub enum DimSelect {
    Single(i64),
    Range { lower: i64, upper: i64, stride: i64 },
    OpenStart { upper: i64, stride: i64 },
    OpenEnd { lower: i64, stride: i64 },
    Full,
    Vector(VectorIndices),
}

/// Vector-subscript payload. Modeled as an enum over the only integer
/// kinds a front end may legally supply, rather than a runtime kind tag:
/// a kind outside this set is simply not constructible, which is the
/// idiomatic-Rust way to retire spec.md §4.E's "vector index of
/// unsupported integer kind" runtime check.
#[derive(Clone, Debug)]
pub enum VectorIndices {
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl VectorIndices {
    fn as_i64(&self) -> Vec<i64> {
        match self {
            VectorIndices::I8(v) => v.iter().map(|x| *x as i64).collect(),
            VectorIndices::I16(v) => v.iter().map(|x| *x as i64).collect(),
            VectorIndices::I32(v) => v.iter().map(|x| *x as i64).collect(),
            VectorIndices::I64(v) => v.clone(),
        }
    }
}

/// One array reference node. `static_dims`, when present, makes this a
/// "static array reference" (bounds/strides come from the node itself);
/// otherwise the walker fetches the owning image's descriptor on demand.
#[derive(Clone, Debug)]
pub struct ArrayRef {
    pub selects: Vec<DimSelect>,
    pub item_size: usize,
    pub static_dims: Option<Vec<Dim>>,
}

#[derive(Clone, Debug)]
pub enum RefNode {
    Component(ComponentRef),
    Array(ArrayRef),
}

pub type ReferenceChain = Vec<RefNode>;

/// The compiler-front-end-owned destination: may start null (and get
/// allocated by the walker) or be a fixed, already-shaped buffer.
pub struct Destination {
    pub data: Option<Vec<u8>>,
    pub descriptor: Option<Descriptor>,
    pub reallocatable: bool,
}

impl Destination {
    pub fn null(reallocatable: bool) -> Self {
        Destination { data: None, descriptor: None, reallocatable }
    }

    pub fn fixed(data: Vec<u8>, descriptor: Descriptor) -> Self {
        Destination { data: Some(data), descriptor: Some(descriptor), reallocatable: false }
    }
}

/// One non-`Single` axis of the array ref actually being walked, with
/// enough information to compute the element-stride byte offset for any
/// position along it.
enum Axis {
    Affine { start: i64, stride: i64, count: i64 },
    Vector { indices: Vec<i64> },
}

impl Axis {
    fn count(&self) -> i64 {
        match self {
            Axis::Affine { count, .. } => *count,
            Axis::Vector { indices } => indices.len() as i64,
        }
    }

    fn position(&self, i: i64) -> i64 {
        match self {
            Axis::Affine { start, stride, .. } => start + i * stride,
            Axis::Vector { indices } => indices[i as usize],
        }
    }
}

struct ResolvedArray {
    /// Offset, in elements along the underlying flat addressing, fixed by
    /// every `Single` subscript.
    fixed_offset: i64,
    axes: Vec<Axis>,
    /// Element stride (in elements) of each underlying dimension,
    /// parallel to `selects`/`static_dims` (needed to convert an axis
    /// position into an element offset).
    underlying_strides: Vec<i64>,
    axis_dim_index: Vec<usize>,
}

fn resolve_array(selects: &[DimSelect], underlying: &[Dim]) -> CoreResult<ResolvedArray> {
    if selects.len() != underlying.len() {
        return Err(CoreError::new(ErrorKind::RankOutOfRange, "subscript count does not match reference rank"));
    }
    let mut fixed_offset = 0i64;
    let mut axes = Vec::new();
    let mut axis_dim_index = Vec::new();
    for (dim_idx, (sel, dim)) in selects.iter().zip(underlying.iter()).enumerate() {
        match sel {
            DimSelect::Single(i) => fixed_offset += (i - dim.lower) * dim.stride,
            DimSelect::Range { lower, upper, stride } => {
                let count = Dim { lower: *lower, upper: *upper, stride: *stride }.extent();
                axes.push(Axis::Affine { start: lower - dim.lower, stride: *stride, count });
                axis_dim_index.push(dim_idx);
            }
            DimSelect::OpenStart { upper, stride } => {
                let count = Dim { lower: dim.lower, upper: *upper, stride: *stride }.extent();
                axes.push(Axis::Affine { start: 0, stride: *stride, count });
                axis_dim_index.push(dim_idx);
            }
            DimSelect::OpenEnd { lower, stride } => {
                let count = Dim { lower: *lower, upper: dim.upper, stride: *stride }.extent();
                axes.push(Axis::Affine { start: lower - dim.lower, stride: *stride, count });
                axis_dim_index.push(dim_idx);
            }
            DimSelect::Full => {
                // Not `dim.extent()`: that formula treats `stride` as a
                // subscript step, but an underlying array's dim is already
                // resolved, so its count is `Dim::count()`'s plain bound
                // span, not a stride division.
                axes.push(Axis::Affine { start: 0, stride: 1, count: dim.count() });
                axis_dim_index.push(dim_idx);
            }
            DimSelect::Vector(v) => {
                let indices: Vec<i64> = v.as_i64().iter().map(|i| i - dim.lower).collect();
                axes.push(Axis::Vector { indices });
                axis_dim_index.push(dim_idx);
            }
        }
    }
    let underlying_strides = underlying.iter().map(|d| d.stride).collect();
    Ok(ResolvedArray { fixed_offset, axes, underlying_strides, axis_dim_index })
}

impl ResolvedArray {
    fn extents(&self) -> Vec<i64> {
        self.axes.iter().map(|a| a.count().max(0)).collect()
    }

    fn element_offset(&self, idx: &[i64]) -> i64 {
        let mut off = self.fixed_offset;
        for (axis, i) in self.axes.iter().zip(idx.iter()) {
            off += axis.position(*i);
        }
        off
    }

    /// Converts per-axis element offsets into a byte offset using each
    /// underlying dimension's own stride (element units).
    fn byte_offset(&self, idx: &[i64], item_size: usize) -> i64 {
        let mut off = 0i64;
        for ((axis, i), dim_idx) in self.axes.iter().zip(idx.iter()).zip(self.axis_dim_index.iter()) {
            off += axis.position(*i) * self.underlying_strides[*dim_idx];
        }
        off += self.fixed_offset_byte();
        off * item_size as i64
    }

    fn fixed_offset_byte(&self) -> i64 {
        // fixed_offset already accumulated in the underlying dims' own
        // stride units when it was built, so it is already an element
        // offset expressed in the flat addressing scheme.
        self.fixed_offset
    }
}

enum AddressSpace {
    Window(WindowId),
    Dynamic(DynAddr),
}

struct PlanOutcome {
    space: AddressSpace,
    image: ImageId,
    base_offset: i64,
    item_size: usize,
    element_type: ElementType,
    element_kind: u8,
    /// `None` when the chain never touched a non-scalar array reference
    /// (a pure scalar component path).
    resolved: Option<ResolvedArray>,
    present: bool,
}

/// Pass 1: walk the chain once, following component pointers, fetching
/// remote descriptors as needed, and locating the final element's
/// address space without transferring anything (spec.md §4.E).
fn plan(rt: &Runtime, root: Token, root_image: ImageId, chain: &[RefNode]) -> CoreResult<PlanOutcome> {
    let (root_window, root_desc) = rt.tokens().lookup_master(root)?;
    let mut space = AddressSpace::Window(root_window);
    let mut image = root_image;
    let mut offset = 0i64;
    let mut item_size = root_desc.as_ref().map(|d| d.element_byte_size).unwrap_or(0);
    let mut element_type = root_desc.as_ref().map(|d| d.element_type).unwrap_or(ElementType::Derived);
    let mut element_kind = root_desc.as_ref().map(|d| d.element_kind).unwrap_or(0);
    let mut resolved: Option<ResolvedArray> = None;
    let mut present = true;

    for node in chain {
        match node {
            RefNode::Component(c) => {
                offset += c.offset;
                item_size = c.item_size;
                if c.token_offset > 0 {
                    let mut ptr = [0u8; 8];
                    read_raw(rt, &space, image, offset as usize, &mut ptr)?;
                    let raw = u64::from_le_bytes(ptr);
                    if raw == 0 {
                        present = false;
                        break;
                    }
                    space = AddressSpace::Dynamic(DynAddr(raw));
                    offset = 0;
                }
            }
            RefNode::Array(a) => {
                if resolved.is_some() {
                    return Err(CoreError::new(
                        ErrorKind::DoubleArrayReference,
                        "two or more array parts in one reference chain",
                    ));
                }
                item_size = a.item_size;
                let underlying = if let Some(dims) = &a.static_dims {
                    dims.clone()
                } else {
                    let mut wire = vec![0u8; crate::descriptor::wire_max_len()];
                    read_raw(rt, &space, image, offset as usize, &mut wire)?;
                    let remote = Descriptor::from_wire(&wire)?;
                    element_type = remote.element_type;
                    element_kind = remote.element_kind;
                    item_size = remote.element_byte_size;
                    offset += remote.base_addr;
                    remote.dims().to_vec()
                };
                resolved = Some(resolve_array(&a.selects, &underlying)?);
            }
        }
    }

    Ok(PlanOutcome { space, image, base_offset: offset, item_size, element_type, element_kind, resolved, present })
}

fn read_raw(rt: &Runtime, space: &AddressSpace, image: ImageId, offset: usize, buf: &mut [u8]) -> CoreResult<()> {
    let transport = rt.transport().as_ref();
    match space {
        AddressSpace::Window(window) => {
            transport.lock(*window, image, LockMode::Shared)?;
            let result = transport.get(*window, image, offset, buf);
            transport.unlock(*window, image)?;
            result
        }
        AddressSpace::Dynamic(addr) => transport.get_dynamic(image, *addr, offset, buf),
    }
}

/// `is_present`: pass 1 only, reporting whether the final dereferenced
/// pointer is non-null (spec.md §4.E).
pub fn is_present(rt: &Runtime, root: Token, root_image: ImageId, chain: &[RefNode]) -> CoreResult<bool> {
    Ok(plan(rt, root, root_image, chain)?.present)
}

/// `get_by_ref`: full two-pass traversal, reallocating `dest` if it
/// starts null and the destination is reallocatable (spec.md §4.E).
pub fn get_by_ref(
    rt: &Runtime,
    root: Token,
    root_image: ImageId,
    chain: &[RefNode],
    dest: &mut Destination,
    stat: Stat<'_>,
) -> CoreResult<()> {
    let result = (|| {
        let outcome = plan(rt, root, root_image, chain)?;
        if !outcome.present {
            return Err(CoreError::new(ErrorKind::InvalidReference, "referenced component pointer is null"));
        }

        let (extents, count) = match &outcome.resolved {
            Some(r) => {
                let extents = r.extents();
                let count = extents.iter().map(|e| (*e).max(0) as usize).product::<usize>();
                (extents, count)
            }
            None => (Vec::new(), 1usize),
        };
        if count == 0 {
            return Ok(());
        }

        let src_desc = Descriptor::scalar(outcome.item_size, outcome.element_type, outcome.element_kind);
        let needed_dest_desc = compact_dest_descriptor(&extents, outcome.item_size, outcome.element_type, outcome.element_kind);

        match (&dest.data, dest.reallocatable) {
            (None, true) => {
                dest.data = Some(vec![0u8; count * needed_dest_desc.element_byte_size]);
                dest.descriptor = Some(needed_dest_desc.clone());
            }
            (None, false) => {
                return Err(CoreError::new(
                    ErrorKind::NonReallocatableExtentMismatch,
                    "destination is null and not reallocatable",
                ));
            }
            (Some(_), _) => {
                let have = dest.descriptor.as_ref().map(|d| d.element_count()).unwrap_or(0);
                if have != count {
                    if dest.reallocatable {
                        dest.data = Some(vec![0u8; count * needed_dest_desc.element_byte_size]);
                        dest.descriptor = Some(needed_dest_desc.clone());
                    } else {
                        return Err(CoreError::new(
                            ErrorKind::NonReallocatableExtentMismatch,
                            "destination extent does not match the referenced section",
                        ));
                    }
                }
            }
        }

        let dest_desc = dest.descriptor.clone().expect("destination descriptor set above");
        let data = dest.data.as_mut().expect("destination data set above");
        copy_out(rt, &outcome, &extents, count, data, &dest_desc, &src_desc)
    })();
    rt.report(stat, result)
}

fn compact_dest_descriptor(extents: &[i64], item_size: usize, ty: ElementType, kind: u8) -> Descriptor {
    let mut stride = 1i64;
    let mut dims = Vec::with_capacity(extents.len());
    for e in extents {
        dims.push(Dim { lower: 1, upper: (*e).max(0), stride });
        stride *= (*e).max(1);
    }
    Descriptor::new(item_size, ty, kind, &dims).expect("extents always fit MAX_RANK")
}

fn copy_out(
    rt: &Runtime,
    outcome: &PlanOutcome,
    extents: &[i64],
    count: usize,
    dest_data: &mut [u8],
    dest_desc: &Descriptor,
    src_desc: &Descriptor,
) -> CoreResult<()> {
    let transport = rt.transport().as_ref();
    let lock_window = match outcome.space {
        AddressSpace::Window(w) => Some(w),
        AddressSpace::Dynamic(_) => None,
    };
    if let Some(w) = lock_window {
        transport.lock(w, outcome.image, LockMode::Shared)?;
    }
    let result = (|| {
        for linear in 0..count {
            let dest_idx = unravel(linear, extents);
            let dest_off = dest_desc.byte_offset(&dest_idx) as usize;
            let src_byte_off = match &outcome.resolved {
                Some(r) => outcome.base_offset + r.byte_offset(&dest_idx, outcome.item_size),
                None => outcome.base_offset,
            } as usize;

            let mut elem = vec![0u8; outcome.item_size];
            match outcome.space {
                AddressSpace::Window(w) => transport.get(w, outcome.image, src_byte_off, &mut elem)?,
                AddressSpace::Dynamic(addr) => {
                    transport.get_dynamic(outcome.image, addr, src_byte_off, &mut elem)?
                }
            }
            convert_element(&elem, src_desc, &mut dest_data[dest_off..dest_off + dest_desc.element_byte_size], dest_desc)?;
        }
        Ok(())
    })();
    if let Some(w) = lock_window {
        transport.unlock(w, outcome.image)?;
    }
    result
}

/// Stubbed per spec.md §9 open question (b): write-back through a
/// reference chain onto allocatable components is not yet implemented in
/// the source this runtime is ported from.
pub fn send_by_ref(
    rt: &Runtime,
    _root: Token,
    _root_image: ImageId,
    _chain: &[RefNode],
    _src: &[u8],
    _src_desc: &Descriptor,
    stat: Stat<'_>,
) -> CoreResult<()> {
    rt.report(
        stat,
        Err(CoreError::new(ErrorKind::Unsupported, "send_by_ref: allocatable-component write-back is not yet implemented")),
    )
}

pub fn sendget_by_ref(
    rt: &Runtime,
    _dest_root: Token,
    _dest_image: ImageId,
    _dest_chain: &[RefNode],
    _src_root: Token,
    _src_image: ImageId,
    _src_chain: &[RefNode],
    stat: Stat<'_>,
) -> CoreResult<()> {
    rt.report(
        stat,
        Err(CoreError::new(ErrorKind::Unsupported, "sendget_by_ref: allocatable-component write-back is not yet implemented")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_full_range_matches_descriptor_extent() {
        let underlying = vec![Dim::unit(1, 4), Dim { lower: 1, upper: 4, stride: 4 }];
        let selects = vec![DimSelect::Full, DimSelect::Full];
        let r = resolve_array(&selects, &underlying).unwrap();
        assert_eq!(r.extents(), vec![4, 4]);
    }

    #[test]
    fn resolve_single_drops_dimension() {
        let underlying = vec![Dim::unit(1, 4), Dim { lower: 1, upper: 4, stride: 4 }];
        let selects = vec![DimSelect::Single(2), DimSelect::Full];
        let r = resolve_array(&selects, &underlying).unwrap();
        assert_eq!(r.extents(), vec![4]);
    }

    #[test]
    fn resolve_strided_section_counts_every_other_element() {
        let underlying = vec![Dim::unit(1, 4), Dim { lower: 1, upper: 4, stride: 4 }];
        let selects = vec![
            DimSelect::Range { lower: 1, upper: 4, stride: 2 },
            DimSelect::Range { lower: 1, upper: 4, stride: 2 },
        ];
        let r = resolve_array(&selects, &underlying).unwrap();
        assert_eq!(r.extents(), vec![2, 2]);
    }
}
