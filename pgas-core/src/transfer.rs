//! Remote access engine (component D): `send`, `get`, `sendget`,
//! translating array sections into one-sided transfers with element-wise
//! type conversion when kinds differ.

use std::borrow::Cow;

use crate::config::{LockStrategyKind, StridedStrategy};
use crate::descriptor::{unravel, Descriptor, ElementType};
use crate::error::{CoreError, CoreResult, ErrorKind, Stat};
use crate::runtime::Runtime;
use crate::token::Token;
use crate::transport::{ImageId, LockMode, WindowId};

/// Writes `src` (laid out per `src_desc`) into `dest_token`'s window on
/// `image`, at the section described by `dest_desc` (spec.md §4.D).
pub fn send(
    rt: &Runtime,
    dest_token: Token,
    offset: i64,
    image: ImageId,
    dest_desc: &Descriptor,
    src: &[u8],
    src_desc: &Descriptor,
    may_require_temp: bool,
    stat: Stat<'_>,
) -> CoreResult<()> {
    let result = (|| {
        let count = dest_desc.element_count();
        if count == 0 {
            return Ok(());
        }
        if count != src_desc.element_count() {
            return Err(CoreError::new(
                ErrorKind::ExtentOutOfRange,
                "source and destination element counts differ",
            ));
        }
        reject_narrowing_character(dest_desc, src_desc)?;

        let (window, _) = rt.tokens().lookup_master(dest_token)?;
        let local_src: Cow<[u8]> = if may_require_temp && image == rt.this_image() {
            Cow::Owned(src.to_vec())
        } else {
            Cow::Borrowed(src)
        };
        write_section(rt, window, image, offset, dest_desc, &local_src, src_desc)
    })();
    rt.report(stat, result)
}

/// Reads `src_token`'s window on `image`, at the section described by
/// `src_desc`, into `dest` (laid out per `dest_desc`).
pub fn get(
    rt: &Runtime,
    src_token: Token,
    offset: i64,
    image: ImageId,
    dest: &mut [u8],
    dest_desc: &Descriptor,
    src_desc: &Descriptor,
    stat: Stat<'_>,
) -> CoreResult<()> {
    let result = (|| {
        let count = dest_desc.element_count();
        if count == 0 {
            return Ok(());
        }
        if count != src_desc.element_count() {
            return Err(CoreError::new(
                ErrorKind::ExtentOutOfRange,
                "source and destination element counts differ",
            ));
        }
        reject_narrowing_character(dest_desc, src_desc)?;

        let (window, _) = rt.tokens().lookup_master(src_token)?;
        read_section(rt, window, image, offset, dest, dest_desc, src_desc)
    })();
    rt.report(stat, result)
}

/// Get-then-put: reads `src_token`'s section on `src_image` into a
/// compact staging buffer, then writes that buffer into `dest_token`'s
/// section on `dest_image` (spec.md §4.D).
#[allow(clippy::too_many_arguments)]
pub fn sendget(
    rt: &Runtime,
    dest_token: Token,
    dest_offset: i64,
    dest_image: ImageId,
    dest_desc: &Descriptor,
    src_token: Token,
    src_offset: i64,
    src_image: ImageId,
    src_desc: &Descriptor,
    stat: Stat<'_>,
) -> CoreResult<()> {
    let result = (|| {
        let count = dest_desc.element_count();
        if count == 0 {
            return Ok(());
        }
        if count != src_desc.element_count() {
            return Err(CoreError::new(
                ErrorKind::ExtentOutOfRange,
                "source and destination element counts differ",
            ));
        }
        reject_narrowing_character(dest_desc, src_desc)?;

        let staging_desc = compact_descriptor(src_desc);
        let mut staging = vec![0u8; count * src_desc.element_byte_size];
        let (src_window, _) = rt.tokens().lookup_master(src_token)?;
        read_section(rt, src_window, src_image, src_offset, &mut staging, &staging_desc, src_desc)?;

        let (dest_window, _) = rt.tokens().lookup_master(dest_token)?;
        write_section(rt, dest_window, dest_image, dest_offset, dest_desc, &staging, &staging_desc)
    })();
    rt.report(stat, result)
}

fn reject_narrowing_character(dest: &Descriptor, src: &Descriptor) -> CoreResult<()> {
    if dest.element_type == ElementType::Character
        && src.element_type == ElementType::Character
        && dest.element_byte_size < src.element_byte_size
    {
        // Open question (a), spec.md §9: reject rather than silently truncate.
        return Err(CoreError::new(
            ErrorKind::ExtentOutOfRange,
            "character destination shorter than source",
        ));
    }
    Ok(())
}

fn needs_conversion(dest: &Descriptor, src: &Descriptor) -> bool {
    dest.element_type != src.element_type
        || dest.element_kind != src.element_kind
        || (dest.element_type == ElementType::Character
            && dest.element_byte_size != src.element_byte_size)
}

/// Extent of dimension 0 if it is unit-strided (i.e. this run of elements
/// is contiguous in memory); otherwise 1 (design note §9: the
/// "Structured" strategy batches these runs instead of building a real
/// indexed datatype, since the transport trait has no such concept).
fn contiguous_run_len(desc: &Descriptor) -> usize {
    match desc.dims().first() {
        Some(d) if d.stride == 1 => d.count().max(1) as usize,
        _ => 1,
    }
}

/// A fresh, densely packed (unit-stride, column-major) descriptor with
/// the same extents/type/kind as `desc`, used for the staging buffer in
/// `sendget`.
fn compact_descriptor(desc: &Descriptor) -> Descriptor {
    let mut stride = 1i64;
    let mut dims = Vec::with_capacity(desc.rank());
    for d in desc.dims() {
        let extent = d.count().max(0);
        dims.push(crate::descriptor::Dim { lower: 1, upper: extent, stride });
        stride *= extent.max(1);
    }
    Descriptor::new(desc.element_byte_size, desc.element_type, desc.element_kind, &dims)
        .expect("compact descriptor always has a valid rank")
}

fn with_lock<F: FnOnce() -> CoreResult<()>>(
    rt: &Runtime,
    window: WindowId,
    image: ImageId,
    mode: LockMode,
    f: F,
) -> CoreResult<()> {
    let transport = rt.transport().as_ref();
    match rt.config().lock_strategy {
        LockStrategyKind::PerOperation => {
            transport.lock(window, image, mode)?;
            let result = f();
            transport.unlock(window, image)?;
            result
        }
        LockStrategyKind::LockAllFlush => {
            let result = f();
            if rt.config().non_blocking_put && mode == LockMode::Exclusive {
                rt.defer_put(image, window);
            } else {
                transport.flush(window, image)?;
            }
            result
        }
    }
}

/// Writes `src` (laid out per `src_desc`) into `window` on `image` at the
/// section described by `dest_desc`.
fn write_section(
    rt: &Runtime,
    window: WindowId,
    image: ImageId,
    base_offset: i64,
    dest_desc: &Descriptor,
    src: &[u8],
    src_desc: &Descriptor,
) -> CoreResult<()> {
    let transport = rt.transport().as_ref();
    let count = dest_desc.element_count();

    if !needs_conversion(dest_desc, src_desc) && dest_desc.is_contiguous() && src_desc.is_contiguous() {
        let total = count * dest_desc.element_byte_size;
        let off = (base_offset + dest_desc.base_addr) as usize;
        return with_lock(rt, window, image, LockMode::Exclusive, || {
            transport.put(window, image, off, &src[..total])
        });
    }

    let run_len = match rt.config().strided_strategy {
        StridedStrategy::Structured if !needs_conversion(dest_desc, src_desc) => {
            contiguous_run_len(dest_desc).min(contiguous_run_len(src_desc))
        }
        _ => 1,
    };
    let dest_extents: Vec<i64> = dest_desc.dims().iter().map(|d| d.count()).collect();
    let src_extents: Vec<i64> = src_desc.dims().iter().map(|d| d.count()).collect();

    with_lock(rt, window, image, LockMode::Exclusive, || {
        let mut linear = 0usize;
        while linear < count {
            let dest_idx = unravel(linear, &dest_extents);
            let src_idx = unravel(linear, &src_extents);
            let dest_off = (base_offset + dest_desc.base_addr + dest_desc.byte_offset(&dest_idx)) as usize;
            let src_off = src_desc.byte_offset(&src_idx) as usize;
            if run_len > 1 {
                let n = run_len.min(count - linear);
                let bytes = n * dest_desc.element_byte_size;
                transport.put(window, image, dest_off, &src[src_off..src_off + bytes])?;
                linear += n;
            } else {
                let mut elem = vec![0u8; dest_desc.element_byte_size];
                convert_element(
                    &src[src_off..src_off + src_desc.element_byte_size],
                    src_desc,
                    &mut elem,
                    dest_desc,
                )?;
                transport.put(window, image, dest_off, &elem)?;
                linear += 1;
            }
        }
        Ok(())
    })
}

/// Reads `window` on `image` at the section described by `src_desc` into
/// `dest` (laid out per `dest_desc`).
fn read_section(
    rt: &Runtime,
    window: WindowId,
    image: ImageId,
    base_offset: i64,
    dest: &mut [u8],
    dest_desc: &Descriptor,
    src_desc: &Descriptor,
) -> CoreResult<()> {
    let transport = rt.transport().as_ref();
    let count = dest_desc.element_count();

    if !needs_conversion(dest_desc, src_desc) && dest_desc.is_contiguous() && src_desc.is_contiguous() {
        let total = count * dest_desc.element_byte_size;
        let off = (base_offset + src_desc.base_addr) as usize;
        return with_lock(rt, window, image, LockMode::Shared, || {
            transport.get(window, image, off, &mut dest[..total])
        });
    }

    let run_len = match rt.config().strided_strategy {
        StridedStrategy::Structured if !needs_conversion(dest_desc, src_desc) => {
            contiguous_run_len(dest_desc).min(contiguous_run_len(src_desc))
        }
        _ => 1,
    };
    let dest_extents: Vec<i64> = dest_desc.dims().iter().map(|d| d.count()).collect();
    let src_extents: Vec<i64> = src_desc.dims().iter().map(|d| d.count()).collect();

    with_lock(rt, window, image, LockMode::Shared, || {
        let mut linear = 0usize;
        while linear < count {
            let dest_idx = unravel(linear, &dest_extents);
            let src_idx = unravel(linear, &src_extents);
            let dest_off = dest_desc.byte_offset(&dest_idx) as usize;
            let src_off = (base_offset + src_desc.base_addr + src_desc.byte_offset(&src_idx)) as usize;
            if run_len > 1 {
                let n = run_len.min(count - linear);
                let bytes = n * dest_desc.element_byte_size;
                transport.get(window, image, src_off, &mut dest[dest_off..dest_off + bytes])?;
                linear += n;
            } else {
                let mut elem = vec![0u8; src_desc.element_byte_size];
                transport.get(window, image, src_off, &mut elem)?;
                convert_element(&elem, src_desc, &mut dest[dest_off..dest_off + dest_desc.element_byte_size], dest_desc)?;
                linear += 1;
            }
        }
        Ok(())
    })
}

/// Converts one element from `src_desc`'s representation to `dest_desc`'s
/// (spec.md §4.E `copy_data`'s four cases, reused here for the transfer
/// engine's own per-element path).
pub(crate) fn convert_element(
    src: &[u8],
    src_desc: &Descriptor,
    dst: &mut [u8],
    dst_desc: &Descriptor,
) -> CoreResult<()> {
    use ElementType::*;
    match (src_desc.element_type, dst_desc.element_type) {
        (a, b) if a == b && src_desc.element_kind == dst_desc.element_kind && a != Character => {
            dst.copy_from_slice(src);
            Ok(())
        }
        (Character, Character) => {
            convert_character(src, src_desc.element_kind, dst, dst_desc.element_kind)
        }
        (Integer, Integer) => {
            write_int(read_int(src), dst);
            Ok(())
        }
        (Real, Real) => {
            write_real(read_real(src), dst);
            Ok(())
        }
        (Complex, Complex) => convert_complex(src, dst),
        (Logical, Logical) => {
            let n = dst.len().min(src.len());
            dst[..n].copy_from_slice(&src[..n]);
            for b in &mut dst[n..] {
                *b = 0;
            }
            Ok(())
        }
        _ => Err(CoreError::new(
            ErrorKind::TypeConversionUnsupported,
            format!("cannot convert {:?} -> {:?}", src_desc.element_type, dst_desc.element_type),
        )),
    }
}

fn convert_character(src: &[u8], src_kind: u8, dst: &mut [u8], dst_kind: u8) -> CoreResult<()> {
    match (src_kind, dst_kind) {
        (a, b) if a == b => {
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
            pad_spaces(dst, n, src_kind);
            Ok(())
        }
        (1, 4) => {
            let dst_chars = dst.len() / 4;
            for (i, chunk) in dst.chunks_exact_mut(4).enumerate().take(dst_chars) {
                let code = if i < src.len() { src[i] as u32 } else { 0x20 };
                chunk.copy_from_slice(&code.to_le_bytes());
            }
            Ok(())
        }
        (4, 1) => {
            let src_chars = src.len() / 4;
            for (i, slot) in dst.iter_mut().enumerate() {
                *slot = if i < src_chars {
                    let code = u32::from_le_bytes(src[i * 4..i * 4 + 4].try_into().unwrap());
                    if code > 255 {
                        b'?'
                    } else {
                        code as u8
                    }
                } else {
                    0x20
                };
            }
            Ok(())
        }
        _ => Err(CoreError::new(ErrorKind::TypeConversionUnsupported, "unsupported character kind pair")),
    }
}

fn pad_spaces(dst: &mut [u8], from: usize, kind: u8) {
    if kind == 4 {
        let mut i = from;
        while i + 4 <= dst.len() {
            dst[i..i + 4].copy_from_slice(&0x20u32.to_le_bytes());
            i += 4;
        }
    } else {
        for b in &mut dst[from..] {
            *b = 0x20;
        }
    }
}

fn read_int(src: &[u8]) -> i128 {
    match src.len() {
        1 => src[0] as i8 as i128,
        2 => i16::from_le_bytes(src.try_into().unwrap()) as i128,
        4 => i32::from_le_bytes(src.try_into().unwrap()) as i128,
        8 => i64::from_le_bytes(src.try_into().unwrap()) as i128,
        16 => i128::from_le_bytes(src.try_into().unwrap()),
        _ => 0,
    }
}

fn write_int(v: i128, dst: &mut [u8]) {
    match dst.len() {
        1 => dst[0] = v as i8 as u8,
        2 => dst.copy_from_slice(&(v as i16).to_le_bytes()),
        4 => dst.copy_from_slice(&(v as i32).to_le_bytes()),
        8 => dst.copy_from_slice(&(v as i64).to_le_bytes()),
        16 => dst.copy_from_slice(&v.to_le_bytes()),
        _ => {}
    }
}

fn read_real(src: &[u8]) -> f64 {
    match src.len() {
        4 => f32::from_le_bytes(src.try_into().unwrap()) as f64,
        8 => f64::from_le_bytes(src.try_into().unwrap()),
        _ => 0.0,
    }
}

fn write_real(v: f64, dst: &mut [u8]) {
    match dst.len() {
        4 => dst.copy_from_slice(&(v as f32).to_le_bytes()),
        8 => dst.copy_from_slice(&v.to_le_bytes()),
        _ => {}
    }
}

fn convert_complex(src: &[u8], dst: &mut [u8]) -> CoreResult<()> {
    let shalf = src.len() / 2;
    let dhalf = dst.len() / 2;
    let re = read_real(&src[..shalf]);
    let im = read_real(&src[shalf..]);
    write_real(re, &mut dst[..dhalf]);
    write_real(im, &mut dst[dhalf..]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_widen_sign_extends() {
        let src: [u8; 4] = (-5i32).to_le_bytes();
        let mut dst = [0u8; 8];
        write_int(read_int(&src), &mut dst);
        assert_eq!(i64::from_le_bytes(dst), -5);
    }

    #[test]
    fn integer_narrow_truncates() {
        let src: [u8; 8] = (0x1_0000_0007i64).to_le_bytes();
        let mut dst = [0u8; 4];
        write_int(read_int(&src), &mut dst);
        assert_eq!(i32::from_le_bytes(dst), 7);
    }

    #[test]
    fn character_widen_then_narrow_round_trips_ascii() {
        let src = b"hi";
        let mut wide = [0u8; 8];
        convert_character(src, 1, &mut wide, 4).unwrap();
        let mut narrow = [0u8; 2];
        convert_character(&wide, 4, &mut narrow, 1).unwrap();
        assert_eq!(&narrow, src);
    }

    #[test]
    fn character_narrow_replaces_non_ascii_with_question_mark() {
        let src = 0x1F600u32.to_le_bytes();
        let mut dst = [0u8; 1];
        convert_character(&src, 4, &mut dst, 1).unwrap();
        assert_eq!(dst[0], b'?');
    }

    #[test]
    fn compact_descriptor_is_contiguous() {
        let d = Descriptor::new(
            4,
            ElementType::Integer,
            4,
            &[crate::descriptor::Dim { lower: 1, upper: 4, stride: 2 }],
        )
        .unwrap();
        let c = compact_descriptor(&d);
        assert!(c.is_contiguous());
        assert_eq!(c.element_count(), d.element_count());
    }
}
