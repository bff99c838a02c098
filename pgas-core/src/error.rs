//! The core's single error domain, in the teacher's shape: a stable code
//! plus a human message plus a category that drives the §7 error-handling
//! policy (write to the caller's `stat`/`errmsg` if given, else terminate
//! for errors classified as fatal).

pub type CoreResult<T> = Result<T, CoreError>;

/// Every error kind spec.md §7 names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    StoppedImage,
    FailedImage,
    DuplicateSyncImage,
    MutexSelfDeadlock,
    AllocationFailure,
    InvalidReference,
    RankOutOfRange,
    ExtentOutOfRange,
    NonReallocatableExtentMismatch,
    DoubleArrayReference,
    TypeConversionUnsupported,
    TransportError,
    /// Not named in spec.md §7 itself but required by the stubbed
    /// `send_by_ref`/`sendget_by_ref` entry points (spec.md §9 open
    /// question (b)).
    Unsupported,
}

impl ErrorKind {
    /// Stable code string, `<domain>.<reason>` in the teacher's
    /// convention.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::StoppedImage => "image.stopped",
            ErrorKind::FailedImage => "image.failed",
            ErrorKind::DuplicateSyncImage => "sync.duplicate_image",
            ErrorKind::MutexSelfDeadlock => "sync.mutex_self_deadlock",
            ErrorKind::AllocationFailure => "token.allocation_failure",
            ErrorKind::InvalidReference => "reference.invalid",
            ErrorKind::RankOutOfRange => "reference.rank_out_of_range",
            ErrorKind::ExtentOutOfRange => "reference.extent_out_of_range",
            ErrorKind::NonReallocatableExtentMismatch => "reference.non_reallocatable_mismatch",
            ErrorKind::DoubleArrayReference => "reference.double_array_reference",
            ErrorKind::TypeConversionUnsupported => "transfer.type_conversion_unsupported",
            ErrorKind::TransportError => "transport.error",
            ErrorKind::Unsupported => "core.unsupported",
        }
    }

    /// Status code per spec.md §6: `OK=0`, `STOPPED_IMAGE`, `FAILED_IMAGE`,
    /// `DUP_SYNC_IMAGES`, `99` (mutex self-deadlock), `1` (generic
    /// failure).
    pub fn status_code(self) -> i32 {
        match self {
            ErrorKind::StoppedImage => 2,
            ErrorKind::FailedImage => 3,
            ErrorKind::DuplicateSyncImage => 4,
            ErrorKind::MutexSelfDeadlock => 99,
            _ => 1,
        }
    }

    /// Errors that terminate the image when the caller did not supply a
    /// `stat` output (spec.md §7). Reference-walker and type-conversion
    /// errors are left recoverable even unhandled: they reflect a
    /// programming mistake in the call site's descriptors, not a loss of
    /// runtime invariants, so propagating a `Result` all the way up is
    /// preferable to an unconditional abort.
    pub fn is_fatal_unhandled(self) -> bool {
        matches!(
            self,
            ErrorKind::StoppedImage
                | ErrorKind::FailedImage
                | ErrorKind::AllocationFailure
                | ErrorKind::TransportError
        )
    }
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        CoreError { kind, message: message.into() }
    }

    pub fn status_code(&self) -> i32 {
        self.kind.status_code()
    }

    /// Writes the message into the caller-provided buffer, space-padded
    /// to its full length (spec.md §4.B/§7).
    pub fn write_errmsg(&self, buf: &mut [u8]) {
        let bytes = self.message.as_bytes();
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        for b in &mut buf[n..] {
            *b = b' ';
        }
    }
}

/// Out-parameters mirroring the compiler-emitted ABI: every public
/// operation takes an optional `stat`/`errmsg` pair alongside its
/// idiomatic `Result` return (spec.md §7).
#[derive(Default)]
pub struct Stat<'a> {
    pub stat: Option<&'a mut i32>,
    pub errmsg: Option<&'a mut [u8]>,
}

impl<'a> Stat<'a> {
    pub fn none() -> Self {
        Stat { stat: None, errmsg: None }
    }

    pub fn new(stat: &'a mut i32) -> Self {
        Stat { stat: Some(stat), errmsg: None }
    }

    pub fn with_errmsg(stat: &'a mut i32, errmsg: &'a mut [u8]) -> Self {
        Stat { stat: Some(stat), errmsg: Some(errmsg) }
    }

    /// Records `result` into `self.stat`/`self.errmsg` when present,
    /// always returns the original `Result` so Rust callers can still use
    /// `?`. The only asymmetry with `stat` present is in
    /// [`crate::runtime::Runtime::report`], which also decides whether to
    /// abort when `stat` is absent.
    pub(crate) fn record(&mut self, result: &CoreResult<()>) {
        match result {
            Ok(()) => {
                if let Some(s) = self.stat.as_deref_mut() {
                    *s = 0;
                }
            }
            Err(err) => {
                if let Some(s) = self.stat.as_deref_mut() {
                    *s = err.status_code();
                }
                if let Some(buf) = self.errmsg.as_deref_mut() {
                    err.write_errmsg(buf);
                }
            }
        }
    }

    pub(crate) fn has_stat(&self) -> bool {
        self.stat.is_some()
    }
}
