//! Termination (component I): `stop`, `error_stop`, `fail_image`, and
//! the `image_status` query (spec.md §4.I).

use crate::error::CoreResult;
use crate::runtime::{ImageStatus, Runtime};
use crate::transport::ImageId;

/// Normal termination with a numeric exit code: every image finalizes
/// (barrier, token teardown) and the process exits with `code`.
pub fn stop_numeric(rt: &Runtime, code: i32) -> ! {
    let _ = rt.finalize();
    tracing::info!(this_image = rt.this_image(), code, "stop");
    std::process::exit(code);
}

/// Normal termination with a textual stop code, per spec.md §4.I printed
/// to stderr before exit (exit code fixed at 0, since a string carries no
/// numeric status).
pub fn stop_str(rt: &Runtime, message: &str) -> ! {
    let _ = rt.finalize();
    eprintln!("{message}");
    tracing::info!(this_image = rt.this_image(), message, "stop");
    std::process::exit(0);
}

/// Abnormal termination: every other image observes `FAILED_IMAGE`
/// rather than participating in an orderly finalize (spec.md §4.I).
pub fn error_stop(rt: &Runtime, code: i32) -> ! {
    tracing::error!(this_image = rt.this_image(), code, "error stop");
    let _ = rt.finalize_with_status(ImageStatus::Failed);
    std::process::exit(code.max(1));
}

pub fn error_stop_str(rt: &Runtime, message: &str) -> ! {
    eprintln!("ERROR STOP {message}");
    error_stop(rt, 1)
}

/// Marks this image `Failed` without tearing it down — used by
/// failure-injection tests and by a supervising process that decides an
/// image should be treated as lost without it actually exiting
/// (spec.md §4.I/§9).
pub fn fail_image(rt: &Runtime) -> CoreResult<()> {
    tracing::warn!(this_image = rt.this_image(), "fail_image");
    rt.finalize_with_status(ImageStatus::Failed)
}

/// `image_status`: delegates to [`Runtime::image_status`], which already
/// implements spec.md §9 open question (c) (peers always report
/// `Running` when failure handling is disabled).
pub fn image_status(rt: &Runtime, image: ImageId) -> CoreResult<i32> {
    Ok(rt.image_status(image)?.to_i32())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_status_round_trips() {
        assert_eq!(ImageStatus::from_i32(ImageStatus::Running.to_i32()), ImageStatus::Running);
        assert_eq!(ImageStatus::from_i32(ImageStatus::Failed.to_i32()), ImageStatus::Failed);
    }
}
