//! Core of a partitioned global address space (PGAS) execution model over a
//! one-sided-RMA transport.
//!
//! The crate presents N symmetric "images" a uniform way to read, write,
//! atomically update, synchronize with, and collectively reduce memory
//! owned by any other image. Every piece of shared data is identified by
//! an opaque [`token::Token`] backed by an RMA window on a transport that
//! implements [`transport::RmaTransport`]; this crate never talks to a
//! concrete network or MPI library directly.

pub mod atomic;
pub mod collective;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod reference;
pub mod runtime;
pub mod sync;
pub mod termination;
pub mod token;
pub mod transfer;
pub mod transport;

pub use config::{LockStrategyKind, RuntimeConfig, RuntimeConfigBuilder, StridedStrategy};
pub use descriptor::{Descriptor, Dim, ElementType, MAX_RANK};
pub use error::{CoreError, CoreResult, ErrorKind};
pub use runtime::{ImageStatus, Runtime};
pub use token::{DeregisterMode, Token, TokenKind};
pub use transport::{ImageId, RmaTransport};
