//! Tarn is a uniform async runtime for embedded columnar SQL engines.
//!
//! A single set of operations — connect, execute, stream, prepare,
//! register-file, catalog-introspect — is presented over two backends: an
//! in-process engine running on a dedicated worker thread, and a native
//! backend reached over an IPC channel. This crate re-exports the public
//! surface of [`tarn_core`].

pub use tarn_core::*;
