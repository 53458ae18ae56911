//! `utils` is intended to be a place to put code that is shared
//! between other crates in this repository.
#![deny(unsafe_code)]
#![deny(clippy::undocumented_unsafe_blocks)]

/// `Lsn` type implements common tasks on Log Sequence Numbers
pub mod lsn;

/// 128-bit tenant and timeline identifiers
pub mod id;

pub mod logging;

/// Durable file operations: fsync'd writes and renames
pub mod crashsafe;

pub mod sync {
    pub mod gate;
}
