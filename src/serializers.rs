//! `serialize_with` helpers for foreign error types that don't implement
//! [Serialize][serde::Serialize]
//!
//! They all store the pretty `Debug` representation, which keeps the variant
//! and the OS error code visible in the JSON soft error reports.

use serde::Serializer;

fn serialize_generic_error<S: Serializer, E: std::error::Error>(
    error: &E,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{error:#?}"))
}

/// Serialize [std::io::Error]
pub fn serialize_io_error<S: Serializer>(
    error: &std::io::Error,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serialize_generic_error(error, serializer)
}

/// Serialize [goblin::error::Error]
pub fn serialize_goblin_error<S: Serializer>(
    error: &goblin::error::Error,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serialize_generic_error(error, serializer)
}

/// Serialize [nix::Error]
pub fn serialize_nix_error<S: Serializer>(
    error: &nix::Error,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serialize_generic_error(error, serializer)
}

/// Serialize [procfs_core::ProcError]
pub fn serialize_proc_error<S: Serializer>(
    error: &procfs_core::ProcError,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serialize_generic_error(error, serializer)
}

/// Serialize [std::time::SystemTimeError]
pub fn serialize_system_time_error<S: Serializer>(
    error: &std::time::SystemTimeError,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serialize_generic_error(error, serializer)
}

/// Serialize [scroll::Error]
pub fn serialize_scroll_error<S: Serializer>(
    error: &scroll::Error,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serialize_generic_error(error, serializer)
}

/// Serialize [std::num::ParseIntError]
pub fn serialize_parse_int_error<S: Serializer>(
    error: &std::num::ParseIntError,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serialize_generic_error(error, serializer)
}
