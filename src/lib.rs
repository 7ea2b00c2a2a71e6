//! runu: an OCI runtime that runs unikernel virtual machines as containers.
//!
//! The container lifecycle lives in [`mocktainer`]; [`machine`] turns a
//! bundle's kernel into the VMM command line that the container's init
//! process finally executes.

pub mod config;
pub mod machine;
pub mod mocktainer;
pub mod spec;
