//! kiln - fire Compose projects into unikernel machines
//!
//! kiln takes Compose-style multi-service application descriptions plus a
//! Dockerfile-based artifact pipeline and turns them into unikernel
//! machines on local hypervisors:
//!
//! - Compose loading, validation and IPv4 address assignment
//! - Dependency-ordered service lifecycle (up/create/start/stop/...)
//! - Dockerfile builds through BuildKit into CPIO (newc) initrds
//! - OCI artifact assembly (kernel + initrd + metadata)
//! - A concurrent progress tree with live terminal feedback

pub mod compose;
pub mod error;
pub mod initrd;
pub mod machine;
pub mod oci;
pub mod tui;

pub use error::{KilnError, Result};
