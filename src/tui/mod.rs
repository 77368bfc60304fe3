//! Terminal progress reporting
//!
//! This module provides the live process tree shown while orchestrating
//! a project: one labeled node per operation, spinners, elapsed timers
//! and the tail of each task's captured log.

pub mod processtree;

pub use processtree::{
    ProcessStatus, ProcessTree, ProcessTreeItem, ProcessTreeOptions, TaskContext,
};
