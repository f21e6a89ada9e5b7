//! Adapters at the edges of the pipeline: external processes, object storage and report
//! persistence.

pub mod persist;
pub mod process;
pub mod storage;
