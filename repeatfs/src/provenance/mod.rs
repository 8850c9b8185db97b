//! Provenance Engine: process/file/IO bookkeeping, causal graph
//! construction, and replay verification, mirroring `provenance.py` and the
//! `provenance/` package it delegates to.

pub mod graph;
pub mod record;
pub mod replay;
pub mod snapshot;
pub mod store;

pub use record::{FileRecord, IoDirection, IoRecord, OpKind, ProcessRecord};
pub use snapshot::{LinuxProcfs, ProcessSnapshot, ProcessStat};
pub use store::Store;
