// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
//! Low-level helpers shared by the devjail engine and daemon: atomic file
//! replacement and process-group control for shell sessions.

pub mod fs;
pub mod process_utils;
