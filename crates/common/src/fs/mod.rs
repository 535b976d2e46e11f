mod safe_write;

pub use safe_write::{atomic_write, StagedWrite};
