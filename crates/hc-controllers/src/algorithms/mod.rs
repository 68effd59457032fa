//! Control and derivation math, free of I/O

pub mod autotune;
pub mod bang_bang;
pub mod pid;
pub mod stats;
