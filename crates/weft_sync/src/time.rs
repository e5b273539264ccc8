//! Currently just re-exports std::time; the monotonic clock is all the lock
//! timeouts need.
pub use std::time::*;
