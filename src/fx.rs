//! Fast hash maps and sets for internal side tables.

pub use rustc_hash::{FxHashMap, FxHashSet};
