//! Linear-algebra primitives with hand-written derivative rules.

mod det;

pub use det::{BatchDet, DoubleBackward, TripleBackward};
