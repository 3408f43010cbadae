//! Event types
//!
//! Raw batches arrive from producers, the normalizer turns every record into a
//! [`NormalizedEvent`], and closed windows emit one [`CorrelationSummary`] per key.

pub mod key;
pub mod normalized;
pub mod raw;
pub mod summary;

pub use key::*;
pub use normalized::*;
pub use raw::*;
pub use summary::*;
