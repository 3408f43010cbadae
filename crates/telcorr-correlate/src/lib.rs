//! Event correlation for telcorr
//!
//! - [`normalize`] turns raw log records and spans into normalized events
//! - [`window`] groups events by correlation key for one processing-time interval
//! - [`scorer`] infers parents between trace segments of a closed window
//! - [`index`] keeps queryable mappings over summary history

pub mod index;
pub mod normalize;
pub mod scorer;
pub mod window;

pub use index::{SummaryIndex, SummaryQuery};
pub use normalize::{Normalizer, RawRecord};
pub use scorer::{Inference, Segment, SegmentArena, SegmentId, TraceScorer};
pub use window::{key_confidence, CorrelationWindow, WindowError, WindowPhase, WindowResult};
