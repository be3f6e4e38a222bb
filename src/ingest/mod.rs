//! Command ingestion.
//!
//! Lines flow source → validator → dedup → queue:
//! - `source`: line-oriented command feeds (file, memory)
//! - `validator`: keyword lookup and per-kind parameter schemas
//! - `dedup`: process-lifetime set of accepted lines
//! - `producer`: the poll loop tying them to a marketplace

pub mod dedup;
pub mod producer;
pub mod source;
pub mod validator;

pub use dedup::Deduplicator;
pub use producer::{PollReport, Producer, ProducerError};
pub use source::{CommandSource, FileSource, MemorySource, SourceError};
pub use validator::{schema_for, CommandValidator, FieldRule, Schema};
