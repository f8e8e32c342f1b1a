//! C7 — Optional sinks.
//!
//! Three independent capability traits (`PersistSink`, `NotifySink`,
//! `EnrichSink`), each with a no-op default selected at construction time
//! (spec.md §4.7, §9): the classifier and query API never branch on
//! whether a real sink is wired up.

pub mod enrich;
pub mod notify;
pub mod persist;

pub use enrich::{CachedEnrich, EnrichSink, NullEnrich};
pub use notify::{NatsNotify, NotifySink, NullNotify};
pub use persist::{BanlistRecord, FilePersist, NullPersist, PersistSink};
