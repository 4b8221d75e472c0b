//! Graph crawl and ordered SQL emission.
//!
//! An export of one subject runs in two phases:
//!
//! 1. [`Crawler`] walks the foreign-key graph from a filtered seed and
//!    collects the identity keys of every reachable row.
//! 2. [`Emitter`] walks the graph again and writes idempotent statements
//!    for those rows, parents first, with foreign keys rewritten by the
//!    [`FkResolver`] to lookups on natural keys.

pub mod crawler;
pub mod emitter;
pub mod fetcher;
pub mod navigation;
pub mod plan;
pub mod resolver;
pub mod statement;

pub use crawler::{Crawler, ExportSet, IdentityKey, TableKeys, TIME_FILTERED_TABLES};
pub use emitter::{EmitStats, Emitter, RowFilter};
pub use fetcher::{fetch_all_rows, fetch_rows, DEFAULT_BATCH_SIZE};
pub use navigation::{should_descend_forward_for_ordering, should_follow_back_reference};
pub use plan::{ExportPlan, PostSubtreeHook};
pub use resolver::{FkCache, FkResolver};
