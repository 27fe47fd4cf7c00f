//! Activity timeline reconstruction.
//!
//! Folds decoded agent events into an ordered list of typed activity items
//! that are created once and then updated in place. The text merge that tells
//! incremental deltas apart from cumulative restatements lives in [`merge`]
//! as a pure function.

pub mod item;
pub mod merge;
pub mod recent;
pub mod timeline;

pub use {
    item::{ActivityItem, ActivityKind, CompactionPhase, ItemId, LifecyclePhase, ToolStatus},
    merge::{DeltaMerge, MergeState, StreamText, classify_delta},
    recent::RecentSet,
    timeline::{Timeline, TimelineChange},
};
