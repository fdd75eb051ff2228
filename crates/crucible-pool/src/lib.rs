//! Executor pool for the Crucible scheduling engine.
//!
//! Each configured [`node::Node`] that comes online is represented by a
//! live `Computer` hosting a resizable set of executor slots; every slot
//! is a long-lived tokio task that receives work units, runs them to a
//! build result, and reports completion. Load statistics are sampled on
//! a periodic tick, not per event.

pub mod computer;
pub mod load;
pub mod node;
pub mod work;

pub use computer::{ComputerSet, ComputerView, ExecutorCounts, OccupantView};
pub use load::{LoadSample, LoadSnapshot, LoadStatistics, MultiStageTimeSeries, TimeSeries};
pub use node::Node;
pub use work::{CompletionReport, SlotId, WorkUnit};
