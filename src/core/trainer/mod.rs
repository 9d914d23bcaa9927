pub mod batch;
pub mod param_groups;
pub mod penalty;
pub mod repulsion;
pub mod stats;
pub mod step;


// 재수출
pub use batch::{ActiveClasses, Replay, ReplayBatch, StepOptions, TrainBatch};
pub use param_groups::{FreezeGuard, GroupId, ParamGroups};
pub use penalty::{PenaltyHook, PenaltyHooks};
pub use stats::TrainStats;
