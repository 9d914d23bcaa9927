pub mod replay_sampler;


// 재수출
pub use replay_sampler::{SampleOutput, SampleSelector};
