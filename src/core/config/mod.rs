pub mod vae_config;


// 재수출
pub use vae_config::{
    ClassifyTap, ContrastiveConfig, DivergenceKind, GateBy, GateConfig, LossWeights,
    NetworkOutput, OptimConfig, PriorConfig, PriorKind, ReconKind, ReplayTargets, Representative,
    RepulsionConfig, Scenario, VaeConfig,
};
