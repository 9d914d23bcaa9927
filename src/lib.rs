//! 생성적 리플레이 VAE (Generative Replay VAE) 라이브러리
//!
//! 변분 오토인코더 기반 연속 학습(continual learning) 코어.
//! 이전 과제의 의사 샘플을 스스로 생성해 현재 과제 데이터와 섞어 학습하는
//! "생성적 리플레이" 학습 단계를 후보 손실 전부와 함께 조율한다.

pub mod core;

// 핵심 모듈들 재수출
pub use core::{
    // 설정
    ClassifyTap, ContrastiveConfig, DivergenceKind, GateBy, GateConfig, LossWeights, NetworkOutput,
    OptimConfig, PriorConfig, PriorKind, ReconKind, ReplayTargets, Representative, RepulsionConfig,
    Scenario, VaeConfig,
    // 사전분포
    ModeSelector, Prior,
    // 모델
    EncodeOutput, ForwardOutput, LatentPair, LossInputs, LossTerms, ReconPair, ReplayVae,
    // 샘플러
    SampleOutput, SampleSelector,
    // 학습 단계
    ActiveClasses, FreezeGuard, GroupId, ParamGroups, PenaltyHook, PenaltyHooks, Replay,
    ReplayBatch, StepOptions, TrainBatch, TrainStats,
};

// 편의 타입 별칭들
pub type Model = ReplayVae;
pub type Config = VaeConfig;
