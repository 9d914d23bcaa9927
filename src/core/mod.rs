//! # 생성적 리플레이 VAE 핵심 모듈
//!
//! 잎(leaf)부터: 설정 → 손실 원시 연산 → 사전분포 → 인코더/디코더 빌딩블록 →
//! 모델 본체 → 샘플러 → 학습 단계 오케스트레이터 → 평가 루틴

pub mod config;
pub mod losses;
pub mod prior;
pub mod encoder;
pub mod decoder;
pub mod model;
pub mod sampler;
pub mod trainer;
pub mod eval;

// 주요 타입들 재수출
pub use config::*;
pub use prior::*;
pub use model::*;
pub use sampler::*;
pub use trainer::*;

// 각 모듈이 자체 테스트를 포함함
