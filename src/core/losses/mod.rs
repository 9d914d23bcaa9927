//! # 손실 원시 연산
//!
//! 손실 합성기가 쓰는 순수 함수들. 전부 배치 원소별(per-sample) 값을 먼저
//! 계산한 뒤에야 가중 평균한다. 순서를 뒤집으면 배치 가중치 의미가 깨진다.

pub mod contrastive;
pub mod distill;
pub mod gaussian;
pub mod recon;
pub mod weighting;


// 재수출
pub use contrastive::{supcon_loss, ContrastiveOptions};
pub use distill::distill_loss;
pub use gaussian::{
    gauss_divergence, invert_divergence, kl_standard, log_normal_diag, log_normal_standard,
    negative_cosine,
};
pub use recon::recon_loss;
pub use weighting::{precision, weighted_average};
