pub mod mlp;
pub mod latent_split;
pub mod attention;
pub mod projection;

// 테스트 모듈
#[cfg(test)]
mod __tests__;

// 재수출
pub use mlp::Mlp;
pub use latent_split::LatentSplit;
pub use attention::ExternalAttention;
pub use projection::{l2_normalize, Predictor, ProjectionHead};
