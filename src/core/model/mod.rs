pub mod autoencoder;
pub mod composer;

// 테스트 모듈
#[cfg(test)]
mod __tests__;

// 재수출
pub use autoencoder::{EncodeOutput, ForwardOutput, ReplayVae};
pub use composer::{LatentPair, LossInputs, LossTerms, ReconPair};
