pub mod loglikelihood;
pub mod recon_error;

// 테스트 모듈
#[cfg(test)]
mod __tests__;
