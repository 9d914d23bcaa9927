//! 은닉 특징 → 가우시안 잠재 파라미터 분기

use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{linear, Linear, Module, VarBuilder};

/// 평균/로그분산 두 갈래 선형 헤드. 어느 쪽에도 비선형성이 없다
#[derive(Debug)]
pub struct LatentSplit {
    mean: Linear,
    logvar: Linear,
}

impl LatentSplit {
    pub fn new(vb: VarBuilder, in_dim: usize, z_dim: usize) -> Result<Self> {
        Ok(Self {
            mean: linear(in_dim, z_dim, vb.pp("mean"))?,
            logvar: linear(in_dim, z_dim, vb.pp("logvar"))?,
        })
    }

    /// (mu, logvar) 반환
    pub fn forward(&self, h: &Tensor) -> Result<(Tensor, Tensor)> {
        Ok((self.mean.forward(h)?, self.logvar.forward(h)?))
    }
}
