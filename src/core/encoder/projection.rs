//! 대조 학습용 투영 헤드와 SimSiam 예측기

use anyhow::Result;
use candle_core::{Tensor, D};
use candle_nn::{
    batch_norm, linear, linear_no_bias, BatchNorm, BatchNormConfig, Linear, Module, ModuleT,
    VarBuilder,
};

const NORM_EPS: f64 = 1e-12;

/// 행별 L2 정규화. 노름이 0에 가까우면 `NORM_EPS`로 바닥을 친다
pub fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.maximum(NORM_EPS)?;
    Ok(x.broadcast_div(&norm)?)
}

/// 투영 헤드: 드롭아웃 → 선형 → L2 정규화
#[derive(Debug)]
pub struct ProjectionHead {
    fc: Linear,
    drop: f32,
}

impl ProjectionHead {
    pub fn new(vb: VarBuilder, in_dim: usize, out_dim: usize, drop: f32) -> Result<Self> {
        Ok(Self {
            fc: linear(in_dim, out_dim, vb.pp("fc"))?,
            drop,
        })
    }

    /// 학습 모드일 때만 입력에 드롭아웃을 적용한다
    pub fn forward(&self, h: &Tensor, train: bool) -> Result<Tensor> {
        let h = if train && self.drop > 0.0 {
            candle_nn::ops::dropout(h, self.drop)?
        } else {
            h.clone()
        };
        let p = self.fc.forward(&h)?;
        l2_normalize(&p)
    }
}

/// SimSiam 예측기: 무편향 선형 → 배치 정규화 → ReLU → 선형
#[derive(Debug)]
pub struct Predictor {
    fc1: Linear,
    bn: BatchNorm,
    fc2: Linear,
}

impl Predictor {
    pub fn new(vb: VarBuilder, dim: usize, hidden: usize) -> Result<Self> {
        Ok(Self {
            fc1: linear_no_bias(dim, hidden, vb.pp("fc1"))?,
            bn: batch_norm(hidden, BatchNormConfig::default(), vb.pp("bn"))?,
            fc2: linear(hidden, dim, vb.pp("fc2"))?,
        })
    }

    pub fn forward(&self, p: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.fc1.forward(p)?;
        let h = self.bn.forward_t(&h, train)?;
        let h = h.relu()?;
        Ok(self.fc2.forward(&h)?)
    }
}
