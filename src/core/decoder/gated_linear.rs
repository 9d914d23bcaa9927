//! 활성화와 곱셈 게이트가 붙은 선형 레이어

use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{linear, Linear, Module, VarBuilder};

/// 레이어 활성화 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Act {
    Relu,
    Sigmoid,
    Identity,
}

/// 선형 → 활성화 → (선택) 게이트 곱
#[derive(Debug)]
pub struct GatedLinear {
    fc: Linear,
    act: Act,
}

impl GatedLinear {
    pub fn new(vb: VarBuilder, in_dim: usize, out_dim: usize, act: Act) -> Result<Self> {
        Ok(Self {
            fc: linear(in_dim, out_dim, vb.pp("fc"))?,
            act,
        })
    }

    /// `gate`는 출력과 같은 모양 [batch, out]의 곱셈 마스크
    pub fn forward(&self, x: &Tensor, gate: Option<&Tensor>) -> Result<Tensor> {
        let h = self.fc.forward(x)?;
        let h = match self.act {
            Act::Relu => h.relu()?,
            Act::Sigmoid => candle_nn::ops::sigmoid(&h)?,
            Act::Identity => h,
        };
        match gate {
            Some(g) => Ok(h.mul(g)?),
            None => Ok(h),
        }
    }
}
