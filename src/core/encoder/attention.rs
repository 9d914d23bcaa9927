//! 외부 어텐션
//!
//! 배치 원소들을 토큰으로 보고 학습 가능한 공유 메모리 슬롯과의 유사도로
//! 특징을 재조합한다. 이중 정규화를 쓴다: 토큰 축 softmax 후 슬롯 축 L1.

use anyhow::Result;
use candle_core::{Tensor, D};
use candle_nn::{linear_no_bias, Linear, Module, VarBuilder};

/// 공유 메모리 슬롯 기반 외부 어텐션
#[derive(Debug)]
pub struct ExternalAttention {
    mk: Linear,
    mv: Linear,
}

impl ExternalAttention {
    /// `d_model` 차원 특징, `slots`개 메모리 슬롯
    pub fn new(vb: VarBuilder, d_model: usize, slots: usize) -> Result<Self> {
        Ok(Self {
            mk: linear_no_bias(d_model, slots, vb.pp("mk"))?,
            mv: linear_no_bias(slots, d_model, vb.pp("mv"))?,
        })
    }

    /// [batch, d_model] → [batch, d_model]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let attn = self.mk.forward(x)?;
        let attn = candle_nn::ops::softmax(&attn, 0)?;
        let norm = attn.sum_keepdim(D::Minus1)?;
        let attn = attn.broadcast_div(&norm)?;
        Ok(self.mv.forward(&attn)?)
    }
}
