//! ReLU 완전연결 스택
//!
//! 인코더 본체(fcE)와 전단 특징 추출기가 공유하는 기본 블록.
//! 과제별 유닛 게이트(컨텍스트 의존 게이팅)를 레이어 출력에 곱할 수 있다.

use anyhow::{bail, Result};
use candle_core::Tensor;
use candle_nn::{linear, Linear, Module, VarBuilder};

/// 완전연결 스택
///
/// `sizes`가 `[in, a, b]`이면 in→a→b 두 레이어, 길이 1이면 항등 스택.
/// 모든 레이어 출력에 ReLU가 적용된다.
#[derive(Debug)]
pub struct Mlp {
    layers: Vec<Linear>,
    drop: f32,
    unit_gates: Option<Vec<Tensor>>,
}

impl Mlp {
    pub fn new(vb: VarBuilder, sizes: &[usize], drop: f32) -> Result<Self> {
        if sizes.is_empty() {
            bail!("MLP needs at least an input size");
        }
        let mut layers = Vec::with_capacity(sizes.len().saturating_sub(1));
        for (i, pair) in sizes.windows(2).enumerate() {
            layers.push(linear(pair[0], pair[1], vb.pp(format!("fc{}", i)))?);
        }
        Ok(Self {
            layers,
            drop,
            unit_gates: None,
        })
    }

    /// 레이어가 없는 항등 스택 여부
    pub fn is_identity(&self) -> bool {
        self.layers.is_empty()
    }

    /// 레이어 수
    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// 과제별 유닛 게이트 설정. `None`이면 해제.
    /// 게이트 수는 레이어 수와 같아야 하며, 각 게이트는 해당 레이어의
    /// 출력 유닛 수 길이의 1차원 텐서.
    pub fn set_unit_gates(&mut self, gates: Option<Vec<Tensor>>) -> Result<()> {
        if let Some(ref g) = gates {
            if g.len() != self.layers.len() {
                bail!(
                    "Expected {} unit gates, got {}",
                    self.layers.len(),
                    g.len()
                );
            }
        }
        self.unit_gates = gates;
        Ok(())
    }

    /// 순전파. 학습 모드이면 두 번째 레이어부터 입력에 드롭아웃을 적용
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            if train && self.drop > 0.0 && i > 0 {
                h = candle_nn::ops::dropout(&h, self.drop)?;
            }
            h = layer.forward(&h)?.relu()?;
            if let Some(ref gates) = self.unit_gates {
                h = h.broadcast_mul(&gates[i])?;
            }
        }
        Ok(h)
    }
}
