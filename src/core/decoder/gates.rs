//! 클래스/과제 조건부 고정 게이트 마스크
//!
//! 디코더의 게이트된 레이어마다 [게이트 행 수, 유닛 수] 모양의 이진 마스크를
//! 시드에서 재현 가능하게 뽑아 보관한다. 마스크는 학습되지 않으며, 게이트
//! 입력(정수 ID 또는 확률 행렬)과의 행렬곱으로 배치별 유닛 가중치가 된다.

use anyhow::{bail, Result};
use candle_core::{Device, Tensor};
use candle_nn::encoding::one_hot;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug)]
pub struct GateMasks {
    masks: Vec<Tensor>,
    gate_size: usize,
}

impl GateMasks {
    /// `prop`은 각 유닛이 꺼질 확률. 각 원소는 확률 1 - prop으로 1이 된다
    pub fn new(
        seed: u64,
        gate_size: usize,
        layer_units: &[usize],
        prop: f32,
        device: &Device,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut masks = Vec::with_capacity(layer_units.len());
        for &units in layer_units {
            let data: Vec<f32> = (0..gate_size * units)
                .map(|_| if rng.gen::<f32>() < prop { 0.0 } else { 1.0 })
                .collect();
            masks.push(Tensor::from_vec(data, (gate_size, units), device)?);
        }
        Ok(Self { masks, gate_size })
    }

    pub fn n_layers(&self) -> usize {
        self.masks.len()
    }

    pub fn gate_size(&self) -> usize {
        self.gate_size
    }

    /// 게이트 입력을 [batch, gate_size] 확률 행렬로 변환.
    /// 1차원 정수 ID는 원-핫으로 바꾸고 2차원 입력은 폭만 검사해 통과시킨다
    pub fn to_probs(&self, gate: &Tensor) -> Result<Tensor> {
        match gate.dims() {
            [_] => Ok(one_hot(gate.clone(), self.gate_size, 1f32, 0f32)?),
            [_, cols] => {
                if *cols != self.gate_size {
                    bail!(
                        "Gate input width {} does not match gate size {}",
                        cols,
                        self.gate_size
                    );
                }
                Ok(gate.clone())
            }
            dims => bail!("Gate input must be 1-D ids or 2-D probabilities, got {:?}", dims),
        }
    }

    /// 레이어별 게이트 가중치 [batch, units] = probs @ mask
    pub fn layer_weights(&self, layer: usize, probs: &Tensor) -> Result<Tensor> {
        if layer >= self.masks.len() {
            bail!(
                "Gated layer index {} out of range ({} layers)",
                layer,
                self.masks.len()
            );
        }
        Ok(probs.matmul(&self.masks[layer])?)
    }
}
