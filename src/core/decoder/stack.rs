//! z → 데이터 공간 복원 스택
//!
//! `from_z` → 은닉 레이어들 → 데이터 레이어 순서. 게이트가 켜져 있으면
//! `from_z`와 은닉 레이어 출력에 클래스/과제 조건부 고정 마스크가 곱해지고
//! 마지막 데이터 레이어는 게이트하지 않는다. fc 스택이 항등(깊이 1)이면
//! `from_z`가 곧바로 데이터 레이어 역할을 한다. 전단 추출기가 있는 픽셀
//! 리플레이 모델은 미러 스택이 특징 수준에서 끝나고 게이트 없는 이미지
//! 헤드가 입력 유닛 수로 되돌린다.

use crate::core::config::{NetworkOutput, VaeConfig};
use crate::core::decoder::gated_linear::{Act, GatedLinear};
use crate::core::decoder::gates::GateMasks;
use anyhow::{bail, Result};
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;

#[derive(Debug)]
pub struct DecoderStack {
    from_z: GatedLinear,
    hidden_layers: Vec<GatedLinear>,
    data_layer: Option<GatedLinear>,
    image_head: Option<GatedLinear>,
    gates: Option<GateMasks>,
    drop: f32,
}

impl DecoderStack {
    pub fn new(config: &VaeConfig, vb: VarBuilder, device: &Device) -> Result<Self> {
        let sizes = config.decoder_layer_sizes();
        let with_image_head = config.decoder_image_head();
        let out_act = match config.network_output {
            NetworkOutput::Sigmoid => Act::Sigmoid,
            NetworkOutput::Identity => Act::Identity,
        };

        // 깊이 1이면 from_z가 곧 데이터 레이어 (이미지 헤드가 없을 때)
        let single = sizes.len() == 1;
        let from_z = GatedLinear::new(
            vb.pp("from_z"),
            config.z_dim,
            sizes[0],
            if single && !with_image_head {
                out_act
            } else {
                Act::Relu
            },
        )?;

        let mut hidden_layers = Vec::new();
        let mut data_layer = None;
        for (i, pair) in sizes.windows(2).enumerate() {
            let last = i == sizes.len() - 2;
            if last && !with_image_head {
                data_layer = Some(GatedLinear::new(
                    vb.pp(format!("fc{}", i)),
                    pair[0],
                    pair[1],
                    out_act,
                )?);
            } else {
                hidden_layers.push(GatedLinear::new(
                    vb.pp(format!("fc{}", i)),
                    pair[0],
                    pair[1],
                    Act::Relu,
                )?);
            }
        }
        let image_head = if with_image_head {
            Some(GatedLinear::new(
                vb.pp("to_image"),
                sizes[sizes.len() - 1],
                config.input_units(),
                out_act,
            )?)
        } else {
            None
        };

        let gates = if config.gates.enabled {
            // 게이트 행: from_z 출력 + 은닉 레이어 출력들 (데이터 쪽 끝은 제외)
            let mut units: Vec<usize> = vec![sizes[0]];
            let gated_pairs = if with_image_head {
                sizes.len().saturating_sub(1)
            } else {
                sizes.len().saturating_sub(2)
            };
            for pair in sizes.windows(2).take(gated_pairs) {
                units.push(pair[1]);
            }
            Some(GateMasks::new(
                config.gates.seed,
                config.gate_size(),
                &units,
                config.gates.prop,
                device,
            )?)
        } else {
            None
        };

        Ok(Self {
            from_z,
            hidden_layers,
            data_layer,
            image_head,
            gates,
            drop: config.fc_drop,
        })
    }

    pub fn gated(&self) -> bool {
        self.gates.is_some()
    }

    /// 잠재 변수를 데이터 공간으로 복원한다. 출력은 [batch, out_units].
    /// 게이트가 켜져 있으면 `gate` 입력이 필수다
    pub fn forward(&self, z: &Tensor, gate: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let probs = match (&self.gates, gate) {
            (Some(masks), Some(g)) => Some(masks.to_probs(g)?),
            (Some(_), None) => {
                bail!("Decoder gating is enabled but no gate input was provided")
            }
            (None, _) => None,
        };
        let layer_gate = |idx: usize| -> Result<Option<Tensor>> {
            match (&self.gates, &probs) {
                (Some(masks), Some(p)) => Ok(Some(masks.layer_weights(idx, p)?)),
                _ => Ok(None),
            }
        };

        let g0 = layer_gate(0)?;
        let mut h = self.from_z.forward(z, g0.as_ref())?;
        for (i, layer) in self.hidden_layers.iter().enumerate() {
            if train && self.drop > 0.0 && i > 0 {
                h = candle_nn::ops::dropout(&h, self.drop)?;
            }
            let g = layer_gate(i + 1)?;
            h = layer.forward(&h, g.as_ref())?;
        }
        if let Some(ref data) = self.data_layer {
            if train && self.drop > 0.0 && !self.hidden_layers.is_empty() {
                h = candle_nn::ops::dropout(&h, self.drop)?;
            }
            h = data.forward(&h, None)?;
        }
        if let Some(ref head) = self.image_head {
            if train && self.drop > 0.0 && !self.hidden_layers.is_empty() {
                h = candle_nn::ops::dropout(&h, self.drop)?;
            }
            h = head.forward(&h, None)?;
        }
        Ok(h)
    }
}
