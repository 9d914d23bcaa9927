//! # 생성적 리플레이 VAE 본체
//!
//! 전단 추출기 → 인코더 fc 스택 → 잠재 분기, 분류기, 게이트 디코더, 잠재
//! 사전분포를 하나의 모델로 묶는다. 파라미터는 전부 하나의 VarMap에 이름
//! 접두사(`frontend`, `fc_e`, `to_z`, `classifier`, `decoder`, `proj`,
//! `predictor`, `attn`, `prior`)로 등록되고, 그 접두사가 그대로 옵티마이저
//! 구획의 경계가 된다. 대조 학습이 켜지면 인코더/투영 구획은 인코더 전용
//! 옵티마이저가, 나머지는 주 옵티마이저가 맡는다.

use crate::core::config::{ClassifyTap, VaeConfig};
use crate::core::decoder::DecoderStack;
use crate::core::encoder::{ExternalAttention, LatentSplit, Mlp, Predictor, ProjectionHead};
use crate::core::prior::Prior;
use crate::core::trainer::ParamGroups;
use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{linear, AdamW, Linear, Module, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::Path;

/// 인코더 경로의 중간 산출물
#[derive(Debug)]
pub struct EncodeOutput {
    /// 잠재 평균 `[batch, z_dim]`
    pub mu: Tensor,
    /// 잠재 로그분산 `[batch, z_dim]`
    pub logvar: Tensor,
    /// 잠재 분기 직전 은닉 특징 `[batch, real_h_dim]`. 투영을 두 뷰에서
    /// 계산할 때도 여기는 주 배치 행만 남는다
    pub h: Tensor,
    /// 전단 추출기 통과 특징 (들어온 행 전부)
    pub features: Tensor,
    /// 대조 투영, 단위 노름 (들어온 행 전부)
    pub proj: Option<Tensor>,
}

/// 전체 전방 계산 한 번의 산출물
#[derive(Debug)]
pub struct ForwardOutput {
    /// 재구성 `[batch, out_units]`
    pub x_recon: Tensor,
    /// 분류 로짓 `[batch, classes]`
    pub y_hat: Tensor,
    pub mu: Tensor,
    pub logvar: Tensor,
    /// 재매개변수화된 잠재 샘플
    pub z: Tensor,
    pub proj: Option<Tensor>,
}

/// 생성적 리플레이 VAE
pub struct ReplayVae {
    pub(crate) config: VaeConfig,
    pub(crate) device: Device,
    pub(crate) varmap: VarMap,
    pub(crate) frontend: Option<Mlp>,
    pub(crate) fc_e: Mlp,
    pub(crate) to_z: LatentSplit,
    pub(crate) classifier: Linear,
    pub(crate) decoder: DecoderStack,
    pub(crate) projection: Option<ProjectionHead>,
    pub(crate) predictor: Option<Predictor>,
    pub(crate) attention: Option<ExternalAttention>,
    pub(crate) prior: Prior,
    /// XdG 과제별 인코더 유닛 마스크 `[task][layer]`
    pub(crate) task_masks: Option<Vec<Vec<Tensor>>>,
    pub(crate) groups: ParamGroups,
    pub(crate) main_opt: AdamW,
    pub(crate) e_opt: Option<AdamW>,
}

impl ReplayVae {
    /// 설정을 검증하고 모든 하위 모듈을 구성한다
    pub fn new(config: VaeConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let frontend = if config.extract_layers > 0 {
            let mut sizes = vec![config.input_units()];
            sizes.extend(std::iter::repeat(config.extract_units).take(config.extract_layers));
            Some(Mlp::new(vb.pp("frontend"), &sizes, 0.0)?)
        } else {
            None
        };
        let fc_e = Mlp::new(vb.pp("fc_e"), &config.fc_layer_sizes(), config.fc_drop)?;
        let to_z = LatentSplit::new(vb.pp("to_z"), config.real_h_dim(), config.z_dim)?;
        let classifier = linear(config.real_h_dim(), config.classes, vb.pp("classifier"))?;
        let decoder = DecoderStack::new(&config, vb.pp("decoder"), device)?;

        let contr = &config.contrastive;
        let projection = if contr.enabled {
            Some(ProjectionHead::new(
                vb.pp("proj"),
                config.real_h_dim(),
                contr.proj_units,
                contr.drop,
            )?)
        } else {
            None
        };
        let predictor = if contr.enabled && contr.simsiam {
            Some(Predictor::new(
                vb.pp("predictor"),
                contr.proj_units,
                contr.pred_units,
            )?)
        } else {
            None
        };
        let attention = if contr.enabled && contr.attention {
            Some(ExternalAttention::new(
                vb.pp("attn"),
                config.real_h_dim(),
                contr.attn_units,
            )?)
        } else {
            None
        };
        let prior = Prior::new(&config, vb.pp("prior"))?;

        let groups = ParamGroups::collect(&varmap);
        let main_opt = AdamW::new(
            groups.main_vars(contr.enabled),
            ParamsAdamW {
                lr: config.optim.lr,
                weight_decay: config.optim.weight_decay,
                ..Default::default()
            },
        )?;
        let e_opt = if contr.enabled {
            Some(AdamW::new(
                groups.encoder_vars(),
                ParamsAdamW {
                    lr: config.optim.encoder_lr,
                    weight_decay: config.optim.weight_decay,
                    ..Default::default()
                },
            )?)
        } else {
            None
        };

        Ok(Self {
            config,
            device: device.clone(),
            varmap,
            frontend,
            fc_e,
            to_z,
            classifier,
            decoder,
            projection,
            predictor,
            attention,
            prior,
            task_masks: None,
            groups,
            main_opt,
            e_opt,
        })
    }

    pub fn config(&self) -> &VaeConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn prior(&self) -> &Prior {
        &self.prior
    }

    /// 구조 하이퍼파라미터 스탬프 (체크포인트 키)
    pub fn name(&self) -> String {
        self.config.name()
    }

    /// 입력을 잠재 통계까지 인코딩한다.
    ///
    /// `not_hidden`이면 은닉 리플레이 모델이라도 입력을 원시 픽셀로 보고
    /// 전단 추출기를 통과시킨다. `main_rows`가 주어지면 대조 투영은 전체
    /// 행에서 계산하되 잠재 경로는 앞쪽 `main_rows`개 행만 쓴다 (두 번째
    /// 뷰가 뒤에 이어붙은 배치). `with_proj`는 투영 헤드 통과 여부
    pub fn encode(
        &self,
        x: &Tensor,
        not_hidden: bool,
        main_rows: Option<usize>,
        with_proj: bool,
        train: bool,
    ) -> Result<EncodeOutput> {
        let x = if x.rank() > 2 {
            x.flatten_from(1)?
        } else {
            x.clone()
        };
        let run_frontend = self.frontend.is_some() && (!self.config.hidden || not_hidden);
        let features = match (&self.frontend, run_frontend) {
            (Some(frontend), true) => frontend.forward(&x, train)?,
            _ => x,
        };
        let mut h = self.fc_e.forward(&features, train)?;

        let proj = match (&self.projection, with_proj) {
            (Some(head), true) => {
                let pre = match &self.attention {
                    Some(attn) => attn.forward(&h)?,
                    None => h.clone(),
                };
                Some(head.forward(&pre, train)?)
            }
            _ => None,
        };

        if let Some(rows) = main_rows {
            if rows < h.dim(0)? {
                h = h.narrow(0, 0, rows)?;
            }
        }
        let (mu, logvar) = self.to_z.forward(&h)?;
        Ok(EncodeOutput {
            mu,
            logvar,
            h,
            features,
            proj,
        })
    }

    /// 재매개변수화: `z = mu + exp(0.5 * logvar) * noise`, 매 호출 새 노이즈
    pub fn reparameterize(&self, mu: &Tensor, logvar: &Tensor) -> Result<Tensor> {
        let std = logvar.affine(0.5, 0.0)?.exp()?;
        let noise = mu.randn_like(0.0, 1.0)?;
        Ok((mu + (noise * std)?)?)
    }

    /// 잠재 변수를 데이터 공간으로 복원한다. 게이트 디코더면 `gate`
    /// (클래스/과제 ID 벡터 또는 soft 확률 행렬)가 필수다
    pub fn decode(&self, z: &Tensor, gate: Option<&Tensor>, train: bool) -> Result<Tensor> {
        self.decoder.forward(z, gate, train)
    }

    /// 분류 로짓. 탭 지점(`classify`)에 따라 은닉 특징, 잠재 평균, 또는
    /// 재매개변수화된 잠재 샘플을 읽는다
    pub fn classify(&self, x: &Tensor, not_hidden: bool, train: bool) -> Result<Tensor> {
        let enc = self.encode(x, not_hidden, None, false, train)?;
        match self.config.classify {
            ClassifyTap::BeforeZ => Ok(self.classifier.forward(&enc.h)?),
            ClassifyTap::Mean => Ok(self.classifier.forward(&enc.mu)?),
            ClassifyTap::Sample => {
                let z = self.reparameterize(&enc.mu, &enc.logvar)?;
                Ok(self.classifier.forward(&z)?)
            }
        }
    }

    /// 인코딩 → 재매개변수화 → 분류 → 복원 전체 경로
    pub fn forward(
        &self,
        x: &Tensor,
        gate: Option<&Tensor>,
        not_hidden: bool,
        main_rows: Option<usize>,
        with_proj: bool,
        train: bool,
    ) -> Result<ForwardOutput> {
        let enc = self.encode(x, not_hidden, main_rows, with_proj, train)?;
        let z = self.reparameterize(&enc.mu, &enc.logvar)?;
        let y_hat = match self.config.classify {
            ClassifyTap::BeforeZ => self.classifier.forward(&enc.h)?,
            ClassifyTap::Mean => self.classifier.forward(&enc.mu)?,
            ClassifyTap::Sample => self.classifier.forward(&z)?,
        };
        let x_recon = self.decode(&z, gate, train)?;
        Ok(ForwardOutput {
            x_recon,
            y_hat,
            mu: enc.mu,
            logvar: enc.logvar,
            z,
            proj: enc.proj,
        })
    }

    /// 과제별 인코더 유닛 마스크를 한 번에 생성한다. 각 과제가 각 fc
    /// 레이어에서 `prop` 비율의 유닛을 끄며, 같은 시드면 같은 마스크
    pub fn init_task_masks(&mut self, n_tasks: usize, prop: f32, seed: u64) -> Result<()> {
        if !(0.0..1.0).contains(&prop) {
            bail!("Task mask proportion must be in [0, 1), got {}", prop);
        }
        let layer_units: Vec<usize> = self.config.fc_layer_sizes()[1..].to_vec();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut masks = Vec::with_capacity(n_tasks);
        for _ in 0..n_tasks {
            let mut per_layer = Vec::with_capacity(layer_units.len());
            for &units in &layer_units {
                let mut order: Vec<usize> = (0..units).collect();
                order.shuffle(&mut rng);
                let gated = (prop * units as f32) as usize;
                let mut values = vec![1f32; units];
                for &unit in &order[..gated] {
                    values[unit] = 0.0;
                }
                per_layer.push(Tensor::from_vec(values, units, &self.device)?);
            }
            masks.push(per_layer);
        }
        self.task_masks = Some(masks);
        Ok(())
    }

    pub fn has_task_masks(&self) -> bool {
        self.task_masks.is_some()
    }

    /// 지정한 과제의 유닛 마스크를 인코더에 건다
    pub fn apply_task_mask(&mut self, task: usize) -> Result<()> {
        let masks = match &self.task_masks {
            Some(masks) => masks,
            None => bail!("Task masks were never initialized"),
        };
        if task >= masks.len() {
            bail!("Task {} out of range ({} tasks)", task, masks.len());
        }
        self.fc_e.set_unit_gates(Some(masks[task].clone()))
    }

    /// 인코더 유닛 마스크를 해제한다 (마스크 자체는 유지)
    pub fn clear_task_mask(&mut self) -> Result<()> {
        self.fc_e.set_unit_gates(None)
    }

    /// 전체 가중치를 safetensors 파일로 저장
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.varmap.save(path.as_ref())?;
        Ok(())
    }

    /// 같은 구성으로 만든 모델에 체크포인트를 적재
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.varmap.load(path.as_ref())?;
        Ok(())
    }
}
