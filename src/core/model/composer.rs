//! # 손실 합성기
//!
//! 전방 계산 산출물에서 조건이 맞는 손실 항들만 계산해 이름 있는 결과로
//! 돌려준다. 합성기는 합치지 않는다: 현재/리플레이 배치의 가중 합산과
//! 역전파 타이밍은 학습 스텝 오케스트레이터 몫이다. 모든 항은 샘플별 값을
//! 먼저 만들고 나서 배치 가중 평균하며, 변분·잠재 반발 항은 입력 픽셀
//! 수로 한 번 더 나눈다.

use crate::core::losses::{
    distill_loss, gauss_divergence, invert_divergence, recon_loss, supcon_loss, weighted_average,
    ContrastiveOptions,
};
use crate::core::model::autoencoder::ReplayVae;
use crate::core::prior::ModeSelector;
use anyhow::{bail, Result};
use candle_core::{DType, Tensor, D};
use candle_nn::ops::{log_softmax, softmax};

/// 잠재 분포 수준 반발/견인 한 쌍
#[derive(Debug)]
pub struct LatentPair<'a> {
    /// 자기 분포 평균 `[rows, z_dim]`
    pub mu: &'a Tensor,
    pub logvar: &'a Tensor,
    /// 상대(경쟁 클래스) 분포 평균
    pub mu_other: &'a Tensor,
    pub logvar_other: &'a Tensor,
    /// 견인이면 발산을 그대로, 반발이면 역수로 뒤집는다
    pub attract: bool,
}

/// 재구성 수준 반발/견인 한 쌍 (행 선별은 호출자가 끝낸 상태)
#[derive(Debug)]
pub struct ReconPair<'a> {
    pub target: &'a Tensor,
    pub recon: &'a Tensor,
}

/// 손실 합성기 입력. 없는 신호는 None으로 두면 해당 항이 빠진다
#[derive(Debug)]
pub struct LossInputs<'a> {
    /// 원본 입력 `[batch, units]`
    pub x: &'a Tensor,
    /// 레이블. `allowed_classes`가 있으면 그 목록 안의 지역 인덱스
    pub y: Option<&'a Tensor>,
    /// 재구성 `[batch, units]`
    pub x_recon: &'a Tensor,
    /// 분류 로짓 (허용 클래스 열로 이미 잘라낸 상태)
    pub y_hat: Option<&'a Tensor>,
    /// 이전 모델이 남긴 교사 점수
    pub scores: Option<&'a Tensor>,
    pub mu: &'a Tensor,
    pub logvar: Option<&'a Tensor>,
    pub z: &'a Tensor,
    /// 현재 활성 전역 클래스 ID 목록
    pub allowed_classes: Option<&'a [usize]>,
    /// 샘플별 손실 가중치 `[batch]`
    pub batch_weights: Option<&'a Tensor>,
    /// 대조 투영 `[batch, 2, proj_units]`
    pub proj: Option<&'a Tensor>,
    pub latent_pair: Option<LatentPair<'a>>,
    pub recon_rep: Option<ReconPair<'a>>,
    pub recon_atr: Option<ReconPair<'a>>,
}

/// 이름 있는 손실 항 묶음. 계산되지 않은 항은 None
#[derive(Debug, Default)]
pub struct LossTerms {
    /// 재구성 손실 (픽셀 평균)
    pub recon: Option<Tensor>,
    /// 변분 손실 (픽셀 수 정규화)
    pub variat: Option<Tensor>,
    /// 분류 교차 엔트로피
    pub pred: Option<Tensor>,
    /// 증류 손실
    pub distil: Option<Tensor>,
    /// 대조 손실
    pub contr: Option<Tensor>,
    /// 잠재 분포 수준 반발/견인
    pub latent_rep: Option<Tensor>,
    /// 재구성 수준 반발 (역수)
    pub recon_rep: Option<Tensor>,
    /// 재구성 수준 견인
    pub recon_atr: Option<Tensor>,
}

impl ReplayVae {
    /// 조건이 맞는 손실 항 전부를 한 번에 계산한다
    pub fn loss_function(&self, inputs: &LossInputs) -> Result<LossTerms> {
        let config = &self.config;
        let mut terms = LossTerms::default();

        // 재구성: 샘플별 픽셀 평균 후 배치 가중 평균
        let recon_each = recon_loss(config.recon, inputs.x, inputs.x_recon, true)?;
        terms.recon = Some(weighted_average(&recon_each, inputs.batch_weights)?);

        // 재구성 수준 반발: 경쟁 대표와의 재구성 손실을 역수로 (행 선별 완료 상태)
        if let Some(pair) = &inputs.recon_rep {
            let each = recon_loss(config.recon, pair.target, pair.recon, true)?;
            terms.recon_rep = Some(weighted_average(&invert_divergence(&each)?, None)?);
        }
        // 재구성 수준 견인: 같은 클래스 대표와의 재구성 손실 그대로
        if let Some(pair) = &inputs.recon_atr {
            let each = recon_loss(config.recon, pair.target, pair.recon, true)?;
            terms.recon_atr = Some(weighted_average(&each, inputs.batch_weights)?);
        }

        // 변분 손실
        if let Some(logvar) = inputs.logvar {
            let variat_each = self.variational_term(inputs, logvar)?;
            let variat = weighted_average(&variat_each, inputs.batch_weights)?;
            terms.variat = Some(variat.affine(1.0 / config.pixel_norm(), 0.0)?);
        }

        // 분류 교차 엔트로피 (잘린 로짓에 지역 인덱스)
        if let (Some(y), Some(y_hat)) = (inputs.y, inputs.y_hat) {
            let log_p = log_softmax(y_hat, D::Minus1)?;
            let picked = log_p.gather(&y.unsqueeze(1)?, 1)?.squeeze(1)?.neg()?;
            terms.pred = Some(weighted_average(&picked, inputs.batch_weights)?);
        }

        // 증류: 교사 점수가 있을 때만
        if let (Some(scores), Some(y_hat)) = (inputs.scores, inputs.y_hat) {
            terms.distil = Some(distill_loss(
                y_hat,
                scores,
                config.kd_temp as f64,
                inputs.batch_weights,
            )?);
        }

        // 대조: 레이블이 없으면 교사 점수의 argmax로 대신한다
        if let Some(proj) = inputs.proj {
            let contr = &config.contrastive;
            let opts = ContrastiveOptions {
                temp: contr.temp as f64,
                base_temp: contr.base_temp as f64,
                use_scores: contr.use_scores,
                hard_negatives: contr.hard_negatives,
            };
            let fallback;
            let labels = match (inputs.y, inputs.scores) {
                (Some(y), _) => Some(y),
                (None, Some(scores)) => {
                    fallback = scores.argmax(D::Minus1)?;
                    Some(&fallback)
                }
                (None, None) => None,
            };
            terms.contr = Some(supcon_loss(proj, labels, inputs.scores, &opts)?);
        }

        // 잠재 분포 수준 반발/견인 (픽셀 수 정규화)
        if let Some(pair) = &inputs.latent_pair {
            let div = gauss_divergence(
                pair.mu,
                pair.logvar,
                pair.mu_other,
                pair.logvar_other,
                config.repulsion.divergence,
            )?;
            let each = if pair.attract {
                div
            } else {
                invert_divergence(&div)?
            };
            let avg = weighted_average(&each, None)?;
            terms.latent_rep = Some(avg.affine(1.0 / config.pixel_norm(), 0.0)?);
        }

        Ok(terms)
    }

    /// 샘플별 변분 손실. 모드 선택 우선순위: 레이블(지역 → 전역 변환) →
    /// 교사 점수의 온도 softmax 확률 → 허용 클래스 제한 → 전체 혼합
    fn variational_term(&self, inputs: &LossInputs, logvar: &Tensor) -> Result<Tensor> {
        match (inputs.y, inputs.scores) {
            (Some(y), _) => {
                let global = match inputs.allowed_classes {
                    Some(allowed) => {
                        let y_vec = y.to_vec1::<u32>()?;
                        let mut ids = Vec::with_capacity(y_vec.len());
                        for &local in &y_vec {
                            if local as usize >= allowed.len() {
                                bail!(
                                    "Label {} outside the {} allowed classes",
                                    local,
                                    allowed.len()
                                );
                            }
                            ids.push(allowed[local as usize] as u32);
                        }
                        Tensor::from_vec(ids, y_vec.len(), y.device())?
                    }
                    None => y.clone(),
                };
                self.prior.variational_loss(
                    inputs.z,
                    inputs.mu,
                    logvar,
                    ModeSelector::PerSampleClass(&global),
                )
            }
            (None, Some(scores)) if self.prior.is_gmm() => {
                // 교사 점수를 증류 온도로 누른 클래스 확률. 점수 폭이 허용
                // 클래스 수보다 좁으면 오른쪽을 0으로 채운다
                let (batch, width) = scores.dims2()?;
                let target = match inputs.allowed_classes {
                    Some(allowed) => allowed.len(),
                    None => self.config.classes,
                };
                if width > target {
                    bail!(
                        "Teacher scores cover {} classes but only {} are allowed",
                        width,
                        target
                    );
                }
                let mut probs = softmax(
                    &scores.affine(1.0 / self.config.kd_temp as f64, 0.0)?,
                    D::Minus1,
                )?;
                if width < target {
                    let pad = Tensor::zeros((batch, target - width), DType::F32, scores.device())?;
                    probs = Tensor::cat(&[&probs, &pad], 1)?;
                }
                self.prior.variational_loss(
                    inputs.z,
                    inputs.mu,
                    logvar,
                    ModeSelector::ClassProbs {
                        probs: &probs,
                        allowed_classes: inputs.allowed_classes,
                    },
                )
            }
            _ => {
                let selector = match inputs.allowed_classes {
                    Some(allowed) => ModeSelector::Classes(allowed),
                    None => ModeSelector::All,
                };
                self.prior
                    .variational_loss(inputs.z, inputs.mu, logvar, selector)
            }
        }
    }
}
