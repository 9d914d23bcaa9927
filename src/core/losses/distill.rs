//! 지식 증류 손실

use crate::core::losses::weighting::weighted_average;
use anyhow::{bail, Result};
use candle_core::{DType, Tensor, D};
use candle_nn::ops::{log_softmax, softmax};

/// 온도 스케일 증류 손실 (스칼라).
///
/// 교사 점수를 온도 `temp`로 soft하게 만든 분포와 학생 로짓의
/// log-softmax를 교차 엔트로피로 비교한다. 교사 점수가 학생 헤드보다
/// 좁으면 softmax 이후 오른쪽을 0으로 채우고, 전체를 `temp^2`로 되돌린다.
pub fn distill_loss(
    logits: &Tensor,
    target_scores: &Tensor,
    temp: f64,
    weights: Option<&Tensor>,
) -> Result<Tensor> {
    let (batch, n_classes) = logits.dims2()?;
    let (target_batch, target_classes) = target_scores.dims2()?;
    if batch != target_batch {
        bail!(
            "Teacher scores batch {} does not match logits batch {}",
            target_batch,
            batch
        );
    }
    if target_classes > n_classes {
        bail!(
            "Teacher scores cover {} classes but the student head only has {}",
            target_classes,
            n_classes
        );
    }

    let log_scores_norm = log_softmax(&logits.affine(1.0 / temp, 0.0)?, D::Minus1)?;
    let mut targets_norm = softmax(&target_scores.affine(1.0 / temp, 0.0)?, D::Minus1)?;
    if target_classes < n_classes {
        let pad = Tensor::zeros(
            (batch, n_classes - target_classes),
            DType::F32,
            logits.device(),
        )?;
        targets_norm = Tensor::cat(&[&targets_norm, &pad], 1)?;
    }

    let kd_per_sample = (targets_norm * log_scores_norm)?.sum(D::Minus1)?.neg()?;
    let kd = weighted_average(&kd_per_sample, weights)?;
    Ok(kd.affine(temp * temp, 0.0)?)
}
