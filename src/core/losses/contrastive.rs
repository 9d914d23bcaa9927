//! 지도 대조 손실 (두 뷰, 하드 네거티브 마이닝 옵션)

use anyhow::{bail, Result};
use candle_core::{DType, Tensor, D};

/// 하드 네거티브 마이닝 혼합 비율
const HARD_TAU: f64 = 0.05;

/// 대조 손실 계산 옵션
#[derive(Debug, Clone, Copy)]
pub struct ContrastiveOptions {
    /// 유사도 온도
    pub temp: f64,
    /// 정규화 기준 온도
    pub base_temp: f64,
    /// 양성 마스크를 교사 점수 유사도로 구성
    pub use_scores: bool,
    /// 음성 분배합 재가중
    pub hard_negatives: bool,
}

/// 두 뷰 투영 `[batch, 2, proj]`에 대한 지도 대조 손실 → 스칼라.
///
/// 양성 마스크는 레이블 일치(또는 점수 유사도 `s·sᵀ`)로 만들고, 자기 자신과의
/// 대비는 대각 제거 마스크로 빼낸다. 분모의 행 최댓값을 빼는 것은 수치 안정화.
pub fn supcon_loss(
    proj: &Tensor,
    labels: Option<&Tensor>,
    scores: Option<&Tensor>,
    opts: &ContrastiveOptions,
) -> Result<Tensor> {
    let (batch, n_views, _proj_units) = proj.dims3()?;
    if n_views != 2 {
        bail!("Contrastive loss expects exactly two views, got {}", n_views);
    }
    let device = proj.device();

    // [batch, 2, proj] -> [2*batch, proj] (뷰1 블록 뒤에 뷰2 블록)
    let views = proj.chunk(2, 1)?;
    let features = Tensor::cat(&[&views[0].squeeze(1)?, &views[1].squeeze(1)?], 0)?;
    let n_anchors = 2 * batch;

    // 양성 마스크 [batch, batch]
    let mask = match (opts.use_scores, scores) {
        (true, Some(s)) => s.matmul(&s.t()?)?,
        _ => {
            let y = match labels {
                Some(y) => y,
                None => bail!("Contrastive loss needs labels when score masking is off"),
            };
            if y.dims1()? != batch {
                bail!(
                    "Num of labels ({}) does not match num of features ({})",
                    y.dims1()?,
                    batch
                );
            }
            let rows = y.unsqueeze(1)?.expand((batch, batch))?;
            let cols = y.unsqueeze(0)?.expand((batch, batch))?;
            rows.eq(&cols)?.to_dtype(DType::F32)?
        }
    };

    let anchor_dot = features
        .matmul(&features.t()?)?
        .affine(1.0 / opts.temp, 0.0)?;
    let logits_max = anchor_dot.max_keepdim(D::Minus1)?.detach();
    let logits = anchor_dot.broadcast_sub(&logits_max)?;

    // 마스크 타일링 + 자기 대비 제거
    let mask = mask.repeat((2, 2))?;
    let eye = Tensor::eye(n_anchors, DType::F32, device)?;
    let logits_mask = (Tensor::ones((n_anchors, n_anchors), DType::F32, device)? - &eye)?;
    let mask = (mask * &logits_mask)?;

    let exp_logits = (logits.exp()? * &logits_mask)?;

    let log_prob = if opts.hard_negatives {
        // 음성 분배합의 상/하한: 양성 기여를 빼고 음성을 재가중한 뒤,
        // `n_neg * e^{-1/temp}` 아래로는 내려가지 못하게 막는다
        let pos_count = mask.sum(D::Minus1)?;
        let n_neg = pos_count.affine(-1.0, n_anchors as f64)?.detach();
        let neg_mask = (&logits_mask - &mask)?;
        let pos_sum = (&exp_logits * &mask)?.sum(D::Minus1)?;
        let neg_sum = (&exp_logits * &neg_mask)?.sum(D::Minus1)?;
        let ng = ((&pos_sum * &n_neg)?.affine(-HARD_TAU, 0.0)?
            + neg_sum.affine(n_anchors as f64, 0.0)?)?
        .affine(1.0 / (1.0 - HARD_TAU), 0.0)?;
        let floor = n_neg.affine((-1.0 / opts.temp).exp(), 0.0)?;
        let denominator = (ng.maximum(&floor)? + &pos_sum)?;
        logits.broadcast_sub(&denominator.log()?.unsqueeze(1)?)?
    } else {
        let denominator = exp_logits.sum_keepdim(D::Minus1)?;
        logits.broadcast_sub(&denominator.log()?)?
    };

    // 양성 위치의 로그확률 평균 (앵커별), 그 다음 전체 앵커 평균
    let mean_log_prob_pos = ((&mask * &log_prob)?.sum(D::Minus1)? / mask.sum(D::Minus1)?)?;
    let loss = mean_log_prob_pos.affine(-opts.temp / opts.base_temp, 0.0)?;
    Ok(loss.mean_all()?)
}
