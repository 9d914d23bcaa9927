//! 대각 가우시안 로그밀도와 분포 간 발산

use crate::core::config::DivergenceKind;
use anyhow::Result;
use candle_core::{Tensor, D};

/// 역수 반발 손실이 무한대로 발산하지 않도록 하는 발산 하한
const DIVERGENCE_FLOOR: f64 = 1e-8;

/// 대각 가우시안 로그밀도 (정규화 상수 생략).
///
/// 마지막 차원으로 합산(또는 `average`면 평균)한다. 입력은 브로드캐스트
/// 가능하면 된다: `[batch, 1, z]` 대 `[1, modes, z]` 조합도 허용.
pub fn log_normal_diag(x: &Tensor, mean: &Tensor, logvar: &Tensor, average: bool) -> Result<Tensor> {
    let diff = x.broadcast_sub(mean)?;
    let inner = diff.sqr()?.broadcast_div(&logvar.exp()?)?;
    let log_normal = inner.broadcast_add(logvar)?.affine(-0.5, 0.0)?;
    Ok(if average {
        log_normal.mean(D::Minus1)?
    } else {
        log_normal.sum(D::Minus1)?
    })
}

/// 표준 가우시안(단위 분산) 로그밀도. `mean`이 주어지면 그 평균 기준
pub fn log_normal_standard(x: &Tensor, mean: Option<&Tensor>, average: bool) -> Result<Tensor> {
    let diff = match mean {
        Some(m) => x.broadcast_sub(m)?,
        None => x.clone(),
    };
    let log_normal = diff.sqr()?.affine(-0.5, 0.0)?;
    Ok(if average {
        log_normal.mean(D::Minus1)?
    } else {
        log_normal.sum(D::Minus1)?
    })
}

/// N(mu, exp(logvar))와 N(0, I) 사이 KL 발산의 닫힌꼴, 배치 원소별.
///
/// `-0.5 * sum(1 + logvar - mu^2 - exp(logvar))`
pub fn kl_standard(mu: &Tensor, logvar: &Tensor) -> Result<Tensor> {
    let inner = ((logvar.affine(1.0, 1.0)? - mu.sqr()?)? - logvar.exp()?)?;
    Ok(inner.sum(D::Minus1)?.affine(-0.5, 0.0)?)
}

/// KL(N_p || N_q)의 닫힌꼴, 배치 원소별
fn kl_gauss(mu_p: &Tensor, lv_p: &Tensor, mu_q: &Tensor, lv_q: &Tensor) -> Result<Tensor> {
    let ratio = (lv_p - lv_q)?.exp()?;
    let shift = ((mu_q - mu_p)?.sqr()? * lv_q.neg()?.exp()?)?;
    let inner = (((ratio + shift)? + (lv_q - lv_p)?)?.affine(1.0, -1.0))?;
    Ok(inner.sum(D::Minus1)?.affine(0.5, 0.0)?)
}

/// 두 대각 가우시안 사이 발산, 배치 원소별.
///
/// `Js`는 두 분포의 중간 혼합 `N_m`에 대한 KL 평균(대칭),
/// `Kl`은 단방향 `KL(N_1 || N_2)`.
pub fn gauss_divergence(
    mu_1: &Tensor,
    logvar_1: &Tensor,
    mu_2: &Tensor,
    logvar_2: &Tensor,
    kind: DivergenceKind,
) -> Result<Tensor> {
    match kind {
        DivergenceKind::Js => {
            let mu_m = ((mu_1 + mu_2)?.affine(0.5, 0.0))?;
            let logvar_m = ((logvar_1.exp()? + logvar_2.exp()?)?.affine(0.25, 0.0))?.log()?;
            let left = kl_gauss(mu_1, logvar_1, &mu_m, &logvar_m)?;
            let right = kl_gauss(mu_2, logvar_2, &mu_m, &logvar_m)?;
            Ok((left + right)?.affine(0.5, 0.0)?)
        }
        DivergenceKind::Kl => kl_gauss(mu_1, logvar_1, mu_2, logvar_2),
    }
}

/// 발산을 반발 손실로 뒤집는다: `1 / max(divergence, floor)`.
///
/// 두 분포가 일치하면 발산이 0이 되므로 하한을 깔고 역수를 취한다.
pub fn invert_divergence(divergence: &Tensor) -> Result<Tensor> {
    Ok(divergence.maximum(DIVERGENCE_FLOOR)?.recip()?)
}

/// SimSiam 목적: 예측과 (정지-기울기) 투영 사이 음의 코사인 유사도 평균
pub fn negative_cosine(pred: &Tensor, proj: &Tensor) -> Result<Tensor> {
    let target = proj.detach();
    let dot = (pred * &target)?.sum(D::Minus1)?;
    let pred_norm = pred.sqr()?.sum(D::Minus1)?.sqrt()?.maximum(1e-12)?;
    let target_norm = target.sqr()?.sum(D::Minus1)?.sqrt()?.maximum(1e-12)?;
    let cosine = ((dot / pred_norm)? / target_norm)?;
    Ok(cosine.mean_all()?.neg()?)
}
