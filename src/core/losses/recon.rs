//! 재구성 손실 (픽셀별 BCE 또는 가우시안 NLL)

use crate::core::config::ReconKind;
use crate::core::losses::gaussian::log_normal_standard;
use anyhow::{bail, Result};
use candle_core::Tensor;

/// log(0) 방지용 확률 클램프
const BCE_EPS: f64 = 1e-7;

/// 배치 원소별 재구성 손실.
///
/// 입력과 재구성은 `[batch, units]` 모양이어야 하며, `average`면 픽셀 차원을
/// 평균으로 줄이고 아니면 합으로 줄인다. 배치 평균은 호출자 몫.
pub fn recon_loss(kind: ReconKind, x: &Tensor, x_recon: &Tensor, average: bool) -> Result<Tensor> {
    if x.dims() != x_recon.dims() {
        bail!(
            "Reconstruction shape {:?} does not match input shape {:?}",
            x_recon.dims(),
            x.dims()
        );
    }
    match kind {
        ReconKind::Bce => bce_per_sample(x, x_recon, average),
        ReconKind::GaussianNll => Ok(log_normal_standard(x, Some(x_recon), average)?.neg()?),
    }
}

fn bce_per_sample(x: &Tensor, x_recon: &Tensor, average: bool) -> Result<Tensor> {
    let r = x_recon.clamp(BCE_EPS, 1.0 - BCE_EPS)?;
    let pos = (x * r.log()?)?;
    let neg = (x.affine(-1.0, 1.0)? * r.affine(-1.0, 1.0)?.log()?)?;
    let bce = (pos + neg)?.neg()?;
    Ok(if average {
        bce.mean(candle_core::D::Minus1)?
    } else {
        bce.sum(candle_core::D::Minus1)?
    })
}
