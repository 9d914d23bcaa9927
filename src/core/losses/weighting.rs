//! 배치 가중 평균과 분류 정밀도

use anyhow::{bail, Result};
use candle_core::{DType, Tensor, D};

/// `[batch]` 텐서의 가중 평균 → 스칼라.
///
/// 가중치가 없으면 단순 평균, 있으면 가중치를 합 1로 정규화해 내적한다.
pub fn weighted_average(values: &Tensor, weights: Option<&Tensor>) -> Result<Tensor> {
    match weights {
        None => Ok(values.mean_all()?),
        Some(w) => {
            if w.dims() != values.dims() {
                bail!(
                    "Batch weights shape {:?} does not match values shape {:?}",
                    w.dims(),
                    values.dims()
                );
            }
            let normalized = w.broadcast_div(&w.sum_all()?)?;
            Ok((values * normalized)?.sum_all()?)
        }
    }
}

/// 현재 배치 분류 정밀도: argmax(logits) == y 비율
pub fn precision(logits: &Tensor, y: &Tensor) -> Result<f32> {
    let predicted = logits.argmax(D::Minus1)?;
    let hits = predicted.eq(y)?.to_dtype(DType::F32)?;
    Ok(hits.mean_all()?.to_scalar::<f32>()?)
}
