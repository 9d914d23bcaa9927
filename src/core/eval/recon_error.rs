//! # 재구성 오차 평가
//!
//! 각 샘플의 잠재 평균을 그대로 복호화했을 때의 재구성 오차를 샘플별로
//! 돌려준다. 과제 시나리오와 과제 게이트 디코더는 평가 시점에 어느
//! head/게이트를 쓸지 정해지지 않아 지원하지 않는다.

use crate::core::config::Scenario;
use crate::core::losses::recon_loss;
use crate::core::model::ReplayVae;
use anyhow::{bail, Result};
use candle_core::Tensor;

impl ReplayVae {
    /// 샘플별 재구성 오차 `[n]`. `average`면 픽셀 평균, 아니면 픽셀 합.
    /// 게이트 디코더(클래스 기준)는 레이블 `y`가 있어야 한다
    pub fn calculate_recon_error(
        &self,
        x: &Tensor,
        y: Option<&Tensor>,
        batch_size: usize,
        average: bool,
    ) -> Result<Tensor> {
        if self.config.scenario == Scenario::Task || self.config.task_gated() {
            bail!("Reconstruction error is undefined for the task scenario or task-gated decoders");
        }
        if batch_size == 0 {
            bail!("Batch size must be positive");
        }
        let rows = x.dim(0)?;
        let mut per_sample = Vec::new();
        let mut start = 0;
        while start < rows {
            let take = batch_size.min(rows - start);
            let chunk = x.narrow(0, start, take)?;
            let (chunk, _) = self.prepare_input(&chunk, None, true, false)?;
            let enc = self.encode(&chunk, false, None, false, false)?;
            let gate = match (self.config.gates.enabled, y) {
                (false, _) => None,
                (true, Some(y)) => Some(y.narrow(0, start, take)?),
                (true, None) => bail!("Gated decoder needs labels to reconstruct"),
            };
            let recon = self.decode(&enc.mu, gate.as_ref(), false)?;
            per_sample.push(recon_loss(self.config.recon, &chunk, &recon, average)?);
            start += take;
        }
        Ok(Tensor::cat(&per_sample, 0)?.detach())
    }
}
