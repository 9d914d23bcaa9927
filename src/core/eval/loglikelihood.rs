//! # 중요도 표본 주변 로그우도 추정
//!
//! 샘플마다 인코더 사후분포에서 z를 S번 뽑아
//! `log p(x) ≈ logsumexp_s[ log p(x|z_s) + log p(z_s) - log q(z_s|x) ] - ln S`
//! 를 계산한다. 관측 모델은 설정과 무관하게 단위 분산 가우시안으로 고정한다.
//! 표본은 메모리를 아끼려고 청크로 나눠 뽑으며, 마지막 청크는 나머지 크기라
//! 절대 비지 않는다.

use crate::core::config::Scenario;
use crate::core::losses::{log_normal_diag, log_normal_standard};
use crate::core::model::ReplayVae;
use crate::core::prior::ModeSelector;
use anyhow::{bail, Result};
use candle_core::Tensor;

impl ReplayVae {
    /// 샘플별 주변 로그우도 추정치. per-class 사전분포면 각 샘플의 레이블이
    /// 자기 클래스 모드를 고르고, 게이트 디코더(클래스 기준)도 레이블을 쓴다
    pub fn estimate_loglikelihood(
        &self,
        x: &Tensor,
        y: Option<&Tensor>,
        importance_samples: usize,
        chunk_size: usize,
    ) -> Result<Vec<f32>> {
        if self.config.scenario == Scenario::Task || self.config.task_gated() {
            bail!("Log-likelihood is undefined for the task scenario or task-gated decoders");
        }
        if importance_samples == 0 || chunk_size == 0 {
            bail!("Importance sample and chunk counts must be positive");
        }
        if self.config.gates.enabled && y.is_none() {
            bail!("Gated decoder needs labels to reconstruct");
        }
        let rows = x.dim(0)?;
        let z_dim = self.config.z_dim;
        let y_ids: Option<Vec<u32>> = match y {
            Some(y) => Some(y.to_vec1()?),
            None => None,
        };

        let mut out = Vec::with_capacity(rows);
        for row in 0..rows {
            let xi = x.narrow(0, row, 1)?;
            let (xi, _) = self.prepare_input(&xi, None, true, false)?;
            let enc = self.encode(&xi, false, None, false, false)?;

            let mut values = Vec::with_capacity(importance_samples);
            let mut left = importance_samples;
            while left > 0 {
                let take = chunk_size.min(left);
                let mu = enc.mu.expand((take, z_dim))?;
                let logvar = enc.logvar.expand((take, z_dim))?;
                let z = self.reparameterize(&mu, &logvar)?;

                let class_ids;
                let selector = match &y_ids {
                    Some(ids) => {
                        class_ids = Tensor::new(vec![ids[row]; take].as_slice(), &self.device)?;
                        ModeSelector::PerSampleClass(&class_ids)
                    }
                    None => ModeSelector::All,
                };
                let log_p_z = self.prior.log_density(&z, selector)?;
                let log_q_z_x = log_normal_diag(&z, &enc.mu, &enc.logvar, false)?;

                let gate = match (&y_ids, self.config.gates.enabled) {
                    (Some(ids), true) => {
                        Some(Tensor::new(vec![ids[row]; take].as_slice(), &self.device)?)
                    }
                    _ => None,
                };
                let recon = self.decode(&z, gate.as_ref(), false)?;
                let log_p_x_z = log_normal_standard(&xi, Some(&recon), false)?;

                let ll = ((log_p_x_z + log_p_z)? - log_q_z_x)?;
                values.extend(ll.to_vec1::<f32>()?);
                left -= take;
            }

            // logsumexp: 최댓값을 빼서 지수 오버플로를 피한다
            let max = values.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
            let sum: f32 = values.iter().map(|&v| (v - max).exp()).sum();
            out.push(max + sum.ln() - (importance_samples as f32).ln());

            if (row + 1) % 500 == 0 {
                println!("우도 추정 진행: {}/{}", row + 1, rows);
            }
        }
        Ok(out)
    }
}
