//! # 잠재 사전분포
//!
//! 표준 정규분포 또는 학습 가능한 가우시안 혼합(GMM). GMM은 `per_class`일 때
//! 클래스 `c`가 모드 구간 `[c*modes_per_class, (c+1)*modes_per_class)`를
//! 배타적으로 소유한다.

use crate::core::config::{PriorKind, VaeConfig};
use crate::core::losses::{kl_standard, log_normal_diag, log_normal_standard};
use anyhow::{bail, Result};
use candle_core::{Tensor, D};
use candle_nn::{Init, VarBuilder};

/// 혼합 밀도가 log에서 -inf로 떨어지지 않게 하는 바닥값
const MIX_FLOOR: f64 = 1e-40;

/// 밀도 평가 시 혼합에 포함할 모드 선택
#[derive(Debug, Clone, Copy)]
pub enum ModeSelector<'a> {
    /// 모든 모드를 균등 혼합
    All,
    /// 허용된 클래스들의 모드 부분구간 합집합 (per_class가 아니면 All과 동일)
    Classes(&'a [usize]),
    /// 샘플별 전역 클래스의 모드만 사용. `u32 [batch]`
    PerSampleClass(&'a Tensor),
    /// 샘플별 클래스 확률로 가중 혼합. `probs`: `[batch, n_classes_sel]`
    ClassProbs {
        probs: &'a Tensor,
        allowed_classes: Option<&'a [usize]>,
    },
}

/// 가우시안 혼합 사전분포의 학습 파라미터
#[derive(Debug, Clone)]
pub struct GmmParams {
    /// 모드 평균 `[total_modes, z_dim]`
    means: Tensor,
    /// 모드 로그분산 `[total_modes, z_dim]`
    logvars: Tensor,
    total_modes: usize,
    /// per_class가 아니면 0
    modes_per_class: usize,
}

/// 잠재 사전분포
#[derive(Debug, Clone)]
pub enum Prior {
    Standard,
    Gmm(GmmParams),
}

impl Prior {
    /// 설정에 따라 사전분포 구성. GMM 모드 파라미터는 `prior.*` 이름으로
    /// VarMap에 등록되어 주 옵티마이저가 함께 학습한다.
    pub fn new(config: &VaeConfig, vb: VarBuilder) -> Result<Self> {
        match config.prior.kind {
            PriorKind::Standard => Ok(Prior::Standard),
            PriorKind::Gmm => {
                let total_modes = config.total_modes();
                let means = vb.get_with_hints(
                    (total_modes, config.z_dim),
                    "means",
                    Init::Randn {
                        mean: 0.0,
                        stdev: 1.0,
                    },
                )?;
                let logvars = vb.get_with_hints(
                    (total_modes, config.z_dim),
                    "logvars",
                    Init::Randn {
                        mean: 0.0,
                        stdev: 1.0,
                    },
                )?;
                Ok(Prior::Gmm(GmmParams {
                    means,
                    logvars,
                    total_modes,
                    modes_per_class: config.modes_per_class(),
                }))
            }
        }
    }

    pub fn is_gmm(&self) -> bool {
        matches!(self, Prior::Gmm(_))
    }

    /// 전체 모드 수 (표준 사전분포는 1로 취급)
    pub fn total_modes(&self) -> usize {
        match self {
            Prior::Standard => 1,
            Prior::Gmm(p) => p.total_modes,
        }
    }

    /// 선택된 모드들의 (평균, 로그분산) 행. 표준 사전분포는 N(0, I) 통계
    pub fn mode_stats(&self, modes: &[u32], z_dim: usize, device: &candle_core::Device) -> Result<(Tensor, Tensor)> {
        match self {
            Prior::Standard => {
                let zeros = Tensor::zeros((modes.len(), z_dim), candle_core::DType::F32, device)?;
                Ok((zeros.clone(), zeros))
            }
            Prior::Gmm(p) => {
                for &m in modes {
                    if m as usize >= p.total_modes {
                        bail!("Mode index {} out of range ({} modes)", m, p.total_modes);
                    }
                }
                let idx = Tensor::new(modes, device)?;
                let means = p.means.index_select(&idx, 0)?;
                let logvars = p.logvars.index_select(&idx, 0)?;
                Ok((means, logvars))
            }
        }
    }

    /// 샘플별 로그밀도 `log p(z)` → `[batch]`
    pub fn log_density(&self, z: &Tensor, selector: ModeSelector) -> Result<Tensor> {
        match self {
            Prior::Standard => Ok(log_normal_standard(z, None, false)?),
            Prior::Gmm(p) => gmm_log_density(p, z, selector),
        }
    }

    /// 샘플별 변분 손실.
    ///
    /// 표준 사전분포는 닫힌꼴 KL, GMM은 중요도 추정
    /// `-(log p(z) - log q(z|x))`를 쓴다.
    pub fn variational_loss(
        &self,
        z: &Tensor,
        mu: &Tensor,
        logvar: &Tensor,
        selector: ModeSelector,
    ) -> Result<Tensor> {
        match self {
            Prior::Standard => kl_standard(mu, logvar),
            Prior::Gmm(_) => {
                let log_p_z = self.log_density(z, selector)?;
                let log_q_z_x = log_normal_diag(z, mu, logvar, false)?;
                Ok((log_q_z_x - log_p_z)?)
            }
        }
    }
}

/// 클래스 목록의 모드 부분구간 합집합 (클래스 순서대로, 구간 내부도 오름차순)
fn class_mode_rows(classes: &[usize], modes_per_class: usize) -> Vec<u32> {
    let mut rows = Vec::with_capacity(classes.len() * modes_per_class);
    for &class_id in classes {
        for m in class_id * modes_per_class..(class_id + 1) * modes_per_class {
            rows.push(m as u32);
        }
    }
    rows
}

fn gmm_log_density(p: &GmmParams, z: &Tensor, selector: ModeSelector) -> Result<Tensor> {
    let device = z.device();
    let (batch, _z_dim) = z.dims2()?;
    let mpc = p.modes_per_class;

    // 혼합에 올릴 모드 행렬 선택
    let restrict_to = match selector {
        ModeSelector::Classes(classes) if mpc > 0 => Some(class_mode_rows(classes, mpc)),
        ModeSelector::ClassProbs {
            allowed_classes: Some(classes),
            ..
        } if mpc > 0 => Some(class_mode_rows(classes, mpc)),
        _ => None,
    };
    let (means, logvars, selected) = match &restrict_to {
        Some(rows) => {
            for &m in rows {
                if m as usize >= p.total_modes {
                    bail!("Class mode {} out of range ({} modes)", m, p.total_modes);
                }
            }
            let idx = Tensor::new(rows.as_slice(), device)?;
            (
                p.means.index_select(&idx, 0)?,
                p.logvars.index_select(&idx, 0)?,
                rows.len(),
            )
        }
        None => (p.means.clone(), p.logvars.clone(), p.total_modes),
    };

    // 모드별 로그밀도 [batch, n_modes] - ln(혼합 크기)
    let per_sample_class = mpc > 0
        && matches!(
            selector,
            ModeSelector::PerSampleClass(_) | ModeSelector::ClassProbs { .. }
        );
    let n_eff = if per_sample_class { mpc } else { selected };
    let a = log_normal_diag(
        &z.unsqueeze(1)?,
        &means.unsqueeze(0)?,
        &logvars.unsqueeze(0)?,
        false,
    )?
    .affine(1.0, -(n_eff as f64).ln())?;

    // 샘플별 클래스가 주어지면 그 클래스 모드 열만 남김
    let a = match selector {
        ModeSelector::PerSampleClass(y) if mpc > 0 => {
            let y_vec = y.to_vec1::<u32>()?;
            if y_vec.len() != batch {
                bail!("Class vector length {} does not match batch {}", y_vec.len(), batch);
            }
            let mut rows = Vec::with_capacity(batch * mpc);
            for &class_id in &y_vec {
                if (class_id as usize + 1) * mpc > p.total_modes {
                    bail!("Class {} has no mode range ({} modes)", class_id, p.total_modes);
                }
                for m in class_id as usize * mpc..(class_id as usize + 1) * mpc {
                    rows.push(m as u32);
                }
            }
            let idx = Tensor::from_vec(rows, (batch, mpc), device)?;
            a.gather(&idx, 1)?
        }
        _ => a,
    };

    // log-sum-exp: 행 최댓값을 빼고 지수합 후 되돌림, 합에는 바닥값
    let a_max = a.max_keepdim(D::Minus1)?;
    let a_exp = a.broadcast_sub(&a_max)?.exp()?;
    let mixed = match selector {
        ModeSelector::ClassProbs { probs, .. } if mpc > 0 => {
            let (probs_batch, n_classes_sel) = probs.dims2()?;
            if probs_batch != batch {
                bail!("Class probabilities batch {} does not match batch {}", probs_batch, batch);
            }
            if n_classes_sel * mpc != a_exp.dim(1)? {
                bail!(
                    "Class probabilities cover {} classes but the mixture has {} modes",
                    n_classes_sel,
                    a_exp.dim(1)?
                );
            }
            // 클래스 확률을 그 클래스의 모드 수만큼 반복해 모드별 가중치로
            let mode_probs = probs
                .unsqueeze(2)?
                .expand((batch, n_classes_sel, mpc))?
                .reshape((batch, n_classes_sel * mpc))?;
            (a_exp * mode_probs)?.sum(D::Minus1)?
        }
        _ => a_exp.sum(D::Minus1)?,
    };
    let logsum = mixed.maximum(MIX_FLOOR)?.log()?;
    Ok((logsum + a_max.squeeze(D::Minus1)?)?)
}
