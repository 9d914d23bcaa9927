//! # 경쟁 클래스 반발/견인 행 조립
//!
//! 리플레이 배치의 `top_classes` 행렬(0열: 자기 클래스, 1열: 이전 모델이
//! 헷갈려한 경쟁 클래스)에서 반발/견인 손실에 들어갈 행을 골라낸다.
//! 교사 확률 문턱이 주어지면 경쟁 클래스 확률이 문턱을 넘는 행만 남기고,
//! 경쟁 클래스 대표가 배치 안에 없는 행은 재구성 반발에서 뺀다. 잠재 수준
//! 손실의 경쟁 분포는 사전분포 모드 통계라서 대표가 없어도 항상 만들 수 있다.

use crate::core::config::Representative;
use crate::core::model::ReplayVae;
use crate::core::sampler::SampleSelector;
use anyhow::{bail, Result};
use candle_core::{Device, Tensor, D};
use candle_nn::ops::softmax;
use rand::rngs::ThreadRng;
use rand::{thread_rng, Rng};
use std::collections::HashMap;

/// 잠재 수준 반발 입력. 같은 행 순서로 자기 분포와 경쟁 사전분포가 짝을 이룬다
#[derive(Debug)]
pub(crate) struct LatentRows {
    pub mu: Tensor,
    pub logvar: Tensor,
    pub mu_other: Tensor,
    pub logvar_other: Tensor,
}

/// 선별이 끝난 반발/견인 입력. None인 쪽은 조건이 안 맞아 빠진 것
#[derive(Debug, Default)]
pub(crate) struct RepulsionData {
    pub latent: Option<LatentRows>,
    /// (경쟁 클래스 대표 입력, 남은 행의 재구성)
    pub recon_rep: Option<(Tensor, Tensor)>,
    /// (자기 클래스 대표 입력, 전체 행의 재구성)
    pub recon_atr: Option<(Tensor, Tensor)>,
}

/// 클래스 ID → 그 클래스에 속한 행 인덱스 목록
pub(crate) fn group_by_class(ids: &[u32]) -> HashMap<u32, Vec<usize>> {
    let mut groups: HashMap<u32, Vec<usize>> = HashMap::new();
    for (row, &id) in ids.iter().enumerate() {
        groups.entry(id).or_default().push(row);
    }
    groups
}

/// 클래스마다 대표 행 하나를 정해 `[1, units]`로 돌려준다.
/// 무작위 정책도 클래스당 한 번만 뽑아 그 스텝 안에서는 재사용한다
fn representatives(
    x: &Tensor,
    groups: &HashMap<u32, Vec<usize>>,
    policy: Representative,
    rng: &mut ThreadRng,
) -> Result<HashMap<u32, Tensor>> {
    let mut reps = HashMap::with_capacity(groups.len());
    for (&class_id, rows) in groups {
        let rep = match policy {
            Representative::Random => {
                let pick = rows[rng.gen_range(0..rows.len())];
                x.narrow(0, pick, 1)?
            }
            Representative::Mean => select_rows(x, rows, x.device())?.mean_keepdim(0)?,
        };
        reps.insert(class_id, rep);
    }
    Ok(reps)
}

fn select_rows(t: &Tensor, rows: &[usize], device: &Device) -> Result<Tensor> {
    let ids: Vec<u32> = rows.iter().map(|&row| row as u32).collect();
    let index = Tensor::new(ids.as_slice(), device)?;
    Ok(t.index_select(&index, 0)?)
}

impl ReplayVae {
    /// 리플레이 행들에서 반발/견인 손실 입력을 조립한다. 설정에서 반발류
    /// 손실이 모두 꺼져 있거나 문턱을 넘는 행이 없으면 None
    pub(crate) fn assemble_repulsion(
        &self,
        x: &Tensor,
        recon: &Tensor,
        mu: &Tensor,
        logvar: &Tensor,
        top_classes: &Tensor,
        scores: Option<&Tensor>,
        threshold: Option<f32>,
    ) -> Result<Option<RepulsionData>> {
        let flags = &self.config.repulsion;
        if !(flags.latent || flags.recon_repulsion || flags.recon_attraction) {
            return Ok(None);
        }
        let (rows, cols) = top_classes.dims2()?;
        if cols < 2 {
            bail!("Competing-class matrix needs at least two columns, got {}", cols);
        }
        let own: Vec<u32> = top_classes.narrow(1, 0, 1)?.squeeze(1)?.to_vec1()?;
        let competing: Vec<u32> = top_classes.narrow(1, 1, 1)?.squeeze(1)?.to_vec1()?;

        // 교사 확률 문턱: 경쟁 클래스 확률이 문턱 이하인 행은 반발이 불필요
        let kept: Vec<usize> = match (threshold, scores) {
            (Some(threshold), Some(scores)) => {
                let probs: Vec<Vec<f32>> = softmax(scores, D::Minus1)?.to_vec2()?;
                let width = probs.first().map_or(0, |row| row.len());
                let mut kept = Vec::with_capacity(rows);
                for (row, &class_id) in competing.iter().enumerate() {
                    if class_id as usize >= width {
                        bail!(
                            "Competing class {} outside the {}-wide replay scores",
                            class_id,
                            width
                        );
                    }
                    if probs[row][class_id as usize] > threshold {
                        kept.push(row);
                    }
                }
                kept
            }
            _ => (0..rows).collect(),
        };
        if kept.is_empty() {
            return Ok(None);
        }

        let device = &self.device;
        let mut data = RepulsionData::default();

        if flags.latent {
            let competing_kept: Vec<u32> = kept.iter().map(|&row| competing[row]).collect();
            let (mu_other, logvar_other) = self.sample_latent_stats(
                competing_kept.len(),
                &SampleSelector::SpecificClasses(&competing_kept),
            )?;
            data.latent = Some(LatentRows {
                mu: select_rows(mu, &kept, device)?,
                logvar: select_rows(logvar, &kept, device)?,
                mu_other,
                logvar_other,
            });
        }

        if flags.recon_repulsion || flags.recon_attraction {
            let mut rng = thread_rng();
            let groups = group_by_class(&own);
            let reps = representatives(x, &groups, flags.representative, &mut rng)?;

            if flags.recon_repulsion {
                let with_rep: Vec<usize> = kept
                    .iter()
                    .copied()
                    .filter(|&row| reps.contains_key(&competing[row]))
                    .collect();
                if !with_rep.is_empty() {
                    let mut targets = Vec::with_capacity(with_rep.len());
                    for &row in &with_rep {
                        if let Some(rep) = reps.get(&competing[row]) {
                            targets.push(rep.clone());
                        }
                    }
                    data.recon_rep = Some((
                        Tensor::cat(&targets, 0)?,
                        select_rows(recon, &with_rep, device)?,
                    ));
                }
            }

            if flags.recon_attraction {
                let mut targets = Vec::with_capacity(own.len());
                for class_id in &own {
                    match reps.get(class_id) {
                        Some(rep) => targets.push(rep.clone()),
                        None => bail!("Class {} missing from its own batch grouping", class_id),
                    }
                }
                data.recon_atr = Some((Tensor::cat(&targets, 0)?, recon.clone()));
            }
        }

        Ok(Some(data))
    }
}
