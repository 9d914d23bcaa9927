//! # 리플레이 표본 추출
//!
//! 사전분포에서 잠재 변수를 뽑고 평가 모드 디코더로 되돌려 의사 샘플을
//! 만든다. GMM 사전분포면 먼저 모드를 고른다: 클래스별 모드 구간을 가진
//! 사전분포에서 샘플별 클래스를 지정하면 그 클래스 구간 안의 무작위
//! 모드에서 뽑고, 내놓는 클래스 레이블은 요청한 클래스와 정확히 일치한다.
//! 출력은 전부 계산 그래프에서 분리된 상태다.

use crate::core::config::{GateBy, Scenario};
use crate::core::model::ReplayVae;
use anyhow::{bail, Result};
use candle_core::Tensor;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::ThreadRng;
use rand::{thread_rng, Rng};

/// 표본 추출 시 모드/클래스 선택 방법
#[derive(Debug, Clone, Copy)]
pub enum SampleSelector<'a> {
    /// 모든 모드에서 균등
    Free,
    /// 허용 클래스 목록에서, 선택적으로 클래스 확률 가중
    AllowedClasses {
        classes: &'a [usize],
        probs: Option<&'a [f32]>,
    },
    /// 지정한 모드 하나에서 전부
    Mode(usize),
    /// 샘플별 지정 클래스 (각자 자기 클래스 구간 안의 무작위 모드)
    SpecificClasses(&'a [u32]),
}

/// 생성된 표본 묶음
#[derive(Debug)]
pub struct SampleOutput {
    /// 생성 데이터. 픽셀 수준이면 `[count, ch, size, size]`,
    /// 은닉 수준이면 `[count, extract_units]`
    pub x: Tensor,
    /// 샘플별 의도한 클래스 ID
    pub y_used: Option<Tensor>,
    /// 디코더 과제 게이트에 쓴 과제 ID
    pub tasks_used: Option<Tensor>,
}

impl ReplayVae {
    /// `count`개의 의사 샘플을 생성한다. `allowed_domains`는 도메인
    /// 시나리오의 과제 게이트 선택에만 쓰인다
    pub fn sample(
        &self,
        count: usize,
        selector: &SampleSelector,
        allowed_domains: Option<&[usize]>,
    ) -> Result<SampleOutput> {
        let config = &self.config;
        let mut rng = thread_rng();

        // 잠재 표본과 의도한 클래스
        let (z, mut y_used): (Tensor, Option<Vec<u32>>) = if self.prior.is_gmm() {
            let (modes, y) = self.pick_modes(count, selector, &mut rng)?;
            let (means, logvars) = self.prior.mode_stats(&modes, config.z_dim, &self.device)?;
            let z = self.reparameterize(&means.detach(), &logvars.detach())?;
            (z, y)
        } else {
            let z = Tensor::randn(0f32, 1f32, (count, config.z_dim), &self.device)?;
            match selector {
                SampleSelector::SpecificClasses(classes) => {
                    check_specific(classes, count, config.classes)?;
                    (z, Some(classes.to_vec()))
                }
                _ => (z, None),
            }
        };

        // 게이트가 클래스를 요구하는데 아직 없으면 여기서 뽑는다
        if y_used.is_none() && config.gates.enabled {
            y_used = Some(match selector {
                SampleSelector::AllowedClasses { classes, probs } => {
                    pick_classes(classes, *probs, count, config.classes, &mut rng)?
                }
                _ => (0..count)
                    .map(|_| rng.gen_range(0..config.classes) as u32)
                    .collect(),
            });
        }

        // 과제 게이트면 클래스를 과제로 바꾸거나 (도메인) 과제를 직접 뽑는다
        let tasks_used: Option<Vec<u32>> = if config.task_gated() {
            let gate_size = config.gate_size();
            Some(match config.scenario {
                Scenario::Domain => match allowed_domains {
                    Some(domains) => {
                        if domains.is_empty() {
                            bail!("allowed_domains must not be empty");
                        }
                        for &d in domains {
                            if d >= gate_size {
                                bail!("Domain {} out of range ({} gates)", d, gate_size);
                            }
                        }
                        (0..count)
                            .map(|_| domains[rng.gen_range(0..domains.len())] as u32)
                            .collect()
                    }
                    None => (0..count)
                        .map(|_| rng.gen_range(0..gate_size) as u32)
                        .collect(),
                },
                _ => {
                    let per_task = config.classes_per_task();
                    if per_task == 0 {
                        bail!("Task gating needs at least one class per task");
                    }
                    match &y_used {
                        Some(classes) => {
                            classes.iter().map(|&c| c / per_task as u32).collect()
                        }
                        None => bail!("Task gating needs sampled classes to derive tasks"),
                    }
                }
            })
        } else {
            None
        };

        // 평가 모드 복원 후 그래프 분리
        let gate_ids = if config.gates.enabled {
            match config.gates.by {
                GateBy::Task => tasks_used.as_ref(),
                GateBy::Class => y_used.as_ref(),
            }
        } else {
            None
        };
        let gate = match gate_ids {
            Some(ids) => Some(Tensor::new(ids.as_slice(), &self.device)?),
            None => None,
        };
        let x = self.decode(&z, gate.as_ref(), false)?.detach();
        let x = if config.hidden {
            x
        } else {
            x.reshape((
                count,
                config.image_channels,
                config.image_size,
                config.image_size,
            ))?
        };

        Ok(SampleOutput {
            x,
            y_used: match y_used {
                Some(ids) => Some(Tensor::new(ids.as_slice(), &self.device)?),
                None => None,
            },
            tasks_used: match tasks_used {
                Some(ids) => Some(Tensor::new(ids.as_slice(), &self.device)?),
                None => None,
            },
        })
    }

    /// 표본 대신 선택된 모드들의 사전분포 통계 `(means, logvars)`를 돌려준다.
    /// 잠재 반발 손실의 경쟁 클래스 쪽 입력이며, 사전분포 파라미터로
    /// 기울기가 흐르도록 그래프를 끊지 않는다
    pub fn sample_latent_stats(
        &self,
        count: usize,
        selector: &SampleSelector,
    ) -> Result<(Tensor, Tensor)> {
        if !self.prior.is_gmm() {
            bail!("Latent mode statistics need a GMM prior");
        }
        let mut rng = thread_rng();
        let (modes, _) = self.pick_modes(count, selector, &mut rng)?;
        self.prior.mode_stats(&modes, self.config.z_dim, &self.device)
    }

    /// GMM 모드 선택. 반환: (샘플별 모드, 샘플별 의도 클래스)
    fn pick_modes(
        &self,
        count: usize,
        selector: &SampleSelector,
        rng: &mut ThreadRng,
    ) -> Result<(Vec<u32>, Option<Vec<u32>>)> {
        let config = &self.config;
        let total = self.prior.total_modes();
        let mpc = config.modes_per_class();
        let per_class = mpc > 0;

        match selector {
            SampleSelector::SpecificClasses(classes) => {
                if !per_class {
                    bail!("Per-sample classes need a per-class prior");
                }
                check_specific(classes, count, config.classes)?;
                let modes = classes
                    .iter()
                    .map(|&c| c * mpc as u32 + rng.gen_range(0..mpc) as u32)
                    .collect();
                Ok((modes, Some(classes.to_vec())))
            }
            SampleSelector::Mode(mode) => {
                if *mode >= total {
                    bail!("Mode {} out of range ({} modes)", mode, total);
                }
                let modes = vec![*mode as u32; count];
                let y = per_class.then(|| vec![(*mode / mpc) as u32; count]);
                Ok((modes, y))
            }
            SampleSelector::AllowedClasses { classes, probs } if per_class => {
                if classes.is_empty() {
                    bail!("Allowed class list must not be empty");
                }
                let mut allowed_modes = Vec::with_capacity(classes.len() * mpc);
                let mut mode_weights = Vec::with_capacity(classes.len() * mpc);
                for (index, &class_id) in classes.iter().enumerate() {
                    if class_id >= config.classes {
                        bail!("Class {} out of range ({} classes)", class_id, config.classes);
                    }
                    for mode in class_id * mpc..(class_id + 1) * mpc {
                        allowed_modes.push(mode as u32);
                        if let Some(p) = probs {
                            if p.len() != classes.len() {
                                bail!(
                                    "Class probabilities ({}) do not match allowed classes ({})",
                                    p.len(),
                                    classes.len()
                                );
                            }
                            mode_weights.push(p[index]);
                        }
                    }
                }
                let modes: Vec<u32> = if probs.is_some() {
                    let dist = WeightedIndex::new(&mode_weights)?;
                    (0..count)
                        .map(|_| allowed_modes[dist.sample(rng)])
                        .collect()
                } else {
                    (0..count)
                        .map(|_| allowed_modes[rng.gen_range(0..allowed_modes.len())])
                        .collect()
                };
                let y = modes.iter().map(|&m| m / mpc as u32).collect();
                Ok((modes, Some(y)))
            }
            // 자유 표본(또는 클래스 구간이 없는 혼합)은 전체 모드에서 균등
            _ => {
                let modes: Vec<u32> = (0..count)
                    .map(|_| rng.gen_range(0..total) as u32)
                    .collect();
                let y = per_class.then(|| modes.iter().map(|&m| m / mpc as u32).collect());
                Ok((modes, y))
            }
        }
    }
}

fn check_specific(classes: &[u32], count: usize, n_classes: usize) -> Result<()> {
    if classes.len() != count {
        bail!(
            "Requested {} samples but {} per-sample classes",
            count,
            classes.len()
        );
    }
    for &c in classes {
        if c as usize >= n_classes {
            bail!("Class {} out of range ({} classes)", c, n_classes);
        }
    }
    Ok(())
}

fn pick_classes(
    classes: &[usize],
    probs: Option<&[f32]>,
    count: usize,
    n_classes: usize,
    rng: &mut ThreadRng,
) -> Result<Vec<u32>> {
    if classes.is_empty() {
        bail!("Allowed class list must not be empty");
    }
    for &c in classes {
        if c >= n_classes {
            bail!("Class {} out of range ({} classes)", c, n_classes);
        }
    }
    match probs {
        Some(p) => {
            if p.len() != classes.len() {
                bail!(
                    "Class probabilities ({}) do not match allowed classes ({})",
                    p.len(),
                    classes.len()
                );
            }
            let dist = WeightedIndex::new(p)?;
            Ok((0..count).map(|_| classes[dist.sample(rng)] as u32).collect())
        }
        None => Ok((0..count)
            .map(|_| classes[rng.gen_range(0..classes.len())] as u32)
            .collect()),
    }
}
