//! # 학습 스텝 오케스트레이터
//!
//! 현재 과제 배치와 리플레이 배치를 한 스텝에 합쳐 처리한다. 현재 손실은
//! `rnt`, 리플레이 손실은 `1 - rnt` 비중으로 섞고, 과제 마스크가 걸린
//! 모델에서는 각 조각을 자기 마스크가 활성인 동안 즉시 역전파해 기울기를
//! 누산한 뒤 마지막에 한 번만 스텝을 밟는다. 대조 학습이 켜져 있으면
//! 인코더 전용 옵티마이저가 먼저 움직이고 주 옵티마이저가 뒤따른다.

use crate::core::config::{GateBy, ReplayTargets};
use crate::core::losses::{negative_cosine, precision};
use crate::core::model::{LatentPair, LossInputs, LossTerms, ReconPair, ReplayVae};
use crate::core::trainer::batch::{ActiveClasses, Replay, ReplayBatch, StepOptions, TrainBatch};
use crate::core::trainer::param_groups::{FreezeGuard, GroupId};
use crate::core::trainer::penalty::PenaltyHooks;
use crate::core::trainer::stats::{scalar, TrainStats};
use anyhow::{bail, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::ops::softmax;
use candle_nn::Optimizer;

impl ReplayVae {
    /// 한 학습 스텝. 현재 배치와 리플레이 중 적어도 하나는 있어야 한다.
    /// 두 옵티마이저 스텝까지 끝내고 손실 분해 기록을 돌려준다
    pub fn train_a_batch(
        &mut self,
        current: Option<&TrainBatch>,
        replay: Option<&Replay>,
        active: &ActiveClasses,
        penalties: &PenaltyHooks,
        opts: &StepOptions,
    ) -> Result<TrainStats> {
        if current.is_none() && replay.is_none() {
            bail!("Training step needs a current batch, replay data, or both");
        }
        if !(0.0..=1.0).contains(&opts.rnt) {
            bail!("Current-task weight must be in [0, 1], got {}", opts.rnt);
        }
        for hook in [&penalties.ewc, &penalties.si] {
            if let Some(hook) = hook {
                if hook.weight < 0.0 {
                    bail!("Penalty weight must be non-negative, got {}", hook.weight);
                }
            }
        }
        let contrastive = self.config.contrastive.enabled;
        let masked = self.has_task_masks();
        let mut stats = TrainStats::default();

        // 마스크 경로에서 조각조각 역전파한 기울기의 누산기
        let mut piecewise: Option<GradStore> = None;

        // ---- 현재 과제 데이터 ----
        let mut loss_cur: Option<Tensor> = None;
        let mut contr_cur: Option<Tensor> = None;
        let mut ss_cur: Option<Tensor> = None;
        if let Some(batch) = current {
            if masked {
                self.apply_task_mask(opts.task)?;
            }
            let contrast = contrastive && opts.contrast_current && batch.x_view.is_some();
            let (x_all, main_rows) =
                self.prepare_input(batch.x, if contrast { batch.x_view } else { None }, true, true)?;
            let allowed = active.current();
            let gate = self.current_gate(batch.y, allowed, main_rows, opts.task)?;
            let out = self.forward(&x_all, gate.as_ref(), false, Some(main_rows), contrast, true)?;
            let x_for_loss = main_slice(&x_all, main_rows)?;

            let mut proj_pairs = None;
            if contrast {
                if let Some(proj) = &out.proj {
                    let (pairs, ss) = self.contrastive_views(proj, main_rows)?;
                    proj_pairs = Some(pairs);
                    ss_cur = ss;
                }
            }

            let y_hat = slice_columns(&out.y_hat, allowed, &self.device)?;
            let terms = self.loss_function(&LossInputs {
                x: &x_for_loss,
                y: batch.y,
                x_recon: &out.x_recon,
                y_hat: Some(&y_hat),
                scores: None,
                mu: &out.mu,
                logvar: Some(&out.logvar),
                z: &out.z,
                allowed_classes: allowed,
                batch_weights: batch.weights,
                proj: proj_pairs.as_ref(),
                latent_pair: None,
                recon_rep: None,
                recon_atr: None,
            })?;
            stats.recon = scalar(&terms.recon)?;
            stats.variat = scalar(&terms.variat)?;
            stats.pred = scalar(&terms.pred)?;
            stats.contr = scalar(&terms.contr)?;
            if let Some(y) = batch.y {
                stats.precision = precision(&y_hat, y)?;
            }

            let weights = self.config.weights.clone();
            let mut combined = None;
            accumulate_loss(&mut combined, weighted(&terms.recon, weights.rcl)?)?;
            accumulate_loss(&mut combined, weighted(&terms.variat, weights.vl)?)?;
            accumulate_loss(&mut combined, weighted(&terms.pred, weights.pl)?)?;
            contr_cur = terms.contr;
            loss_cur = combined;

            // 마스크 경로에서 리플레이가 뒤따르면 현재 몫을 지금 역전파
            if masked && replay.is_some() {
                if let Some(cur) = &loss_cur {
                    piecewise = Some(cur.affine(opts.rnt, 0.0)?.backward()?);
                }
            }
        }

        // ---- 리플레이 데이터 ----
        let mut loss_replay = None;
        let mut contr_rep = None;
        let mut ss_rep = None;
        if let Some(replay) = replay {
            let heads: Vec<&ReplayBatch> = match replay {
                Replay::Merged(batch) => vec![batch],
                Replay::PerTask(batches) => batches.iter().collect(),
            };
            if heads.is_empty() {
                bail!("Per-task replay needs at least one batch");
            }
            let merged = matches!(replay, Replay::Merged(_));
            if merged && matches!(active, ActiveClasses::PerTask(_)) {
                bail!("Merged replay needs a single class list, not per-task lists");
            }
            if let (Replay::PerTask(_), ActiveClasses::PerTask(lists)) = (replay, active) {
                if lists.len() < heads.len() {
                    bail!(
                        "{} replay heads but only {} active-class lists",
                        heads.len(),
                        lists.len()
                    );
                }
            }
            let n_heads = heads.len();
            let mut sum = None;
            let mut contr_sum = None;
            let mut ss_sum = None;
            for (head, batch) in heads.iter().enumerate() {
                if masked {
                    self.apply_task_mask(head)?;
                }
                let allowed = active.replay_head(head);
                let (loss, terms, ss) =
                    self.replay_head_losses(batch, allowed, head, merged, opts)?;
                stats.recon_r += scalar(&terms.recon)?;
                stats.variat_r += scalar(&terms.variat)?;
                stats.pred_r += scalar(&terms.pred)?;
                stats.distil_r += scalar(&terms.distil)?;
                stats.contr_r += scalar(&terms.contr)?;
                stats.rep_r += scalar(&terms.latent_rep)?;
                stats.recon_rep_r += scalar(&terms.recon_rep)?;
                stats.recon_atr_r += scalar(&terms.recon_atr)?;
                accumulate_loss(&mut contr_sum, terms.contr)?;
                accumulate_loss(&mut ss_sum, ss)?;
                if masked {
                    // 이 head의 마스크가 걸린 동안 제 몫을 역전파해 둔다
                    let share = loss.affine((1.0 - opts.rnt) / n_heads as f64, 0.0)?;
                    let store = share.backward()?;
                    match &mut piecewise {
                        Some(acc) => self.groups.accumulate(acc, &store)?,
                        None => piecewise = Some(store),
                    }
                }
                accumulate_loss(&mut sum, Some(loss))?;
            }
            let inv = 1.0 / n_heads as f64;
            loss_replay = mean_of(sum, inv)?;
            contr_rep = mean_of(contr_sum, inv)?;
            ss_rep = mean_of(ss_sum, inv)?;
            let inv = inv as f32;
            stats.recon_r *= inv;
            stats.variat_r *= inv;
            stats.pred_r *= inv;
            stats.distil_r *= inv;
            stats.contr_r *= inv;
            stats.rep_r *= inv;
            stats.recon_rep_r *= inv;
            stats.recon_atr_r *= inv;
        }

        // ---- 총 손실 + 패널티 ----
        let mut loss_total = match (&loss_cur, &loss_replay) {
            (Some(cur), Some(rep)) => {
                (cur.affine(opts.rnt, 0.0)? + rep.affine(1.0 - opts.rnt, 0.0)?)?
            }
            (Some(cur), None) => cur.clone(),
            (None, Some(rep)) => rep.clone(),
            (None, None) => bail!("Training step produced no loss terms"),
        };
        let mut penalty_terms = Vec::new();
        for (hook, slot) in [
            (&penalties.ewc, &mut stats.ewc),
            (&penalties.si, &mut stats.si),
        ] {
            if let Some(hook) = hook {
                let value = (hook.eval)()?;
                *slot = value.to_scalar::<f32>()?;
                if hook.weight > 0.0 {
                    let term = value.affine(hook.weight, 0.0)?;
                    loss_total = (loss_total + &term)?;
                    penalty_terms.push(term);
                }
            }
        }
        stats.loss_total = loss_total.to_scalar::<f32>()?;

        // 대조/자기지도 총합: 현재가 섞이면 고정 비율 0.2 / 0.8
        let contr_total = mix(contr_cur, contr_rep, opts.rnt)?;
        let ss_total = mix(ss_cur, ss_rep, 0.2)?;
        if self.config.contrastive.simsiam {
            stats.ssl = scalar(&ss_total)?;
        }

        // ---- 주 손실 역전파 ----
        // 마스크 조각이 있으면 패널티만 보태고, 아니면 총합을 한 번에
        let mut main_grads = match piecewise {
            Some(mut acc) => {
                for term in &penalty_terms {
                    let store = term.backward()?;
                    self.groups.accumulate(&mut acc, &store)?;
                }
                acc
            }
            None => loss_total.backward()?,
        };

        // ---- 인코더 전용 스텝 (대조 학습일 때만) ----
        if let Some(e_opt) = &mut self.e_opt {
            let encoder_loss = if self.config.contrastive.simsiam {
                ss_total
            } else {
                contr_total
            };
            if let Some(loss) = encoder_loss {
                let grads = loss.backward()?;
                e_opt.step(&grads)?;
            }
        }

        // ---- 주 옵티마이저 스텝 ----
        {
            let mut guard = FreezeGuard::new(&mut self.groups);
            if opts.freeze_frontend {
                guard.freeze_only(&[GroupId::Frontend]);
                guard.filter(&mut main_grads);
            }
            self.main_opt.step(&main_grads)?;
        }

        Ok(stats)
    }

    /// 리플레이 head 하나의 순전파와 손실. 반환: (가중 합산 손실, 항별 기록,
    /// SimSiam 손실)
    fn replay_head_losses(
        &self,
        batch: &ReplayBatch,
        allowed: Option<&[usize]>,
        head: usize,
        merged: bool,
        opts: &StepOptions,
    ) -> Result<(Tensor, LossTerms, Option<Tensor>)> {
        let contrast =
            self.config.contrastive.enabled && opts.contrast_replayed && batch.x_view.is_some();
        let (x_all, main_rows) = self.prepare_input(
            batch.x,
            if contrast { batch.x_view } else { None },
            opts.replay_not_hidden,
            true,
        )?;
        let gate = self.replay_gate(batch, allowed, head, merged)?;
        let out = self.forward(&x_all, gate.as_ref(), false, Some(main_rows), contrast, true)?;
        let x_for_loss = main_slice(&x_all, main_rows)?;

        let mut proj_pairs = None;
        let mut ss = None;
        if contrast {
            if let Some(proj) = &out.proj {
                let (pairs, s) = self.contrastive_views(proj, main_rows)?;
                proj_pairs = Some(pairs);
                ss = s;
            }
        }

        let y_hat = slice_columns(&out.y_hat, allowed, &self.device)?;

        // 경쟁 클래스 반발/견인은 병합 리플레이에서만 조립한다
        let repulsion = match (merged, batch.top_classes) {
            (true, Some(top)) => self.assemble_repulsion(
                &x_for_loss,
                &out.x_recon,
                &out.mu,
                &out.logvar,
                top,
                batch.scores,
                opts.repulsion_threshold,
            )?,
            _ => None,
        };
        let latent_pair = repulsion
            .as_ref()
            .and_then(|data| data.latent.as_ref())
            .map(|rows| LatentPair {
                mu: &rows.mu,
                logvar: &rows.logvar,
                mu_other: &rows.mu_other,
                logvar_other: &rows.logvar_other,
                attract: false,
            });
        let recon_rep = repulsion
            .as_ref()
            .and_then(|data| data.recon_rep.as_ref())
            .map(|(target, recon)| ReconPair { target, recon });
        let recon_atr = repulsion
            .as_ref()
            .and_then(|data| data.recon_atr.as_ref())
            .map(|(target, recon)| ReconPair { target, recon });

        let terms = self.loss_function(&LossInputs {
            x: &x_for_loss,
            y: batch.y,
            x_recon: &out.x_recon,
            y_hat: Some(&y_hat),
            scores: batch.scores,
            mu: &out.mu,
            logvar: Some(&out.logvar),
            z: &out.z,
            allowed_classes: allowed,
            batch_weights: batch.weights,
            proj: proj_pairs.as_ref(),
            latent_pair,
            recon_rep,
            recon_atr,
        })?;

        let weights = self.config.weights.clone();
        let mut loss = None;
        accumulate_loss(&mut loss, weighted(&terms.recon, weights.rcl)?)?;
        accumulate_loss(&mut loss, weighted(&terms.variat, weights.vl)?)?;
        match self.config.replay_targets {
            ReplayTargets::Hard => accumulate_loss(&mut loss, weighted(&terms.pred, weights.pl)?)?,
            ReplayTargets::Soft => {
                accumulate_loss(&mut loss, weighted(&terms.distil, weights.pl)?)?
            }
        }
        accumulate_loss(&mut loss, weighted(&terms.latent_rep, weights.rep)?)?;
        accumulate_loss(&mut loss, weighted(&terms.recon_rep, weights.recon_rep)?)?;
        accumulate_loss(&mut loss, weighted(&terms.recon_atr, weights.recon_atr)?)?;
        match loss {
            Some(loss) => Ok((loss, terms, ss)),
            None => bail!("Replay head produced no loss terms"),
        }
    }

    /// 입력(과 선택적 두 번째 뷰)을 2-D로 펼쳐 행으로 이어붙인다. 은닉
    /// 리플레이 모델에 원시 입력이 온 경우(`raw`)는 전단 추출기까지 통과시킨다
    pub(crate) fn prepare_input(
        &self,
        x: &Tensor,
        view: Option<&Tensor>,
        raw: bool,
        train: bool,
    ) -> Result<(Tensor, usize)> {
        let main_rows = x.dim(0)?;
        let mut x_all = match view {
            Some(view) => Tensor::cat(&[&flatten_rows(x)?, &flatten_rows(view)?], 0)?,
            None => flatten_rows(x)?,
        };
        if self.config.hidden && raw {
            if let Some(frontend) = &self.frontend {
                x_all = frontend.forward(&x_all, train)?;
            }
        }
        Ok((x_all, main_rows))
    }

    /// 투영을 두 뷰로 갈라 `[batch, 2, proj]` 묶음을 만들고, 예측기가 있으면
    /// 교차 음의 코사인 자기지도 손실도 계산한다 (상대 뷰는 그래프에서 분리)
    fn contrastive_views(&self, proj: &Tensor, main_rows: usize) -> Result<(Tensor, Option<Tensor>)> {
        let z1 = proj.narrow(0, 0, main_rows)?;
        let z2 = proj.narrow(0, main_rows, main_rows)?;
        let ss = match &self.predictor {
            Some(predictor) => {
                let p1 = predictor.forward(&z1, true)?;
                let p2 = predictor.forward(&z2, true)?;
                Some(((negative_cosine(&p1, &z2)? + negative_cosine(&p2, &z1)?)? * 0.5)?)
            }
            None => None,
        };
        let pairs = Tensor::cat(&[&z1.unsqueeze(1)?, &z2.unsqueeze(1)?], 1)?;
        Ok((pairs, ss))
    }

    /// 현재 배치의 디코더 게이트 입력. 과제 게이트면 현재 과제 ID로 채우고,
    /// 클래스 게이트면 레이블을 전역 클래스 ID로 올려 쓴다
    fn current_gate(
        &self,
        y: Option<&Tensor>,
        allowed: Option<&[usize]>,
        rows: usize,
        task: usize,
    ) -> Result<Option<Tensor>> {
        if !self.config.gates.enabled {
            return Ok(None);
        }
        match self.config.gates.by {
            GateBy::Task => {
                let gate_size = self.config.gate_size();
                if task >= gate_size {
                    bail!("Task {} out of range ({} gates)", task, gate_size);
                }
                let ids = vec![task as u32; rows];
                Ok(Some(Tensor::new(ids.as_slice(), &self.device)?))
            }
            GateBy::Class => match y {
                Some(y) => Ok(Some(globalize(y, allowed, &self.device)?)),
                None => bail!("Class-gated decoder needs labels for the current batch"),
            },
        }
    }

    /// 리플레이 head의 디코더 게이트 입력. 레이블이 없으면 교사 점수의
    /// 온도 softmax를 soft 클래스 게이트로 쓴다
    fn replay_gate(
        &self,
        batch: &ReplayBatch,
        allowed: Option<&[usize]>,
        head: usize,
        merged: bool,
    ) -> Result<Option<Tensor>> {
        if !self.config.gates.enabled {
            return Ok(None);
        }
        match self.config.gates.by {
            GateBy::Task => match batch.tasks {
                Some(tasks) => Ok(Some(tasks.clone())),
                None => bail!("Task-gated decoder needs replay task ids"),
            },
            GateBy::Class => {
                if let Some(y) = batch.y {
                    Ok(Some(globalize(y, allowed, &self.device)?))
                } else if let Some(scores) = batch.scores {
                    Ok(Some(self.scores_gate(scores, allowed, head, merged)?))
                } else {
                    bail!("Class-gated decoder needs replay labels or scores")
                }
            }
        }
    }

    /// 교사 점수의 온도 softmax를 게이트 폭에 맞춰 배치한 soft 게이트.
    /// 활성 목록이 있으면 각 열을 그 전역 위치에, 없으면 head 블록 위치에 놓는다
    fn scores_gate(
        &self,
        scores: &Tensor,
        allowed: Option<&[usize]>,
        head: usize,
        merged: bool,
    ) -> Result<Tensor> {
        let (rows, width) = scores.dims2()?;
        let gate_size = self.config.gate_size();
        let probs = softmax(&scores.affine(1.0 / self.config.kd_temp as f64, 0.0)?, D::Minus1)?;
        let cols: Vec<u32> = match allowed {
            Some(list) => {
                if list.len() != width {
                    bail!(
                        "Replay scores are {} wide but {} classes are active",
                        width,
                        list.len()
                    );
                }
                list.iter().map(|&c| c as u32).collect()
            }
            None => {
                let start = if merged { 0 } else { head * width };
                ((start as u32)..(start + width) as u32).collect()
            }
        };
        if let Some(&max) = cols.iter().max() {
            if max as usize >= gate_size {
                bail!("Gate class {} out of range ({} gates)", max, gate_size);
            }
        }
        let zeros = Tensor::zeros((rows, gate_size), DType::F32, scores.device())?;
        let index = Tensor::new(cols.as_slice(), scores.device())?;
        Ok(zeros.index_add(&index, &probs, 1)?)
    }
}

/// 배치 차원 이후를 전부 펼쳐 2-D로 만든다
fn flatten_rows(t: &Tensor) -> Result<Tensor> {
    Ok(if t.rank() > 2 { t.flatten_from(1)? } else { t.clone() })
}

/// 두 뷰가 붙어 있으면 본 배치 행만 잘라낸다
fn main_slice(x_all: &Tensor, main_rows: usize) -> Result<Tensor> {
    Ok(if x_all.dim(0)? > main_rows {
        x_all.narrow(0, 0, main_rows)?
    } else {
        x_all.clone()
    })
}

/// 지역 레이블을 활성 목록의 전역 클래스 ID로 올린다. 목록이 없으면 그대로
fn globalize(y: &Tensor, allowed: Option<&[usize]>, device: &Device) -> Result<Tensor> {
    match allowed {
        Some(list) => {
            let ids = y.to_vec1::<u32>()?;
            let mut global = Vec::with_capacity(ids.len());
            for &local in &ids {
                match list.get(local as usize) {
                    Some(&class_id) => global.push(class_id as u32),
                    None => bail!("Label {} outside the {} active classes", local, list.len()),
                }
            }
            Ok(Tensor::new(global.as_slice(), device)?)
        }
        None => Ok(y.clone()),
    }
}

/// 로짓에서 활성 클래스 열만 골라낸다
fn slice_columns(logits: &Tensor, allowed: Option<&[usize]>, device: &Device) -> Result<Tensor> {
    match allowed {
        Some(cols) => {
            let ids: Vec<u32> = cols.iter().map(|&c| c as u32).collect();
            let index = Tensor::new(ids.as_slice(), device)?;
            Ok(logits.index_select(&index, 1)?)
        }
        None => Ok(logits.clone()),
    }
}

fn weighted(term: &Option<Tensor>, weight: f32) -> Result<Option<Tensor>> {
    match term {
        Some(term) => Ok(Some(term.affine(weight as f64, 0.0)?)),
        None => Ok(None),
    }
}

fn accumulate_loss(total: &mut Option<Tensor>, part: Option<Tensor>) -> Result<()> {
    if let Some(part) = part {
        *total = Some(match total.take() {
            Some(total) => (total + part)?,
            None => part,
        });
    }
    Ok(())
}

fn mean_of(sum: Option<Tensor>, inv: f64) -> Result<Option<Tensor>> {
    match sum {
        Some(sum) => Ok(Some(sum.affine(inv, 0.0)?)),
        None => Ok(None),
    }
}

/// 양쪽이 다 있으면 `w·cur + (1-w)·rep`, 한쪽만 있으면 그쪽 그대로
fn mix(cur: Option<Tensor>, rep: Option<Tensor>, w_cur: f64) -> Result<Option<Tensor>> {
    Ok(match (cur, rep) {
        (Some(cur), Some(rep)) => {
            Some((cur.affine(w_cur, 0.0)? + rep.affine(1.0 - w_cur, 0.0)?)?)
        }
        (Some(cur), None) => Some(cur),
        (None, Some(rep)) => Some(rep),
        (None, None) => None,
    })
}
