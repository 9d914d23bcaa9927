//! # 스텝 진단 기록
//!
//! 한 학습 스텝이 만든 손실 조각들을 f32로 풀어 담는다. 해당 스텝에서
//! 계산되지 않은 항은 0으로 남는다. 리플레이 쪽 항(`*_r`)은 head 평균이다.

use anyhow::Result;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

/// 한 스텝의 손실 분해와 정확도
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainStats {
    /// 역전파된 총 손실 (패널티 포함)
    pub loss_total: f32,
    /// 현재 배치 분류 정확도 (레이블 없으면 0)
    pub precision: f32,
    /// 현재 배치 재구성 손실
    pub recon: f32,
    /// 현재 배치 변분 손실
    pub variat: f32,
    /// 현재 배치 분류 손실
    pub pred: f32,
    /// 현재 배치 대조 손실
    pub contr: f32,
    /// 현재/리플레이를 섞은 자기지도(SimSiam) 손실
    pub ssl: f32,
    /// 리플레이 재구성 손실
    pub recon_r: f32,
    /// 리플레이 변분 손실
    pub variat_r: f32,
    /// 리플레이 하드 분류 손실
    pub pred_r: f32,
    /// 리플레이 증류 손실
    pub distil_r: f32,
    /// 리플레이 대조 손실
    pub contr_r: f32,
    /// 잠재 수준 반발 손실
    pub rep_r: f32,
    /// 재구성 수준 반발 손실
    pub recon_rep_r: f32,
    /// 재구성 수준 견인 손실
    pub recon_atr_r: f32,
    /// EWC 패널티 (가중치 곱하기 전)
    pub ewc: f32,
    /// SI 패널티 (가중치 곱하기 전)
    pub si: f32,
}

/// 선택적 스칼라 항을 f32로 읽는다. 없으면 0
pub(crate) fn scalar(term: &Option<Tensor>) -> Result<f32> {
    match term {
        Some(term) => Ok(term.to_scalar::<f32>()?),
        None => Ok(0.0),
    }
}
