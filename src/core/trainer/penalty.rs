//! # 외부 정칙화 패널티
//!
//! EWC나 SI 같은 파라미터 정칙화는 과제 경계에서 갱신되는 자기만의 상태
//! (Fisher 대각, 경로 적분)를 들고 있어서 모델 밖에서 관리한다. 스텝은
//! 평가 클로저만 받아 항상 값을 기록하고, 가중치가 양수면 총 손실에 더한다.

use anyhow::Result;
use candle_core::Tensor;

/// 스칼라 패널티 평가자와 그 가중치
pub struct PenaltyHook<'a> {
    /// 총 손실에 곱해 더할 계수. 0이면 기록만 한다
    pub weight: f64,
    /// 현재 파라미터에 대한 패널티 스칼라를 만든다
    pub eval: &'a dyn Fn() -> Result<Tensor>,
}

/// 한 스텝에 끼워 넣을 패널티 묶음
#[derive(Default)]
pub struct PenaltyHooks<'a> {
    pub ewc: Option<PenaltyHook<'a>>,
    pub si: Option<PenaltyHook<'a>>,
}
