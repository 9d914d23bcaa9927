//! # 학습 스텝 입력 묶음
//!
//! 한 스텝에 들어오는 현재 과제 배치와 리플레이 배치를 빌린 참조로 묶는다.
//! 리플레이는 전체 클래스를 한 덩어리로 섞은 병합형과, 이전 과제(head)마다
//! 별도 배치를 주는 과제별형 두 가지를 받는다. 활성 클래스 목록은 출력
//! head를 어느 열로 자를지와 지역 레이블을 전역 클래스 ID로 올릴 때 쓴다.

use candle_core::Tensor;

/// 현재 과제 데이터 한 배치
#[derive(Debug)]
pub struct TrainBatch<'a> {
    /// 입력. `[batch, ...]` 모양이면 내부에서 2-D로 펼친다
    pub x: &'a Tensor,
    /// 대조 학습용 두 번째 증강 뷰 (같은 모양)
    pub x_view: Option<&'a Tensor>,
    /// 정답 레이블 (U32). 활성 클래스 목록이 있으면 그 안의 지역 인덱스
    pub y: Option<&'a Tensor>,
    /// 샘플별 손실 가중치
    pub weights: Option<&'a Tensor>,
}

/// 리플레이 데이터 한 배치 (병합형이면 전체, 과제별형이면 head 하나 몫)
#[derive(Debug)]
pub struct ReplayBatch<'a> {
    /// 리플레이 입력. 은닉 리플레이면 전단 특징, 아니면 원시 입력
    pub x: &'a Tensor,
    /// 대조 학습용 두 번째 뷰
    pub x_view: Option<&'a Tensor>,
    /// 하드 레이블 (U32, 활성 목록 기준 지역 인덱스)
    pub y: Option<&'a Tensor>,
    /// 이전 모델이 남긴 로짓 `[batch, 활성 클래스 수]` (soft 타깃/게이트용)
    pub scores: Option<&'a Tensor>,
    /// 과제 게이트용 과제 ID (U32)
    pub tasks: Option<&'a Tensor>,
    /// 샘플별 손실 가중치
    pub weights: Option<&'a Tensor>,
    /// 이전 모델의 상위 예측 클래스 `[batch, k>=2]` (U32, 전역 ID).
    /// 0열이 자기 클래스, 1열이 반발 대상인 경쟁 클래스
    pub top_classes: Option<&'a Tensor>,
}

/// 리플레이 전달 방식
#[derive(Debug)]
pub enum Replay<'a> {
    /// 모든 이전 클래스를 한 배치에 섞음 (클래스/도메인 시나리오)
    Merged(ReplayBatch<'a>),
    /// 이전 과제마다 배치 하나, head 순서대로 (과제 시나리오)
    PerTask(Vec<ReplayBatch<'a>>),
}

/// 출력 head에서 실제로 쓰는 클래스 열 목록
#[derive(Debug)]
pub enum ActiveClasses<'a> {
    /// 전체 열 사용, 레이블은 전역 ID
    All,
    /// 하나의 목록을 현재/리플레이 모두에 적용
    Single(&'a [usize]),
    /// 과제마다 목록 하나, 마지막이 현재 과제. 과제별 리플레이 전용
    PerTask(&'a [Vec<usize>]),
}

impl ActiveClasses<'_> {
    /// 현재 과제 배치에 적용할 목록
    pub fn current(&self) -> Option<&[usize]> {
        match self {
            ActiveClasses::All => None,
            ActiveClasses::Single(classes) => Some(classes),
            ActiveClasses::PerTask(lists) => lists.last().map(|list| list.as_slice()),
        }
    }

    /// 리플레이 head 하나에 적용할 목록
    pub fn replay_head(&self, head: usize) -> Option<&[usize]> {
        match self {
            ActiveClasses::All => None,
            ActiveClasses::Single(classes) => Some(classes),
            ActiveClasses::PerTask(lists) => lists.get(head).map(|list| list.as_slice()),
        }
    }
}

/// 스텝 단위 선택지
#[derive(Debug, Clone)]
pub struct StepOptions {
    /// 현재 과제 번호 (0부터). 과제 마스크 선택에 쓴다
    pub task: usize,
    /// 현재 손실 비중. 리플레이는 `1 - rnt`를 받는다
    pub rnt: f64,
    /// 주 옵티마이저 스텝에서 전단 추출기 기울기를 거른다
    pub freeze_frontend: bool,
    /// 현재 배치에도 대조 손실을 건다 (두 번째 뷰 필요)
    pub contrast_current: bool,
    /// 리플레이 배치에 대조 손실을 건다 (두 번째 뷰 필요)
    pub contrast_replayed: bool,
    /// 은닉 리플레이 모드인데 리플레이가 원시 입력으로 온 경우
    pub replay_not_hidden: bool,
    /// 경쟁 클래스 확률이 이 값을 넘는 행만 반발 손실에 넣는다
    pub repulsion_threshold: Option<f32>,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            task: 0,
            rnt: 0.5,
            freeze_frontend: false,
            contrast_current: false,
            contrast_replayed: true,
            replay_not_hidden: false,
            repulsion_threshold: None,
        }
    }
}
