//! # 모델 구성 설정
//!
//! 생성적 리플레이 VAE의 모든 학습/손실 옵션을 담는 명시적 설정 레코드.
//! 모든 필드가 채워진 상태로 `ReplayVae::new`에 전달되며, 생성 시점에
//! `validate()`가 한 번 실행되어 잘못된 조합을 즉시 거부한다.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// 연속 학습 시나리오
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scenario {
    /// 과제 ID가 시험 시점에 주어짐 (Task-IL)
    Task,
    /// 단일 분류 헤드가 모든 클래스를 포괄 (Class-IL)
    Class,
    /// 과제 구조는 같고 입력 분포만 변함 (Domain-IL)
    Domain,
}

/// 잠재 사전분포 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriorKind {
    /// 표준 정규분포 N(0, I)
    Standard,
    /// 학습 가능한 가우시안 혼합
    Gmm,
}

/// 재구성 손실 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconKind {
    /// 픽셀별 이진 교차 엔트로피 (출력이 sigmoid일 때)
    Bce,
    /// 단위 분산 가우시안 관측 모델의 음의 로그우도
    GaussianNll,
}

/// 디코더 최종 출력 비선형성
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkOutput {
    Sigmoid,
    Identity,
}

/// 분류기가 읽는 지점
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassifyTap {
    /// 잠재 투영 직전의 은닉 특징
    BeforeZ,
    /// 잠재 평균
    Mean,
    /// 재매개변수화된 잠재 샘플
    Sample,
}

/// 디코더 게이트 기준
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateBy {
    /// 클래스 ID로 게이트
    Class,
    /// 과제 ID로 게이트
    Task,
}

/// 가우시안 쌍 사이 발산 종류 (반발/견인 손실용)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DivergenceKind {
    /// 대칭화된 Jensen-Shannon 발산
    Js,
    /// 단방향 KL 발산
    Kl,
}

/// 리플레이 배치의 감독 신호 선택
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayTargets {
    /// 정수 레이블 교차 엔트로피
    Hard,
    /// 교사 점수 증류
    Soft,
}

/// 경쟁 클래스 대표 샘플 선택 정책
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Representative {
    /// 해당 클래스 샘플 중 무작위 1개
    Random,
    /// 해당 클래스 샘플들의 평균
    Mean,
}

/// 잠재 사전분포 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorConfig {
    /// 사전분포 종류
    pub kind: PriorKind,
    /// 모드 수. `per_class`이면 클래스당 모드 수, 아니면 전체 모드 수
    pub n_modes: usize,
    /// 클래스마다 연속된 모드 부분구간을 배타적으로 소유
    pub per_class: bool,
}

/// 디코더 게이트 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// 게이트 사용 여부
    pub enabled: bool,
    /// 게이트 기준 (클래스 / 과제)
    pub by: GateBy,
    /// 각 게이트 행에서 유닛이 꺼질 확률. 활성화 시 (0, 1) 범위 필수
    pub prop: f32,
    /// 게이트 행 수. `by == Task`이면 과제 수, `by == Class`이면 0으로 두면
    /// 클래스 수로 유도됨
    pub size: usize,
    /// 고정 게이트 마스크 재현용 시드
    pub seed: u64,
}

/// 대조 학습 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContrastiveConfig {
    /// 대조 학습 사용 여부 (두 번째 뷰 + 투영 헤드 + 인코더 전용 옵티마이저)
    pub enabled: bool,
    /// 유사도 온도
    pub temp: f32,
    /// 정규화 기준 온도 (손실 스케일 `temp / base_temp`)
    pub base_temp: f32,
    /// 투영 직전 드롭아웃 확률
    pub drop: f32,
    /// 투영 헤드 출력 차원
    pub proj_units: usize,
    /// 양성 마스크를 레이블 대신 교사 점수 유사도로 구성
    pub use_scores: bool,
    /// 음성 분배합을 하드 네거티브 마이닝 공식으로 재가중
    pub hard_negatives: bool,
    /// 대조 손실 대신 SimSiam 음의 코사인 목적 사용
    pub simsiam: bool,
    /// SimSiam 예측기 은닉 차원
    pub pred_units: usize,
    /// 투영 전 외부 어텐션 변환 사용 여부
    pub attention: bool,
    /// 외부 어텐션 공유 메모리 슬롯 수
    pub attn_units: usize,
}

/// 반발/견인 손실 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepulsionConfig {
    /// 잠재 분포 수준 반발 손실 사용
    pub latent: bool,
    /// 발산 종류
    pub divergence: DivergenceKind,
    /// 재구성 수준 반발 손실 사용
    pub recon_repulsion: bool,
    /// 재구성 수준 견인 손실 사용
    pub recon_attraction: bool,
    /// 경쟁 클래스 대표 선택 정책
    pub representative: Representative,
}

/// 손실 항 가중치
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossWeights {
    /// 재구성 손실 가중치
    pub rcl: f32,
    /// 변분 손실 가중치
    pub vl: f32,
    /// 분류/증류 손실 가중치
    pub pl: f32,
    /// 잠재 반발 손실 가중치
    pub rep: f32,
    /// 재구성 반발 손실 가중치
    pub recon_rep: f32,
    /// 재구성 견인 손실 가중치
    pub recon_atr: f32,
}

/// 옵티마이저 설정 (주 옵티마이저 + 인코더 전용 옵티마이저)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimConfig {
    /// 주 옵티마이저 학습률
    pub lr: f64,
    /// 인코더 전용 옵티마이저 학습률 (대조 학습 시)
    pub encoder_lr: f64,
    /// 가중치 감쇠 (0이면 순수 Adam과 동일)
    pub weight_decay: f64,
}

/// 생성적 리플레이 VAE 구성 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaeConfig {
    /// 입력 이미지 한 변의 길이
    pub image_size: usize,
    /// 입력 채널 수
    pub image_channels: usize,
    /// 전체 클래스 수
    pub classes: usize,
    /// 연속 학습 시나리오
    pub scenario: Scenario,
    /// 전단 특징 추출기 레이어 수 (0이면 추출기 없음)
    pub extract_layers: usize,
    /// 특징 추출기 출력 유닛 수
    pub extract_units: usize,
    /// 은닉 리플레이: 리플레이가 픽셀이 아닌 특징 수준에서 이루어짐
    pub hidden: bool,
    /// 인코더 fc 스택 깊이 (1이면 항등, 0은 오류)
    pub fc_layers: usize,
    /// fc 은닉 유닛 수
    pub fc_units: usize,
    /// fc 스택 최종 출력 차원
    pub h_dim: usize,
    /// fc 스택 드롭아웃 확률
    pub fc_drop: f32,
    /// 잠재 차원
    pub z_dim: usize,
    /// 분류기 탭 지점
    pub classify: ClassifyTap,
    /// 디코더 최종 출력 비선형성
    pub network_output: NetworkOutput,
    /// 재구성 손실 종류
    pub recon: ReconKind,
    /// 증류 온도
    pub kd_temp: f32,
    /// 리플레이 감독 신호
    pub replay_targets: ReplayTargets,
    /// 사전분포 설정
    pub prior: PriorConfig,
    /// 디코더 게이트 설정
    pub gates: GateConfig,
    /// 대조 학습 설정
    pub contrastive: ContrastiveConfig,
    /// 반발/견인 손실 설정
    pub repulsion: RepulsionConfig,
    /// 손실 가중치
    pub weights: LossWeights,
    /// 옵티마이저 설정
    pub optim: OptimConfig,
}

impl VaeConfig {
    /// 평탄화된 입력 유닛 수
    pub fn input_units(&self) -> usize {
        self.image_channels * self.image_size * self.image_size
    }

    /// 변분/반발 손실 정규화 분모 (입력 픽셀 수)
    pub fn pixel_norm(&self) -> f64 {
        self.input_units() as f64
    }

    /// 인코더 fc 스택이 읽는 유닛 수 (추출기 있으면 그 출력)
    pub fn encoder_input_units(&self) -> usize {
        if self.extract_layers > 0 {
            self.extract_units
        } else {
            self.input_units()
        }
    }

    /// fc 스택 최종 차원. `fc_layers == 1`이면 스택이 항등이므로 입력 차원 그대로
    pub fn real_h_dim(&self) -> usize {
        if self.fc_layers > 1 {
            self.h_dim
        } else {
            self.encoder_input_units()
        }
    }

    /// 인코더 fc 스택 레이어 크기 목록. 첫 원소가 입력, 마지막이 출력 차원.
    /// 중간 유닛 수는 `fc_units`에서 `h_dim`까지 선형 보간 (소수점 내림)
    pub fn fc_layer_sizes(&self) -> Vec<usize> {
        let input = self.encoder_input_units();
        if self.fc_layers < 2 {
            return vec![input];
        }
        if self.fc_layers == 2 {
            return vec![input, self.h_dim];
        }
        let mut sizes = vec![input];
        let steps = self.fc_layers - 1;
        let lo = self.fc_units as f64;
        let hi = self.h_dim as f64;
        for i in 0..steps {
            let t = i as f64 / (steps - 1) as f64;
            sizes.push((lo + (hi - lo) * t) as usize);
        }
        sizes
    }

    /// 디코더 최종 출력 유닛 수. 은닉 리플레이면 특징 수준에서 복원함
    pub fn decoder_out_units(&self) -> usize {
        if self.hidden {
            self.extract_units
        } else {
            self.input_units()
        }
    }

    /// 디코더 fc 스택 레이어 크기 목록 (인코더 스택의 역순). 전단 추출기가
    /// 있고 은닉 리플레이가 아니면 이 스택 뒤에 이미지 헤드가 따로 붙는다
    pub fn decoder_layer_sizes(&self) -> Vec<usize> {
        let mut sizes = self.fc_layer_sizes();
        sizes.reverse();
        sizes
    }

    /// 디코더 미러 스택 뒤에 이미지 헤드가 붙는지 여부
    pub fn decoder_image_head(&self) -> bool {
        self.extract_layers > 0 && !self.hidden
    }

    /// 게이트 행 수 (클래스 게이트면 클래스 수로 유도)
    pub fn gate_size(&self) -> usize {
        match self.gates.by {
            GateBy::Class => {
                if self.gates.size == 0 {
                    self.classes
                } else {
                    self.gates.size
                }
            }
            GateBy::Task => self.gates.size,
        }
    }

    /// 과제 게이트에서 한 과제가 맡는 클래스 수
    pub fn classes_per_task(&self) -> usize {
        let gate_size = self.gate_size();
        if gate_size == 0 {
            0
        } else {
            self.classes / gate_size
        }
    }

    /// 클래스당 모드 수 (per_class가 아니면 0)
    pub fn modes_per_class(&self) -> usize {
        if self.prior.per_class {
            self.prior.n_modes
        } else {
            0
        }
    }

    /// 사전분포 전체 모드 수
    pub fn total_modes(&self) -> usize {
        if self.prior.per_class {
            self.prior.n_modes * self.classes
        } else {
            self.prior.n_modes
        }
    }

    /// 과제 게이트 사용 여부
    pub fn task_gated(&self) -> bool {
        self.gates.enabled && self.gates.by == GateBy::Task
    }

    /// 구조 하이퍼파라미터에서 유도한 식별 스탬프 (체크포인트 키)
    pub fn name(&self) -> String {
        let mut name = String::from("VAE");
        if self.extract_layers > 0 {
            name.push_str(&format!("-F{}x{}", self.extract_units, self.extract_layers));
            if self.hidden {
                name.push_str("h");
            }
        }
        name.push_str(&format!(
            "-MLP{}-{}x{}-h{}",
            self.encoder_input_units(),
            self.fc_units,
            self.fc_layers,
            self.real_h_dim()
        ));
        name.push_str(&format!("-z{}", self.z_dim));
        if self.prior.kind == PriorKind::Gmm {
            name.push_str(&format!(
                "-GMM{}{}",
                self.prior.n_modes,
                if self.prior.per_class { "pc" } else { "" }
            ));
        }
        if self.gates.enabled {
            let tag = match self.gates.by {
                GateBy::Class => "cg",
                GateBy::Task => "tg",
            };
            name.push_str(&format!("-{}{}x{}", tag, self.gates.prop, self.gate_size()));
        }
        name.push_str(&format!("-c{}", self.classes));
        name
    }

    /// JSON 직렬화 (실험 기록용)
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// JSON 역직렬화
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// 옵션 조합 검증. 모델 생성 시 한 번 실행되며 이후 재검증하지 않음
    pub fn validate(&self) -> Result<()> {
        if self.image_size == 0 || self.image_channels == 0 {
            bail!("Input shape must be non-empty (image_size and image_channels > 0)");
        }
        if self.classes == 0 {
            bail!("At least one class is required");
        }
        if self.fc_layers == 0 {
            bail!("fc_layers must be at least 1 (1 means an identity stack)");
        }
        if self.fc_layers > 1 && (self.fc_units == 0 || self.h_dim == 0) {
            bail!("fc_units and h_dim must be positive when fc_layers > 1");
        }
        if self.z_dim == 0 {
            bail!("z_dim must be positive");
        }
        if !(0.0..1.0).contains(&self.fc_drop) {
            bail!("fc_drop must be in [0, 1)");
        }
        if self.extract_layers > 0 && self.extract_units == 0 {
            bail!("extract_units must be positive when a feature extractor is requested");
        }
        if self.hidden && self.extract_layers == 0 {
            bail!("Hidden replay requires a feature extractor (extract_layers > 0)");
        }
        if self.kd_temp <= 0.0 {
            bail!("Distillation temperature must be positive");
        }
        if self.prior.kind == PriorKind::Gmm && self.prior.n_modes == 0 {
            bail!("GMM prior needs at least one mode");
        }
        if self.prior.per_class && self.prior.kind != PriorKind::Gmm {
            bail!("Per-class modes are only meaningful for the GMM prior");
        }
        if self.gates.enabled {
            if !(self.gates.prop > 0.0 && self.gates.prop < 1.0) {
                bail!(
                    "Decoder gating enabled but gate proportion {} is outside (0, 1)",
                    self.gates.prop
                );
            }
            let gate_size = self.gate_size();
            if gate_size == 0 {
                bail!("Gate size must be positive when gating is enabled");
            }
            if self.gates.by == GateBy::Task
                && self.scenario != Scenario::Domain
                && self.classes % gate_size != 0
            {
                bail!(
                    "Task gating needs classes ({}) divisible by the number of tasks ({})",
                    self.classes,
                    gate_size
                );
            }
        }
        if self.contrastive.enabled {
            if self.contrastive.proj_units == 0 {
                bail!("Contrastive training needs a positive projection size");
            }
            if self.contrastive.temp <= 0.0 || self.contrastive.base_temp <= 0.0 {
                bail!("Contrastive temperatures must be positive");
            }
            if !(0.0..1.0).contains(&self.contrastive.drop) {
                bail!("Contrastive dropout must be in [0, 1)");
            }
            if self.contrastive.simsiam && self.contrastive.pred_units == 0 {
                bail!("SimSiam predictor needs a positive hidden size");
            }
            if self.contrastive.attention && self.contrastive.attn_units == 0 {
                bail!("External attention needs a positive slot count");
            }
        }
        for (name, w) in [
            ("rcl", self.weights.rcl),
            ("vl", self.weights.vl),
            ("pl", self.weights.pl),
            ("rep", self.weights.rep),
            ("recon_rep", self.weights.recon_rep),
            ("recon_atr", self.weights.recon_atr),
        ] {
            if w < 0.0 {
                bail!("Loss weight '{}' must be non-negative, got {}", name, w);
            }
        }
        if self.optim.lr <= 0.0 || self.optim.encoder_lr <= 0.0 {
            bail!("Learning rates must be positive");
        }
        Ok(())
    }
}

impl Default for VaeConfig {
    fn default() -> Self {
        Self {
            image_size: 32,
            image_channels: 1,
            classes: 10,
            scenario: Scenario::Class,
            extract_layers: 0,
            extract_units: 0,
            hidden: false,
            fc_layers: 3,
            fc_units: 1000,
            h_dim: 400,
            fc_drop: 0.0,
            z_dim: 20,
            classify: ClassifyTap::BeforeZ,
            network_output: NetworkOutput::Sigmoid,
            recon: ReconKind::Bce,
            kd_temp: 2.0,
            replay_targets: ReplayTargets::Hard,
            prior: PriorConfig::default(),
            gates: GateConfig::default(),
            contrastive: ContrastiveConfig::default(),
            repulsion: RepulsionConfig::default(),
            weights: LossWeights::default(),
            optim: OptimConfig::default(),
        }
    }
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            kind: PriorKind::Standard,
            n_modes: 1,
            per_class: false,
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            by: GateBy::Task,
            prop: 0.0,
            size: 0,
            seed: 0,
        }
    }
}

impl Default for ContrastiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            temp: 1.0,
            base_temp: 0.07,
            drop: 0.5,
            proj_units: 2000,
            use_scores: false,
            hard_negatives: false,
            simsiam: false,
            pred_units: 512,
            attention: false,
            attn_units: 64,
        }
    }
}

impl Default for RepulsionConfig {
    fn default() -> Self {
        Self {
            latent: false,
            divergence: DivergenceKind::Js,
            recon_repulsion: false,
            recon_attraction: false,
            representative: Representative::Random,
        }
    }
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            rcl: 1.0,
            vl: 1.0,
            pl: 1.0,
            rep: 1e-6,
            recon_rep: 1e-6,
            recon_atr: 1e-6,
        }
    }
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            encoder_lr: 1e-8,
            weight_decay: 0.0,
        }
    }
}
