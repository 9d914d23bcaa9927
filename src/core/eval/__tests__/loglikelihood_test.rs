//! 중요도 표본 로그우도 추정 테스트

use crate::core::config::{PriorConfig, PriorKind, Scenario, VaeConfig};
use crate::core::model::ReplayVae;
use candle_core::{Device, Tensor};

fn small_config() -> VaeConfig {
    VaeConfig {
        image_size: 4,
        image_channels: 1,
        classes: 3,
        fc_layers: 2,
        fc_units: 8,
        h_dim: 6,
        z_dim: 2,
        ..Default::default()
    }
}

fn build(config: VaeConfig) -> ReplayVae {
    ReplayVae::new(config, &Device::Cpu).unwrap()
}

#[test]
fn 표준_사전분포_추정_테스트() {
    let device = Device::Cpu;
    let model = build(small_config());
    let x = Tensor::rand(0f32, 1f32, (3, 16), &device).unwrap();

    // 10개 표본을 4짜리 청크로: 4 + 4 + 2
    let lls = model.estimate_loglikelihood(&x, None, 10, 4).unwrap();
    assert_eq!(lls.len(), 3);
    for ll in lls {
        assert!(ll.is_finite());
    }
}

#[test]
fn 청크가_나누어떨어져도_빈_청크_없음_테스트() {
    let device = Device::Cpu;
    let model = build(small_config());
    let x = Tensor::rand(0f32, 1f32, (2, 16), &device).unwrap();

    let lls = model.estimate_loglikelihood(&x, None, 8, 4).unwrap();
    assert_eq!(lls.len(), 2);
    for ll in lls {
        assert!(ll.is_finite());
    }
}

#[test]
fn 클래스별_사전분포는_레이블로_모드_선택_테스트() {
    let device = Device::Cpu;
    let mut config = small_config();
    config.prior = PriorConfig {
        kind: PriorKind::Gmm,
        n_modes: 2,
        per_class: true,
    };
    let model = build(config);
    let x = Tensor::rand(0f32, 1f32, (2, 16), &device).unwrap();
    let y = Tensor::new(&[0u32, 2], &device).unwrap();

    let lls = model.estimate_loglikelihood(&x, Some(&y), 6, 3).unwrap();
    assert_eq!(lls.len(), 2);
    for ll in lls {
        assert!(ll.is_finite());
    }
}

#[test]
fn 과제_시나리오_거부_테스트() {
    let device = Device::Cpu;
    let mut config = small_config();
    config.scenario = Scenario::Task;
    let model = build(config);
    let x = Tensor::rand(0f32, 1f32, (2, 16), &device).unwrap();

    assert!(model.estimate_loglikelihood(&x, None, 4, 2).is_err());
}

#[test]
fn 표본_수_0은_오류_테스트() {
    let device = Device::Cpu;
    let model = build(small_config());
    let x = Tensor::rand(0f32, 1f32, (1, 16), &device).unwrap();

    assert!(model.estimate_loglikelihood(&x, None, 0, 2).is_err());
}
