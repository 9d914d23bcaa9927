//! 손실 합성기 항별 수기 검증

use crate::core::config::{PriorConfig, PriorKind, VaeConfig};
use crate::core::model::{LatentPair, LossInputs, ReconPair, ReplayVae};
use crate::core::prior::ModeSelector;
use approx::assert_relative_eq;
use candle_core::{DType, Device, Tensor};

const LN2: f32 = std::f32::consts::LN_2;

/// 2x2 단일 채널, 항등 인코더 스택, 표준 사전분포
fn tiny_config() -> VaeConfig {
    VaeConfig {
        image_size: 2,
        image_channels: 1,
        classes: 2,
        fc_layers: 1,
        z_dim: 1,
        ..Default::default()
    }
}

fn tiny_model(config: VaeConfig) -> ReplayVae {
    ReplayVae::new(config, &Device::Cpu).unwrap()
}

fn half_pixels(device: &Device) -> Tensor {
    Tensor::from_vec(vec![0.5f32; 4], (1, 4), device).unwrap()
}

fn scalar(t: &Option<Tensor>) -> f32 {
    t.as_ref().unwrap().to_scalar::<f32>().unwrap()
}

#[test]
fn 기본_항_수기_검증_테스트() {
    let device = Device::Cpu;
    let model = tiny_model(tiny_config());
    let x = half_pixels(&device);
    let zeros = Tensor::zeros((1, 1), DType::F32, &device).unwrap();
    let y = Tensor::new(&[0u32], &device).unwrap();
    let y_hat = Tensor::zeros((1, 2), DType::F32, &device).unwrap();

    let terms = model
        .loss_function(&LossInputs {
            x: &x,
            y: Some(&y),
            x_recon: &x,
            y_hat: Some(&y_hat),
            scores: None,
            mu: &zeros,
            logvar: Some(&zeros),
            z: &zeros,
            allowed_classes: None,
            batch_weights: None,
            proj: None,
            latent_pair: None,
            recon_rep: None,
            recon_atr: None,
        })
        .unwrap();

    // BCE(0.5 ‖ 0.5) = ln 2, 두 클래스 균등 로짓의 CE도 ln 2
    assert_relative_eq!(scalar(&terms.recon), LN2, epsilon = 1e-5);
    assert_relative_eq!(scalar(&terms.pred), LN2, epsilon = 1e-5);
    // mu = 0, logvar = 0이면 닫힌꼴 KL은 0
    assert_relative_eq!(scalar(&terms.variat), 0.0, epsilon = 1e-6);
    assert!(terms.distil.is_none());
    assert!(terms.contr.is_none());
    assert!(terms.latent_rep.is_none());
    assert!(terms.recon_rep.is_none());
    assert!(terms.recon_atr.is_none());
}

#[test]
fn 증류_항_온도_제곱_테스트() {
    let device = Device::Cpu;
    let model = tiny_model(tiny_config());
    let x = half_pixels(&device);
    let zeros = Tensor::zeros((1, 1), DType::F32, &device).unwrap();
    let y_hat = Tensor::zeros((1, 2), DType::F32, &device).unwrap();
    let scores = Tensor::zeros((1, 2), DType::F32, &device).unwrap();

    let terms = model
        .loss_function(&LossInputs {
            x: &x,
            y: None,
            x_recon: &x,
            y_hat: Some(&y_hat),
            scores: Some(&scores),
            mu: &zeros,
            logvar: None,
            z: &zeros,
            allowed_classes: None,
            batch_weights: None,
            proj: None,
            latent_pair: None,
            recon_rep: None,
            recon_atr: None,
        })
        .unwrap();

    // 균등 교사/학생 분포의 증류 손실은 ln 2, 기본 온도 2의 제곱이 곱해진다
    assert_relative_eq!(scalar(&terms.distil), 4.0 * LN2, epsilon = 1e-4);
    assert!(terms.pred.is_none());
    assert!(terms.variat.is_none());
}

#[test]
fn 잠재_반발_견인_대칭_테스트() {
    let device = Device::Cpu;
    let model = tiny_model(tiny_config());
    let x = half_pixels(&device);
    let zeros = Tensor::zeros((1, 1), DType::F32, &device).unwrap();

    let attract = model
        .loss_function(&LossInputs {
            x: &x,
            y: None,
            x_recon: &x,
            y_hat: None,
            scores: None,
            mu: &zeros,
            logvar: Some(&zeros),
            z: &zeros,
            allowed_classes: None,
            batch_weights: None,
            proj: None,
            latent_pair: Some(LatentPair {
                mu: &zeros,
                logvar: &zeros,
                mu_other: &zeros,
                logvar_other: &zeros,
                attract: true,
            }),
            recon_rep: None,
            recon_atr: None,
        })
        .unwrap();
    // 같은 분포끼리 견인 손실은 0
    assert_relative_eq!(scalar(&attract.latent_rep), 0.0, epsilon = 1e-6);

    let repulse = model
        .loss_function(&LossInputs {
            x: &x,
            y: None,
            x_recon: &x,
            y_hat: None,
            scores: None,
            mu: &zeros,
            logvar: Some(&zeros),
            z: &zeros,
            allowed_classes: None,
            batch_weights: None,
            proj: None,
            latent_pair: Some(LatentPair {
                mu: &zeros,
                logvar: &zeros,
                mu_other: &zeros,
                logvar_other: &zeros,
                attract: false,
            }),
            recon_rep: None,
            recon_atr: None,
        })
        .unwrap();
    // 반발은 발산 하한의 역수가 픽셀 수로 나뉜 값까지 치솟는다
    assert_relative_eq!(scalar(&repulse.latent_rep), 1e8 / 4.0, max_relative = 1e-4);
}

#[test]
fn 재구성_반발_역수_견인_그대로_테스트() {
    let device = Device::Cpu;
    let model = tiny_model(tiny_config());
    let x = half_pixels(&device);
    let zeros = Tensor::zeros((1, 1), DType::F32, &device).unwrap();

    let terms = model
        .loss_function(&LossInputs {
            x: &x,
            y: None,
            x_recon: &x,
            y_hat: None,
            scores: None,
            mu: &zeros,
            logvar: None,
            z: &zeros,
            allowed_classes: None,
            batch_weights: None,
            proj: None,
            latent_pair: None,
            recon_rep: Some(ReconPair {
                target: &x,
                recon: &x,
            }),
            recon_atr: Some(ReconPair {
                target: &x,
                recon: &x,
            }),
        })
        .unwrap();

    assert_relative_eq!(scalar(&terms.recon_rep), 1.0 / LN2, epsilon = 1e-4);
    assert_relative_eq!(scalar(&terms.recon_atr), LN2, epsilon = 1e-5);
}

#[test]
fn 허용_클래스_지역_레이블_변환_테스트() {
    let device = Device::Cpu;
    let mut config = tiny_config();
    config.classes = 3;
    config.prior = PriorConfig {
        kind: PriorKind::Gmm,
        n_modes: 1,
        per_class: true,
    };
    let model = tiny_model(config);

    // 모드 평균을 0/10/20으로 고정
    {
        let data = model.varmap().data().lock().unwrap();
        data.get("prior.means")
            .unwrap()
            .set(&Tensor::new(&[[0f32], [10.0], [20.0]], &device).unwrap())
            .unwrap();
        data.get("prior.logvars")
            .unwrap()
            .set(&Tensor::zeros((3, 1), DType::F32, &device).unwrap())
            .unwrap();
    }

    let x = half_pixels(&device);
    let z = Tensor::new(&[[20f32]], &device).unwrap();
    let logvar = Tensor::zeros((1, 1), DType::F32, &device).unwrap();
    let y = Tensor::new(&[1u32], &device).unwrap();
    let allowed = [1usize, 2];

    let terms = model
        .loss_function(&LossInputs {
            x: &x,
            y: Some(&y),
            x_recon: &x,
            y_hat: None,
            scores: None,
            mu: &z,
            logvar: Some(&logvar),
            z: &z,
            allowed_classes: Some(&allowed),
            batch_weights: None,
            proj: None,
            latent_pair: None,
            recon_rep: None,
            recon_atr: None,
        })
        .unwrap();

    // 지역 레이블 1은 전역 클래스 2(평균 20)로 옮겨져야 하고, 그 모드에
    // 정확히 올라탄 z의 변분 손실은 0이다. 변환이 없다면 전역 1(평균 10)
    // 기준 (20-10)^2/2 / 4 = 12.5가 나온다
    assert_relative_eq!(scalar(&terms.variat), 0.0, epsilon = 1e-4);

    // 전역 클래스를 직접 지정한 경로와도 일치
    let global = Tensor::new(&[2u32], &device).unwrap();
    let direct = model
        .prior()
        .variational_loss(&z, &z, &logvar, ModeSelector::PerSampleClass(&global))
        .unwrap()
        .mean_all()
        .unwrap()
        .affine(1.0 / 4.0, 0.0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert_relative_eq!(scalar(&terms.variat), direct, epsilon = 1e-5);
}

#[test]
fn 점수_확률_패딩_테스트() {
    let device = Device::Cpu;
    let mut config = tiny_config();
    config.classes = 3;
    config.prior = PriorConfig {
        kind: PriorKind::Gmm,
        n_modes: 1,
        per_class: true,
    };
    let model = tiny_model(config);

    let x = half_pixels(&device);
    let zeros = Tensor::zeros((1, 1), DType::F32, &device).unwrap();
    let allowed = [0usize, 1];

    // 점수 폭 1 < 허용 2: 오른쪽 0 패딩으로 진행된다
    let narrow = Tensor::zeros((1, 1), DType::F32, &device).unwrap();
    let terms = model
        .loss_function(&LossInputs {
            x: &x,
            y: None,
            x_recon: &x,
            y_hat: None,
            scores: Some(&narrow),
            mu: &zeros,
            logvar: Some(&zeros),
            z: &zeros,
            allowed_classes: Some(&allowed),
            batch_weights: None,
            proj: None,
            latent_pair: None,
            recon_rep: None,
            recon_atr: None,
        })
        .unwrap();
    assert!(scalar(&terms.variat).is_finite());

    // 점수 폭 3 > 허용 2는 오류
    let wide = Tensor::zeros((1, 3), DType::F32, &device).unwrap();
    let result = model.loss_function(&LossInputs {
        x: &x,
        y: None,
        x_recon: &x,
        y_hat: None,
        scores: Some(&wide),
        mu: &zeros,
        logvar: Some(&zeros),
        z: &zeros,
        allowed_classes: Some(&allowed),
        batch_weights: None,
        proj: None,
        latent_pair: None,
        recon_rep: None,
        recon_atr: None,
    });
    assert!(result.is_err());
}
