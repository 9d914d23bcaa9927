//! 모델 본체 전방 경로/마스크/체크포인트 테스트

use crate::core::config::{
    ClassifyTap, NetworkOutput, PriorConfig, PriorKind, ReconKind, VaeConfig,
};
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

fn rows(n: usize, units: usize, device: &Device) -> Tensor {
    let values: Vec<f32> = (0..n * units).map(|i| (i % 7) as f32 / 10.0).collect();
    Tensor::from_vec(values, (n, units), device).unwrap()
}

#[test]
fn 전방_계산_차원_테스트() {
    let device = Device::Cpu;
    let model = ReplayVae::new(small_config(), &device).unwrap();
    let x = rows(2, 16, &device);

    let out = model.forward(&x, None, false, None, false, false).unwrap();
    assert_eq!(out.x_recon.dims(), &[2, 16]);
    assert_eq!(out.y_hat.dims(), &[2, 3]);
    assert_eq!(out.mu.dims(), &[2, 2]);
    assert_eq!(out.logvar.dims(), &[2, 2]);
    assert_eq!(out.z.dims(), &[2, 2]);
    assert!(out.proj.is_none());

    // 시그모이드 출력 범위
    let min = out.x_recon.min_all().unwrap().to_scalar::<f32>().unwrap();
    let max = out.x_recon.max_all().unwrap().to_scalar::<f32>().unwrap();
    assert!(min >= 0.0 && max <= 1.0);
}

#[test]
fn 투영은_전체_행_잠재는_주_배치_테스트() {
    let device = Device::Cpu;
    let mut config = small_config();
    config.contrastive.enabled = true;
    config.contrastive.proj_units = 5;
    config.contrastive.drop = 0.0;
    let model = ReplayVae::new(config, &device).unwrap();

    // 두 뷰가 이어붙은 배치: 4행 중 주 배치는 앞 2행
    let x = rows(4, 16, &device);
    let enc = model.encode(&x, false, Some(2), true, false).unwrap();
    assert_eq!(enc.mu.dims(), &[2, 2]);
    assert_eq!(enc.h.dims(), &[2, 6]);
    let proj = enc.proj.unwrap();
    assert_eq!(proj.dims(), &[4, 5]);

    // 투영은 단위 노름
    let norms = proj.sqr().unwrap().sum(1).unwrap().sqrt().unwrap();
    for n in norms.to_vec1::<f32>().unwrap() {
        assert!((n - 1.0).abs() < 1e-4);
    }
}

#[test]
fn 분류_탭_결정성_테스트() {
    let device = Device::Cpu;
    let mut config = small_config();
    config.classify = ClassifyTap::Mean;
    let model = ReplayVae::new(config, &device).unwrap();
    let x = rows(2, 16, &device);

    // 잠재 평균 탭은 결정적
    let a = model.classify(&x, false, false).unwrap();
    let b = model.classify(&x, false, false).unwrap();
    let diff = (a - b).unwrap().abs().unwrap().sum_all().unwrap();
    assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);

    // 잠재 샘플 탭은 호출마다 다른 노이즈를 쓴다
    let mut config = small_config();
    config.classify = ClassifyTap::Sample;
    let model = ReplayVae::new(config, &device).unwrap();
    let a = model.classify(&x, false, false).unwrap();
    let b = model.classify(&x, false, false).unwrap();
    let diff = (a - b).unwrap().abs().unwrap().sum_all().unwrap();
    assert!(diff.to_scalar::<f32>().unwrap() > 0.0);
}

#[test]
fn 재매개변수화_테스트() {
    let device = Device::Cpu;
    let model = ReplayVae::new(small_config(), &device).unwrap();
    let mu = Tensor::zeros((4, 2), candle_core::DType::F32, &device).unwrap();
    let logvar = Tensor::zeros((4, 2), candle_core::DType::F32, &device).unwrap();

    let z1 = model.reparameterize(&mu, &logvar).unwrap();
    let z2 = model.reparameterize(&mu, &logvar).unwrap();
    assert_eq!(z1.dims(), &[4, 2]);
    let diff = (&z1 - &z2).unwrap().abs().unwrap().sum_all().unwrap();
    assert!(diff.to_scalar::<f32>().unwrap() > 0.0);

    // 로그분산이 매우 작으면 표본이 평균에 붙는다
    let tiny = logvar.affine(1.0, -60.0).unwrap();
    let z = model.reparameterize(&mu, &tiny).unwrap();
    let spread = z.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
    assert!(spread < 1e-9);
}

#[test]
fn 재매개변수화_표본_모멘트_테스트() {
    let device = Device::Cpu;
    let model = ReplayVae::new(small_config(), &device).unwrap();

    // 표본 평균은 mu, 표본 분산은 exp(logvar)에 수렴해야 한다
    let n = 20_000usize;
    let mu = Tensor::zeros((n, 1), candle_core::DType::F32, &device)
        .unwrap()
        .affine(1.0, 1.5)
        .unwrap();
    let logvar = Tensor::zeros((n, 1), candle_core::DType::F32, &device)
        .unwrap()
        .affine(1.0, (4f64).ln())
        .unwrap();

    let z = model.reparameterize(&mu, &logvar).unwrap();
    let samples = z.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    let mean = samples.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let var = samples
        .iter()
        .map(|&v| (v as f64 - mean) * (v as f64 - mean))
        .sum::<f64>()
        / n as f64;

    assert!((mean - 1.5).abs() < 0.05, "sample mean {} drifted from 1.5", mean);
    assert!(
        (3.4..=4.6).contains(&var),
        "sample variance {} outside [3.4, 4.6]",
        var
    );
}

#[test]
fn 체크포인트_왕복_테스트() {
    let device = Device::Cpu;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vae.safetensors");

    let saved = ReplayVae::new(small_config(), &device).unwrap();
    saved.save(&path).unwrap();

    let mut loaded = ReplayVae::new(small_config(), &device).unwrap();
    let x = rows(2, 16, &device);
    let before = loaded.encode(&x, false, None, false, false).unwrap();
    let original = saved.encode(&x, false, None, false, false).unwrap();
    let gap = (&before.mu - &original.mu)
        .unwrap()
        .abs()
        .unwrap()
        .sum_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert!(gap > 0.0, "fresh init should differ before loading");

    loaded.load(&path).unwrap();
    let after = loaded.encode(&x, false, None, false, false).unwrap();
    let gap = (&after.mu - &original.mu)
        .unwrap()
        .abs()
        .unwrap()
        .sum_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert!(gap < 1e-6);
}

#[test]
fn 과제_마스크_전환_테스트() {
    let device = Device::Cpu;
    let mut model = ReplayVae::new(small_config(), &device).unwrap();
    let x = rows(2, 16, &device);

    assert!(model.apply_task_mask(0).is_err());

    let bare = model.encode(&x, false, None, false, false).unwrap();
    model.init_task_masks(2, 0.5, 42).unwrap();
    assert!(model.has_task_masks());
    assert!(model.apply_task_mask(2).is_err());

    // 각 과제 마스크는 레이어 유닛의 절반을 정확히 끈다
    let masks = model.task_masks.as_ref().unwrap();
    assert_eq!(masks.len(), 2);
    for per_layer in masks {
        assert_eq!(per_layer.len(), 1);
        let values = per_layer[0].to_vec1::<f32>().unwrap();
        assert_eq!(values.len(), 6);
        assert!(values.iter().all(|v| *v == 0.0 || *v == 1.0));
        assert_eq!(values.iter().filter(|v| **v == 0.0).count(), 3);
    }

    model.apply_task_mask(0).unwrap();
    let masked = model.encode(&x, false, None, false, false).unwrap();
    assert_eq!(masked.h.dims(), &[2, 6]);

    // 해제하면 마스크 없는 경로로 돌아온다
    model.clear_task_mask().unwrap();
    let cleared = model.encode(&x, false, None, false, false).unwrap();
    let gap = (&cleared.h - &bare.h)
        .unwrap()
        .abs()
        .unwrap()
        .sum_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert!(gap < 1e-6);
}

#[test]
fn 과제_마스크_시드_재현성_테스트() {
    let device = Device::Cpu;
    let mut first = ReplayVae::new(small_config(), &device).unwrap();
    let mut second = ReplayVae::new(small_config(), &device).unwrap();
    first.init_task_masks(3, 0.5, 7).unwrap();
    second.init_task_masks(3, 0.5, 7).unwrap();

    let lhs = first.task_masks.as_ref().unwrap();
    let rhs = second.task_masks.as_ref().unwrap();
    for (a, b) in lhs.iter().zip(rhs.iter()) {
        for (ta, tb) in a.iter().zip(b.iter()) {
            assert_eq!(
                ta.to_vec1::<f32>().unwrap(),
                tb.to_vec1::<f32>().unwrap()
            );
        }
    }
}

#[test]
fn 은닉_리플레이_경로_테스트() {
    let device = Device::Cpu;
    let mut config = small_config();
    config.extract_layers = 1;
    config.extract_units = 6;
    config.hidden = true;
    config.recon = ReconKind::GaussianNll;
    config.network_output = NetworkOutput::Identity;
    let model = ReplayVae::new(config, &device).unwrap();

    // 은닉 모드 기본 경로: 입력이 이미 특징이라 전단을 건너뛴다
    let features = rows(2, 6, &device);
    let out = model.forward(&features, None, false, None, false, false).unwrap();
    assert_eq!(out.x_recon.dims(), &[2, 6]);

    // not_hidden이면 원시 픽셀을 받아 전단을 통과시킨다
    let pixels = rows(2, 16, &device);
    let enc = model.encode(&pixels, true, None, false, false).unwrap();
    assert_eq!(enc.features.dims(), &[2, 6]);
}

#[test]
fn 이미지_헤드_복원_테스트() {
    let device = Device::Cpu;
    let mut config = small_config();
    config.extract_layers = 1;
    config.extract_units = 6;
    let model = ReplayVae::new(config, &device).unwrap();

    // 전단이 있고 은닉 모드가 아니면 디코더가 픽셀 수준까지 되돌린다
    let x = rows(2, 16, &device);
    let out = model.forward(&x, None, false, None, false, false).unwrap();
    assert_eq!(out.x_recon.dims(), &[2, 16]);
}

#[test]
fn gmm_사전분포_모드_수_테스트() {
    let device = Device::Cpu;
    let mut config = small_config();
    config.prior = PriorConfig {
        kind: PriorKind::Gmm,
        n_modes: 2,
        per_class: true,
    };
    let model = ReplayVae::new(config, &device).unwrap();
    assert!(model.prior().is_gmm());
    assert_eq!(model.prior().total_modes(), 6);
}
