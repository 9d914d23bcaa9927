use candle_core::{Device, Tensor};
use replay_vae::{
    ActiveClasses, NetworkOutput, PenaltyHooks, PriorConfig, PriorKind, ReconKind, Replay,
    ReplayBatch, ReplayTargets, ReplayVae, SampleSelector, StepOptions, TrainBatch, VaeConfig,
};

fn snapshot(model: &ReplayVae, name: &str) -> Vec<f32> {
    let data = model.varmap().data().lock().unwrap();
    data.get(name)
        .unwrap()
        .as_tensor()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
}

#[test]
fn test_sampled_classes_match_requested() {
    println!("=== 클래스 지정 표본 추출 ===");
    let device = Device::Cpu;
    let config = VaeConfig {
        image_size: 4,
        image_channels: 1,
        classes: 3,
        fc_layers: 2,
        fc_units: 8,
        h_dim: 8,
        z_dim: 4,
        prior: PriorConfig {
            kind: PriorKind::Gmm,
            n_modes: 2,
            per_class: true,
        },
        ..Default::default()
    };
    let model = ReplayVae::new(config, &device).unwrap();

    let wanted = [0u32, 1, 2, 0];
    let out = model
        .sample(4, &SampleSelector::SpecificClasses(&wanted), None)
        .unwrap();
    assert_eq!(out.x.dims(), &[4, 16]);
    let y_used = out.y_used.unwrap().to_vec1::<u32>().unwrap();
    assert_eq!(y_used, wanted);
}

#[test]
fn test_sample_then_replay_with_soft_targets_only() {
    println!("=== 교사 점수만으로 리플레이 ===");
    let device = Device::Cpu;
    let config = VaeConfig {
        image_size: 4,
        image_channels: 1,
        classes: 3,
        fc_layers: 2,
        fc_units: 8,
        h_dim: 8,
        z_dim: 4,
        replay_targets: ReplayTargets::Soft,
        prior: PriorConfig {
            kind: PriorKind::Gmm,
            n_modes: 1,
            per_class: true,
        },
        ..Default::default()
    };
    let mut model = ReplayVae::new(config, &device).unwrap();

    let sampled = model
        .sample(
            6,
            &SampleSelector::AllowedClasses {
                classes: &[0, 1, 2],
                probs: None,
            },
            None,
        )
        .unwrap();
    let scores = model.classify(&sampled.x, false, false).unwrap();

    // 레이블은 버리고 점수만 넘겨 soft 감독 경로를 탄다
    let replay = Replay::Merged(ReplayBatch {
        x: &sampled.x,
        x_view: None,
        y: None,
        scores: Some(&scores),
        tasks: None,
        weights: None,
        top_classes: None,
    });
    let stats = model
        .train_a_batch(
            None,
            Some(&replay),
            &ActiveClasses::All,
            &PenaltyHooks::default(),
            &StepOptions::default(),
        )
        .unwrap();
    println!(
        "리플레이 스텝: recon_r={:.4}, distil_r={:.4}",
        stats.recon_r, stats.distil_r
    );

    assert!(stats.loss_total.is_finite());
    assert!(stats.recon_r > 0.0);
    assert!(stats.distil_r > 0.0);
    assert_eq!(stats.pred_r, 0.0);
    assert_eq!(stats.recon, 0.0);
}

#[test]
fn test_hidden_replay_round_trip() {
    println!("=== 은닉 수준 리플레이 왕복 ===");
    let device = Device::Cpu;
    let config = VaeConfig {
        image_size: 4,
        image_channels: 1,
        classes: 2,
        extract_layers: 2,
        extract_units: 8,
        hidden: true,
        fc_layers: 2,
        fc_units: 8,
        h_dim: 8,
        z_dim: 4,
        network_output: NetworkOutput::Identity,
        recon: ReconKind::GaussianNll,
        replay_targets: ReplayTargets::Soft,
        ..Default::default()
    };
    let mut model = ReplayVae::new(config, &device).unwrap();

    // 은닉 리플레이 모델의 표본은 특징 수준에서 나온다
    let sampled = model.sample(4, &SampleSelector::Free, None).unwrap();
    assert_eq!(sampled.x.dims(), &[4, 8]);
    let scores = model.classify(&sampled.x, false, false).unwrap();

    let frontend_before = snapshot(&model, "frontend.fc0.weight");
    let classifier_before = snapshot(&model, "classifier.weight");

    let x = Tensor::rand(0f32, 1f32, (4, 16), &device).unwrap();
    let y = Tensor::new(&[0u32, 1, 0, 1], &device).unwrap();
    let current = TrainBatch {
        x: &x,
        x_view: None,
        y: Some(&y),
        weights: None,
    };
    let replay = Replay::Merged(ReplayBatch {
        x: &sampled.x,
        x_view: None,
        y: None,
        scores: Some(&scores),
        tasks: None,
        weights: None,
        top_classes: None,
    });
    let stats = model
        .train_a_batch(
            Some(&current),
            Some(&replay),
            &ActiveClasses::All,
            &PenaltyHooks::default(),
            &StepOptions {
                freeze_frontend: true,
                ..Default::default()
            },
        )
        .unwrap();
    println!(
        "은닉 스텝: recon={:.4}, recon_r={:.4}, distil_r={:.4}",
        stats.recon, stats.recon_r, stats.distil_r
    );

    assert!(stats.loss_total.is_finite());
    assert!(stats.recon > 0.0);
    assert!(stats.recon_r > 0.0);
    assert!(stats.distil_r > 0.0);
    // 전단 추출기는 동결, 나머지는 갱신
    assert_eq!(frontend_before, snapshot(&model, "frontend.fc0.weight"));
    assert_ne!(classifier_before, snapshot(&model, "classifier.weight"));
}
