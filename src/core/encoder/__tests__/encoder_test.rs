use crate::core::encoder::{ExternalAttention, LatentSplit, Mlp, Predictor, ProjectionHead};
use approx::assert_relative_eq;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

fn builder() -> (VarMap, VarBuilder<'static>) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    (varmap, vb)
}

#[test]
fn mlp_항등_스택_테스트() {
    let (_vm, vb) = builder();
    let mlp = Mlp::new(vb, &[6], 0.0).unwrap();
    assert!(mlp.is_identity());

    let x = Tensor::rand(0f32, 1f32, (2, 6), &Device::Cpu).unwrap();
    let y = mlp.forward(&x, true).unwrap();
    let a = x.to_vec2::<f32>().unwrap();
    let b = y.to_vec2::<f32>().unwrap();
    assert_eq!(a, b);
}

#[test]
fn mlp_출력_차원_테스트() {
    let (_vm, vb) = builder();
    let mlp = Mlp::new(vb, &[6, 4, 3], 0.0).unwrap();
    assert_eq!(mlp.n_layers(), 2);

    let x = Tensor::rand(0f32, 1f32, (2, 6), &Device::Cpu).unwrap();
    let y = mlp.forward(&x, false).unwrap();
    assert_eq!(y.dims(), &[2, 3]);
}

#[test]
fn mlp_유닛_게이트_적용_테스트() {
    let device = Device::Cpu;
    let (_vm, vb) = builder();
    let mut mlp = Mlp::new(vb, &[4, 3, 2], 0.0).unwrap();

    // 게이트 수가 레이어 수와 다르면 거부
    let one = Tensor::ones(3, DType::F32, &device).unwrap();
    assert!(mlp.set_unit_gates(Some(vec![one.clone()])).is_err());

    // 전부 0인 게이트면 출력도 0
    let g0 = Tensor::zeros(3, DType::F32, &device).unwrap();
    let g1 = Tensor::zeros(2, DType::F32, &device).unwrap();
    mlp.set_unit_gates(Some(vec![g0, g1])).unwrap();
    let x = Tensor::rand(0f32, 1f32, (2, 4), &device).unwrap();
    let y = mlp.forward(&x, false).unwrap();
    let total = y.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
    assert_relative_eq!(total, 0.0);

    // 해제하면 다시 통과
    mlp.set_unit_gates(None).unwrap();
    let y = mlp.forward(&x, false).unwrap();
    assert_eq!(y.dims(), &[2, 2]);
}

#[test]
fn mlp_평가_모드_결정성_테스트() {
    let (_vm, vb) = builder();
    let mlp = Mlp::new(vb, &[5, 4, 3], 0.5).unwrap();
    let x = Tensor::rand(0f32, 1f32, (3, 5), &Device::Cpu).unwrap();

    // 평가 모드에서는 드롭아웃이 없어 두 번의 순전파가 동일
    let a = mlp.forward(&x, false).unwrap().to_vec2::<f32>().unwrap();
    let b = mlp.forward(&x, false).unwrap().to_vec2::<f32>().unwrap();
    assert_eq!(a, b);
}

#[test]
fn 잠재_분기_차원_테스트() {
    let (_vm, vb) = builder();
    let split = LatentSplit::new(vb, 8, 3).unwrap();
    let h = Tensor::rand(0f32, 1f32, (4, 8), &Device::Cpu).unwrap();
    let (mu, logvar) = split.forward(&h).unwrap();
    assert_eq!(mu.dims(), &[4, 3]);
    assert_eq!(logvar.dims(), &[4, 3]);
}

#[test]
fn 외부_어텐션_차원_보존_테스트() {
    let (_vm, vb) = builder();
    let attn = ExternalAttention::new(vb, 8, 4).unwrap();
    let x = Tensor::rand(0f32, 1f32, (3, 8), &Device::Cpu).unwrap();
    let y = attn.forward(&x).unwrap();
    assert_eq!(y.dims(), &[3, 8]);
    for row in y.to_vec2::<f32>().unwrap() {
        for v in row {
            assert!(v.is_finite());
        }
    }
}

#[test]
fn 투영_헤드_단위_노름_테스트() {
    let (_vm, vb) = builder();
    let proj = ProjectionHead::new(vb, 8, 5, 0.5).unwrap();
    let h = Tensor::rand(0f32, 1f32, (4, 8), &Device::Cpu).unwrap();
    let p = proj.forward(&h, false).unwrap();
    assert_eq!(p.dims(), &[4, 5]);

    // L2 정규화 후 각 행의 노름은 1
    for row in p.to_vec2::<f32>().unwrap() {
        let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert_relative_eq!(norm, 1.0, epsilon = 1e-4);
    }
}

#[test]
fn 예측기_차원_보존_테스트() {
    let (_vm, vb) = builder();
    let pred = Predictor::new(vb, 6, 4).unwrap();
    let p = Tensor::rand(0f32, 1f32, (4, 6), &Device::Cpu).unwrap();
    let out = pred.forward(&p, true).unwrap();
    assert_eq!(out.dims(), &[4, 6]);
}
