//! # 파라미터 그룹 동결/해제
//!
//! 대조 학습의 핑퐁 옵티마이저 규율을 위한 명시적 파라미터 구획.
//! 주 옵티마이저와 인코더 전용 옵티마이저는 생성 시점부터 배타적인 구획을
//! 나눠 갖고, 스텝 도중의 동결은 역전파를 막는 대신 옵티마이저에 넘기기
//! 전에 기울기 저장소에서 해당 구획을 걸러내는 방식으로 구현한다.
//! 스텝이 어떤 분기로 끝나든 모든 구획은 갱신 가능 상태로 돌아와야 한다.

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::VarMap;
use std::collections::HashSet;

/// 이름 접두사로 묶이는 파라미터 구획
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupId {
    /// 전단 특징 추출기
    Frontend,
    /// 인코더 fc 스택
    Encoder,
    /// 투영 헤드 + SimSiam 예측기 + 외부 어텐션
    Projection,
    /// 나머지 전부 (잠재 분기, 분류기, 디코더, 사전분포)
    Rest,
}

impl GroupId {
    /// VarMap 등록 이름의 첫 구획으로 그룹을 정한다
    fn of(name: &str) -> GroupId {
        let head = name.split('.').next().unwrap_or(name);
        match head {
            "frontend" => GroupId::Frontend,
            "fc_e" => GroupId::Encoder,
            "proj" | "predictor" | "attn" => GroupId::Projection,
            _ => GroupId::Rest,
        }
    }
}

/// 이름 접두사로 수집한 파라미터 그룹과 현재 동결 상태
#[derive(Debug)]
pub struct ParamGroups {
    vars: Vec<(GroupId, Var)>,
    frozen: HashSet<GroupId>,
}

impl ParamGroups {
    /// VarMap의 모든 파라미터를 그룹으로 분류해 수집한다.
    /// 이름순으로 정렬하므로 같은 구성이면 옵티마이저 순서도 재현된다
    pub fn collect(varmap: &VarMap) -> Self {
        let data = varmap.data().lock().unwrap();
        let mut named: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        drop(data);
        named.sort_by(|a, b| a.0.cmp(&b.0));
        let vars = named
            .into_iter()
            .map(|(name, var)| (GroupId::of(&name), var))
            .collect();
        Self {
            vars,
            frozen: HashSet::new(),
        }
    }

    /// 지정한 그룹들의 파라미터만 모아 반환
    pub fn vars(&self, ids: &[GroupId]) -> Vec<Var> {
        self.vars
            .iter()
            .filter(|(group, _)| ids.contains(group))
            .map(|(_, var)| var.clone())
            .collect()
    }

    /// 주 옵티마이저 구획. 대조 학습이면 인코더/투영 구획은 인코더 전용
    /// 옵티마이저 몫이므로 제외한다
    pub fn main_vars(&self, contrastive: bool) -> Vec<Var> {
        if contrastive {
            self.vars(&[GroupId::Frontend, GroupId::Rest])
        } else {
            self.vars(&[
                GroupId::Frontend,
                GroupId::Encoder,
                GroupId::Projection,
                GroupId::Rest,
            ])
        }
    }

    /// 인코더 전용 옵티마이저 구획
    pub fn encoder_vars(&self) -> Vec<Var> {
        self.vars(&[GroupId::Encoder, GroupId::Projection])
    }

    /// 지정한 그룹들만 동결 상태로 둔다 (이전 동결 상태는 대체)
    pub fn freeze_only(&mut self, ids: &[GroupId]) {
        self.frozen = ids.iter().copied().collect();
    }

    pub fn unfreeze_all(&mut self) {
        self.frozen.clear();
    }

    pub fn is_frozen(&self, id: GroupId) -> bool {
        self.frozen.contains(&id)
    }

    /// 모든 그룹이 갱신 가능한 상태인지 (스텝 종료 후 불변식)
    pub fn all_trainable(&self) -> bool {
        self.frozen.is_empty()
    }

    /// 동결된 그룹의 기울기를 저장소에서 제거한다
    pub fn filter(&self, grads: &mut GradStore) {
        for (group, var) in &self.vars {
            if self.frozen.contains(group) {
                grads.remove(var.as_tensor());
            }
        }
    }

    /// `extra`의 기울기를 `acc`에 더해 흡수한다. 마스크 전환을 사이에 둔
    /// 역전파 구간들을 하나의 옵티마이저 스텝으로 합칠 때 쓴다
    pub fn accumulate(&self, acc: &mut GradStore, extra: &GradStore) -> Result<()> {
        for (_, var) in &self.vars {
            let tensor = var.as_tensor();
            if let Some(grad) = extra.get(tensor) {
                let merged = match acc.get(tensor) {
                    Some(prev) => (prev + grad)?,
                    None => grad.clone(),
                };
                acc.insert(tensor, merged);
            }
        }
        Ok(())
    }
}

/// 스코프를 벗어나면 모든 그룹을 갱신 가능 상태로 되돌리는 가드.
/// 스텝 중간에 오류로 빠져나가도 동결 상태가 새지 않는다
pub struct FreezeGuard<'a> {
    groups: &'a mut ParamGroups,
}

impl<'a> FreezeGuard<'a> {
    pub fn new(groups: &'a mut ParamGroups) -> Self {
        Self { groups }
    }

    pub fn freeze_only(&mut self, ids: &[GroupId]) {
        self.groups.freeze_only(ids);
    }

    pub fn filter(&self, grads: &mut GradStore) {
        self.groups.filter(grads);
    }
}

impl Drop for FreezeGuard<'_> {
    fn drop(&mut self) {
        self.groups.unfreeze_all();
    }
}
