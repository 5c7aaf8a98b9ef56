pub mod random;
pub mod sequential;

use crate::config::{Backend, StrategyKind};

pub use random::RandomSelector;
pub use sequential::SequentialSelector;

/// 后端选择策略
///
/// 固定的两种实现，用枚举分发而不是插件注册。
#[derive(Debug, Clone)]
pub enum SelectionStrategy {
    Sequential(SequentialSelector),
    Random(RandomSelector),
}

impl SelectionStrategy {
    pub fn new(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::Sequential => SelectionStrategy::Sequential(SequentialSelector::new()),
            StrategyKind::Random => SelectionStrategy::Random(RandomSelector::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SelectionStrategy::Sequential(_) => "sequential",
            SelectionStrategy::Random(_) => "random",
        }
    }

    /// 选出下一个候选后端
    ///
    /// `current` 为 `None` 表示启动阶段（尚无活跃后端）；`attempt` 是本轮中的第几次尝试。
    /// `attempt` 从0走到 `len-1` 时每个后端恰好出现一次，故障切换时当前（已失败的）后端排在最后，
    /// 所以单后端的列表仍会被重试。后端列表为空时返回 `None`。
    pub fn next<'a>(
        &mut self,
        backends: &'a [Backend],
        current: Option<usize>,
        attempt: usize,
    ) -> Option<(usize, &'a Backend)> {
        if backends.is_empty() {
            return None;
        }

        let index = match self {
            SelectionStrategy::Sequential(s) => s.next_index(backends.len(), current, attempt),
            SelectionStrategy::Random(r) => r.next_index(backends.len(), current, attempt),
        };
        Some((index, &backends[index]))
    }
}
