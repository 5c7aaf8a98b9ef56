/// 顺序选择器 - 按配置顺序依次选择后端，末尾回绕
#[derive(Debug, Clone, Default)]
pub struct SequentialSelector;

impl SequentialSelector {
    pub fn new() -> Self {
        Self
    }

    /// 启动时从0开始；故障切换时从 `current + 1` 开始
    pub fn next_index(&self, len: usize, current: Option<usize>, attempt: usize) -> usize {
        match current {
            None => attempt % len,
            Some(current) => (current + 1 + attempt) % len,
        }
    }
}
