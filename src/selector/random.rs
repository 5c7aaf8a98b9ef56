use rand::seq::SliceRandom;

/// 随机选择器 - 在候选中均匀随机选择，故障切换时排除当前失败的后端
///
/// 每轮的第0次尝试重新洗牌，之后的尝试沿着这一轮的顺序走，保证一轮内不重复。
#[derive(Debug, Clone, Default)]
pub struct RandomSelector {
    order: Vec<usize>,
}

impl RandomSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_index(&mut self, len: usize, current: Option<usize>, attempt: usize) -> usize {
        if attempt == 0 || self.order.len() != len {
            self.order = Self::shuffled(len, current);
        }
        self.order[attempt % len]
    }

    /// 当前后端排在最后，其余后端随机排列
    fn shuffled(len: usize, current: Option<usize>) -> Vec<usize> {
        let mut rng = rand::thread_rng();
        match current {
            Some(current) if current < len => {
                let mut order: Vec<usize> = (0..len).filter(|i| *i != current).collect();
                order.shuffle(&mut rng);
                order.push(current);
                order
            }
            _ => {
                let mut order: Vec<usize> = (0..len).collect();
                order.shuffle(&mut rng);
                order
            }
        }
    }
}
