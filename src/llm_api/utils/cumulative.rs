//! 累积文本 → 增量

use tracing::warn;

/// 记录供应商已发送的完整文本，把每次的全量结果裁剪成增量
#[derive(Debug, Default, Clone)]
pub struct CumulativeText {
    seen: String,
}

impl CumulativeText {
    pub fn new() -> Self {
        Self::default()
    }

    /// 输入当前全量文本，返回新增部分
    ///
    /// 已输出的内容不能撤回：如果供应商改写了前缀，只输出超出已见长度的部分
    pub fn delta(&mut self, full: &str) -> String {
        let delta = match full.strip_prefix(self.seen.as_str()) {
            Some(rest) => rest.to_string(),
            None => {
                warn!(
                    seen_len = self.seen.len(),
                    full_len = full.len(),
                    "Cumulative text is not an extension of previous output"
                );
                let mut cut = self.seen.len().min(full.len());
                while !full.is_char_boundary(cut) {
                    cut += 1;
                }
                full[cut..].to_string()
            }
        };
        self.seen.clear();
        self.seen.push_str(full);
        delta
    }

    pub fn as_str(&self) -> &str {
        &self.seen
    }
}
