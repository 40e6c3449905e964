use serde::{Deserialize, Serialize};

use crate::error::FailureKind;

/// 重试策略配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 传输类失败的最大重试次数
    pub max_retries: u32,
    /// 校验类失败的最大重试次数
    pub max_validation_retries: u32,
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            max_validation_retries: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 300_000, // 5分钟
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// 不重试（测试或一次性调用）
    pub fn no_retry() -> Self {
        Self {
            max_retries: 1,
            max_validation_retries: 1,
            ..Self::default()
        }
    }

    /// 该失败类型允许的重试上限
    pub fn limit_for(&self, kind: FailureKind) -> u32 {
        match kind {
            FailureKind::Transport | FailureKind::Storage => self.max_retries,
            FailureKind::Validation => self.max_validation_retries.min(self.max_retries),
            FailureKind::Conflict | FailureKind::Permanent => 0,
        }
    }

    /// 已失败 `retry_count` 次后是否还可以再试
    pub fn should_retry(&self, retry_count: u32, kind: FailureKind) -> bool {
        kind.is_retryable() && retry_count < self.limit_for(kind)
    }

    /// 第 `retry_count` 次失败后的退避（毫秒，未加抖动）
    pub fn backoff_ms(&self, retry_count: u32, kind: FailureKind) -> u64 {
        let base = self.base_delay_ms as f64 * self.backoff_factor.powf(retry_count as f64);
        let adjusted = base * delay_multiplier(kind);
        adjusted.min(self.max_delay_ms as f64).max(0.0) as u64
    }

    /// 计算下次尝试的时间戳；不应再重试时返回 None
    pub fn next_attempt_at(&self, now_millis: i64, retry_count: u32, kind: FailureKind) -> Option<i64> {
        if !self.should_retry(retry_count, kind) {
            return None;
        }
        let capped = self.backoff_ms(retry_count, kind) as f64;
        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5);
        let delay = (capped + jitter).max(0.0) as i64;
        Some(now_millis + delay)
    }
}

/// 校验失败通常是数据问题，拉长间隔
fn delay_multiplier(kind: FailureKind) -> f64 {
    match kind {
        FailureKind::Validation => 2.0,
        FailureKind::Transport | FailureKind::Storage | FailureKind::Conflict | FailureKind::Permanent => 1.0,
    }
}
