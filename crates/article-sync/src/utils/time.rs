//! 时间工具
//!
//! # 约定
//!
//! - **存储层**: 所有时间字段使用 UTC 毫秒时间戳（INTEGER）
//! - **业务层**: 一律通过注入的 [`Clock`] 取时间，便于测试替换

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// 时钟抽象
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// 当前 UTC 毫秒时间戳
    fn now_millis(&self) -> i64;
}

/// 系统时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// 手动推进的时钟（测试用）
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// 毫秒时间戳格式化为 RFC3339（日志用），非法时间戳返回原始数字
pub fn format_iso8601(utc_timestamp_ms: i64) -> String {
    match Utc.timestamp_millis_opt(utc_timestamp_ms).single() {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => utc_timestamp_ms.to_string(),
    }
}

/// 毫秒时间戳转 DateTime<Utc>
pub fn to_datetime(utc_timestamp_ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(utc_timestamp_ms).single()
}
