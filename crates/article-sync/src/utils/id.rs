//! 客户端 ID 生成
//!
//! 格式：`{device_id}-{millis}`。millis 严格单调，同一毫秒内的多次创建会顺延到下一毫秒。
//! 接入 `IdWatermark` 后已发出的最大 millis 会持久化，重启或时钟回拨后从它之后继续。

use std::sync::Arc;

use parking_lot::Mutex;

use super::time::Clock;
use crate::error::Result;

pub trait IdGenerator: Send + Sync + std::fmt::Debug {
    fn next_client_id(&self) -> Result<String>;
}

/// 已发出 ID 的高水位持久化
pub trait IdWatermark: Send + Sync + std::fmt::Debug {
    fn load_watermark(&self) -> Result<Option<i64>>;
    fn store_watermark(&self, millis: i64) -> Result<()>;
}

#[derive(Debug)]
pub struct ClientIdGenerator {
    device_id: String,
    clock: Arc<dyn Clock>,
    last_millis: Mutex<i64>,
    watermark: Option<Arc<dyn IdWatermark>>,
}

impl ClientIdGenerator {
    /// 仅进程内单调（测试或一次性使用）
    pub fn new(device_id: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            device_id: device_id.into(),
            clock,
            last_millis: Mutex::new(0),
            watermark: None,
        }
    }

    /// 从持久化高水位继续，每次发出新 ID 前先写回
    pub fn with_watermark(
        device_id: impl Into<String>,
        clock: Arc<dyn Clock>,
        watermark: Arc<dyn IdWatermark>,
    ) -> Result<Self> {
        let last = watermark.load_watermark()?.unwrap_or(0);
        Ok(Self {
            device_id: device_id.into(),
            clock,
            last_millis: Mutex::new(last),
            watermark: Some(watermark),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn next_millis(&self) -> Result<i64> {
        let now = self.clock.now_millis();
        let mut last = self.last_millis.lock();
        let candidate = if now > *last { now } else { *last + 1 };
        // 先落盘再发出：写失败时不消耗这个值
        if let Some(watermark) = &self.watermark {
            watermark.store_watermark(candidate)?;
        }
        *last = candidate;
        Ok(candidate)
    }
}

impl IdGenerator for ClientIdGenerator {
    fn next_client_id(&self) -> Result<String> {
        Ok(format!("{}-{}", self.device_id, self.next_millis()?))
    }
}

/// 生成新的设备 ID（首次启动时写入 KV，之后保持不变）
pub fn generate_device_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::time::ManualClock;
    use std::collections::HashSet;

    #[test]
    fn test_ids_unique_within_same_millisecond() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let generator = ClientIdGenerator::new("dev1", clock.clone());

        let ids: HashSet<String> = (0..50).map(|_| generator.next_client_id().unwrap()).collect();
        assert_eq!(ids.len(), 50);
        assert!(ids.contains("dev1-1700000000000"));
        assert!(ids.contains("dev1-1700000000049"));
    }

    #[test]
    fn test_ids_monotonic_when_clock_goes_backwards() {
        let clock = Arc::new(ManualClock::new(5_000));
        let generator = ClientIdGenerator::new("dev", clock.clone());
        assert_eq!(generator.next_client_id().unwrap(), "dev-5000");
        clock.set(1_000);
        assert_eq!(generator.next_client_id().unwrap(), "dev-5001");
    }

    #[derive(Debug, Default)]
    struct MemoryWatermark(Mutex<Option<i64>>);

    impl IdWatermark for MemoryWatermark {
        fn load_watermark(&self) -> Result<Option<i64>> {
            Ok(*self.0.lock())
        }

        fn store_watermark(&self, millis: i64) -> Result<()> {
            *self.0.lock() = Some(millis);
            Ok(())
        }
    }

    #[test]
    fn test_watermark_survives_new_generator() {
        let clock = Arc::new(ManualClock::new(1_000));
        let watermark = Arc::new(MemoryWatermark::default());

        let first = ClientIdGenerator::with_watermark("dev", clock.clone(), watermark.clone()).unwrap();
        assert_eq!(first.next_client_id().unwrap(), "dev-1000");
        assert_eq!(first.next_client_id().unwrap(), "dev-1001");
        drop(first);

        // 时钟只前进 1ms，新实例仍不能重复 1001
        clock.advance(1);
        let second = ClientIdGenerator::with_watermark("dev", clock, watermark.clone()).unwrap();
        assert_eq!(second.next_client_id().unwrap(), "dev-1002");
        assert_eq!(*watermark.0.lock(), Some(1002));
    }

    #[test]
    fn test_generate_device_id_shape() {
        let id = generate_device_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
