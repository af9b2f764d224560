//! 抓包状态对象
//!
//! 进程内唯一的共享可变状态：记录存储 + 抓包开关 + 通知调度器。
//! 拦截层通过 crate 内部接口写入，外部查看层只能通过下面的窄接口读取/删除。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::model::config::{Config, IngestConfig};
use crate::model::record::{CaptureRecord, RecordId, RecordStatus};
use crate::notification::{NotificationScheduler, Subscription};

use super::store::RecordStore;
use super::types::{RecordQuery, RecordStatsResponse, SortField, SortOrder};

/// 全局实例（可选，由 `init_global` 显式初始化）
static GLOBAL_MONITOR: OnceLock<Arc<CaptureMonitor>> = OnceLock::new();

/// 抓包监控服务（公开 API）
pub struct CaptureMonitor {
    config: Config,
    ingest: Arc<IngestConfig>,
    store: Mutex<RecordStore>,
    capture_enabled: AtomicBool,
    installed: AtomicBool,
    scheduler: NotificationScheduler,
}

impl CaptureMonitor {
    /// 创建新的监控实例并启动后台通知任务；不在 tokio 运行时中时返回错误
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let scheduler = NotificationScheduler::new(config.debounce())?;
        Ok(Arc::new(Self {
            ingest: Arc::new(config.ingest.clone()),
            store: Mutex::new(RecordStore::new(config.max_records)),
            capture_enabled: AtomicBool::new(config.capture_enabled),
            installed: AtomicBool::new(false),
            scheduler,
            config,
        }))
    }

    /// 初始化进程级实例（只能调用一次）
    pub fn init_global(config: Config) -> anyhow::Result<Arc<Self>> {
        let monitor = Self::new(config)?;
        GLOBAL_MONITOR
            .set(monitor.clone())
            .map_err(|_| anyhow::anyhow!("CaptureMonitor 已初始化"))?;
        tracing::info!(
            max_records = monitor.config.max_records,
            debounce_ms = monitor.config.debounce_ms,
            "抓包监控已初始化"
        );
        Ok(monitor)
    }

    /// 获取进程级实例
    pub fn global() -> Option<Arc<Self>> {
        GLOBAL_MONITOR.get().cloned()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn ingest_config(&self) -> Arc<IngestConfig> {
        self.ingest.clone()
    }

    // === 外部接口 ===

    /// 订阅"记录集合已变化"通知（防抖后触发）
    pub fn subscribe<F>(&self, on_change: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.scheduler.subscribe(Arc::new(on_change))
    }

    /// 所有记录的快照（按插入顺序，最旧的在前）
    pub fn list_records(&self) -> Vec<CaptureRecord> {
        self.store.lock().list()
    }

    pub fn get_record(&self, id: &RecordId) -> Option<CaptureRecord> {
        self.store.lock().find(id).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.store.lock().len()
    }

    /// 开启/暂停抓包；不影响已有记录
    pub fn set_capture_enabled(&self, enabled: bool) {
        let previous = self.capture_enabled.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            tracing::info!(enabled, "抓包开关已切换");
            self.scheduler.request();
        }
    }

    pub fn is_capture_enabled(&self) -> bool {
        self.capture_enabled.load(Ordering::SeqCst)
    }

    /// 删除单条记录
    pub fn remove_record(&self, id: &RecordId) -> bool {
        let removed = self.store.lock().remove(id).is_some();
        if removed {
            self.scheduler.request();
        }
        removed
    }

    /// 清空所有记录，返回清除数量
    pub fn clear_all(&self) -> usize {
        let count = self.store.lock().clear();
        tracing::info!("已清除 {} 条记录", count);
        self.scheduler.request();
        count
    }

    /// 过滤并排序
    pub fn query(&self, query: &RecordQuery) -> Vec<CaptureRecord> {
        let mut records: Vec<CaptureRecord> = self
            .store
            .lock()
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();

        records.sort_by(|a, b| {
            let ordering = match query.sort {
                SortField::Time => a.started_at.cmp(&b.started_at),
                SortField::Size => a.size_bytes.unwrap_or(0).cmp(&b.size_bytes.unwrap_or(0)),
                SortField::Duration => duration_ms(a).cmp(&duration_ms(b)),
            };
            match query.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });
        records
    }

    /// 统计信息
    ///
    /// 先取快照再序列化，不在持锁期间计算字符数
    pub fn stats(&self) -> RecordStatsResponse {
        let records = self.list_records();
        let mut stats = RecordStatsResponse::default();
        for record in &records {
            stats.count += 1;
            stats.total_size_bytes += record.size_bytes.unwrap_or(0);
            stats.total_chars += serde_json::to_string(record)
                .map(|s| s.chars().count())
                .unwrap_or(0);
            match record.status {
                RecordStatus::Streaming => stats.streaming_count += 1,
                RecordStatus::Error => stats.error_count += 1,
                _ => {}
            }
            *stats
                .by_kind
                .entry(record.kind.as_str().to_string())
                .or_insert(0) += 1;
        }
        stats
    }

    /// 预设过滤：删除 URL 包含任一预设关键字的记录（追踪、静态资源等）
    pub fn apply_preset_filter(&self) -> usize {
        let keywords = &self.config.preset_filter_keywords;
        let removed = self
            .store
            .lock()
            .remove_where(|r| keywords.iter().any(|k| r.url.contains(k.as_str())));
        if removed > 0 {
            tracing::info!("预设过滤已清除 {} 条记录", removed);
            self.scheduler.request();
        }
        removed
    }

    /// 以 JSON 数组导出所有记录（字段名保持导出契约）
    pub fn export_json(&self) -> anyhow::Result<String> {
        let records = self.list_records();
        Ok(serde_json::to_string_pretty(&records)?)
    }

    // === 拦截层内部接口 ===

    /// 插入新记录并通知
    pub(crate) fn insert_record(&self, record: CaptureRecord) -> RecordId {
        let id = record.id;
        let evicted = self.store.lock().insert(record);
        if let Some(evicted) = evicted {
            tracing::debug!(record_id = %evicted.id, "记录数达到上限，淘汰最旧记录");
        }
        self.scheduler.request();
        id
    }

    /// 修改一条记录并通知；记录已被淘汰/删除时返回 None
    pub(crate) fn update_record<R>(
        &self,
        id: &RecordId,
        f: impl FnOnce(&mut CaptureRecord) -> R,
    ) -> Option<R> {
        let result = {
            let mut store = self.store.lock();
            store.find_mut(id).map(f)
        };
        if result.is_some() {
            self.scheduler.request();
        }
        result
    }

    /// 标记已安装拦截器；重复安装返回 false
    pub(crate) fn mark_installed(&self) -> bool {
        self.installed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

fn duration_ms(record: &CaptureRecord) -> i64 {
    record
        .duration()
        .map(|d| d.num_milliseconds())
        .unwrap_or(0)
}
