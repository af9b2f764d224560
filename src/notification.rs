//! 变更通知调度模块
//!
//! 记录集合发生变化时通知订阅者。采用尾沿防抖：每次请求都会重置计时器，
//! 静默期结束后只触发一次回调，突发的流式数据不会逐字节触发通知。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// 订阅回调
pub type Callback = Arc<dyn Fn() + Send + Sync>;

type Subscribers = Arc<RwLock<BTreeMap<u64, Callback>>>;

/// 通知调度器
pub struct NotificationScheduler {
    sender: mpsc::UnboundedSender<()>,
    subscribers: Subscribers,
    next_id: AtomicU64,
}

impl NotificationScheduler {
    /// 创建调度器并启动后台防抖任务；不在 tokio 运行时中时返回错误
    pub fn new(delay: Duration) -> anyhow::Result<Self> {
        let handle = Handle::try_current().context("通知调度器需要在 tokio 运行时中创建")?;
        let subscribers: Subscribers = Arc::new(RwLock::new(BTreeMap::new()));
        let (sender, receiver) = mpsc::unbounded_channel();
        handle.spawn(Self::consume_loop(delay, subscribers.clone(), receiver));
        Ok(Self {
            sender,
            subscribers,
            next_id: AtomicU64::new(1),
        })
    }

    /// 请求一次通知（非阻塞，可从同步代码调用）
    pub fn request(&self) {
        if self.sender.send(()).is_err() {
            tracing::debug!("通知调度任务已退出，忽略通知请求");
        }
    }

    /// 注册订阅者
    pub fn subscribe(&self, callback: Callback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().insert(id, callback);
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// 后台防抖循环
    async fn consume_loop(
        delay: Duration,
        subscribers: Subscribers,
        mut receiver: mpsc::UnboundedReceiver<()>,
    ) {
        while receiver.recv().await.is_some() {
            // 静默期内的新请求会重置计时器
            let closed = loop {
                match tokio::time::timeout(delay, receiver.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) => break true,
                    Err(_) => break false,
                }
            };

            Self::fire(&subscribers);

            if closed {
                break;
            }
        }
        tracing::debug!("通知调度循环已退出");
    }

    fn fire(subscribers: &Subscribers) {
        // 先复制回调列表再调用，回调中可以安全地订阅/退订
        let callbacks: Vec<Callback> = subscribers.read().values().cloned().collect();
        for callback in callbacks {
            callback();
        }
    }
}

/// 订阅句柄
///
/// 丢弃句柄不会退订，需显式调用 [`Subscription::unsubscribe`]
pub struct Subscription {
    id: u64,
    subscribers: std::sync::Weak<RwLock<BTreeMap<u64, Callback>>>,
}

impl Subscription {
    /// 取消订阅
    pub fn unsubscribe(self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.write().remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, Callback) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_into_single_notification() {
        let scheduler = NotificationScheduler::new(Duration::from_millis(100)).unwrap();
        let (count, callback) = counter();
        let _sub = scheduler.subscribe(callback);

        for _ in 0..50 {
            scheduler.request();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_request_is_delivered_once() {
        let scheduler = NotificationScheduler::new(Duration::from_millis(100)).unwrap();
        let (count, callback) = counter();
        let _sub = scheduler.subscribe(callback);

        scheduler.request();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        scheduler.request();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_stops_delivery() {
        let scheduler = NotificationScheduler::new(Duration::from_millis(50)).unwrap();
        let (count, callback) = counter();
        let sub = scheduler.subscribe(callback);
        assert_eq!(scheduler.subscriber_count(), 1);

        sub.unsubscribe();
        assert_eq!(scheduler.subscriber_count(), 0);

        scheduler.request();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_sees_latest_state() {
        let scheduler = NotificationScheduler::new(Duration::from_millis(100)).unwrap();
        let state = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(RwLock::new(Vec::new()));

        let (s, v) = (state.clone(), seen.clone());
        let _sub = scheduler.subscribe(Arc::new(move || {
            v.write().push(s.load(Ordering::SeqCst));
        }));

        for i in 1..=5 {
            state.store(i, Ordering::SeqCst);
            scheduler.request();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*seen.read(), vec![5]);
    }

    #[test]
    fn test_new_outside_runtime_is_error() {
        let err = NotificationScheduler::new(Duration::from_millis(10)).err().unwrap();
        assert!(err.to_string().contains("tokio"));
    }
}
