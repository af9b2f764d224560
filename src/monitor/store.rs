//! 有界记录存储

use std::collections::VecDeque;

use crate::model::record::{CaptureRecord, RecordId};

/// 按插入顺序保存的有界记录集合，超出容量时淘汰最旧记录（FIFO）
#[derive(Debug)]
pub struct RecordStore {
    records: VecDeque<CaptureRecord>,
    capacity: usize,
}

impl RecordStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// 插入新记录；已满时先淘汰最旧的一条并返回
    pub fn insert(&mut self, record: CaptureRecord) -> Option<CaptureRecord> {
        let evicted = if self.records.len() >= self.capacity {
            self.records.pop_front()
        } else {
            None
        };
        self.records.push_back(record);
        evicted
    }

    pub fn find(&self, id: &RecordId) -> Option<&CaptureRecord> {
        self.records.iter().find(|r| &r.id == id)
    }

    pub fn find_mut(&mut self, id: &RecordId) -> Option<&mut CaptureRecord> {
        self.records.iter_mut().find(|r| &r.id == id)
    }

    pub fn remove(&mut self, id: &RecordId) -> Option<CaptureRecord> {
        let index = self.records.iter().position(|r| &r.id == id)?;
        self.records.remove(index)
    }

    /// 按条件批量删除，返回删除数量
    pub fn remove_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&CaptureRecord) -> bool,
    {
        let before = self.records.len();
        self.records.retain(|r| !predicate(r));
        before - self.records.len()
    }

    pub fn clear(&mut self) -> usize {
        let count = self.records.len();
        self.records.clear();
        count
    }

    /// 所有记录（最旧的在前）
    pub fn iter(&self) -> impl Iterator<Item = &CaptureRecord> {
        self.records.iter()
    }

    pub fn list(&self) -> Vec<CaptureRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
