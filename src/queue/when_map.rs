//! `when_map`: ordered mapping from delivery deadline to pending queue
//! tasks.
//!
//! Multiple tasks may share a timestamp; insertion order is preserved
//! within a bucket, with `submit_head` prepending instead.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::task::{QueueTask, TaskId};

#[derive(Default)]
pub struct WhenMap {
    buckets: BTreeMap<u64, VecDeque<Arc<QueueTask>>>,
}

impl WhenMap {
    pub fn new() -> Self {
        Self { buckets: BTreeMap::new() }
    }

    pub fn insert(&mut self, task: Arc<QueueTask>, submit_head: bool) {
        let bucket = self.buckets.entry(task.uptime_us()).or_default();
        if submit_head {
            bucket.push_front(task);
        } else {
            bucket.push_back(task);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn head_uptime(&self) -> Option<u64> {
        self.buckets.keys().next().copied()
    }

    /// Pop a single task off the earliest bucket if it is due at `now`.
    pub fn pop_one_due(&mut self, now_us: u64) -> Option<Arc<QueueTask>> {
        let (&key, _) = self.buckets.iter().next()?;
        if key > now_us {
            return None;
        }
        let task = {
            let bucket = self.buckets.get_mut(&key)?;
            let task = bucket.pop_front();
            if bucket.is_empty() {
                self.buckets.remove(&key);
            }
            task
        };
        task
    }

    /// Drain every task in the earliest bucket if it is due at `now`.
    pub fn pop_all_due(&mut self, now_us: u64) -> Vec<Arc<QueueTask>> {
        let Some((&key, _)) = self.buckets.iter().next() else {
            return Vec::new();
        };
        if key > now_us {
            return Vec::new();
        }
        self.buckets.remove(&key).map(Vec::from).unwrap_or_default()
    }

    /// Purge everything, returning the removed tasks so the caller can
    /// notify/drop-ref each one.
    pub fn remove_all(&mut self) -> Vec<Arc<QueueTask>> {
        std::mem::take(&mut self.buckets).into_values().flatten().collect()
    }

    /// Regex/substring match against the task label.
    pub fn remove_matching(&mut self, pattern: &regex::Regex) -> Vec<Arc<QueueTask>> {
        let mut removed = Vec::new();
        self.buckets.retain(|_, bucket| {
            let (matched, rest): (VecDeque<_>, VecDeque<_>) =
                bucket.drain(..).partition(|t| t.matches_label(pattern));
            removed.extend(matched);
            *bucket = rest;
            !bucket.is_empty()
        });
        removed
    }

    /// Targeted cancel: removes and returns the task if it is still
    /// pending in `when_map`.
    pub fn remove_task(&mut self, gid: TaskId) -> Option<Arc<QueueTask>> {
        let mut found = None;
        self.buckets.retain(|_, bucket| {
            bucket.retain(|t| {
                let is_target = t.base().gid() == gid;
                if is_target {
                    found = Some(Arc::clone(t));
                }
                !is_target
            });
            !bucket.is_empty()
        });
        found
    }

    pub fn has_task(&self, pattern: &regex::Regex) -> bool {
        self.buckets.values().flatten().any(|t| t.matches_label(pattern))
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(VecDeque::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qos::QoS;

    fn task(uptime: u64, label: &str) -> Arc<QueueTask> {
        QueueTask::new(QoS::Default, 1, Some(label.to_string()), Box::new(|| {}), uptime, None, 0)
    }

    #[test]
    fn fifo_order_within_same_bucket() {
        let mut wm = WhenMap::new();
        let a = task(100, "a");
        let b = task(100, "b");
        let ga = a.base().gid();
        wm.insert(a, false);
        wm.insert(b, false);
        assert_eq!(wm.pop_one_due(200).unwrap().base().gid(), ga);
    }

    #[test]
    fn submit_head_prepends() {
        let mut wm = WhenMap::new();
        let a = task(100, "a");
        let b = task(100, "b");
        let gb = b.base().gid();
        wm.insert(a, false);
        wm.insert(b, true);
        assert_eq!(wm.pop_one_due(200).unwrap().base().gid(), gb);
    }

    #[test]
    fn not_due_yet_returns_none() {
        let mut wm = WhenMap::new();
        wm.insert(task(500, "a"), false);
        assert!(wm.pop_one_due(100).is_none());
    }

    #[test]
    fn pop_all_due_drains_whole_bucket() {
        let mut wm = WhenMap::new();
        wm.insert(task(100, "a"), false);
        wm.insert(task(100, "b"), false);
        wm.insert(task(200, "c"), false);
        let batch = wm.pop_all_due(150);
        assert_eq!(batch.len(), 2);
        assert_eq!(wm.len(), 1);
    }

    #[test]
    fn remove_matching_by_label() {
        let mut wm = WhenMap::new();
        wm.insert(task(100, "net-fetch"), false);
        wm.insert(task(100, "disk-flush"), false);
        let pattern = regex::Regex::new("net-.*").unwrap();
        let removed = wm.remove_matching(&pattern);
        assert_eq!(removed.len(), 1);
        assert_eq!(wm.len(), 1);
    }
}
