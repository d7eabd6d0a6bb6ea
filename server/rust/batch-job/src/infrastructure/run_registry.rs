use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use uuid::Uuid;

use crate::domain::service::InterruptKind;

/// RunControl は実行中ループ 1 つ分の中断ラッチ。
/// ラッチは一度立てたら戻らない。
#[derive(Debug)]
pub struct RunControl {
    job_id: Uuid,
    cancelled: AtomicBool,
    paused: AtomicBool,
}

impl RunControl {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            cancelled: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// 立っているラッチを返す。キャンセルが優先される。
    pub fn interrupt(&self) -> Option<InterruptKind> {
        if self.is_cancelled() {
            Some(InterruptKind::Cancelled)
        } else if self.is_paused() {
            Some(InterruptKind::Paused)
        } else {
            None
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunRegistryError {
    #[error("run registry is at capacity ({0} live jobs)")]
    AtCapacity(usize),
    #[error("job already has a live execution loop: {0}")]
    AlreadyRegistered(Uuid),
}

/// RunRegistry はこのプロセスで生きている実行ループの索引。
/// プロセス再起動をまたいでは保持されない。
pub trait RunRegistry: Send + Sync {
    fn register(&self, job_id: Uuid) -> Result<Arc<RunControl>, RunRegistryError>;

    fn get(&self, job_id: Uuid) -> Option<Arc<RunControl>>;

    /// エントリがあればキャンセルラッチを立てて true を返す。
    fn signal_cancel(&self, job_id: Uuid) -> bool {
        self.get(job_id).map(|c| c.cancel()).is_some()
    }

    /// エントリがあれば一時停止ラッチを立てて true を返す。
    fn signal_pause(&self, job_id: Uuid) -> bool {
        self.get(job_id).map(|c| c.pause()).is_some()
    }

    fn remove(&self, job_id: Uuid) -> bool;

    fn is_live(&self, job_id: Uuid) -> bool {
        self.get(job_id).is_some()
    }

    fn live_count(&self) -> usize;
}

/// InMemoryRunRegistry は上限付きの RunRegistry 実装。
/// ロックは await をまたいで保持しない。
pub struct InMemoryRunRegistry {
    entries: Mutex<HashMap<Uuid, Arc<RunControl>>>,
    capacity: usize,
}

impl InMemoryRunRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<RunControl>>> {
        // 保持中に panic するコードはないため、poison されても中身はそのまま使える
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RunRegistry for InMemoryRunRegistry {
    fn register(&self, job_id: Uuid) -> Result<Arc<RunControl>, RunRegistryError> {
        let mut entries = self.lock();
        if entries.contains_key(&job_id) {
            return Err(RunRegistryError::AlreadyRegistered(job_id));
        }
        if entries.len() >= self.capacity {
            return Err(RunRegistryError::AtCapacity(self.capacity));
        }
        let control = Arc::new(RunControl::new(job_id));
        entries.insert(job_id, Arc::clone(&control));
        Ok(control)
    }

    fn get(&self, job_id: Uuid) -> Option<Arc<RunControl>> {
        self.lock().get(&job_id).cloned()
    }

    fn remove(&self, job_id: Uuid) -> bool {
        self.lock().remove(&job_id).is_some()
    }

    fn live_count(&self) -> usize {
        self.lock().len()
    }
}

/// RunGuard はスコープを抜けるときにレジストリのエントリを必ず削除する。
pub struct RunGuard {
    registry: Arc<dyn RunRegistry>,
    job_id: Uuid,
}

impl RunGuard {
    pub fn new(registry: Arc<dyn RunRegistry>, job_id: Uuid) -> Self {
        Self { registry, job_id }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry.remove(self.job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_signal() {
        let registry = InMemoryRunRegistry::new(4);
        let job_id = Uuid::new_v4();
        let control = registry.register(job_id).unwrap();

        assert!(registry.is_live(job_id));
        assert!(control.interrupt().is_none());
        assert!(registry.signal_pause(job_id));
        assert_eq!(control.interrupt(), Some(InterruptKind::Paused));
        assert!(registry.signal_cancel(job_id));
        assert_eq!(control.interrupt(), Some(InterruptKind::Cancelled));
    }

    #[test]
    fn test_signal_absent_entry_is_tolerated() {
        let registry = InMemoryRunRegistry::new(4);
        let job_id = Uuid::new_v4();
        assert!(!registry.signal_cancel(job_id));
        assert!(!registry.signal_pause(job_id));
        assert!(!registry.remove(job_id));
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let registry = InMemoryRunRegistry::new(4);
        let job_id = Uuid::new_v4();
        registry.register(job_id).unwrap();
        assert!(matches!(
            registry.register(job_id),
            Err(RunRegistryError::AlreadyRegistered(id)) if id == job_id
        ));
    }

    #[test]
    fn test_capacity_is_enforced() {
        let registry = InMemoryRunRegistry::new(2);
        registry.register(Uuid::new_v4()).unwrap();
        registry.register(Uuid::new_v4()).unwrap();
        assert!(matches!(
            registry.register(Uuid::new_v4()),
            Err(RunRegistryError::AtCapacity(2))
        ));
        assert_eq!(registry.live_count(), 2);
    }

    #[test]
    fn test_guard_removes_entry_on_drop() {
        let registry: Arc<dyn RunRegistry> = Arc::new(InMemoryRunRegistry::new(4));
        let job_id = Uuid::new_v4();
        registry.register(job_id).unwrap();
        {
            let _guard = RunGuard::new(Arc::clone(&registry), job_id);
            assert!(registry.is_live(job_id));
        }
        assert!(!registry.is_live(job_id));
        assert_eq!(registry.live_count(), 0);
    }
}
