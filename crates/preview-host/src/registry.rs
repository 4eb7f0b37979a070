use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use preview_instance::{InstanceStatus, PrDetails, PrNumber};

use crate::instance::{InstanceEnv, PreviewInstance};

/// All preview instances known to this process, keyed by PR number.
///
/// Lock order is registry, then an instance's queue or state. Work is queued on
/// an instance while the registry lock is held (see [`Self::with_instance`]), so
/// a teardown deciding whether to leave the registry always sees it.
pub struct InstanceRegistry {
    env: Arc<InstanceEnv>,
    instances: Mutex<HashMap<PrNumber, Arc<PreviewInstance>>>,
}

impl InstanceRegistry {
    pub fn new(env: InstanceEnv) -> Arc<Self> {
        Arc::new(Self {
            env: Arc::new(env),
            instances: Mutex::new(HashMap::new()),
        })
    }

    pub fn env(&self) -> &Arc<InstanceEnv> {
        &self.env
    }

    pub fn get(&self, pr: PrNumber) -> Option<Arc<PreviewInstance>> {
        self.lock().get(&pr).cloned()
    }

    pub fn contains(&self, pr: PrNumber) -> bool {
        self.lock().contains_key(&pr)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns the instance for `details.number`, creating it from `details`
    /// if needed. An existing instance keeps its own details.
    pub fn get_or_create(self: &Arc<Self>, details: &PrDetails) -> Arc<PreviewInstance> {
        self.with_instance(details, Arc::clone)
    }

    /// Like [`Self::get_or_create`], but runs `f` before the registry lock is
    /// released. Use it to queue operations.
    pub fn with_instance<R>(
        self: &Arc<Self>,
        details: &PrDetails,
        f: impl FnOnce(&Arc<PreviewInstance>) -> R,
    ) -> R {
        let mut instances = self.lock();
        let instance = instances.entry(details.number).or_insert_with(|| {
            tracing::debug!(pr = %details.number, "registering instance");
            PreviewInstance::new(details.clone(), Arc::clone(&self.env), Arc::downgrade(self))
        });
        f(instance)
    }

    /// Snapshot of every instance, ordered by PR number.
    pub fn statuses(&self) -> Vec<InstanceStatus> {
        let instances: Vec<Arc<PreviewInstance>> = self.lock().values().cloned().collect();
        let mut out: Vec<InstanceStatus> = instances.iter().map(|i| i.status()).collect();
        out.sort_by_key(|s| s.pr);
        out
    }

    /// Drops `instance` from the registry unless work is queued behind the
    /// caller or the entry has already been replaced.
    pub(crate) fn remove_if_idle(&self, instance: &Arc<PreviewInstance>) -> bool {
        let mut instances = self.lock();
        let same = instances
            .get(&instance.pr())
            .is_some_and(|cur| Arc::ptr_eq(cur, instance));
        if !same || instance.queue().waiting() > 0 {
            return false;
        }
        instances.remove(&instance.pr());
        true
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PrNumber, Arc<PreviewInstance>>> {
        self.instances.lock().unwrap_or_else(|e| e.into_inner())
    }
}
