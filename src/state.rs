use crate::config::Config;
use crate::reconciler::Reconciler;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct ControllerContext {
    pub(crate) kube_client: kube::Client,
    pub(crate) config: Arc<Config>,
    pub(crate) reconciler: Arc<Reconciler>,
    pub(crate) health: HealthState,
    /// Held for the duration of a scan so ticks never overlap.
    pub(crate) scan_lock: Arc<Mutex<()>>,
}

/// Readiness flag shared between the scan loop and the probe endpoints.
#[derive(Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}
