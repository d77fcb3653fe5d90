use super::instance::Instance;
use super::lock;
use crate::error::BrokerError;
use crate::reply::Reply;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info};

/// Single slot naming the instance that module-level queries go to.
///
/// The slot holds a weak reference: it routes queries but never keeps an
/// instance alive or closes it. The first instance marked default keeps the
/// slot until it is closed.
#[derive(Default)]
pub struct DefaultRegistry {
    slot: Mutex<Option<Weak<Instance>>>,
}

impl DefaultRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `instance` if the slot is free. Returns whether it took effect.
    pub fn set_default(&self, instance: &Arc<Instance>) -> bool {
        // Checked under the slot lock: close marks the instance closed before
        // it clears the slot, so a store here is always seen by that clear.
        let mut slot = lock(&self.slot);
        if instance.is_closed() {
            debug!(instance = %instance.name(), "Closed instance cannot become default");
            return false;
        }

        if let Some(current) = slot.as_ref().and_then(Weak::upgrade) {
            debug!(
                instance = %instance.name(),
                current = %current.name(),
                "Default already set, ignoring"
            );
            return false;
        }

        *slot = Some(Arc::downgrade(instance));
        info!(instance = %instance.name(), "Default instance set");
        true
    }

    pub fn current(&self) -> Option<Arc<Instance>> {
        lock(&self.slot).as_ref().and_then(Weak::upgrade)
    }

    pub fn is_default(&self, instance: &Instance) -> bool {
        lock(&self.slot)
            .as_ref()
            .is_some_and(|w| std::ptr::eq(w.as_ptr(), instance))
    }

    /// Empties the slot only if it points at `instance`.
    pub fn clear_if(&self, instance: &Instance) -> bool {
        let mut slot = lock(&self.slot);
        let occupied_by_instance = slot
            .as_ref()
            .is_some_and(|w| std::ptr::eq(w.as_ptr(), instance));

        if occupied_by_instance {
            *slot = None;
            info!(instance = %instance.name(), "Default instance cleared");
        }
        occupied_by_instance
    }

    /// Routes `sql` to the default instance.
    pub async fn query_default(&self, sql: &str) -> Reply {
        match self.current() {
            Some(instance) => instance.query(sql).await,
            None => Reply::err(BrokerError::NoDefault),
        }
    }
}
