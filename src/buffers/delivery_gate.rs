use std::sync::atomic::{AtomicUsize, Ordering};

/// Ensures that at most one task at a time drains a receive buffer, without blocking the others.
///
/// Every task that added messages calls [DeliveryGate::enter]. The first one becomes the drainer,
///  all others return immediately. The drainer keeps removing and delivering messages, and only
///  stops after [DeliveryGate::leave] reports that no other task entered in the meantime. A task
///  that entered while the drainer was busy bumped the counter, so the drainer does another round
///  and picks up that task's messages.
///
/// ```ignore
/// if gate.enter() {
///     loop {
///         match remove_batch() {
///             Some(batch) => deliver(batch),
///             None => if !gate.leave() { break; }
///         }
///     }
/// }
/// ```
#[derive(Default, Debug)]
pub struct DeliveryGate {
    adders: AtomicUsize,
}

impl DeliveryGate {
    pub fn new() -> DeliveryGate {
        DeliveryGate::default()
    }

    /// returns `true` if the caller became the drainer
    #[must_use]
    pub fn enter(&self) -> bool {
        self.adders.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// Called by the drainer after it found nothing to remove. Returns `true` if other tasks
    ///  entered since, i.e. the drainer must do another round.
    #[must_use]
    pub fn leave(&self) -> bool {
        self.adders.fetch_sub(1, Ordering::AcqRel) != 1
    }

    #[cfg(test)]
    pub fn is_draining(&self) -> bool {
        self.adders.load(Ordering::Acquire) != 0
    }
}
