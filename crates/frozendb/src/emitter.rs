//! Row emitter (C4): broadcasts newly durable rows to subscribers in
//! registration order. Delivery is synchronous with the writer: the
//! transaction engine calls `emit` after each byte write is durable and
//! before returning success to the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::codec::RowUnion;
use crate::error::Result;

/// A registered callback. `id` lets `unsubscribe` find it again; storing
/// subscribers behind `Arc` means a snapshot clone is O(subscribers) in
/// pointer copies only, never a deep clone.
struct Subscriber {
    id: u64,
    callback: Box<dyn Fn(u64, &RowUnion) -> Result<()> + Send + Sync>,
}

/// Handle returned by [`RowEmitter::subscribe`]; pass to `unsubscribe`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriptionHandle(u64);

#[derive(Default)]
pub struct RowEmitter {
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
}

impl RowEmitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        callback: impl Fn(u64, &RowUnion) -> Result<()> + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push(Arc::new(Subscriber {
            id,
            callback: Box::new(callback),
        }));
        SubscriptionHandle(id)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.subscribers.write().retain(|s| s.id != handle.0);
    }

    /// Delivers `row` to a point-in-time snapshot of subscribers taken in
    /// registration order. Concurrent subscribe/unsubscribe never
    /// disturbs this in-flight delivery. Returns the first subscriber
    /// error encountered, if any.
    pub fn emit(&self, logical_index: u64, row: &RowUnion) -> Result<()> {
        let snapshot: Vec<Arc<Subscriber>> = self.subscribers.read().clone();
        for subscriber in &snapshot {
            (subscriber.callback)(logical_index, row)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ChecksumRow;
    use std::sync::Mutex;

    fn sample_row() -> RowUnion {
        RowUnion::Checksum(ChecksumRow { crc: 1 })
    }

    #[test]
    fn delivers_in_registration_order() {
        let emitter = RowEmitter::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = Arc::clone(&order);
            emitter.subscribe(move |_, _| {
                order.lock().unwrap().push(n);
                Ok(())
            });
        }
        emitter.emit(0, &sample_row()).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let emitter = RowEmitter::new();
        let hits = Arc::new(Mutex::new(0));
        let hits_clone = Arc::clone(&hits);
        let handle = emitter.subscribe(move |_, _| {
            *hits_clone.lock().unwrap() += 1;
            Ok(())
        });
        emitter.emit(0, &sample_row()).unwrap();
        emitter.unsubscribe(handle);
        emitter.emit(1, &sample_row()).unwrap();
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn subscriber_error_propagates() {
        let emitter = RowEmitter::new();
        emitter.subscribe(|_, _| Err(crate::error::Error::corrupt("boom")));
        assert!(emitter.emit(0, &sample_row()).is_err());
    }
}
