use tokio::sync::oneshot;

use crate::CacheError;

/// What a waiter receives once the computation it is waiting on settles.
pub(crate) type Delivery<V, E> = Result<V, CacheError<E>>;

/// A caller waiting on somebody else's computation.
struct Waiter<V, E> {
    id: u64,
    sender: oneshot::Sender<Delivery<V, E>>,
}

/// Bookkeeping for a key whose computation is currently running.
///
/// A slot only exists while its computation is in flight. It is removed, and all of its waiters
/// are released, in the same critical section that settles the computation.
pub(crate) struct Slot<V, E> {
    waiters: Vec<Waiter<V, E>>,
    /// Set by `delete` while in flight: the result is still delivered but not cached.
    invalidated: bool,
}

impl<V, E> Slot<V, E> {
    pub fn new() -> Self {
        Self {
            waiters: Vec::new(),
            invalidated: false,
        }
    }

    /// Appends a new waiter and returns the receiving end of its delivery channel.
    pub fn register(&mut self, id: u64) -> oneshot::Receiver<Delivery<V, E>> {
        let (sender, receiver) = oneshot::channel();
        self.waiters.push(Waiter { id, sender });
        receiver
    }

    /// Removes the waiter with the given `id`, returning whether it was still registered.
    pub fn deregister(&mut self, id: u64) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|waiter| waiter.id != id);
        self.waiters.len() != before
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Marks the result of this slot as not to be cached.
    ///
    /// Returns `false` if the slot was already invalidated.
    pub fn invalidate(&mut self) -> bool {
        !std::mem::replace(&mut self.invalidated, true)
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }
}

impl<V: Clone, E: Clone> Slot<V, E> {
    /// Hands `delivery` to every registered waiter, consuming the slot.
    ///
    /// Returns the number of waiters that actually received it. A waiter whose receiver is
    /// already gone has been cancelled and is simply skipped.
    pub fn release(self, delivery: Delivery<V, E>) -> usize {
        let mut delivered = 0;
        for waiter in self.waiters {
            if waiter.sender.send(delivery.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_delivers_once_to_each_waiter() {
        let mut slot: Slot<u32, ()> = Slot::new();
        let mut receivers: Vec<_> = (0..3).map(|id| slot.register(id)).collect();

        assert_eq!(slot.release(Ok(42)), 3);

        for receiver in &mut receivers {
            assert_eq!(receiver.try_recv().unwrap(), Ok(42));
        }
    }

    #[test]
    fn test_deregister_removes_only_that_waiter() {
        let mut slot: Slot<u32, ()> = Slot::new();
        let mut first = slot.register(1);
        let second = slot.register(2);

        assert!(slot.deregister(2));
        assert!(!slot.deregister(2));
        assert_eq!(slot.waiter_count(), 1);
        drop(second);

        assert_eq!(slot.release(Err(CacheError::Aborted)), 1);
        assert_eq!(first.try_recv().unwrap(), Err(CacheError::Aborted));
    }

    #[test]
    fn test_dropped_receiver_is_skipped() {
        let mut slot: Slot<u32, ()> = Slot::new();
        drop(slot.register(1));
        let mut alive = slot.register(2);

        assert_eq!(slot.release(Ok(1)), 1);
        assert_eq!(alive.try_recv().unwrap(), Ok(1));
    }

    #[test]
    fn test_invalidate_reports_first_call_only() {
        let mut slot: Slot<u32, ()> = Slot::new();
        assert!(!slot.is_invalidated());
        assert!(slot.invalidate());
        assert!(!slot.invalidate());
        assert!(slot.is_invalidated());
    }
}
