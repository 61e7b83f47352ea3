//! Fixed table of 256 correlation slots.
//!
//! Every outstanding request occupies the slot whose index is its message
//! id until a reply takes it, its deadline passes, or the table is torn
//! down. Ids are handed out round-robin; id `0xFF` is never used, so at
//! most 255 requests are in flight at once. When the next id is still
//! occupied, [`SlotTable::hold`] waits for that one slot instead of
//! searching for a free one, which keeps ids cycling in order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, trace};

use trapsync_protocol::MessageId;

use crate::MessagerError;

/// Number of slots; one per possible id byte.
pub const SLOT_COUNT: usize = 256;

/// How often stale occupants are expired.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Why an occupant left its slot other than by being taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReason {
    /// The table was torn down.
    Clear,
    /// The occupant's deadline passed.
    Expire,
    /// The occupant was explicitly dropped, usually after a write failure.
    Drop,
}

/// Something that can sit in a slot.
///
/// `on_delete` runs exactly once for an occupant removed by anything other
/// than [`SlotTable::take`]; taken occupants are handed back instead.
pub trait Occupant: Send + 'static {
    fn on_delete(self, reason: DeleteReason, err: Option<MessagerError>);
}

struct Slot<T> {
    occupant: Option<T>,
    expires: Instant,
}

struct Inner<T> {
    slots: Vec<Slot<T>>,
    cursor: u8,
    enabled: bool,
}

impl<T> Inner<T> {
    fn next_id(&mut self) -> MessageId {
        let id = self.cursor;
        self.cursor = self.cursor.wrapping_add(1);
        if self.cursor == MessageId::RESERVED.0 {
            self.cursor = 0;
        }
        MessageId(id)
    }
}

/// The correlation slot table shared by one messager's read and write
/// tasks.
pub struct SlotTable<T: Occupant> {
    inner: Mutex<Inner<T>>,
    released: Vec<Notify>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Occupant> SlotTable<T> {
    /// Creates an enabled table and starts its expiry sweep.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Arc<Self> {
        let now = Instant::now();
        let table = Arc::new(Self {
            inner: Mutex::new(Inner {
                slots: (0..SLOT_COUNT)
                    .map(|_| Slot {
                        occupant: None,
                        expires: now,
                    })
                    .collect(),
                cursor: 0,
                enabled: true,
            }),
            released: (0..SLOT_COUNT).map(|_| Notify::new()).collect(),
            sweeper: Mutex::new(None),
        });

        let handle = tokio::spawn(sweep(Arc::downgrade(&table)));
        *lock(&table.sweeper) = Some(handle);
        table
    }

    /// Reserves the next id for `occupant`, expiring after `timeout`.
    ///
    /// If the slot is occupied, waits until it is released or its occupant
    /// expires, but no longer than `timeout` itself.
    ///
    /// # Errors
    /// - [`MessagerError::SlotsDisabled`] if the table is (or gets) torn down
    /// - [`MessagerError::MessageExpired`] if the wait outlasts `timeout`
    pub async fn hold(&self, occupant: T, timeout: Duration) -> Result<MessageId, MessagerError> {
        let deadline = Instant::now() + timeout;
        let id = {
            let mut inner = lock(&self.inner);
            if !inner.enabled {
                return Err(MessagerError::SlotsDisabled);
            }
            inner.next_id()
        };
        let mut occupant = Some(occupant);

        loop {
            // Register interest before looking, so a release between the
            // check and the wait is not missed.
            let released = self.released[id.index()].notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let (evicted, wait_until) = {
                let mut inner = lock(&self.inner);
                if !inner.enabled {
                    return Err(MessagerError::SlotsDisabled);
                }
                let now = Instant::now();
                let slot = &mut inner.slots[id.index()];

                if slot.occupant.is_none() || slot.expires <= now {
                    let evicted = slot.occupant.take();
                    slot.occupant = occupant.take();
                    slot.expires = now + timeout;
                    (evicted, None)
                } else {
                    (None, Some(slot.expires.min(deadline)))
                }
            };

            let Some(wait_until) = wait_until else {
                if let Some(old) = evicted {
                    debug!(%id, "evicting expired occupant");
                    old.on_delete(DeleteReason::Expire, None);
                }
                trace!(%id, "slot held");
                return Ok(id);
            };

            if Instant::now() >= deadline {
                return Err(MessagerError::MessageExpired);
            }

            tokio::select! {
                _ = &mut released => {}
                _ = sleep_until(wait_until) => {}
            }
        }
    }

    /// Removes and returns the occupant of `id` without notifying it.
    pub fn take(&self, id: MessageId) -> Result<T, MessagerError> {
        let taken = lock(&self.inner).slots[id.index()].occupant.take();
        match taken {
            Some(occupant) => {
                self.released[id.index()].notify_waiters();
                Ok(occupant)
            }
            None => Err(MessagerError::SlotNotFound(id)),
        }
    }

    /// Like [`take`](Self::take), but only when `pred` accepts the
    /// occupant. Returns `Ok(None)` if it is held but rejected.
    pub fn take_if(
        &self,
        id: MessageId,
        pred: impl FnOnce(&T) -> bool,
    ) -> Result<Option<T>, MessagerError> {
        let taken = {
            let mut inner = lock(&self.inner);
            let slot = &mut inner.slots[id.index()];
            let accepted = match &slot.occupant {
                None => return Err(MessagerError::SlotNotFound(id)),
                Some(occupant) => pred(occupant),
            };
            if !accepted {
                return Ok(None);
            }
            slot.occupant.take()
        };
        self.released[id.index()].notify_waiters();
        Ok(taken)
    }

    /// Removes the occupant of `id` and tells it why.
    pub fn drop_message(&self, id: MessageId, err: Option<MessagerError>) -> Result<(), MessagerError> {
        let occupant = self.take(id)?;
        occupant.on_delete(DeleteReason::Drop, err);
        Ok(())
    }

    /// Returns `true` if `id` currently has an occupant.
    pub fn is_held(&self, id: MessageId) -> bool {
        lock(&self.inner).slots[id.index()].occupant.is_some()
    }

    /// Number of ids that could be held right now.
    pub fn free(&self) -> usize {
        SLOT_COUNT - 1 - self.remains()
    }

    /// Number of occupied slots.
    pub fn remains(&self) -> usize {
        lock(&self.inner)
            .slots
            .iter()
            .filter(|s| s.occupant.is_some())
            .count()
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.inner).enabled
    }

    /// Removes every occupant whose deadline has passed.
    pub fn expire(&self) {
        let now = Instant::now();
        let expired: Vec<(usize, T)> = {
            let mut inner = lock(&self.inner);
            inner
                .slots
                .iter_mut()
                .enumerate()
                .filter(|(_, s)| s.occupant.is_some() && s.expires <= now)
                .filter_map(|(i, s)| s.occupant.take().map(|o| (i, o)))
                .collect()
        };

        for (i, occupant) in expired {
            debug!(id = %MessageId(i as u8), "slot expired");
            occupant.on_delete(DeleteReason::Expire, None);
            self.released[i].notify_waiters();
        }
    }

    /// Disables the table, stops the sweep and clears every occupant.
    /// Pending and future holds fail with `SlotsDisabled`. Idempotent.
    pub async fn deinit(&self) {
        let cleared: Vec<T> = {
            let mut inner = lock(&self.inner);
            inner.enabled = false;
            inner
                .slots
                .iter_mut()
                .filter_map(|s| s.occupant.take())
                .collect()
        };

        let sweeper = lock(&self.sweeper).take();
        if let Some(handle) = sweeper {
            handle.abort();
            let _ = handle.await;
        }

        if !cleared.is_empty() {
            debug!(count = cleared.len(), "clearing held messages");
        }
        for occupant in cleared {
            occupant.on_delete(DeleteReason::Clear, None);
        }
        for released in &self.released {
            released.notify_waiters();
        }
    }
}

impl<T: Occupant> Drop for SlotTable<T> {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.sweeper).take() {
            handle.abort();
        }
    }
}

async fn sweep<T: Occupant>(table: Weak<SlotTable<T>>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(table) = table.upgrade() else {
            return;
        };
        table.expire();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    /// Occupant that reports its deletion on a channel.
    struct Tracked {
        tag: u32,
        deleted: mpsc::UnboundedSender<(u32, DeleteReason)>,
    }

    impl Occupant for Tracked {
        fn on_delete(self, reason: DeleteReason, _err: Option<MessagerError>) {
            let _ = self.deleted.send((self.tag, reason));
        }
    }

    fn tracked(tag: u32, tx: &mpsc::UnboundedSender<(u32, DeleteReason)>) -> Tracked {
        Tracked {
            tag,
            deleted: tx.clone(),
        }
    }

    const LONG: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_hold_hands_out_ids_in_order() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let table = SlotTable::new();

        for expected in 0..3u8 {
            let id = table.hold(tracked(0, &tx), LONG).await.unwrap();
            assert_eq!(id, MessageId(expected));
        }
        assert_eq!(table.free(), 255 - 3);
        assert_eq!(table.remains(), 3);
    }

    #[tokio::test]
    async fn test_hold_skips_reserved_id() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let table = SlotTable::new();

        let mut last = MessageId(0);
        for _ in 0..255 {
            last = table.hold(tracked(0, &tx), LONG).await.unwrap();
            assert_ne!(last, MessageId::RESERVED);
        }
        assert_eq!(last, MessageId(254));
        assert_eq!(table.free(), 0);
        assert_eq!(table.remains(), 255);
    }

    #[tokio::test]
    async fn test_hold_waits_for_occupied_slot_until_take() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let table = SlotTable::new();
        for _ in 0..255 {
            table.hold(tracked(0, &tx), LONG).await.unwrap();
        }

        let waiter = {
            let table = Arc::clone(&table);
            let tx = tx.clone();
            tokio::spawn(async move { table.hold(tracked(1, &tx), LONG).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "the 256th hold must block");

        table.take(MessageId(0)).unwrap();
        let id = waiter.await.unwrap().unwrap();
        assert_eq!(id, MessageId(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_evicts_expired_occupant() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let table = SlotTable::new();
        table.hold(tracked(7, &tx), Duration::from_millis(200)).await.unwrap();
        for _ in 1..255 {
            table.hold(tracked(0, &tx), LONG).await.unwrap();
        }

        // Wraps to slot 0, which frees up once its occupant expires.
        let id = table.hold(tracked(8, &tx), LONG).await.unwrap();

        assert_eq!(id, MessageId(0));
        assert_eq!(rx.recv().await, Some((7, DeleteReason::Expire)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_gives_up_after_own_timeout() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let table = SlotTable::new();
        for _ in 0..255 {
            table.hold(tracked(0, &tx), LONG).await.unwrap();
        }

        let err = table
            .hold(tracked(1, &tx), Duration::from_millis(300))
            .await
            .unwrap_err();

        assert!(matches!(err, MessagerError::MessageExpired));
    }

    #[tokio::test]
    async fn test_take_returns_occupant_without_deleting() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let table = SlotTable::new();
        let id = table.hold(tracked(3, &tx), LONG).await.unwrap();

        let occupant = table.take(id).unwrap();

        assert_eq!(occupant.tag, 3);
        assert!(rx.try_recv().is_err());
        assert!(matches!(table.take(id), Err(MessagerError::SlotNotFound(_))));
    }

    #[tokio::test]
    async fn test_take_if_rejects_without_removing() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let table = SlotTable::new();
        let id = table.hold(tracked(3, &tx), LONG).await.unwrap();

        assert!(table.take_if(id, |p| p.tag == 4).unwrap().is_none());
        assert!(table.is_held(id));
        assert_eq!(table.take_if(id, |p| p.tag == 3).unwrap().map(|p| p.tag), Some(3));
    }

    #[tokio::test]
    async fn test_drop_notifies_with_drop_reason() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let table = SlotTable::new();
        let id = table.hold(tracked(5, &tx), LONG).await.unwrap();

        table.drop_message(id, None).unwrap();

        assert_eq!(rx.recv().await, Some((5, DeleteReason::Drop)));
        assert!(!table.is_held(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expires_stale_occupants() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let table = SlotTable::new();
        let id = table.hold(tracked(9, &tx), Duration::from_millis(500)).await.unwrap();

        tokio::time::sleep(SWEEP_INTERVAL * 2).await;

        assert_eq!(rx.recv().await, Some((9, DeleteReason::Expire)));
        assert!(!table.is_held(id));
    }

    #[tokio::test]
    async fn test_deinit_clears_and_rejects_new_holds() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let table = SlotTable::new();
        table.hold(tracked(1, &tx), LONG).await.unwrap();
        table.hold(tracked(2, &tx), LONG).await.unwrap();

        table.deinit().await;
        table.deinit().await;

        assert_eq!(rx.recv().await, Some((1, DeleteReason::Clear)));
        assert_eq!(rx.recv().await, Some((2, DeleteReason::Clear)));
        assert!(!table.is_enabled());
        let err = table.hold(tracked(3, &tx), LONG).await.unwrap_err();
        assert!(matches!(err, MessagerError::SlotsDisabled));
    }

    #[tokio::test]
    async fn test_deinit_wakes_blocked_hold() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let table = SlotTable::new();
        for _ in 0..255 {
            table.hold(tracked(0, &tx), LONG).await.unwrap();
        }
        let waiter = {
            let table = Arc::clone(&table);
            let tx = tx.clone();
            tokio::spawn(async move { table.hold(tracked(1, &tx), LONG).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        table.deinit().await;

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, MessagerError::SlotsDisabled));
    }
}
