use std::future::Future;
use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::{DateTime, FixedOffset, Utc};
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::error::Result;
use crate::schedule::CronSchedule;

/// Invoked once per fire with the entry's planned and next fire times.
pub type Callback = Arc<dyn Fn(Fire) -> BoxFuture<'static, ()> + Send + Sync>;

/// The fire times handed to a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fire {
    /// The fire time this callback represents.
    pub planned_at: DateTime<Utc>,
    /// The following fire time of the same entry.
    pub next_at: DateTime<Utc>,
}

/// Last computed fire times of an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Entry {
    pub prev: Option<DateTime<Utc>>,
    pub next: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(usize);

struct Slot {
    schedule: CronSchedule,
    callback: Callback,
    times: Mutex<Entry>,
}

impl Slot {
    fn update(&self, f: impl FnOnce(&mut Entry)) {
        let mut times = self.times.lock().expect("ticker entry poisoned");
        f(&mut times);
    }
}

struct TickerInner {
    offset: FixedOffset,
    slots: RwLock<Vec<Arc<Slot>>>,
    /// `Some` while running.
    running: Mutex<Option<CancellationToken>>,
    tracker: TaskTracker,
}

/// Cron timer driving registered callbacks on the tokio runtime.
///
/// Every entry gets its own timer task; every fire is spawned as a separate
/// task so a slow callback never delays other entries. Cheap to clone.
#[derive(Clone)]
pub struct Ticker {
    inner: Arc<TickerInner>,
}

impl Ticker {
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            inner: Arc::new(TickerInner {
                offset,
                slots: RwLock::new(Vec::new()),
                running: Mutex::new(None),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Register `callback` under `spec`. Entries added while running start
    /// ticking immediately.
    pub fn register(&self, spec: &str, callback: Callback) -> Result<EntryId> {
        let schedule = CronSchedule::parse(spec, self.inner.offset)?;
        let slot = Arc::new(Slot {
            schedule,
            callback,
            times: Mutex::new(Entry::default()),
        });

        let id = {
            let mut slots = self.inner.slots.write().expect("ticker slots poisoned");
            slots.push(Arc::clone(&slot));
            EntryId(slots.len() - 1)
        };

        let running = self.inner.running.lock().expect("ticker state poisoned");
        if let Some(token) = running.as_ref() {
            self.spawn_entry(slot, token.clone());
        }
        debug!(spec, "ticker entry registered");
        Ok(id)
    }

    pub fn entry(&self, id: EntryId) -> Option<Entry> {
        let slots = self.inner.slots.read().expect("ticker slots poisoned");
        slots
            .get(id.0)
            .map(|slot| *slot.times.lock().expect("ticker entry poisoned"))
    }

    /// Handle that does not keep the ticker alive. Registered callbacks own
    /// their jobs, so jobs must only hold the ticker weakly.
    pub(crate) fn downgrade(&self) -> WeakTicker {
        WeakTicker(Arc::downgrade(&self.inner))
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .running
            .lock()
            .expect("ticker state poisoned")
            .is_some()
    }

    /// Start every entry's timer. No-op if already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut running = self.inner.running.lock().expect("ticker state poisoned");
        if running.is_some() {
            return;
        }
        let token = CancellationToken::new();
        self.inner.tracker.reopen();

        let slots = self.inner.slots.read().expect("ticker slots poisoned");
        for slot in slots.iter() {
            self.spawn_entry(Arc::clone(slot), token.clone());
        }
        info!(entries = slots.len(), "ticker started");
        *running = Some(token);
    }

    /// Stop the timers. The returned future resolves once every callback
    /// already in flight has returned.
    pub fn stop(&self) -> impl Future<Output = ()> + Send + 'static {
        if let Some(token) = self
            .inner
            .running
            .lock()
            .expect("ticker state poisoned")
            .take()
        {
            token.cancel();
            info!("ticker stopping");
        }
        self.inner.tracker.close();
        let tracker = self.inner.tracker.clone();
        async move { tracker.wait().await }
    }

    fn spawn_entry(&self, slot: Arc<Slot>, token: CancellationToken) {
        let tracker = self.inner.tracker.clone();
        self.inner
            .tracker
            .spawn(drive_entry(slot, tracker, token));
    }
}

#[derive(Clone)]
pub(crate) struct WeakTicker(Weak<TickerInner>);

impl WeakTicker {
    pub(crate) fn entry(&self, id: EntryId) -> Option<Entry> {
        let inner = self.0.upgrade()?;
        Ticker { inner }.entry(id)
    }
}

async fn drive_entry(slot: Arc<Slot>, tracker: TaskTracker, token: CancellationToken) {
    let mut from = Utc::now();
    loop {
        let Some(target) = slot.schedule.next_after(from) else {
            debug!(spec = slot.schedule.spec(), "schedule exhausted");
            slot.update(|times| times.next = None);
            return;
        };
        slot.update(|times| times.next = Some(target));

        let wait = (target - Utc::now()).to_std().unwrap_or_default();
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        let next_at = slot
            .schedule
            .next_after(target)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        slot.update(|times| {
            times.prev = Some(target);
            times.next = Some(next_at);
        });
        tracker.spawn((slot.callback)(Fire {
            planned_at: target,
            next_at,
        }));

        // Ticks that passed while we were late are skipped, not replayed.
        from = target.max(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures_util::FutureExt;

    use super::*;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    #[test]
    fn register_rejects_bad_spec() {
        let ticker = Ticker::new(utc());
        let callback: Callback = Arc::new(|_: Fire| async {}.boxed());
        assert!(ticker.register("every now and then", callback).is_err());
    }

    #[test]
    fn entry_has_no_times_before_start() {
        let ticker = Ticker::new(utc());
        let callback: Callback = Arc::new(|_: Fire| async {}.boxed());
        let id = ticker.register("* * * * * *", callback).unwrap();
        assert_eq!(ticker.entry(id), Some(Entry::default()));
        assert!(!ticker.is_running());
    }

    #[tokio::test]
    async fn fires_every_second_with_consecutive_times() {
        let ticker = Ticker::new(utc());
        let fired = Arc::new(AtomicUsize::new(0));
        let fires = Arc::new(Mutex::new(Vec::new()));

        let (f, log) = (Arc::clone(&fired), Arc::clone(&fires));
        let callback: Callback = Arc::new(move |fire: Fire| {
            let (f, log) = (Arc::clone(&f), Arc::clone(&log));
            async move {
                log.lock().unwrap().push(fire);
                f.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        });
        let id = ticker.register("* * * * * *", callback).unwrap();

        ticker.start();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        ticker.stop().await;

        let count = fired.load(Ordering::SeqCst);
        assert!((2..=3).contains(&count), "fired {count} times");
        for fire in fires.lock().unwrap().iter() {
            assert_eq!(fire.next_at - fire.planned_at, chrono::Duration::seconds(1));
            assert_eq!(fire.planned_at.timestamp_subsec_nanos(), 0);
        }
        let entry = ticker.entry(id).unwrap();
        assert!(entry.prev.is_some());
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_callbacks() {
        let ticker = Ticker::new(utc());
        let done = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&done);
        let callback: Callback = Arc::new(move |_: Fire| {
            let d = Arc::clone(&d);
            async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                d.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        });
        ticker.register("* * * * * *", callback).unwrap();

        ticker.start();
        // Long enough for at least one fire to be in flight.
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        ticker.stop().await;

        assert!(done.load(Ordering::SeqCst) >= 1);
        assert!(!ticker.is_running());
    }
}
