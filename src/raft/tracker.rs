use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// Tracks committed entries between hand-off to the apply side and the
/// moment their effects have been enforced.
///
/// The raft node `watch`es each committed entry (indexes arrive in strictly
/// increasing order) and `wait`s for the previous entry's confirmation
/// before emitting the next one, which is what makes apply serial. A
/// snapshot taker calls `pause` → `wait` to quiesce apply, serializes the
/// state sources, and `resume`s.
pub struct EntryTracker {
    window: Mutex<Window>,
    changed: watch::Sender<u64>,
}

#[derive(Default)]
struct Window {
    first_index: u64,
    confirmed: Vec<bool>,
    paused: bool,
}

impl EntryTracker {
    pub fn new() -> Arc<Self> {
        let (changed, _) = watch::channel(0);
        Arc::new(EntryTracker {
            window: Mutex::new(Window::default()),
            changed,
        })
    }

    /// Registers `index` and returns the handle that confirms it. Blocks
    /// while the tracker is paused. Indexes must arrive in increasing order.
    pub async fn watch(self: &Arc<Self>, index: u64) -> AckHandle {
        let mut rx = self.changed.subscribe();
        loop {
            {
                let mut window = self.window.lock().expect("tracker window poisoned");
                if !window.paused {
                    if window.confirmed.is_empty() {
                        window.first_index = index;
                    }
                    window.confirmed.push(false);
                    return AckHandle {
                        tracker: self.clone(),
                        index,
                        fired: false,
                    };
                }
            }
            if rx.changed().await.is_err() {
                // sender lives as long as self; treat as spurious
                continue;
            }
        }
    }

    /// Blocks until every watched entry has been confirmed.
    pub async fn wait(&self) {
        let mut rx = self.changed.subscribe();
        loop {
            if self
                .window
                .lock()
                .expect("tracker window poisoned")
                .confirmed
                .is_empty()
            {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Makes future `watch` calls block until `resume`.
    pub fn pause(&self) {
        self.window.lock().expect("tracker window poisoned").paused = true;
    }

    pub fn resume(&self) {
        self.window.lock().expect("tracker window poisoned").paused = false;
        self.changed.send_modify(|gen| *gen += 1);
    }

    fn confirm(&self, index: u64) {
        let mut window = self.window.lock().expect("tracker window poisoned");
        let slot = (index - window.first_index) as usize;
        if slot < window.confirmed.len() {
            window.confirmed[slot] = true;
        }

        let pruned = window
            .confirmed
            .iter()
            .take_while(|&&confirmed| confirmed)
            .count();
        window.confirmed.drain(..pruned);
        window.first_index += pruned as u64;
        drop(window);

        self.changed.send_modify(|gen| *gen += 1);
    }
}

/// Confirms one watched entry. Fires exactly once: explicitly through
/// `ack`, or on drop if an error path loses the handle, so a failed apply
/// can never wedge the ordering gate.
pub struct AckHandle {
    tracker: Arc<EntryTracker>,
    index: u64,
    fired: bool,
}

impl AckHandle {
    pub fn ack(mut self) {
        self.fire();
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    fn fire(&mut self) {
        if !self.fired {
            self.fired = true;
            self.tracker.confirm(self.index);
        }
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        self.fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_once_all_confirmed() {
        let tracker = EntryTracker::new();
        let a = tracker.watch(5).await;
        let b = tracker.watch(6).await;

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        b.ack();
        a.ack();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait should finish")
            .unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_confirmation_prunes_contiguously() {
        let tracker = EntryTracker::new();
        let a = tracker.watch(1).await;
        let b = tracker.watch(2).await;
        let c = tracker.watch(3).await;

        // confirming the middle first must not release the window
        b.ack();
        {
            let window = tracker.window.lock().unwrap();
            assert_eq!(window.first_index, 1);
            assert_eq!(window.confirmed.len(), 3);
        }

        a.ack();
        {
            let window = tracker.window.lock().unwrap();
            assert_eq!(window.first_index, 3);
            assert_eq!(window.confirmed.len(), 1);
        }

        c.ack();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_pause_blocks_watch_until_resume() {
        let tracker = EntryTracker::new();
        tracker.pause();

        let blocked = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.watch(1).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!blocked.is_finished());

        tracker.resume();
        let handle = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("watch should unblock")
            .unwrap();
        handle.ack();
    }

    #[tokio::test]
    async fn test_dropped_handle_still_confirms() {
        let tracker = EntryTracker::new();
        let handle = tracker.watch(9).await;
        drop(handle);
        tracker.wait().await;
    }
}
