//! Per-consumer intention queue. A consumer anchors a queue at a log
//! position; the dispatcher pushes every intention at or past that
//! position, in strictly increasing position order. The queue's position
//! advances only on push, to one past the delivered intention, so the
//! dispatcher can always tell what a queue still needs.

use std::collections::VecDeque;
use std::sync::Arc;

use eyre::{ensure, eyre, Result};
use parking_lot::{Condvar, Mutex};

use crate::txn::Intention;

struct QueueInner {
    queue: VecDeque<Arc<Intention>>,
    pos: u64,
    stopped: bool,
}

pub struct IntentionQueue {
    inner: Mutex<QueueInner>,
    cond: Condvar,
}

impl IntentionQueue {
    pub fn new(pos: u64) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                pos,
                stopped: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// The next log position this queue is waiting for.
    pub fn position(&self) -> u64 {
        self.inner.lock().pos
    }

    /// Delivers an intention. Positions must arrive in increasing order;
    /// a push behind the queue's position is a dispatcher bug and fatal.
    pub fn push(&self, intention: Arc<Intention>) -> Result<()> {
        let pos = intention
            .position()
            .ok_or_else(|| eyre!("intention pushed without a log position"))?;
        let mut inner = self.inner.lock();
        ensure!(
            pos >= inner.pos,
            "intention {pos} pushed behind queue position {}",
            inner.pos
        );
        inner.pos = pos + 1;
        inner.queue.push_back(intention);
        drop(inner);
        self.cond.notify_one();
        Ok(())
    }

    /// Blocks for the next intention; `None` after [`stop`](Self::stop).
    pub fn wait(&self) -> Option<Arc<Intention>> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(intention) = inner.queue.pop_front() {
                return Some(intention);
            }
            if inner.stopped {
                return None;
            }
            self.cond.wait(&mut inner);
        }
    }

    pub fn stop(&self) {
        self.inner.lock().stopped = true;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn intention_at(pos: u64) -> Arc<Intention> {
        let mut intention = Intention::new(0, 1);
        intention.set_position(pos);
        Arc::new(intention)
    }

    #[test]
    fn delivers_in_push_order_and_advances_position() {
        let queue = IntentionQueue::new(0);
        queue.push(intention_at(0)).unwrap();
        queue.push(intention_at(2)).unwrap();
        assert_eq!(queue.position(), 3);
        assert_eq!(queue.wait().unwrap().position(), Some(0));
        assert_eq!(queue.wait().unwrap().position(), Some(2));
    }

    #[test]
    fn rejects_out_of_order_push() {
        let queue = IntentionQueue::new(5);
        assert!(queue.push(intention_at(3)).is_err());
    }

    #[test]
    fn rejects_positionless_intention() {
        let queue = IntentionQueue::new(0);
        assert!(queue.push(Arc::new(Intention::new(0, 1))).is_err());
    }

    #[test]
    fn stop_wakes_blocked_waiter_with_sentinel() {
        let queue = Arc::new(IntentionQueue::new(0));
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.wait())
        };
        thread::sleep(Duration::from_millis(20));
        queue.stop();
        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn queued_intentions_drain_before_sentinel() {
        let queue = IntentionQueue::new(0);
        queue.push(intention_at(0)).unwrap();
        queue.stop();
        assert!(queue.wait().is_some());
        assert!(queue.wait().is_none());
    }
}
