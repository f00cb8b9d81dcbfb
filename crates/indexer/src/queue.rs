//! Bounded per-chain ingest queue.
//!
//! One queue + one worker per chain keeps chains independent while in-chain
//! processing stays strictly sequential. The handle is passed explicitly to
//! whoever enqueues (no process-wide singletons), and a full queue rejects
//! the task — the poll loop recomputes the same range on its next tick, so
//! dropped ticks cost nothing.

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestTask {
    pub chain_id: u64,
    pub from_block: u64,
    pub to_block: u64,
}

#[derive(Clone)]
pub struct IngestQueue {
    tx: mpsc::Sender<IngestTask>,
}

impl IngestQueue {
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<IngestTask>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }

    /// Non-blocking enqueue; false when the queue is full or the worker is
    /// gone.
    pub fn try_enqueue(&self, task: IngestTask) -> bool {
        self.tx.try_send(task).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(from_block: u64) -> IngestTask {
        IngestTask {
            chain_id: 1,
            from_block,
            to_block: from_block + 9,
        }
    }

    #[tokio::test]
    async fn test_enqueue_and_receive_in_order() {
        let (queue, mut rx) = IngestQueue::new(4);
        assert!(queue.try_enqueue(task(1)));
        assert!(queue.try_enqueue(task(11)));

        assert_eq!(rx.recv().await.unwrap().from_block, 1);
        assert_eq!(rx.recv().await.unwrap().from_block, 11);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_blocking() {
        let (queue, mut rx) = IngestQueue::new(2);
        assert!(queue.try_enqueue(task(1)));
        assert!(queue.try_enqueue(task(11)));
        assert!(!queue.try_enqueue(task(21)), "third enqueue must be rejected");

        // Draining one slot makes room again.
        let _ = rx.recv().await.unwrap();
        assert!(queue.try_enqueue(task(21)));
    }

    #[tokio::test]
    async fn test_enqueue_fails_after_worker_drops() {
        let (queue, rx) = IngestQueue::new(2);
        drop(rx);
        assert!(!queue.try_enqueue(task(1)));
    }
}
