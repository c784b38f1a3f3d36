//! Delayed-task execution for deferred closes and registry expiries.
//!
//! One worker thread owns a min-heap of deadlines and waits on a
//! crossbeam channel with `recv_timeout` until the nearest deadline falls
//! due. Every scheduled task carries a [`CancelToken`]; a reference removed
//! by another path cancels its pending timer deterministically instead of
//! relying on the fired check to notice.
//!
//! Tasks must be short and non-blocking: they run on the shared timer
//! thread.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};

/// Cancellation handle for one scheduled task.
#[derive(Clone, Debug)]
pub(crate) struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Prevents the task from running if it has not fired yet.
    pub(crate) fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

type Task = Box<dyn FnOnce() + Send>;

enum Command {
    Schedule {
        deadline: Instant,
        token: CancelToken,
        run: Task,
    },
    Stop,
}

struct Entry {
    deadline: Instant,
    seq: u64,
    token: CancelToken,
    run: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the BinaryHeap pops the earliest deadline first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Timer thread executing tasks at their deadline.
pub(crate) struct Scheduler {
    tx: Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        let (tx, rx) = unbounded();
        let worker = thread::Builder::new()
            .name("r66-timer".into())
            .spawn(move || run_worker(&rx))
            .expect("spawn timer thread");
        Self {
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Schedules `run` to execute after `delay`. Returns its cancel token.
    pub(crate) fn schedule_after(
        &self,
        delay: Duration,
        run: impl FnOnce() + Send + 'static,
    ) -> CancelToken {
        let token = CancelToken::new();
        let command = Command::Schedule {
            deadline: Instant::now() + delay,
            token: token.clone(),
            run: Box::new(run),
        };
        if self.tx.send(command).is_err() {
            // Scheduler already stopped; the task will never run.
            token.cancel();
        }
        token
    }

    /// Stops the worker thread, dropping tasks that have not fired.
    pub(crate) fn stop(&self) {
        let _ = self.tx.send(Command::Stop);
        let worker = self.worker.lock().expect("scheduler lock poisoned").take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Stop);
    }
}

fn run_worker(rx: &Receiver<Command>) {
    let mut heap: BinaryHeap<Entry> = BinaryHeap::new();
    let mut next_seq: u64 = 0;

    loop {
        let received = match heap.peek() {
            Some(entry) => {
                let wait = entry.deadline.saturating_duration_since(Instant::now());
                rx.recv_timeout(wait)
            }
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(Command::Schedule {
                deadline,
                token,
                run,
            }) => {
                heap.push(Entry {
                    deadline,
                    seq: next_seq,
                    token,
                    run,
                });
                next_seq += 1;
            }
            Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        while heap.peek().is_some_and(|entry| entry.deadline <= now) {
            let entry = heap.pop().expect("peeked entry exists");
            if !entry.token.is_cancelled() {
                (entry.run)();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_task_after_delay() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);

        scheduler.schedule_after(Duration::from_millis(10), move || {
            flag.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(fired.load(Ordering::SeqCst));
        scheduler.stop();
    }

    #[test]
    fn cancelled_task_never_runs() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);

        let token = scheduler.schedule_after(Duration::from_millis(20), move || {
            flag.store(true, Ordering::SeqCst);
        });
        token.cancel();

        thread::sleep(Duration::from_millis(60));
        assert!(!fired.load(Ordering::SeqCst));
        scheduler.stop();
    }

    #[test]
    fn tasks_fire_in_deadline_order() {
        let scheduler = Scheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (delay_ms, label) in [(30u64, 3u8), (10, 1), (20, 2)] {
            let order = Arc::clone(&order);
            scheduler.schedule_after(Duration::from_millis(delay_ms), move || {
                order.lock().expect("order lock").push(label);
            });
        }

        thread::sleep(Duration::from_millis(80));
        assert_eq!(*order.lock().expect("order lock"), vec![1, 2, 3]);
        scheduler.stop();
    }

    #[test]
    fn stop_drops_pending_tasks() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        scheduler.schedule_after(Duration::from_secs(60), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.stop();

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
