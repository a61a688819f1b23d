//! Small worker-pool helper for Pass-3 decompression.
//!
//! Tasks are independent; workers pull indices from a shared counter
//! and report through a wait group. Device reads stay serialized behind
//! one mutex, everything else runs in parallel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// Counts outstanding tasks; `wait` blocks until every `done` arrived.
#[derive(Clone)]
pub struct WaitGroup {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

impl WaitGroup {
    pub fn new() -> WaitGroup {
        WaitGroup {
            inner: Arc::new((Mutex::new(0), Condvar::new())),
        }
    }

    pub fn add(&self, count: usize) {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap() += count;
    }

    pub fn done(&self) {
        let (lock, cvar) = &*self.inner;
        let mut pending = lock.lock().unwrap();
        if *pending > 0 {
            *pending -= 1;
            if *pending == 0 {
                cvar.notify_all();
            }
        }
    }

    pub fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let mut pending = lock.lock().unwrap();
        while *pending > 0 {
            pending = cvar.wait(pending).unwrap();
        }
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        WaitGroup::new()
    }
}

/// Run `task(i)` for every `i < task_count` on up to `max_workers`
/// threads and collect the results in index order.
pub fn run_indexed<T, F>(task_count: usize, max_workers: usize, task: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync,
{
    if task_count == 0 {
        return Vec::new();
    }
    let workers = max_workers.max(1).min(task_count);

    let mut slots: Vec<Option<T>> = Vec::with_capacity(task_count);
    slots.resize_with(task_count, || None);
    let slots = Mutex::new(slots);
    let next = AtomicUsize::new(0);
    let wg = WaitGroup::new();
    wg.add(task_count);

    thread::scope(|scope| {
        for _ in 0..workers {
            let wg = wg.clone();
            let slots = &slots;
            let next = &next;
            let task = &task;
            scope.spawn(move || loop {
                let i = next.fetch_add(1, Ordering::Relaxed);
                if i >= task_count {
                    break;
                }
                let value = task(i);
                slots.lock().unwrap()[i] = Some(value);
                wg.done();
            });
        }
        wg.wait();
    });

    slots
        .into_inner()
        .unwrap()
        .into_iter()
        .map(|slot| slot.expect("worker completed every task"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_come_back_in_index_order() {
        let out = run_indexed(100, 4, |i| i * 2);
        assert_eq!(out.len(), 100);
        for (i, v) in out.iter().enumerate() {
            assert_eq!(*v, i * 2);
        }
    }

    #[test]
    fn single_worker_and_empty_input() {
        assert!(run_indexed(0, 4, |i| i).is_empty());
        assert_eq!(run_indexed(3, 1, |i| i + 1), vec![1, 2, 3]);
    }

    #[test]
    fn wait_group_reaches_zero() {
        let wg = WaitGroup::new();
        wg.add(2);
        let w2 = wg.clone();
        let handle = std::thread::spawn(move || {
            w2.done();
            w2.done();
        });
        wg.wait();
        handle.join().unwrap();
    }
}
