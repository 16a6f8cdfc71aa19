use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
};

/// Something that produces training batches one at a time. `None` means the
/// source is exhausted.
pub trait BatchSource: Send + 'static {
    type Batch: Send + 'static;

    fn next_batch(&mut self) -> Option<Self::Batch>;
}

impl<I> BatchSource for I
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    type Batch = I::Item;

    fn next_batch(&mut self) -> Option<Self::Batch> {
        self.next()
    }
}

struct Queue<T> {
    batches: VecDeque<T>,
    exhausted: bool,
    finished: bool,
}

struct Shared<T> {
    queue: Mutex<Queue<T>>,
    /// Signaled when a batch is added or the producer stops.
    ready: Condvar,
    /// Signaled when a batch is taken or the iterator terminates.
    space: Condvar,
    capacity: usize,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Queue<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Prefetches batches from a [`BatchSource`] on a background thread into a
/// bounded queue.
pub struct DataIterator<T> {
    shared: Arc<Shared<T>>,
    worker: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> DataIterator<T> {
    pub fn new<S>(source: S, capacity: usize) -> Self
    where
        S: BatchSource<Batch = T>,
    {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                batches: VecDeque::with_capacity(capacity),
                exhausted: false,
                finished: false,
            }),
            ready: Condvar::new(),
            space: Condvar::new(),
            capacity: capacity.max(1),
        });
        let worker = {
            let shared = shared.clone();
            thread::spawn(move || produce(source, &shared))
        };
        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Blocks until a batch is available. Returns `None` once the source is
    /// exhausted and drained, or after `terminate`.
    pub fn get_next(&self) -> Option<T> {
        let mut queue = self.shared.lock();
        loop {
            if queue.finished {
                return None;
            }
            if let Some(batch) = queue.batches.pop_front() {
                self.shared.space.notify_one();
                return Some(batch);
            }
            if queue.exhausted {
                return None;
            }
            queue = self
                .shared
                .ready
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl<T> DataIterator<T> {
    /// Stops the background thread and wakes every waiter. Calling it more
    /// than once is harmless.
    pub fn terminate(&mut self) {
        {
            let mut queue = self.shared.lock();
            queue.finished = true;
            queue.batches.clear();
        }
        self.shared.ready.notify_all();
        self.shared.space.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("DataIterator: the producer thread panicked");
            }
        }
    }
}

impl<T> Drop for DataIterator<T> {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn produce<S: BatchSource>(mut source: S, shared: &Shared<S::Batch>) {
    loop {
        {
            let mut queue = shared.lock();
            while queue.batches.len() >= shared.capacity && !queue.finished {
                queue = shared
                    .space
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if queue.finished {
                return;
            }
        }

        // The source may be slow, so it runs without holding the lock.
        let batch = source.next_batch();

        let mut queue = shared.lock();
        if queue.finished {
            return;
        }
        match batch {
            Some(batch) => queue.batches.push_back(batch),
            None => {
                queue.exhausted = true;
                shared.ready.notify_all();
                log::debug!("DataIterator: source exhausted");
                return;
            }
        }
        shared.ready.notify_one();
    }
}

#[test]
fn yields_every_batch_in_order() {
    let iter = DataIterator::new(0..10, 3);
    let batches = std::iter::from_fn(|| iter.get_next()).collect::<Vec<_>>();
    assert_eq!(batches, (0..10).collect::<Vec<_>>());
    assert_eq!(iter.get_next(), None);
}

#[test]
fn empty_source() {
    let iter = DataIterator::new(std::iter::empty::<u32>(), 2);
    assert_eq!(iter.get_next(), None);
}

#[test]
fn terminate_is_idempotent() {
    let mut iter = DataIterator::new(0.., 2);
    assert_eq!(iter.get_next(), Some(0));
    iter.terminate();
    iter.terminate();
    assert_eq!(iter.get_next(), None);
}

#[test]
fn drop_stops_an_endless_source() {
    let mut n = 0;
    let source = std::iter::repeat_with(move || {
        n += 1;
        vec![n as f32; 4]
    });
    let iter = DataIterator::new(source, 4);
    assert_eq!(iter.get_next(), Some(vec![1.0; 4]));
    drop(iter);
}
