pub type LocalTask = std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), crate::Error>>>>;

type Task = Box<dyn FnOnce() -> LocalTask + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Started,
    ShuttingDown,
    Stopped,
}

impl LoopState {
    fn from_u8(state: u8) -> Self {
        match state {
            0 => LoopState::Idle,
            1 => LoopState::Started,
            2 => LoopState::ShuttingDown,
            _ => LoopState::Stopped,
        }
    }
}

/// A single-worker task queue.
///
/// Tasks run strictly in submission order, and each one runs to completion, including every
/// suspension inside it, before the next is taken. Cloning yields another handle to the same loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: std::sync::Arc<EventLoopInner>,
}

struct EventLoopInner {
    id: usize,
    state: std::sync::atomic::AtomicU8,
    sender: parking_lot::Mutex<Option<crossbeam_channel::Sender<Task>>>,
    receiver: parking_lot::Mutex<Option<crossbeam_channel::Receiver<Task>>>,
    worker: parking_lot::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl EventLoop {
    pub fn new(id: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        EventLoop {
            inner: std::sync::Arc::new(EventLoopInner {
                id,
                state: std::sync::atomic::AtomicU8::new(LoopState::Idle as u8),
                sender: parking_lot::Mutex::new(Some(sender)),
                receiver: parking_lot::Mutex::new(Some(receiver)),
                worker: Default::default(),
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.inner.state.load(std::sync::atomic::Ordering::Acquire))
    }

    pub fn is_shut_down(&self) -> bool {
        matches!(self.state(), LoopState::ShuttingDown | LoopState::Stopped)
    }

    /// Spawns the worker. Calling it again, or after shutdown, does nothing.
    pub fn start(&self) -> Result<(), crate::Error> {
        if self.inner.state.compare_exchange(
            LoopState::Idle as u8,
            LoopState::Started as u8,
            std::sync::atomic::Ordering::AcqRel,
            std::sync::atomic::Ordering::Acquire,
        ).is_err() {
            return Ok(());
        }

        let receiver = match self.inner.receiver.lock().take() {
            Some(receiver) => receiver,
            None => return Ok(()),
        };

        let inner = self.inner.clone();
        let spawned =
            std::thread::Builder::new()
            .name(format!("burst-loop-{}", self.inner.id))
            .spawn(move || run(&inner, &receiver));
        let worker = match spawned {
            Ok(worker) => worker,
            Err(err) => {
                tracing::error!(loop_id = self.inner.id, %err, "could not spawn loop worker");
                self.stop_without_worker();
                return Err(err.into());
            },
        };
        *self.inner.worker.lock() = Some(worker);

        tracing::debug!(loop_id = self.inner.id, "loop started");
        Ok(())
    }

    /// Queues `task` behind everything already submitted. Callable from any thread.
    ///
    /// The closure is sent to the worker and invoked there, so the future it builds does not need to be `Send`.
    pub fn submit<F, Fut>(&self, task: F) -> Result<(), crate::Error>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), crate::Error>> + 'static,
    {
        let sender = self.inner.sender.lock();
        let sender = sender.as_ref().ok_or(crate::Error::LoopShutdown(self.inner.id))?;
        sender
            .send(Box::new(move || Box::pin(task()) as LocalTask))
            .map_err(|_| crate::Error::LoopShutdown(self.inner.id))
    }

    /// Stops accepting tasks. Queued and in-flight tasks still run to completion.
    pub fn shutdown(&self) {
        let previous = self.inner.state.fetch_max(LoopState::ShuttingDown as u8, std::sync::atomic::Ordering::AcqRel);
        drop(self.inner.sender.lock().take());

        match LoopState::from_u8(previous) {
            LoopState::Idle => self.stop_without_worker(),
            LoopState::Started => tracing::debug!(loop_id = self.inner.id, "loop shutting down"),
            LoopState::ShuttingDown | LoopState::Stopped => (),
        }
    }

    /// No worker will ever drain the queue: reject new tasks and drop the queued ones.
    fn stop_without_worker(&self) {
        drop(self.inner.sender.lock().take());
        drop(self.inner.receiver.lock().take());
        self.inner.state.store(LoopState::Stopped as u8, std::sync::atomic::Ordering::Release);
    }

    /// Waits for the worker to finish draining. Only returns once `shutdown` has been called.
    pub fn join(&self) {
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::error!(loop_id = self.inner.id, "loop worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

fn run(inner: &EventLoopInner, receiver: &crossbeam_channel::Receiver<Task>) {
    let reactor = match crate::reactor::Reactor::new() {
        Ok(reactor) => std::rc::Rc::new(reactor),
        Err(err) => {
            tracing::error!(loop_id = inner.id, %err, "could not create reactor, loop stopped");
            inner.state.store(LoopState::Stopped as u8, std::sync::atomic::Ordering::Release);
            return;
        },
    };
    reactor.install();

    // Ends once every sender is gone, i.e. after shutdown, and only when the queue is empty.
    for task in receiver {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| reactor.block_on(task())));
        match outcome {
            Ok(Ok(Ok(()))) => (),
            Ok(Ok(Err(err))) => tracing::error!(loop_id = inner.id, %err, "task failed"),
            Ok(Err(err)) => tracing::error!(loop_id = inner.id, %err, "reactor failed while running task"),
            Err(panic) => tracing::error!(loop_id = inner.id, panic = panic_message(&*panic), "task panicked"),
        }
    }

    inner.state.store(LoopState::Stopped as u8, std::sync::atomic::Ordering::Release);
    tracing::debug!(loop_id = inner.id, "loop stopped");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    }
    else if let Some(message) = panic.downcast_ref::<String>() {
        message
    }
    else {
        "<non-string panic>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (std::sync::Arc<parking_lot::Mutex<Vec<usize>>>, impl Fn(usize) -> Box<dyn FnOnce() + Send>) {
        let log: std::sync::Arc<parking_lot::Mutex<Vec<usize>>> = Default::default();
        let push = {
            let log = log.clone();
            move |n: usize| -> Box<dyn FnOnce() + Send> {
                let log = log.clone();
                Box::new(move || log.lock().push(n))
            }
        };
        (log, push)
    }

    #[test]
    fn tasks_run_in_submission_order() {
        let event_loop = EventLoop::new(0);
        let (log, push) = recorder();

        for n in 0..100 {
            let push = push(n);
            event_loop.submit(move || async move {
                push();
                Ok(())
            }).unwrap();
        }

        event_loop.start().unwrap();
        event_loop.shutdown();
        event_loop.join();

        assert_eq!(*log.lock(), (0..100).collect::<Vec<_>>());
        assert_eq!(event_loop.state(), LoopState::Stopped);
    }

    #[test]
    fn a_suspended_task_finishes_before_the_next_starts() {
        let event_loop = EventLoop::new(0);
        event_loop.start().unwrap();
        let (log, push) = recorder();

        let (wake_sender, wake_receiver) = crossbeam_channel::bounded::<std::task::Waker>(1);
        std::thread::spawn(move || {
            if let Ok(waker) = wake_receiver.recv() {
                std::thread::sleep(std::time::Duration::from_millis(50));
                waker.wake();
            }
        });

        let (first, second) = (push(1), push(2));
        event_loop.submit(move || async move {
            let mut suspended = false;
            std::future::poll_fn(|cx| {
                if suspended {
                    std::task::Poll::Ready(())
                }
                else {
                    suspended = true;
                    wake_sender.send(cx.waker().clone()).unwrap();
                    std::task::Poll::Pending
                }
            }).await;
            first();
            Ok(())
        }).unwrap();
        event_loop.submit(move || async move {
            second();
            Ok(())
        }).unwrap();

        event_loop.shutdown();
        event_loop.join();
        assert_eq!(*log.lock(), vec![1, 2]);
    }

    fn explode() -> Result<(), crate::Error> {
        panic!("handler panicked")
    }

    #[test]
    fn failing_and_panicking_tasks_do_not_stop_the_worker() {
        let event_loop = EventLoop::new(3);
        event_loop.start().unwrap();
        let (log, push) = recorder();

        event_loop.submit(|| async { Err::<(), _>(crate::Error::handler("boom")) }).unwrap();
        event_loop.submit(|| async { explode() }).unwrap();
        let push = push(7);
        event_loop.submit(move || async move {
            push();
            Ok(())
        }).unwrap();

        event_loop.shutdown();
        event_loop.join();
        assert_eq!(*log.lock(), vec![7]);
    }

    #[test]
    fn shutdown_rejects_new_tasks_but_drains_queued_ones() {
        let event_loop = EventLoop::new(1);
        let (log, push) = recorder();

        for n in 0..3 {
            let push = push(n);
            event_loop.submit(move || async move {
                push();
                Ok(())
            }).unwrap();
        }
        event_loop.start().unwrap();
        event_loop.shutdown();

        let rejected = event_loop.submit(|| async { Ok(()) });
        assert!(matches!(rejected, Err(crate::Error::LoopShutdown(1))));
        assert!(event_loop.is_shut_down());

        event_loop.join();
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn start_is_idempotent() {
        let event_loop = EventLoop::new(0);
        event_loop.start().unwrap();
        event_loop.start().unwrap();
        assert_eq!(event_loop.state(), LoopState::Started);
        event_loop.shutdown();
        event_loop.join();
        event_loop.start().unwrap();
        assert_eq!(event_loop.state(), LoopState::Stopped);
    }

    #[test]
    fn a_loop_whose_worker_never_spawned_rejects_tasks() {
        let event_loop = EventLoop::new(4);
        let (log, push) = recorder();
        let push = push(1);
        event_loop.submit(move || async move {
            push();
            Ok(())
        }).unwrap();

        // The state `start` leaves behind when the spawn itself fails.
        event_loop.inner.state.store(LoopState::Started as u8, std::sync::atomic::Ordering::Release);
        let receiver = event_loop.inner.receiver.lock().take();
        drop(receiver);
        event_loop.stop_without_worker();

        assert_eq!(event_loop.state(), LoopState::Stopped);
        assert!(matches!(event_loop.submit(|| async { Ok(()) }), Err(crate::Error::LoopShutdown(4))));
        event_loop.start().unwrap();
        event_loop.join();
        assert!(log.lock().is_empty());
    }

    #[test]
    fn shutting_down_an_idle_loop_stops_it() {
        let event_loop = EventLoop::new(0);
        event_loop.shutdown();
        assert_eq!(event_loop.state(), LoopState::Stopped);
        event_loop.start().unwrap();
        assert_eq!(event_loop.state(), LoopState::Stopped);
    }
}
