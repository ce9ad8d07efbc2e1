/// A fixed set of [`EventLoop`](crate::EventLoop)s handed out round-robin.
pub struct EventLoopGroup {
    loops: Vec<crate::EventLoop>,
    next: std::sync::atomic::AtomicUsize,
}

impl EventLoopGroup {
    /// Creates and starts `count` loops.
    pub fn new(count: usize) -> Result<Self, crate::Error> {
        if count == 0 {
            return Err(crate::Error::InvalidConfig("an event loop group needs at least one loop".to_owned()));
        }

        let loops: Vec<_> = (0..count).map(crate::EventLoop::new).collect();
        for event_loop in &loops {
            if let Err(err) = event_loop.start() {
                for event_loop in &loops {
                    event_loop.shutdown();
                }
                return Err(err);
            }
        }

        tracing::info!(loops = count, "event loop group started");
        Ok(EventLoopGroup {
            loops,
            next: Default::default(),
        })
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn loops(&self) -> &[crate::EventLoop] {
        &self.loops
    }

    /// Safe to call from any number of threads at once.
    pub fn next_loop(&self) -> crate::EventLoop {
        let index = self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % self.loops.len();
        self.loops[index].clone()
    }

    pub fn shutdown(&self) {
        for event_loop in &self.loops {
            event_loop.shutdown();
        }
    }

    /// Waits for every loop to drain after [`shutdown`](EventLoopGroup::shutdown).
    pub fn join(&self) {
        for event_loop in &self.loops {
            event_loop.join();
        }
    }
}

impl std::fmt::Debug for EventLoopGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopGroup")
            .field("loops", &self.loops)
            .finish()
    }
}
