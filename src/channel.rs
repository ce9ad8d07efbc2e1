use std::io::{Read, Write};

static NEXT_CHANNEL_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        ChannelId(NEXT_CHANNEL_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Receive buffer size estimate, kept within `[floor, ceiling]`.
///
/// A receive that fills the buffer doubles it; one that fills less than half halves it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdaptiveSize {
    floor: usize,
    ceiling: usize,
    current: usize,
}

impl AdaptiveSize {
    pub fn new(floor: usize, ceiling: usize) -> Self {
        let floor = floor.max(1);
        AdaptiveSize {
            floor,
            ceiling: ceiling.max(floor),
            current: floor,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn floor(&self) -> usize {
        self.floor
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn record(&mut self, received: usize) {
        if received == self.current && self.current < self.ceiling {
            self.current = self.current.saturating_mul(2).min(self.ceiling);
        }
        else if received < self.current / 2 && self.current > self.floor {
            self.current = (self.current / 2).max(self.floor);
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChannelOptions {
    pub receive: AdaptiveSize,
    pub pool: std::sync::Arc<crate::BufferPool>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        ChannelOptions::from(&crate::config::ReceiveConfig::default())
    }
}

impl From<&crate::config::ReceiveConfig> for ChannelOptions {
    fn from(config: &crate::config::ReceiveConfig) -> Self {
        ChannelOptions {
            receive: AdaptiveSize::new(config.floor, config.ceiling),
            pool: crate::BufferPool::shared().clone(),
        }
    }
}

/// One accepted connection: its socket, its pipeline, and the loop it is pinned to.
///
/// Everything a channel does after [`start`](Channel::start) happens on that loop's worker.
pub struct Channel {
    id: ChannelId,
    fd: std::os::unix::io::RawFd,
    peer_addr: Option<std::net::SocketAddr>,
    stream: std::cell::RefCell<Option<std::net::TcpStream>>,
    event_loop: crate::EventLoop,
    pipeline: crate::Pipeline,
    pool: std::sync::Arc<crate::BufferPool>,
    receive_size: std::cell::Cell<AdaptiveSize>,
    closed: std::cell::Cell<bool>,
    disconnect_listeners: std::cell::RefCell<Vec<crate::pipeline::ChannelListener>>,
}

impl Channel {
    /// Takes ownership of `stream` and `pipeline`, then fires the pipeline's connect listeners.
    pub fn new(
        stream: std::net::TcpStream,
        event_loop: crate::EventLoop,
        mut pipeline: crate::Pipeline,
        options: ChannelOptions,
    ) -> Result<Self, crate::Error> {
        stream.set_nonblocking(true)?;

        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&stream);
        let peer_addr = stream.peer_addr().ok();
        let (connect_listeners, disconnect_listeners) = pipeline.take_listeners();

        let channel = Channel {
            id: ChannelId::next(),
            fd,
            peer_addr,
            stream: std::cell::RefCell::new(Some(stream)),
            event_loop,
            pipeline,
            pool: options.pool,
            receive_size: std::cell::Cell::new(options.receive),
            closed: std::cell::Cell::new(false),
            disconnect_listeners: std::cell::RefCell::new(disconnect_listeners),
        };
        tracing::debug!(channel = %channel.id, peer = ?channel.peer_addr, loop_id = channel.event_loop.id(), "channel active");

        for listener in connect_listeners {
            listener(&channel);
        }

        Ok(channel)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.peer_addr
    }

    pub fn event_loop(&self) -> &crate::EventLoop {
        &self.event_loop
    }

    pub fn pipeline(&self) -> &crate::Pipeline {
        &self.pipeline
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Current size of the buffer the next receive will use.
    pub fn receive_buffer_size(&self) -> usize {
        self.receive_size.get().current()
    }

    /// Subscribes to the disconnect notification. Ignored once the channel is closed.
    pub fn on_disconnect(&self, listener: impl FnOnce(&Channel) + Send + 'static) {
        if !self.closed.get() {
            self.disconnect_listeners.borrow_mut().push(Box::new(listener));
        }
    }

    /// Queues the receive loop on this channel's loop.
    pub fn start(self) -> Result<(), crate::Error> {
        let event_loop = self.event_loop.clone();
        event_loop.submit(move || self.run())
    }

    /// Writes the unread region of `buffer` to the socket, advancing its reader index by what was sent.
    ///
    /// The write resumes after partial writes until everything is flushed. A transport error aborts
    /// the send; the bytes that did go out stay consumed, so the caller can retry with the rest.
    pub async fn send(&self, buffer: &mut crate::Buffer) -> Result<usize, crate::Error> {
        if self.closed.get() {
            tracing::warn!(channel = %self.id, "cannot send on a closed channel");
            return Err(crate::Error::ChannelClosed(self.id));
        }

        let scratch = {
            let readable = buffer.readable()?;
            let mut scratch = self.pool.rent(readable.len());
            scratch.copy_from_slice(readable);
            scratch
        };

        let mut sent = 0;
        while sent < scratch.len() {
            let pending = &scratch[sent..];
            match std::future::poll_fn(|cx| self.poll_send(cx, pending)).await {
                Ok(written) => {
                    sent += written;
                    buffer.set_reader_index(buffer.reader_index() + written)?;
                },
                Err(err) => {
                    tracing::warn!(channel = %self.id, %err, sent, "send failed");
                    return Err(err.into());
                },
            }
        }

        tracing::trace!(channel = %self.id, sent, "sent");
        Ok(sent)
    }

    /// Runs the pipeline's write hooks over `buffer`. Sending never does this on its own.
    pub async fn process_write(&self, buffer: &mut crate::Buffer) -> Result<(), crate::Error> {
        self.pipeline.process_write(buffer, self).await
    }

    /// Fires the disconnect notification, then shuts down and closes the socket. Later calls do nothing.
    pub fn disconnect(&self) {
        if self.closed.replace(true) {
            return;
        }

        let listeners = std::mem::take(&mut *self.disconnect_listeners.borrow_mut());
        for listener in listeners {
            listener(self);
        }

        if let Err(err) = crate::reactor::deregister(self.fd) {
            tracing::debug!(channel = %self.id, %err, "could not deregister socket");
        }

        if let Some(stream) = self.stream.borrow_mut().take() {
            match stream.shutdown(std::net::Shutdown::Both) {
                Err(err) if err.kind() != std::io::ErrorKind::NotConnected => {
                    tracing::debug!(channel = %self.id, %err, "could not shut down socket");
                },
                _ => (),
            }
        }

        tracing::debug!(channel = %self.id, peer = ?self.peer_addr, "channel closed");
    }

    async fn run(self) -> Result<(), crate::Error> {
        let result = self.receive_loop().await;
        self.disconnect();
        result
    }

    async fn receive_loop(&self) -> Result<(), crate::Error> {
        while !self.closed.get() {
            let mut receive_size = self.receive_size.get();
            let mut scratch = self.pool.rent(receive_size.current());

            let received = match std::future::poll_fn(|cx| self.poll_receive(cx, &mut scratch)).await {
                Ok(0) => {
                    tracing::debug!(channel = %self.id, "connection closed by peer");
                    return Ok(());
                },
                Ok(received) => received,
                Err(err) => {
                    tracing::warn!(channel = %self.id, %err, "receive failed");
                    return Ok(());
                },
            };

            receive_size.record(received);
            self.receive_size.set(receive_size);

            let mut buffer = crate::Buffer::with_pool(&self.pool, received);
            buffer.write_bytes(&scratch[..received])?;
            drop(scratch);

            let result = self.pipeline.process_read(&mut buffer, self).await;
            if let Ok(false) = buffer.release() {
                tracing::trace!(channel = %self.id, "inbound buffer retained past the pipeline pass");
            }
            result?;
        }

        Ok(())
    }

    fn poll_receive(&self, cx: &mut std::task::Context<'_>, dst: &mut [u8]) -> std::task::Poll<std::io::Result<usize>> {
        let stream = self.stream.borrow();
        let stream = match &*stream {
            Some(stream) => stream,
            None => return std::task::Poll::Ready(Ok(0)),
        };

        loop {
            match (&*stream).read(dst) {
                Ok(read) => return std::task::Poll::Ready(Ok(read)),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => (),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    return match crate::reactor::register(self.fd, crate::reactor::Interest::Readable, cx.waker()) {
                        Ok(()) => std::task::Poll::Pending,
                        Err(err) => std::task::Poll::Ready(Err(err)),
                    };
                },
                Err(err) => return std::task::Poll::Ready(Err(err)),
            }
        }
    }

    fn poll_send(&self, cx: &mut std::task::Context<'_>, src: &[u8]) -> std::task::Poll<std::io::Result<usize>> {
        let stream = self.stream.borrow();
        let stream = match &*stream {
            Some(stream) => stream,
            None => return std::task::Poll::Ready(Err(std::io::ErrorKind::NotConnected.into())),
        };

        loop {
            match (&*stream).write(src) {
                Ok(0) => return std::task::Poll::Ready(Err(std::io::ErrorKind::WriteZero.into())),
                Ok(written) => return std::task::Poll::Ready(Ok(written)),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => (),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    return match crate::reactor::register(self.fd, crate::reactor::Interest::Writable, cx.waker()) {
                        Ok(()) => std::task::Poll::Pending,
                        Err(err) => std::task::Poll::Ready(Err(err)),
                    };
                },
                Err(err) => return std::task::Poll::Ready(Err(err)),
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("loop", &self.event_loop.id())
            .field("receive_size", &self.receive_size.get())
            .field("closed", &self.closed.get())
            .finish()
    }
}

impl std::os::unix::io::AsRawFd for Channel {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.fd
    }
}
