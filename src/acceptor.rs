/// Pause before accepting again once the process or system is out of descriptors or buffers.
const EXHAUSTION_BACKOFF: std::time::Duration = std::time::Duration::from_millis(100);

pub type PipelineConfigurator = dyn Fn(&mut crate::Pipeline) + Send + Sync;

/// Accepts connections and pins each one, as a [`Channel`](crate::Channel), to the next loop of a group.
///
/// There is no limit on how fast connections are accepted or how many stay open.
pub struct Acceptor {
    inner: std::net::TcpListener,
    group: std::sync::Arc<crate::EventLoopGroup>,
    configurator: std::sync::Arc<PipelineConfigurator>,
    socket_options: SocketOptions,
    channel_options: crate::ChannelOptions,
}

#[derive(Clone, Copy, Debug)]
struct SocketOptions {
    tcp_no_delay: bool,
    receive_buffer_size: Option<usize>,
    send_buffer_size: Option<usize>,
    keep_alive: Option<crate::config::KeepAliveConfig>,
}

impl Acceptor {
    pub fn bind(
        config: &crate::ServerConfig,
        group: std::sync::Arc<crate::EventLoopGroup>,
        configurator: impl Fn(&mut crate::Pipeline) + Send + Sync + 'static,
    ) -> Result<Self, crate::Error> {
        let () = config.validate()?;

        let addr = config.socket_addr();
        let socket = socket2::Socket::new(socket2::Domain::for_address(addr), socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(config.backlog)?;
        let inner: std::net::TcpListener = socket.into();

        tracing::info!(addr = ?inner.local_addr()?, "listening");

        Ok(Acceptor {
            inner,
            group,
            configurator: std::sync::Arc::new(configurator),
            socket_options: SocketOptions {
                tcp_no_delay: config.tcp_no_delay,
                receive_buffer_size: config.receive_buffer_size,
                send_buffer_size: config.send_buffer_size,
                keep_alive: config.keep_alive,
            },
            channel_options: crate::ChannelOptions::from(&config.receive),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.inner.local_addr()
    }

    /// Accepts connections until the listener fails. Blocks the calling thread, never a loop worker.
    pub fn run(self) -> Result<(), crate::Error> {
        loop {
            let (stream, peer) = match self.inner.accept() {
                Ok(accepted) => accepted,

                Err(err) if is_transient(&err) => {
                    tracing::debug!(%err, "transient accept error");
                    continue;
                },

                Err(err) if is_resource_exhaustion(&err) => {
                    tracing::warn!(%err, backoff = ?EXHAUSTION_BACKOFF, "out of resources, accept paused");
                    std::thread::sleep(EXHAUSTION_BACKOFF);
                    continue;
                },

                Err(err) => {
                    tracing::error!(%err, "accept failed, acceptor stopping");
                    return Err(err.into());
                },
            };

            tracing::info!(%peer, "client connected");
            if let Err(err) = self.accept(stream) {
                tracing::warn!(%peer, %err, "could not set up channel");
            }
        }
    }

    /// Runs [`run`](Acceptor::run) on a dedicated thread.
    pub fn spawn(self) -> std::io::Result<std::thread::JoinHandle<Result<(), crate::Error>>> {
        std::thread::Builder::new()
            .name("burst-acceptor".to_owned())
            .spawn(move || self.run())
    }

    fn accept(&self, stream: std::net::TcpStream) -> Result<(), crate::Error> {
        let () = self.socket_options.apply(&stream)?;

        let mut pipeline = crate::Pipeline::new();
        (self.configurator)(&mut pipeline);

        let event_loop = self.group.next_loop();
        let channel = crate::Channel::new(stream, event_loop, pipeline, self.channel_options.clone())?;
        channel.start()
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("local_addr", &self.inner.local_addr().ok())
            .field("group", &self.group)
            .field("socket_options", &self.socket_options)
            .finish()
    }
}

impl std::os::unix::io::AsRawFd for Acceptor {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        std::os::unix::io::AsRawFd::as_raw_fd(&self.inner)
    }
}

impl SocketOptions {
    fn apply(&self, stream: &std::net::TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.tcp_no_delay)?;

        let socket = socket2::SockRef::from(stream);
        if let Some(size) = self.receive_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(keep_alive) = self.keep_alive {
            socket.set_tcp_keepalive(&keep_alive.to_socket2())?;
        }

        stream.set_nonblocking(true)
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::Interrupted | std::io::ErrorKind::ConnectionAborted | std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::WouldBlock,
    )
}

fn is_resource_exhaustion(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error().map(nix::errno::Errno::from_i32),
        Some(nix::errno::Errno::EMFILE | nix::errno::Errno::ENFILE | nix::errno::Errno::ENOBUFS | nix::errno::Errno::ENOMEM),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os_error(errno: nix::errno::Errno) -> std::io::Error {
        std::io::Error::from_raw_os_error(errno as i32)
    }

    #[test]
    fn exhausted_descriptors_and_buffers_do_not_stop_accepting() {
        for errno in [nix::errno::Errno::EMFILE, nix::errno::Errno::ENFILE, nix::errno::Errno::ENOBUFS, nix::errno::Errno::ENOMEM] {
            let err = os_error(errno);
            assert!(is_resource_exhaustion(&err), "{}", err);
            assert!(!is_transient(&err), "{}", err);
        }
    }

    #[test]
    fn dropped_handshakes_are_transient() {
        assert!(is_transient(&os_error(nix::errno::Errno::ECONNABORTED)));
        assert!(is_transient(&os_error(nix::errno::Errno::EINTR)));
        assert!(!is_resource_exhaustion(&os_error(nix::errno::Errno::ECONNABORTED)));
    }

    #[test]
    fn other_listener_errors_are_fatal() {
        let err = os_error(nix::errno::Errno::EBADF);
        assert!(!is_transient(&err));
        assert!(!is_resource_exhaustion(&err));
    }

    #[test]
    fn bind_rejects_invalid_configuration() {
        let group = std::sync::Arc::new(crate::EventLoopGroup::new(1).unwrap());
        let config = crate::ServerConfig {
            receive: crate::config::ReceiveConfig { floor: 0, ceiling: 8 },
            ..Default::default()
        };
        let bound = Acceptor::bind(&config, group.clone(), |_| ());
        assert!(matches!(bound, Err(crate::Error::InvalidConfig(_))));
        group.shutdown();
        group.join();
    }
}
