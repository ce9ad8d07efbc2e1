#![allow(dead_code)]

pub struct EchoHandler;

#[async_trait::async_trait(?Send)]
impl burst::Handler for EchoHandler {
    async fn on_read(&self, buffer: &mut burst::Buffer, channel: &burst::Channel) -> Result<(), burst::Error> {
        let mut reply = buffer.duplicate()?;
        channel.send(&mut reply).await?;
        Ok(())
    }
}

pub struct Server {
    pub addr: std::net::SocketAddr,
    pub group: std::sync::Arc<burst::EventLoopGroup>,
}

impl Drop for Server {
    fn drop(&mut self) {
        self.group.shutdown();
    }
}

pub fn test_config(loops: usize) -> burst::ServerConfig {
    burst::ServerConfig {
        bind_address: std::net::Ipv4Addr::LOCALHOST.into(),
        port: 0,
        loops,
        ..Default::default()
    }
}

pub fn serve(
    config: &burst::ServerConfig,
    configurator: impl Fn(&mut burst::Pipeline) + Send + Sync + 'static,
) -> Server {
    let group = std::sync::Arc::new(burst::EventLoopGroup::new(config.loops).unwrap());
    let acceptor = burst::Acceptor::bind(config, group.clone(), configurator).unwrap();
    let addr = acceptor.local_addr().unwrap();
    let _ = acceptor.spawn().unwrap();
    Server { addr, group }
}

pub fn connect(addr: std::net::SocketAddr) -> std::net::TcpStream {
    let stream = std::net::TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(std::time::Duration::from_secs(5))).unwrap();
    stream
}

/// Two ends of a loopback connection: the accepted side and the client side.
pub fn connected_pair() -> (std::net::TcpStream, std::net::TcpStream) {
    let listener = std::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0)).unwrap();
    let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (accepted, _) = listener.accept().unwrap();
    client.set_read_timeout(Some(std::time::Duration::from_secs(5))).unwrap();
    (accepted, client)
}

pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    condition()
}
