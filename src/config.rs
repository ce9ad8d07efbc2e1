//! Settings consumed by the acceptor and channels. Every field has a default, so an empty
//! TOML document is a valid configuration.

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind_address: std::net::IpAddr,
    pub port: u16,
    pub loops: usize,
    pub backlog: i32,
    pub tcp_no_delay: bool,

    /// `SO_RCVBUF` hint applied to every accepted socket. Unset leaves the OS default.
    pub receive_buffer_size: Option<usize>,

    /// `SO_SNDBUF` hint applied to every accepted socket. Unset leaves the OS default.
    pub send_buffer_size: Option<usize>,

    pub keep_alive: Option<KeepAliveConfig>,
    pub receive: ReceiveConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_address: std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            port: 4324,
            loops: 1,
            backlog: 100,
            tcp_no_delay: true,
            receive_buffer_size: None,
            send_buffer_size: None,
            keep_alive: None,
            receive: Default::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, crate::Error> {
        let config: ServerConfig = toml::from_str(s)?;
        let () = config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, crate::Error> {
        let s = std::fs::read_to_string(path)?;
        ServerConfig::from_toml_str(&s)
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.loops == 0 {
            return Err(crate::Error::InvalidConfig("loops must be at least 1".to_owned()));
        }
        let () = self.receive.validate()?;
        Ok(())
    }

    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.bind_address, self.port)
    }
}

/// TCP keep-alive settings passed through to the socket as-is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeepAliveConfig {
    pub time_secs: u64,
    pub interval_secs: Option<u64>,
    pub retries: Option<u32>,
}

impl KeepAliveConfig {
    pub(crate) fn to_socket2(self) -> socket2::TcpKeepalive {
        let keep_alive = socket2::TcpKeepalive::new().with_time(std::time::Duration::from_secs(self.time_secs));

        #[cfg(target_os = "linux")]
        let keep_alive = match self.interval_secs {
            Some(interval_secs) => keep_alive.with_interval(std::time::Duration::from_secs(interval_secs)),
            None => keep_alive,
        };

        #[cfg(target_os = "linux")]
        let keep_alive = match self.retries {
            Some(retries) => keep_alive.with_retries(retries),
            None => keep_alive,
        };

        keep_alive
    }
}

/// Bounds of the adaptive per-receive buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReceiveConfig {
    pub floor: usize,
    pub ceiling: usize,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        ReceiveConfig {
            floor: 128,
            ceiling: 8192,
        }
    }
}

impl ReceiveConfig {
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.floor == 0 {
            return Err(crate::Error::InvalidConfig("receive.floor must be at least 1".to_owned()));
        }
        if self.floor > self.ceiling {
            return Err(crate::Error::InvalidConfig(format!(
                "receive.floor ({}) must not exceed receive.ceiling ({})",
                self.floor, self.ceiling,
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = ServerConfig::from_toml_str("").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.socket_addr(), "0.0.0.0:4324".parse().unwrap());
    }

    #[test]
    fn full_document_is_parsed() {
        let config = ServerConfig::from_toml_str(r#"
            bind_address = "127.0.0.1"
            port = 9000
            loops = 4
            backlog = 1024
            tcp_no_delay = false
            receive_buffer_size = 65536
            send_buffer_size = 32768

            [keep_alive]
            time_secs = 7200
            interval_secs = 1
            retries = 10

            [receive]
            floor = 256
            ceiling = 16384
        "#).unwrap();

        assert_eq!(config.socket_addr(), "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.loops, 4);
        assert_eq!(config.backlog, 1024);
        assert!(!config.tcp_no_delay);
        assert_eq!(config.receive_buffer_size, Some(65536));
        assert_eq!(config.send_buffer_size, Some(32768));
        assert_eq!(config.keep_alive, Some(KeepAliveConfig { time_secs: 7200, interval_secs: Some(1), retries: Some(10) }));
        assert_eq!(config.receive, ReceiveConfig { floor: 256, ceiling: 16384 });
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(ServerConfig::from_toml_str("loops = 0"), Err(crate::Error::InvalidConfig(_))));
        assert!(matches!(ServerConfig::from_toml_str("[receive]\nfloor = 0"), Err(crate::Error::InvalidConfig(_))));
        assert!(matches!(
            ServerConfig::from_toml_str("[receive]\nfloor = 1024\nceiling = 512"),
            Err(crate::Error::InvalidConfig(_)),
        ));
        assert!(matches!(ServerConfig::from_toml_str("colour = \"blue\""), Err(crate::Error::Config(_))));
    }
}
