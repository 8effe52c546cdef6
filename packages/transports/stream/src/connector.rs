use std::path::PathBuf;

use async_std::{channel::Sender, net::TcpStream, os::unix::net::UnixStream};
use satlink_codec::{LinkConnector, LinkError, PacketLink};

use crate::connection::{stream_link, StreamConfig};

pub struct TcpConnector {
    addr: String,
    config: StreamConfig,
    console: Option<Sender<Vec<u8>>>,
}

impl TcpConnector {
    pub fn new(addr: &str, config: StreamConfig) -> Self {
        Self {
            addr: addr.to_string(),
            config,
            console: None,
        }
    }

    pub fn with_console(mut self, console: Sender<Vec<u8>>) -> Self {
        self.console = Some(console);
        self
    }
}

#[async_trait::async_trait]
impl LinkConnector for TcpConnector {
    async fn connect(&self) -> Result<PacketLink, LinkError> {
        let stream = TcpStream::connect(&self.addr).await.map_err(|e| LinkError::Io(e.to_string()))?;
        stream.set_nodelay(true).map_err(|e| LinkError::Io(e.to_string()))?;
        log::info!("[TcpConnector] connected to {}", self.addr);
        Ok(stream_link(stream, self.config.clone(), self.console.clone()))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

pub struct UnixConnector {
    path: PathBuf,
    config: StreamConfig,
}

impl UnixConnector {
    pub fn new<P: Into<PathBuf>>(path: P, config: StreamConfig) -> Self {
        Self { path: path.into(), config }
    }
}

#[async_trait::async_trait]
impl LinkConnector for UnixConnector {
    async fn connect(&self) -> Result<PacketLink, LinkError> {
        let stream = UnixStream::connect(async_std::path::Path::new(self.path.as_os_str())).await.map_err(|e| LinkError::Io(e.to_string()))?;
        log::info!("[UnixConnector] connected to {}", self.path.display());
        Ok(stream_link(stream, self.config.clone(), None))
    }

    fn describe(&self) -> String {
        format!("unix://{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use async_std::net::TcpListener;
    use satlink_codec::{LinkConnector, LinkError, Value};

    use super::TcpConnector;
    use crate::connection::{stream_link, StreamConfig};

    #[async_std::test]
    async fn tcp_link_both_directions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("should bind");
        let addr = listener.local_addr().expect("should have addr");
        let accept = async_std::task::spawn(async move {
            let (stream, _) = listener.accept().await.expect("should accept");
            stream_link(stream, StreamConfig::default(), None)
        });

        let connector = TcpConnector::new(&addr.to_string(), StreamConfig::default());
        assert_eq!(connector.describe(), format!("tcp://{}", addr));
        let mut client = connector.connect().await.expect("should connect");
        let mut server = accept.await;

        client.sender.send(Value::from("ping")).await.expect("should send");
        assert_eq!(server.receiver.recv().await, Ok(Value::from("ping")));
        server.sender.send(Value::from("pong")).await.expect("should send");
        assert_eq!(client.receiver.recv().await, Ok(Value::from("pong")));

        client.sender.close().await;
        assert_eq!(server.receiver.recv().await, Err(LinkError::Closed));
    }

    #[async_std::test]
    async fn tcp_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("should bind");
        let addr = listener.local_addr().expect("should have addr");
        drop(listener);
        let connector = TcpConnector::new(&addr.to_string(), StreamConfig::default());
        assert!(matches!(connector.connect().await, Err(LinkError::Io(_))));
    }
}
