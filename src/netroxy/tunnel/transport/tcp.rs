use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::netroxy::tunnel::transport::{BoxedStream, Transport};

pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn accept(&self, conn: TcpStream) -> anyhow::Result<BoxedStream> {
        Ok(Box::new(conn))
    }

    async fn dial(&self, addr: &str) -> anyhow::Result<BoxedStream> {
        let c = TcpStream::connect(addr).await?;
        let _ = c.set_nodelay(true);
        Ok(Box::new(c))
    }
}
