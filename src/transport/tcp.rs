//! TCP dialer.

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::common::{Address, StreamConn, Result, Stream};

use super::Dialer;

pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &Address) -> Result<Stream> {
        let stream = match addr {
            Address::Socket(sa) => TcpStream::connect(sa).await?,
            Address::Domain(domain, port) => {
                TcpStream::connect((domain.as_str(), *port)).await?
            }
        };
        stream.set_nodelay(true)?;
        Ok(stream.boxed())
    }
}
