//! Direct connector - the dialed conn already reaches the target.

use async_trait::async_trait;

use crate::common::{Address, Network, RequestMeta, Result, Stream};
use crate::transport::Connector;

pub struct DirectConnector;

#[async_trait]
impl Connector for DirectConnector {
    async fn connect(
        &self,
        stream: Stream,
        _network: Network,
        _address: &Address,
        _req: &RequestMeta,
    ) -> Result<Stream> {
        Ok(stream)
    }
}
