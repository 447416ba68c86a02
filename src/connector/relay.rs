//! Relay protocol client connector.

use async_trait::async_trait;

use crate::common::{Address, Network, RequestMeta, Result, Stream};
use crate::error::Error;
use crate::relay::{
    Feature, Request, Response, CMD_ASSOCIATE, CMD_CONNECT, FLAG_UDP, NETWORK_UDP, STATUS_FORBIDDEN,
    STATUS_HOST_UNREACHABLE, STATUS_NETWORK_UNREACHABLE, STATUS_OK, STATUS_UNAUTHORIZED, VERSION1,
};
use crate::transport::Connector;

pub struct RelayConnector {
    auth: Option<(String, String)>,
}

impl RelayConnector {
    pub fn new(auth: Option<(String, String)>) -> Self {
        Self { auth }
    }
}

#[async_trait]
impl Connector for RelayConnector {
    async fn connect(
        &self,
        mut stream: Stream,
        network: Network,
        address: &Address,
        req: &RequestMeta,
    ) -> Result<Stream> {
        let cmd = match network {
            Network::Tcp => CMD_CONNECT,
            Network::Udp => CMD_ASSOCIATE | FLAG_UDP,
        };
        let mut request = Request::new(cmd);

        if let Some((user, pass)) = &self.auth {
            request.features.push(Feature::UserAuth {
                username: user.clone(),
                password: pass.clone(),
            });
        }
        if network == Network::Udp {
            request.features.push(Feature::Network(NETWORK_UDP));
        }
        if let Some(src) = req.src_addr {
            request.features.push(Feature::Addr(Address::Socket(src)));
        }
        request.features.push(Feature::Addr(address.clone()));

        request.write_to(&mut stream).await?;

        // exactly one response frame; a truncated frame is an error
        let response = Response::read_from(&mut stream).await?;
        if response.version != VERSION1 {
            return Err(Error::BadVersion);
        }
        match response.status {
            STATUS_OK => Ok(stream),
            STATUS_UNAUTHORIZED => Err(Error::Unauthorized),
            STATUS_FORBIDDEN => Err(Error::Bypass),
            STATUS_NETWORK_UNREACHABLE | STATUS_HOST_UNREACHABLE => {
                Err(Error::NoRoute(address.to_string()))
            }
            other => Err(Error::Protocol(format!("relay status: {}", other))),
        }
    }
}
