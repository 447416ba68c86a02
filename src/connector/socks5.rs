//! SOCKS5 client connector.

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::{socks_addr, Address, Network, RequestMeta, Result, Stream};
use crate::error::Error;
use crate::handler::socks5::{
    AUTH_NONE, AUTH_NO_ACCEPTABLE, AUTH_PASSWORD, CMD_CONNECT, CMD_UDP_ASSOCIATE, REP_SUCCESS,
    SOCKS5_VERSION,
};
use crate::transport::Connector;

pub struct Socks5Connector {
    auth: Option<(String, String)>,
}

impl Socks5Connector {
    pub fn new(auth: Option<(String, String)>) -> Self {
        Self { auth }
    }
}

#[async_trait]
impl Connector for Socks5Connector {
    async fn connect(
        &self,
        mut stream: Stream,
        network: Network,
        address: &Address,
        _req: &RequestMeta,
    ) -> Result<Stream> {
        // greeting
        let method = if self.auth.is_some() {
            AUTH_PASSWORD
        } else {
            AUTH_NONE
        };
        stream.write_all(&[SOCKS5_VERSION, 1, method]).await?;
        stream.flush().await?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply[0] != SOCKS5_VERSION {
            return Err(Error::BadVersion);
        }
        if reply[1] == AUTH_NO_ACCEPTABLE {
            return Err(Error::Protocol("no acceptable auth method".into()));
        }

        if reply[1] == AUTH_PASSWORD {
            let (user, pass) = self
                .auth
                .as_ref()
                .map(|(u, p)| (u.as_str(), p.as_str()))
                .unwrap_or(("", ""));
            let mut auth = Vec::with_capacity(3 + user.len() + pass.len());
            auth.push(0x01);
            auth.push(user.len() as u8);
            auth.extend_from_slice(user.as_bytes());
            auth.push(pass.len() as u8);
            auth.extend_from_slice(pass.as_bytes());
            stream.write_all(&auth).await?;
            stream.flush().await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(Error::Unauthorized);
            }
        }

        // request
        let cmd = match network {
            Network::Tcp => CMD_CONNECT,
            Network::Udp => CMD_UDP_ASSOCIATE,
        };
        let mut request = BytesMut::new();
        request.extend_from_slice(&[SOCKS5_VERSION, cmd, 0x00]);
        socks_addr::encode_addr(address, &mut request);
        stream.write_all(&request).await?;
        stream.flush().await?;

        // reply: VER | REP | RSV | BND.ADDR
        let mut head = [0u8; 3];
        stream.read_exact(&mut head).await?;
        if head[0] != SOCKS5_VERSION {
            return Err(Error::BadVersion);
        }
        let _bound = socks_addr::read_addr(&mut stream).await?;

        if head[1] != REP_SUCCESS {
            return Err(Error::Protocol(format!("socks5 reply: {}", head[1])));
        }

        Ok(stream)
    }
}
