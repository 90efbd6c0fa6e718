//! Length-delimited, bincode-framed transport for the vote/disk RPC
//! services, built on `tokio-util`'s codec.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{CResult, Error};
use crate::rpc::message::{Request, Response};

/// Caps a single frame at 64 MiB, generous enough for a `GetFile` chunk
/// while still catching a desynced peer quickly.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub struct Connection {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        let codec = LengthDelimitedCodec::builder().max_frame_length(MAX_FRAME_LEN).new_codec();
        Connection { framed: Framed::new(stream, codec) }
    }

    pub async fn connect(addr: std::net::SocketAddr) -> CResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream))
    }

    pub async fn send_request(&mut self, request: &Request) -> CResult<()> {
        let bytes = bincode::serialize(request)?;
        self.framed.send(Bytes::from(bytes)).await?;
        Ok(())
    }

    pub async fn recv_response(&mut self) -> CResult<Response> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(bincode::deserialize(&frame)?),
            Some(Err(e)) => Err(e.into()),
            None => Err(Error::Io("peer closed connection".into())),
        }
    }

    pub async fn send_response(&mut self, response: &Response) -> CResult<()> {
        let bytes = bincode::serialize(response)?;
        self.framed.send(Bytes::from(bytes)).await?;
        Ok(())
    }

    pub async fn recv_request(&mut self) -> CResult<Option<Request>> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(Some(bincode::deserialize(&frame)?)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Performs one request/response round trip, enforcing the 20 s RPC
    /// timeout.
    pub async fn call(&mut self, request: &Request) -> CResult<Response> {
        self.send_request(request).await?;
        match tokio::time::timeout(std::time::Duration::from_secs(20), self.recv_response()).await {
            Ok(result) => result,
            Err(_) => Err(Error::NotReady("RPC timed out after 20s".into())),
        }
    }
}
