//! Client library for the coordinator's text protocol.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::resp::{ClientCodec, Command, Reply};

/// One connection to a coordinator.
pub struct KvClient {
    addr: SocketAddr,
    conn: Framed<TcpStream, ClientCodec>,
}

impl KvClient {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            addr,
            conn: Framed::new(stream, ClientCodec),
        })
    }

    async fn request(&mut self, cmd: Command) -> anyhow::Result<Reply> {
        self.conn.send(cmd).await?;
        match self.conn.next().await {
            Some(reply) => Ok(reply?),
            None => anyhow::bail!("coordinator {} closed the connection", self.addr),
        }
    }

    /// `None` covers both a missing key and a coordinator with no live
    /// participants; the protocol does not distinguish them.
    pub async fn get(&mut self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        match self.request(Command::Get { key: key.to_vec() }).await? {
            Reply::Bulk(value) => Ok(Some(value)),
            Reply::Error => Ok(None),
            other => anyhow::bail!("unexpected GET reply: {other:?}"),
        }
    }

    /// True when the write committed on every live participant.
    pub async fn set(&mut self, key: &[u8], value: &[u8]) -> anyhow::Result<bool> {
        let cmd = Command::Set {
            key: key.to_vec(),
            value: value.to_vec(),
        };
        match self.request(cmd).await? {
            Reply::Ok => Ok(true),
            Reply::Error => Ok(false),
            other => anyhow::bail!("unexpected SET reply: {other:?}"),
        }
    }

    /// Returns the number of keys deleted, or `None` when the transaction
    /// aborted.
    pub async fn del(&mut self, keys: &[&[u8]]) -> anyhow::Result<Option<u64>> {
        let cmd = Command::Del {
            keys: keys.iter().map(|k| k.to_vec()).collect(),
        };
        match self.request(cmd).await? {
            Reply::Integer(n) => Ok(Some(n)),
            Reply::Error => Ok(None),
            other => anyhow::bail!("unexpected DEL reply: {other:?}"),
        }
    }
}
