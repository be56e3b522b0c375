//! Client-facing TCP server: frames the byte stream, routes commands to the
//! coordinator, writes replies.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use crate::coordinator::Coordinator;
use crate::resp::{Command, CommandCodec, FrameError, Reply};

pub async fn run(listener: TcpListener, coordinator: Arc<Coordinator>) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, coordinator).await {
                tracing::debug!(%peer, error = %err, "client connection closed");
            }
        });
    }
}

async fn handle_conn(socket: TcpStream, coordinator: Arc<Coordinator>) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, CommandCodec);

    while let Some(frame) = framed.next().await {
        match frame {
            Ok(cmd) => {
                let reply = dispatch(&coordinator, cmd).await;
                if framed.send(reply).await.is_err() {
                    // Client went away mid-reply; the transaction already
                    // ran to its decision and is logged.
                    break;
                }
            }
            Err(FrameError::Malformed(what)) => {
                tracing::warn!(what, "malformed client frame");
                let _ = framed.send(Reply::Error).await;
                break;
            }
            Err(FrameError::Io(err)) => return Err(err.into()),
        }
    }
    Ok(())
}

async fn dispatch(coordinator: &Coordinator, cmd: Command) -> Reply {
    match cmd {
        Command::Get { key } => coordinator.handle_get(&key).await,
        Command::Set { key, value } => coordinator.handle_set(key, value).await,
        Command::Del { keys } => coordinator.handle_del(keys).await,
    }
}
