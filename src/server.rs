use std::net::SocketAddr;
use tokio::io::{AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::proto::{read_frame, Frame, Greeting, Request, Response};
use crate::store::TupleStore;
use crate::{Error, Result};

/// Protocol version announced in the greeting.
pub const PROTOCOL_VERSION: &str = "1.6.8";

/// Serves a [`TupleStore`] over the binary protocol, one task per connection.
pub struct TupleServer {
    pub store: TupleStore,
    listener: TcpListener,
    greeting: Greeting,
    instance: String,
}

impl TupleServer {
    /// Bind the listening socket. Port 0 picks a free port, see [`TupleServer::local_addr`].
    pub async fn bind(store: TupleStore, addr: SocketAddr) -> Result<TupleServer> {
        let listener = TcpListener::bind(addr).await?;
        let salt = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        Ok(TupleServer {
            store,
            listener,
            greeting: Greeting {
                version: PROTOCOL_VERSION.to_string(),
                salt: salt[..44].to_string(),
            },
            instance: uuid::Uuid::new_v4().to_string(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> Result<()> {
        info!("Listening on {}", self.local_addr()?);
        info!(
            "tnt-server version: {}, protocol: {}",
            env!("CARGO_PKG_VERSION"),
            PROTOCOL_VERSION
        );
        let greeting = self.greeting.encode(&self.instance);
        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!(%peer, "Connection established");
            let store = self.store.clone();
            let greeting = greeting.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, store, &greeting).await {
                    warn!(%peer, error = %e, "Connection closed with error");
                }
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, store: TupleStore, greeting: &[u8]) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut stream = BufStream::new(stream);
    stream.write_all(greeting).await?;
    stream.flush().await?;

    while let Some(payload) = read_frame(&mut stream).await? {
        let frame = Frame::decode(&payload)?;
        let sync = frame.sync;
        let response = match Request::from_frame(&frame).and_then(|request| store.execute(request)) {
            Ok(tuples) => Response::Data(tuples),
            Err(Error::Store { code, message }) => {
                debug!(sync, code, message = %message, "Request failed");
                Response::Error { code, message }
            }
            Err(e) => {
                error!(sync, error = %e, "Unable to serve request");
                return Err(e);
            }
        };
        stream.write_all(&response.encode(sync)?).await?;
        stream.flush().await?;
    }
    debug!("Peer closed connection");
    Ok(())
}
