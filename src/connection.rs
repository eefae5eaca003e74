use rmpv::Value;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::proto::{frame_bounds, Frame, Greeting, IteratorType, Request, Response, GREETING_SIZE};
use crate::{Error, Result};

/// Index every lookup goes through: the primary key index on tuple field 0.
pub const PRIMARY_INDEX: u32 = 0;

const READ_CHUNK: usize = 8 * 1024;

/// A single connection to a tuple store. Requests are sent one at a time and
/// each waits for its own response.
#[derive(Debug)]
pub struct Connection {
    stream: BufStream<TcpStream>,
    addr: String,
    greeting: Greeting,
    sync: u64,
    timeout: Option<Duration>,

    /// Received bytes not yet consumed as a whole frame. A request abandoned
    /// on timeout leaves the start of its reply here, so the reply can still be
    /// skipped once the rest of it arrives.
    inbound: Vec<u8>,

    /// Set while a request is being written and once the byte stream can no
    /// longer be split into frames. Requests on a broken connection fail.
    broken: bool,
}

impl Connection {
    /// Connect to `addr` and read the server greeting.
    pub async fn connect(addr: &str, timeout: Option<Duration>) -> Result<Connection> {
        let connect = with_timeout(timeout, async {
            TcpStream::connect(addr).await.map_err(|source| Error::Connect {
                source,
                addr: addr.to_string(),
            })
        });
        let stream = connect.await?;
        stream.set_nodelay(true)?;
        let mut stream = BufStream::new(stream);

        let mut buf = [0u8; GREETING_SIZE];
        with_timeout(timeout, async {
            stream.read_exact(&mut buf).await?;
            Ok::<_, Error>(())
        })
        .await?;
        let greeting = Greeting::parse(&buf)?;
        debug!(addr, version = %greeting.version, "Connected to store");

        Ok(Connection {
            stream,
            addr: addr.to_string(),
            greeting,
            sync: 0,
            timeout,
            inbound: Vec::with_capacity(READ_CHUNK),
            broken: false,
        })
    }

    pub fn greeting(&self) -> &Greeting {
        &self.greeting
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn select(
        &mut self,
        space: u32,
        key: Vec<Value>,
        offset: u32,
        limit: u32,
        iterator: IteratorType,
    ) -> Result<Vec<Value>> {
        self.call(Request::Select {
            space,
            index: PRIMARY_INDEX,
            key,
            iterator,
            limit,
            offset,
        })
        .await
    }

    /// Insert a tuple, failing if its key already exists.
    pub async fn insert(&mut self, space: u32, tuple: Vec<Value>) -> Result<Vec<Value>> {
        self.call(Request::Insert { space, tuple }).await
    }

    /// Insert a tuple, overwriting any tuple with the same key.
    pub async fn replace(&mut self, space: u32, tuple: Vec<Value>) -> Result<Vec<Value>> {
        self.call(Request::Replace { space, tuple }).await
    }

    pub async fn delete(&mut self, space: u32, key: Vec<Value>) -> Result<Vec<Value>> {
        self.call(Request::Delete {
            space,
            index: PRIMARY_INDEX,
            key,
        })
        .await
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.call(Request::Ping).await.map(|_| ())
    }

    pub async fn close(mut self) -> Result<()> {
        self.stream.shutdown().await?;
        debug!(addr = %self.addr, "Closed connection");
        Ok(())
    }

    async fn call(&mut self, request: Request) -> Result<Vec<Value>> {
        let timeout = self.timeout;
        with_timeout(timeout, self.roundtrip(request)).await
    }

    async fn roundtrip(&mut self, request: Request) -> Result<Vec<Value>> {
        if self.broken {
            return Err(Error::Broken);
        }
        self.sync += 1;
        let sync = self.sync;
        let frame = request.encode(sync)?;

        // A write cut short leaves part of a request on the wire.
        self.broken = true;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        self.broken = false;

        loop {
            let payload = self.next_frame().await?;
            let frame = Frame::decode(&payload)?;
            // Replies to requests abandoned after a timeout arrive first.
            if frame.sync < sync {
                warn!(expected = sync, received = frame.sync, "Discarding stale response");
                continue;
            }
            if frame.sync != sync {
                self.broken = true;
                return Err(Error::SyncMismatch {
                    expected: sync,
                    received: frame.sync,
                });
            }
            return Response::from_frame(frame)?.into_result();
        }
    }

    /// Wait for the next whole frame and return its payload. Only cancel safe
    /// reads touch the socket, so dropping this future loses no bytes.
    async fn next_frame(&mut self) -> Result<Vec<u8>> {
        loop {
            match frame_bounds(&self.inbound) {
                Ok(Some((start, end))) if end <= self.inbound.len() => {
                    let payload = self.inbound[start..end].to_vec();
                    self.inbound.drain(..end);
                    return Ok(payload);
                }
                Ok(_) => {}
                Err(e) => {
                    self.broken = true;
                    return Err(e);
                }
            }

            self.inbound.reserve(READ_CHUNK);
            match self.stream.read_buf(&mut self.inbound).await {
                Ok(0) => {
                    self.broken = true;
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed by store",
                    )));
                }
                Ok(_) => {}
                Err(e) => {
                    self.broken = true;
                    return Err(e.into());
                }
            }
        }
    }
}

async fn with_timeout<T, F>(timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| Error::Timeout(limit))?,
        None => fut.await,
    }
}
