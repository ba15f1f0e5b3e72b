use crate::protocol::{ClientCodec, Request, Response, Status};
use anyhow::{anyhow, bail, Error};
use bytes::Bytes;
use futures::SinkExt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

/// HTTP client for the key-value service. Keeps one connection open and
/// reconnects once if the server has dropped it.
pub struct Client {
    addr: SocketAddr,
    conn: Framed<TcpStream, ClientCodec>,
    // Server asked to close the connection after the last response.
    closed: bool,
}

impl Client {
    pub async fn connect(addr: &str) -> std::result::Result<Self, Error> {
        let addr = lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| anyhow!("could not resolve {}", addr))?;
        let conn = TcpStream::connect(&addr).await?;

        Ok(Client {
            addr,
            conn: Framed::new(conn, ClientCodec::default()),
            closed: false,
        })
    }

    async fn reconnect(&mut self) -> std::result::Result<(), Error> {
        let mut timeout_ms = 100;
        let max_timeout_ms = 5000;

        loop {
            match TcpStream::connect(&self.addr).await {
                Ok(conn) => {
                    self.conn = Framed::new(conn, ClientCodec::default());
                    self.closed = false;
                    return Ok(());
                }
                Err(e) if timeout_ms >= max_timeout_ms => {
                    bail!("could not reconnect to {}: {}", self.addr, e);
                }
                Err(_) => {
                    tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                    timeout_ms *= 2;
                }
            };
        }
    }

    /// Sends a request and waits for its response.
    pub async fn send(&mut self, request: Request) -> std::result::Result<Response, Error> {
        if self.closed {
            self.reconnect().await?;
        }

        let response = match self.exchange(request.clone()).await {
            Ok(Some(response)) => response,
            Ok(None) => {
                // Connection was closed by the server, try once more on a fresh one.
                self.reconnect().await?;
                self.exchange(request)
                    .await?
                    .ok_or_else(|| anyhow!("connection closed before response"))?
            }
            Err(e) if is_connection_error(&e) => {
                self.reconnect().await?;
                self.exchange(request)
                    .await?
                    .ok_or_else(|| anyhow!("connection closed before response"))?
            }
            Err(e) => return Err(e.into()),
        };

        self.closed = response.close;

        Ok(response)
    }

    async fn exchange(&mut self, request: Request) -> std::io::Result<Option<Response>> {
        self.conn.send(request).await?;
        self.conn.next().await.transpose()
    }

    /// Returns the value of the key, `None` if the server does not have it.
    pub async fn get(&mut self, key: Bytes) -> std::result::Result<Option<Bytes>, Error> {
        let response = self.send(Request::get(key)).await?;

        match response.status {
            Status::Ok => {
                // Server terminates the value with a newline.
                let mut value = response.body;
                if value.ends_with(b"\n") {
                    value.truncate(value.len() - 1);
                }
                Ok(Some(value))
            }
            Status::NotFound => Ok(None),
            _ => Err(unexpected(response)),
        }
    }

    pub async fn set(&mut self, key: Bytes, value: Bytes) -> std::result::Result<(), Error> {
        let response = self.send(Request::set(key, value)).await?;

        match response.status {
            Status::Created => Ok(()),
            _ => Err(unexpected(response)),
        }
    }

    pub async fn stats(&mut self) -> std::result::Result<String, Error> {
        let response = self.send(Request::stats()).await?;

        match response.status {
            Status::Ok => Ok(String::from_utf8_lossy(&response.body).into_owned()),
            _ => Err(unexpected(response)),
        }
    }
}

fn unexpected(response: Response) -> Error {
    anyhow!(
        "server responded {} {}: {}",
        response.status.code(),
        response.status.reason(),
        String::from_utf8_lossy(&response.body).trim_end()
    )
}

fn is_connection_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
    )
}
