use crate::engine::Engine;
use crate::protocol::{Request, Response, ServerCodec, Status};
use bytes::{BufMut, Bytes, BytesMut};
use futures::SinkExt;
use socket2::{SockRef, TcpKeepalive};
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tokio::task;
use tokio::time::Duration;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// Maximum number of concurrent connections server will accept. When this limit is reached,
/// the server will stop accepting connections until an active connection terminates.
const MAX_CONN: usize = 256;

const NOT_FOUND: &str = "404 page not found";
const INTERNAL_ERROR: &str = "internal server error";

#[derive(Debug)]
struct ListenerWithCap {
    listener: TcpListener,
    permits: Arc<Semaphore>,
    max_connections: usize,
}

#[derive(Debug, Clone, Copy)]
pub enum ConnLimit {
    Default,
    Is(usize),
}

impl ListenerWithCap {
    fn new(listener: TcpListener, limit: ConnLimit) -> Self {
        let max_conn = match limit {
            ConnLimit::Default => MAX_CONN,
            ConnLimit::Is(val) => val,
        };

        Self {
            listener,
            permits: Arc::new(Semaphore::new(max_conn)),
            max_connections: max_conn,
        }
    }
}

struct ConnPoolGuard {
    max_conns: usize,
    pool: Arc<Semaphore>,
}

impl ConnPoolGuard {
    fn new(max_conns: usize, pool: Arc<Semaphore>) -> Self {
        Self { max_conns, pool }
    }

    fn active_connections(&self) -> usize {
        self.max_conns - self.pool.available_permits()
    }
}

/// Serves the engine over HTTP until the signal future resolves. Connections
/// are limited by a given capacity, open ones are allowed to finish the
/// request in flight before the function returns.
pub async fn run(
    listener: TcpListener,
    max_conn: ConnLimit,
    engine: Arc<Engine>,
    signal: impl Future,
) -> crate::Result<()> {
    let listener = ListenerWithCap::new(listener, max_conn);
    let (network_shutdown_tx, _) = broadcast::channel::<()>(1);
    let pool_guard = ConnPoolGuard::new(listener.max_connections, listener.permits.clone());

    if let Ok(addr) = listener.listener.local_addr() {
        info!("listening on {}", addr);
    }

    let network_loop_handle = tokio::spawn({
        let mut network_shutdown_rx = network_shutdown_tx.subscribe();
        let clients_shutdown_tx = network_shutdown_tx.clone();

        async move {
            loop {
                // Wait for a free slot before accepting the next connection.
                let permit = tokio::select! {
                    _ = network_shutdown_rx.recv() => break,
                    permit = listener.permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break, // Semaphore closed.
                    },
                };

                tokio::select! {
                    _ = network_shutdown_rx.recv() => {
                        info!("shutting down the server");
                        break;
                    }
                    socket = listener.listener.accept() => {
                        match socket {
                            Ok((socket, addr)) => {
                                if let Err(e) = apply_keep_alive_options(&socket) {
                                    error!("setting up keep-alive options failed: {}", e);
                                    continue;
                                }

                                debug!("accepted connection from {}", addr);

                                let engine = engine.clone();
                                let client_shutdown_rx = clients_shutdown_tx.subscribe();

                                tokio::spawn(async move {
                                    handle_client(socket, engine, client_shutdown_rx).await;
                                    drop(permit);
                                });
                            }
                            Err(e) => {
                                error!("error accepting connection: {:?}", e);
                            }
                        }
                    }
                }
            }
        }
    });

    let network_abort_handle = network_loop_handle.abort_handle();

    tokio::select! {
        _ = signal => {
            info!("shutdown signal received");
            let _ = network_shutdown_tx.send(());
        },
        res = network_loop_handle => {
            error!("network accept loop exited: {:?}", res);
            res?;
        }
    }

    while pool_guard.active_connections() > 0 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    network_abort_handle.abort();

    info!("bye!");

    Ok(())
}

fn apply_keep_alive_options(socket: &TcpStream) -> Result<(), std::io::Error> {
    let sock_ref = SockRef::from(&socket);
    let mut ka = TcpKeepalive::new();
    ka = ka.with_time(Duration::from_secs(30));
    ka = ka.with_interval(Duration::from_secs(30));
    ka = ka.with_retries(3);
    sock_ref.set_tcp_keepalive(&ka)
}

/// When the new connection is accepted it is handled by this function. It runs loop
/// reading requests from a single client. Once shutdown signal is received,
/// loop is exited and connection is being terminated.
async fn handle_client(
    socket: TcpStream,
    engine: Arc<Engine>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut frames = Framed::new(socket, ServerCodec::default());

    loop {
        tokio::select! {
            result = frames.next() => {
                match result {
                    Some(Ok(request)) => {
                        info!("{} {}", request.method, request.target());

                        let close = request.close;
                        let mut response = handle_request(request, &engine).await;
                        response.close = close;

                        if let Err(e) = frames.send(response).await {
                            warn!("error sending response: {:?}", e);
                            break;
                        }

                        if close {
                            break;
                        }
                    }
                    Some(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                        warn!("could not parse request: {}", e);
                        // Framing is lost, there is no telling where the next request starts.
                        let mut response = Response::error(Status::BadRequest, "malformed request");
                        response.close = true;

                        if let Err(e) = frames.send(response).await {
                            warn!("error sending response: {:?}", e);
                        }
                        break;
                    }
                    Some(Err(e)) => {
                        error!("error reading from socket: {:?}", e);
                        // Close connection since it's probably broken. Client will reconnect.
                        break;
                    }
                    None => break, // Exit loop, connection was closed by client.
                }
            }
            _ = shutdown.recv() => {
                info!("shutdown signal received for connection");
                break; // Exit loop, connection is to shut down.
            }
        }
    }

    debug!("connection closed");
}

/// This function is called for every single well-formed request from a client.
async fn handle_request(request: Request, engine: &Arc<Engine>) -> Response {
    match request.path.as_str() {
        "/get" => handle_get(request, engine).await,
        "/set" => handle_set(request, engine).await,
        "/stats" => handle_stats(engine).await,
        _ => Response::error(Status::NotFound, NOT_FOUND),
    }
}

/// `/get?key=<key>` answers with the value followed by a newline.
async fn handle_get(request: Request, engine: &Arc<Engine>) -> Response {
    let keys = request.query_values(b"key");
    if keys.len() != 1 {
        return Response::error(Status::BadRequest, "should pass exactly one key");
    }
    let key = keys[0].clone();

    let engine = engine.clone();
    match task::spawn_blocking(move || engine.get(&key)).await {
        Ok(Ok(Some(value))) => {
            let mut body = BytesMut::with_capacity(value.len() + 1);
            body.put_slice(&value);
            body.put_u8(b'\n');
            Response::new(Status::Ok, body.freeze())
        }
        Ok(Ok(None)) => Response::error(Status::NotFound, NOT_FOUND),
        Ok(Err(e)) => {
            error!("error handling get: {}", e);
            Response::error(Status::InternalServerError, INTERNAL_ERROR)
        }
        Err(e) => {
            error!("get task failed: {}", e);
            Response::error(Status::InternalServerError, INTERNAL_ERROR)
        }
    }
}

/// `/set?<key>=<value>` takes exactly one parameter, its name is the key.
async fn handle_set(request: Request, engine: &Arc<Engine>) -> Response {
    let mut names: Vec<&Bytes> = request.query.iter().map(|(key, _)| key).collect();
    names.sort();
    names.dedup();
    if names.len() != 1 {
        return Response::error(Status::BadRequest, "expecting exactly one key");
    }

    let key = names[0].clone();
    let values = request.query_values(&key);
    if values.len() != 1 {
        return Response::error(Status::BadRequest, "multiple values for key");
    }
    let value = values[0].clone();

    let engine = engine.clone();
    match task::spawn_blocking(move || engine.put(key, value)).await {
        Ok(Ok(())) => Response::new(Status::Created, Bytes::new()),
        Ok(Err(e)) => {
            error!("error handling set: {}", e);
            Response::error(Status::InternalServerError, INTERNAL_ERROR)
        }
        Err(e) => {
            error!("set task failed: {}", e);
            Response::error(Status::InternalServerError, INTERNAL_ERROR)
        }
    }
}

async fn handle_stats(engine: &Arc<Engine>) -> Response {
    let engine = engine.clone();
    match task::spawn_blocking(move || engine.stats()).await {
        Ok(stats) => Response::new(
            Status::Ok,
            format!(
                "memtable_entries {}\ntable_entries {}\ntables {}\n",
                stats.memtable_entries, stats.table_entries, stats.tables
            ),
        ),
        Err(e) => {
            error!("stats task failed: {}", e);
            Response::error(Status::InternalServerError, INTERNAL_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::engine::memtable::MemTableSize;
    use rand::Rng;
    use std::net::SocketAddr;
    use tempfile::{tempdir, TempDir};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;
    use tracing_test::traced_test;

    struct TestServer {
        addr: SocketAddr,
        shutdown: oneshot::Sender<()>,
        handle: JoinHandle<crate::Result<()>>,
        _dir: TempDir,
    }

    async fn start_server(limit: ConnLimit) -> TestServer {
        let dir = tempdir().unwrap();
        let engine = Arc::new(Engine::open(dir.path(), MemTableSize::Is(10)).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap(); // Get the actual address
        let (shutdown, signal) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move { run(listener, limit, engine, signal).await });

        TestServer {
            addr,
            shutdown,
            handle,
            _dir: dir,
        }
    }

    /// Writes raw bytes and reads until the server closes the connection.
    async fn raw_exchange(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8(response).unwrap()
    }

    #[traced_test]
    #[tokio::test]
    async fn test_set_and_get() {
        let server = start_server(ConnLimit::Default).await;
        let mut client = Client::connect(&server.addr.to_string()).await.unwrap();

        client
            .set(Bytes::from("foo"), Bytes::from("bar"))
            .await
            .unwrap();
        assert_eq!(
            client.get(Bytes::from("foo")).await.unwrap(),
            Some(Bytes::from("bar"))
        );
        assert_eq!(client.get(Bytes::from("nope")).await.unwrap(), None);

        // Reserved characters survive the query string.
        let key = Bytes::from("a key&with=odd chars");
        let value = Bytes::from("100% \u{2713}\n");
        client.set(key.clone(), value.clone()).await.unwrap();
        assert_eq!(client.get(key).await.unwrap(), Some(value));

        assert!(logs_contain("POST /set?foo=bar"));
        assert!(logs_contain("GET /get?key=foo"));
    }

    #[traced_test]
    #[tokio::test]
    async fn test_random_entries_across_flushes() {
        let server = start_server(ConnLimit::Is(1)).await;
        let mut client = Client::connect(&server.addr.to_string()).await.unwrap();

        let mut entries = Vec::new();
        for i in 0..200 {
            let key = Bytes::from(format!("key{}", i));
            let value = generate_valid_printable_value();
            client.set(key.clone(), value.clone()).await.unwrap();
            entries.push((key, value));
        }

        for (key, value) in entries {
            assert_eq!(client.get(key).await.unwrap(), Some(value));
        }

        let stats = client.stats().await.unwrap();
        assert!(stats.contains("tables 18\n"), "stats: {}", stats);
        assert!(stats.contains("memtable_entries 2\n"), "stats: {}", stats);
    }

    #[traced_test]
    #[tokio::test]
    async fn test_get_requires_exactly_one_key() {
        let server = start_server(ConnLimit::Default).await;

        for target in ["/get", "/get?key=a&key=b", "/get?other=a"] {
            let request = format!("GET {} HTTP/1.1\r\nConnection: close\r\n\r\n", target);
            let response = raw_exchange(server.addr, &request).await;
            assert!(
                response.starts_with("HTTP/1.1 400 Bad Request\r\n"),
                "{}: {}",
                target,
                response
            );
            assert!(response.ends_with("should pass exactly one key\n"));
        }
    }

    #[traced_test]
    #[tokio::test]
    async fn test_set_requires_exactly_one_key() {
        let server = start_server(ConnLimit::Default).await;

        for target in ["/set", "/set?a=1&b=2"] {
            let request = format!("POST {} HTTP/1.1\r\nConnection: close\r\n\r\n", target);
            let response = raw_exchange(server.addr, &request).await;
            assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
            assert!(response.ends_with("expecting exactly one key\n"));
        }

        let request = "POST /set?a=1&a=2 HTTP/1.1\r\nConnection: close\r\n\r\n";
        let response = raw_exchange(server.addr, request).await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(response.ends_with("multiple values for key\n"));
    }

    #[traced_test]
    #[tokio::test]
    async fn test_unknown_path_and_bad_requests() {
        let server = start_server(ConnLimit::Default).await;

        let response =
            raw_exchange(server.addr, "GET /nope HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(response.ends_with("404 page not found\n"));

        let response = raw_exchange(server.addr, "invalid command\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(logs_contain("could not parse request"));
    }

    #[traced_test]
    #[tokio::test]
    async fn test_keep_alive_pipelining() {
        let server = start_server(ConnLimit::Default).await;

        let requests = "POST /set?k=v HTTP/1.1\r\n\r\n\
                        GET /get?key=k HTTP/1.1\r\n\r\n\
                        GET /get?key=k HTTP/1.1\r\nConnection: close\r\n\r\n";
        let response = raw_exchange(server.addr, requests).await;

        assert_eq!(response.matches("HTTP/1.1 201 Created").count(), 1);
        assert_eq!(response.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(response.ends_with("v\n"));
    }

    #[traced_test]
    #[tokio::test]
    async fn test_graceful_shutdown() {
        let server = start_server(ConnLimit::Is(4)).await;
        let mut client = Client::connect(&server.addr.to_string()).await.unwrap();
        client
            .set(Bytes::from("foo"), Bytes::from("bar"))
            .await
            .unwrap();

        server.shutdown.send(()).unwrap();
        let result = server.handle.await.unwrap();
        assert!(result.is_ok());
        assert!(logs_contain("bye!"));

        assert!(TcpStream::connect(server.addr).await.is_err());
    }

    fn generate_valid_printable_value() -> Bytes {
        let mut rng = rand::rng();
        let length = rng.random_range(1..=1000);
        Bytes::from(
            (0..length)
                .map(|_| rng.random_range(32..=126) as u8)
                .collect::<Vec<u8>>(),
        )
    }
}
