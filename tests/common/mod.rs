#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use resplink::codec;
use resplink::config::Config;
use resplink::source::ByteSource;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;

/// A command the fake server received, tagged with the index of the connection it came on.
/// Connections are numbered in accept order.
#[derive(Debug, Clone, PartialEq)]
pub struct Received {
    pub connection: usize,
    pub parts: Vec<String>,
}

enum Control {
    Write(Vec<u8>),
    Close,
}

type Responder = Arc<dyn Fn(&[String]) -> Option<Vec<u8>> + Send + Sync>;

/// An in-process server that records every command and answers with whatever the responder
/// returns. A `None` answer leaves the client waiting.
pub struct FakeServer {
    pub port: u16,
    received: UnboundedReceiver<Received>,
    connections: Arc<Mutex<Vec<UnboundedSender<Control>>>>,
}

impl FakeServer {
    pub async fn start<F>(responder: F) -> FakeServer
    where
        F: Fn(&[String]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let responder: Responder = Arc::new(responder);
        let connections = Arc::new(Mutex::new(Vec::new()));
        let (received_tx, received) = mpsc::unbounded_channel();

        tokio::spawn({
            let connections = connections.clone();
            async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let (control_tx, control_rx) = mpsc::unbounded_channel();
                    let index = {
                        let mut connections = connections.lock().unwrap();
                        connections.push(control_tx.clone());
                        connections.len() - 1
                    };

                    let (reader, writer) = socket.into_split();
                    tokio::spawn(write_loop(writer, control_rx));
                    tokio::spawn(read_loop(
                        ByteSource::new(reader, Duration::from_secs(5)),
                        index,
                        responder.clone(),
                        control_tx,
                        received_tx.clone(),
                    ));
                }
            }
        });

        FakeServer {
            port,
            received,
            connections,
        }
    }

    /// A server that answers `+OK` to everything.
    pub async fn ok() -> FakeServer {
        FakeServer::start(|_| Some(b"+OK\r\n".to_vec())).await
    }

    /// Client settings with short timeouts and the periodic check pushed out of the way, tests
    /// drive the liveness check themselves.
    pub fn config(&self) -> Config {
        Config::new("127.0.0.1", self.port)
            .with_connect_timeout(Duration::from_millis(500))
            .with_read_timeout(Duration::from_millis(200))
            .with_check_interval(Duration::from_secs(3600))
    }

    pub async fn next_command(&mut self) -> Received {
        timeout(Duration::from_secs(2), self.received.recv())
            .await
            .expect("no command received in time")
            .expect("server stopped")
    }

    /// Asserts nothing else is received for `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(Some(received)) = timeout(window, self.received.recv()).await {
            panic!("unexpected command {:?}", received);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub async fn wait_for_connections(&self, n: usize) {
        let this = self;
        eventually(move || async move { this.connection_count() >= n }).await
    }

    pub fn write(&self, connection: usize, bytes: &[u8]) {
        let connections = self.connections.lock().unwrap();
        let _ = connections[connection].send(Control::Write(bytes.to_vec()));
    }

    /// Closes the server's side of a connection, the client sees the stream end.
    pub fn close(&self, connection: usize) {
        let connections = self.connections.lock().unwrap();
        let _ = connections[connection].send(Control::Close);
    }
}

async fn write_loop(
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut control: UnboundedReceiver<Control>,
) {
    while let Some(control) = control.recv().await {
        match control {
            Control::Write(bytes) => {
                if writer.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            // Dropping the write half shuts it down.
            Control::Close => break,
        }
    }
}

async fn read_loop(
    mut source: ByteSource<tokio::net::tcp::OwnedReadHalf>,
    index: usize,
    responder: Responder,
    control: UnboundedSender<Control>,
    received: UnboundedSender<Received>,
) {
    while let Ok(true) = source.readable().await {
        let reply = match codec::decode(&mut source).await {
            Ok(reply) => reply,
            Err(_) => break,
        };
        let parts = reply.rows();

        if let Some(answer) = responder(&parts) {
            let _ = control.send(Control::Write(answer));
        }
        let _ = received.send(Received {
            connection: index,
            parts,
        });
    }
}

pub fn parts(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Polls `check` every 10ms for up to two seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
