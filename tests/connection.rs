mod common;

use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};

use common::{parts, FakeServer};
use resplink::codec;
use resplink::command::Command;
use resplink::connection::{Connection, Error, Status};
use resplink::reply::Reply;
use resplink::source::ByteSource;

const QUANTUM: Duration = Duration::from_millis(200);

async fn create_tcp_connection() -> Result<(UnboundedSender<Vec<u8>>, TcpStream), std::io::Error> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let local_addr = listener.local_addr()?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            while let Some(data) = rx.recv().await {
                if socket.write_all(&data).await.is_err() {
                    break;
                }
            }
        }
    });

    let stream = TcpStream::connect(local_addr).await?;

    Ok((tx, stream))
}

#[tokio::test]
async fn test_decode_status() {
    let (tx, stream) = create_tcp_connection().await.unwrap();
    let mut source = ByteSource::new(stream, QUANTUM);

    tx.send(b"+OK\r\n".to_vec()).unwrap();

    let actual = codec::decode(&mut source).await.unwrap();
    assert_eq!(actual, Reply::Status("OK".to_string()));
}

#[tokio::test]
async fn test_decode_multiple_replies_sequentially() {
    let (tx, stream) = create_tcp_connection().await.unwrap();
    let mut source = ByteSource::new(stream, QUANTUM);

    tx.send(b"+OK\r\n".to_vec()).unwrap();
    tx.send(b"$5\r\nhello\r\n".to_vec()).unwrap();
    tx.send(b"*2\r\n$3\r\nfoo\r\n$-1\r\n".to_vec()).unwrap();
    tx.send(b"-Error message\r\n".to_vec()).unwrap();
    tx.send(b":1000\r\n".to_vec()).unwrap();

    let actual = codec::decode(&mut source).await.unwrap();
    assert_eq!(actual, Reply::Status("OK".to_string()));

    let actual = codec::decode(&mut source).await.unwrap();
    assert_eq!(actual, Reply::Bulk(Bytes::from("hello")));

    let actual = codec::decode(&mut source).await.unwrap();
    assert_eq!(
        actual,
        Reply::Array(vec![Reply::Bulk(Bytes::from("foo")), Reply::Nil])
    );

    let actual = codec::decode(&mut source).await.unwrap();
    assert_eq!(actual.error(), "Error message");

    let actual = codec::decode(&mut source).await.unwrap();
    assert_eq!(actual.integer(), 1000);
}

#[tokio::test]
async fn test_decode_incomplete_frame() {
    let (tx, stream) = create_tcp_connection().await.unwrap();
    let mut source = ByteSource::new(stream, QUANTUM);

    // "*3\r\n$3\r\nSET\r\n$5\r\nmykey\r\n$7\r\nmyvalue\r\n" split to simulate partial data.
    let part1 = b"*3\r\n$3\r\nSE";
    let part2 = b"T\r\n$5\r\nmyke";
    let part3 = b"y\r\n$7\r\nmyvalue\r\n";

    tokio::spawn(async move {
        for part in [part1.to_vec(), part2.to_vec(), part3.to_vec()] {
            tx.send(part).unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });

    let actual = codec::decode(&mut source).await.unwrap();
    assert_eq!(actual.rows(), vec!["SET", "mykey", "myvalue"]);
}

#[tokio::test]
async fn test_decode_times_out_when_nothing_arrives() {
    let (_tx, stream) = create_tcp_connection().await.unwrap();
    let mut source = ByteSource::new(stream, QUANTUM);

    let started = Instant::now();
    let err = codec::decode(&mut source).await.unwrap_err();

    assert!(matches!(err, codec::DecodeError::TimedOut));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_execute_round_trip() {
    let mut server = FakeServer::start(|cmd| match cmd[0].as_str() {
        "GET" => Some(b"$5\r\nhello\r\n".to_vec()),
        "LRANGE" => Some(b"*2\r\n$1\r\na\r\n$1\r\nb\r\n".to_vec()),
        _ => Some(b"-ERR unknown command\r\n".to_vec()),
    })
    .await;

    let mut conn = Connection::new(&server.config());
    conn.connect().await.unwrap();
    assert_eq!(conn.status(), Status::Connected);

    let reply = conn
        .execute(Command::new("GET").arg("key"))
        .await
        .unwrap();
    assert_eq!(reply.string(), "hello");
    assert_eq!(server.next_command().await.parts, parts(&["GET", "key"]));

    let reply = conn
        .execute(Command::new("LRANGE").args(["list", "0", "-1"]))
        .await
        .unwrap();
    assert_eq!(reply.rows(), vec!["a", "b"]);

    // An error reply is a reply, the connection stays up.
    let reply = conn.execute(Command::new("NOPE")).await.unwrap();
    assert_eq!(reply.error(), "ERR unknown command");
    assert_eq!(conn.status(), Status::Connected);
}

#[tokio::test]
async fn test_execute_timeout_closes_connection() {
    let server = FakeServer::start(|cmd| match cmd[0].as_str() {
        "BLPOP" => None,
        _ => Some(b"+PONG\r\n".to_vec()),
    })
    .await;

    let mut conn = Connection::new(&server.config());
    conn.connect().await.unwrap();

    let started = Instant::now();
    let err = conn
        .execute(Command::new("BLPOP").args(["queue", "0"]))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(conn.status(), Status::Disconnected);

    conn.connect().await.unwrap();
    let reply = conn.execute(Command::new("PING")).await.unwrap();
    assert_eq!(reply.status(), "PONG");
}

#[tokio::test]
async fn test_server_close_is_noticed_while_idle() {
    let server = FakeServer::ok().await;

    let mut conn = Connection::new(&server.config());
    conn.connect().await.unwrap();
    server.wait_for_connections(1).await;
    assert_eq!(conn.refresh_status(), Status::Connected);

    server.close(0);

    for _ in 0..200 {
        if conn.refresh_status() == Status::Disconnected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(conn.status(), Status::Disconnected);

    // Nothing is written to a socket known to be gone.
    let err = conn.execute(Command::new("PING")).await.unwrap_err();
    assert!(matches!(err, Error::Disconnected));
}

#[tokio::test]
async fn test_unsolicited_bytes_close_idle_connection() {
    let server = FakeServer::ok().await;

    let mut conn = Connection::new(&server.config());
    conn.connect().await.unwrap();
    server.wait_for_connections(1).await;

    server.write(0, b"+LATE\r\n");

    for _ in 0..200 {
        if conn.refresh_status() == Status::Disconnected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(conn.status(), Status::Disconnected);
}
