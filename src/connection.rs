use std::io;
use std::time::Duration;

use futures::SinkExt;
use strum_macros::Display;
use thiserror::Error as ThisError;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::FramedWrite;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::codec::{self, CommandCodec, DecodeError};
use crate::command::Command;
use crate::config::{Address, Config};
use crate::reply::Reply;
use crate::source::ByteSource;

/// Marker text of a timed out read, also what the session records as its last error.
pub const TIMEOUT_MARKER: &str = "read time out";

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("read time out")]
    Timeout,
    #[error("not connected")]
    Disconnected,
    #[error("connecting to {0} timed out")]
    ConnectTimeout(Address),
    #[error(transparent)]
    Decode(DecodeError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Error {
        match err {
            DecodeError::TimedOut => Error::Timeout,
            DecodeError::Io(e) => Error::Io(e),
            err => Error::Decode(err),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum Status {
    Disconnected,
    Connected,
}

pub(crate) type Writer = FramedWrite<OwnedWriteHalf, CommandCodec>;

/// Opens a TCP stream to `address`, giving up after `within`, and splits it into a reply source
/// and a command sink.
pub(crate) async fn open(
    address: &Address,
    within: Duration,
    quantum: Duration,
) -> Result<(ByteSource<OwnedReadHalf>, Writer), Error> {
    let stream = timeout(
        within,
        TcpStream::connect((address.host.as_str(), address.port)),
    )
    .await
    .map_err(|_| Error::ConnectTimeout(address.clone()))??;

    stream.set_nodelay(true)?;

    let (reader, writer) = stream.into_split();
    Ok((
        ByteSource::new(reader, quantum),
        FramedWrite::new(writer, CommandCodec),
    ))
}

struct Io {
    source: ByteSource<OwnedReadHalf>,
    writer: Writer,
}

/// The request/reply connection. One command is in flight at most, each call writes its command
/// and reads the whole reply before returning.
///
/// Any failure other than an error reply from the server closes the socket. A reply that arrives
/// after its caller gave up can then never be taken as the reply to a later command.
pub struct Connection {
    pub id: Uuid,
    address: Address,
    connect_timeout: Duration,
    read_timeout: Duration,
    io: Option<Io>,
}

impl Connection {
    pub fn new(config: &Config) -> Connection {
        Connection {
            id: Uuid::new_v4(),
            address: config.address.clone(),
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            io: None,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn status(&self) -> Status {
        if self.io.is_some() {
            Status::Connected
        } else {
            Status::Disconnected
        }
    }

    /// Looks at the idle socket and returns the status it leaves. A stream the server closed, or
    /// bytes arriving that no command asked for, close the connection.
    pub fn refresh_status(&mut self) -> Status {
        let Some(io) = self.io.as_mut() else {
            return Status::Disconnected;
        };

        match io.source.try_fill() {
            Ok(true) if io.source.buffered() == 0 => {}
            Ok(true) => {
                warn!(connection_id = %self.id, "Unsolicited data on idle command connection");
                self.disconnect();
            }
            Ok(false) => {
                info!(connection_id = %self.id, "Command connection closed by server");
                self.disconnect();
            }
            Err(e) => {
                warn!(connection_id = %self.id, "Command connection failed: {}", e);
                self.disconnect();
            }
        }

        self.status()
    }

    #[instrument(name = "command_connect", skip(self), fields(connection_id = %self.id, address = %self.address))]
    pub async fn connect(&mut self) -> Result<(), Error> {
        self.io = None;

        let (source, writer) =
            open(&self.address, self.connect_timeout, self.read_timeout).await?;
        self.io = Some(Io { source, writer });

        info!("Command connection established");
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if self.io.take().is_some() {
            info!(connection_id = %self.id, "Command connection closed");
        }
    }

    /// Sends `cmd` and waits for its reply.
    ///
    /// An error reply from the server is returned as `Ok(Reply::Error(_))`.
    #[instrument(name = "execute", skip_all, fields(connection_id = %self.id, command = %cmd.name()))]
    pub async fn execute(&mut self, cmd: Command) -> Result<Reply, Error> {
        if self.refresh_status() == Status::Disconnected {
            return Err(Error::Disconnected);
        }

        let result = self.round_trip(cmd).await;

        match result {
            Err(Error::Disconnected) | Ok(_) => {}
            Err(ref e) => {
                warn!("Closing command connection: {}", e);
                self.disconnect();
            }
        }

        result
    }

    async fn round_trip(&mut self, cmd: Command) -> Result<Reply, Error> {
        let io = self.io.as_mut().ok_or(Error::Disconnected)?;

        debug!("Sending command: {}", cmd);
        // `send` flushes, the whole command is on the wire before reading starts.
        timeout(self.read_timeout, io.writer.send(cmd))
            .await
            .map_err(|_| Error::Timeout)??;

        let reply = codec::decode(&mut io.source).await?;
        debug!(kind = %reply.kind(), "Received reply");

        Ok(reply)
    }
}
