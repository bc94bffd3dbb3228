use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use strum_macros::EnumString;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::codec;
use crate::command::Command;
use crate::config::{Address, Config};
use crate::connection::{self, Error, Status, Writer};
use crate::reply::Reply;
use crate::source::ByteSource;

/// A message published on a watched channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Channel the message was published on, or the name the server reported for it.
    pub channel: String,
    pub payload: String,
    /// The pattern that matched, when the server reported one.
    pub pattern: Option<String>,
}

#[derive(Debug, PartialEq, EnumString)]
#[strum(serialize_all = "lowercase")]
enum Header {
    Message,
    Pmessage,
}

impl Message {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Message {
        Message {
            channel: channel.into(),
            payload: payload.into(),
            pattern: None,
        }
    }

    /// Reads a message out of a frame received on the subscription connection.
    ///
    /// `[message|pmessage, name, payload]` gives a message for `name`. The four element pattern
    /// form `[pmessage, pattern, channel, payload]` keeps both names. Anything else, subscription
    /// acknowledgements included, is not a message.
    pub fn from_reply(reply: &Reply) -> Option<Message> {
        let children = match reply {
            Reply::Array(children) => children,
            _ => return None,
        };
        let header = children.first()?.scalar().parse::<Header>().ok()?;

        match (header, children.len()) {
            (_, 3) => Some(Message::new(children[1].string(), children[2].string())),
            (Header::Pmessage, 4) => Some(Message {
                channel: children[2].string().into_owned(),
                payload: children[3].string().into_owned(),
                pattern: Some(children[1].string().into_owned()),
            }),
            _ => None,
        }
    }
}

/// The publish/subscribe connection.
///
/// Writes go out from the caller, nothing is read back synchronously. A background task owns the
/// read half, decodes every frame the server pushes and broadcasts the messages among them.
///
/// The connection is reported down once the server closes it, sends something that does not
/// decode, or stalls in the middle of a frame for longer than the read timeout. The position in
/// the stream is lost in each case, so the next liveness check reconnects and replays.
pub struct Subscriber {
    pub id: Uuid,
    address: Address,
    connect_timeout: Duration,
    read_timeout: Duration,
    writer: Option<Writer>,
    // Cleared by the reader task when the server goes away. Every connect gets a fresh flag so a
    // finishing reader of an old socket cannot mark the new one as dead.
    alive: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    events: broadcast::Sender<Message>,
}

impl Subscriber {
    pub fn new(config: &Config, events: broadcast::Sender<Message>) -> Subscriber {
        Subscriber {
            id: Uuid::new_v4(),
            address: config.address.clone(),
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            writer: None,
            alive: Arc::new(AtomicBool::new(false)),
            reader: None,
            events,
        }
    }

    pub fn status(&self) -> Status {
        if self.writer.is_some() && self.alive.load(Ordering::Acquire) {
            Status::Connected
        } else {
            Status::Disconnected
        }
    }

    /// A new receiver of every message delivered from now on.
    pub fn messages(&self) -> broadcast::Receiver<Message> {
        self.events.subscribe()
    }

    #[instrument(name = "subscription_connect", skip(self), fields(connection_id = %self.id, address = %self.address))]
    pub async fn connect(&mut self) -> Result<(), Error> {
        self.disconnect();

        let (source, writer) =
            connection::open(&self.address, self.connect_timeout, self.read_timeout).await?;

        let alive = Arc::new(AtomicBool::new(true));
        self.reader = Some(tokio::spawn(read_frames(
            source,
            self.events.clone(),
            alive.clone(),
            self.id,
        )));
        self.alive = alive;
        self.writer = Some(writer);

        info!("Subscription connection established");
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if self.writer.take().is_some() {
            info!(connection_id = %self.id, "Subscription connection closed");
        }
        self.alive.store(false, Ordering::Release);
    }

    /// Writes `cmd` without waiting for an answer. A failed write closes the connection.
    pub async fn send(&mut self, cmd: Command) -> Result<(), Error> {
        if self.status() == Status::Disconnected {
            return Err(Error::Disconnected);
        }
        let writer = self.writer.as_mut().ok_or(Error::Disconnected)?;

        debug!(connection_id = %self.id, "Sending command: {}", cmd);
        let result = match timeout(self.read_timeout, writer.send(cmd)).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Timeout),
        };

        if let Err(ref e) = result {
            warn!(connection_id = %self.id, "Closing subscription connection: {}", e);
            self.disconnect();
        }
        result
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[instrument(name = "subscription", skip(source, events, alive))]
async fn read_frames(
    mut source: ByteSource<OwnedReadHalf>,
    events: broadcast::Sender<Message>,
    alive: Arc<AtomicBool>,
    connection_id: Uuid,
) {
    'triggers: loop {
        match source.readable().await {
            Ok(true) => {}
            Ok(false) => {
                info!("Subscription connection closed by server");
                break;
            }
            Err(e) => {
                warn!("Subscription connection failed: {}", e);
                break;
            }
        }

        // Drain every frame already buffered before waiting for the socket again.
        loop {
            let reply = match codec::decode(&mut source).await {
                Ok(reply) => reply,
                // A frame stalled past the read timeout is dropped with the connection, the rest
                // of it could not be told apart from the next frame.
                Err(e) => {
                    warn!("Failed to decode subscription frame: {}", e);
                    break 'triggers;
                }
            };

            match Message::from_reply(&reply) {
                Some(message) => {
                    debug!(channel = %message.channel, "Received message");
                    // Nobody listening is not an error.
                    let _ = events.send(message);
                }
                None => {
                    trace!(%reply, "Ignoring frame");
                    continue 'triggers;
                }
            }

            if source.buffered() == 0 {
                break;
            }
        }
    }

    alive.store(false, Ordering::Release);
}
