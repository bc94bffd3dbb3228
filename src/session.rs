use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use strum_macros::AsRefStr;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::command::Command;
use crate::config::Config;
use crate::connection::{Connection, Error, Status};
use crate::reply::Reply;
use crate::subscription::{Message, Subscriber};

/// The channels and patterns a session is asked to watch. Replayed in full on the subscription
/// connection every time it comes back.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Subscriptions {
    channels: HashSet<String>,
    patterns: HashSet<String>,
}

impl Subscriptions {
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(String::as_str)
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.patterns.is_empty()
    }

    fn apply(&mut self, action: Action, names: &[&str]) {
        let set = match action {
            Action::Subscribe | Action::Unsubscribe => &mut self.channels,
            Action::Psubscribe | Action::Punsubscribe => &mut self.patterns,
        };

        match action {
            Action::Subscribe | Action::Psubscribe => {
                set.extend(names.iter().map(|name| name.to_string()));
            }
            // No names means everything, as for the server.
            Action::Unsubscribe | Action::Punsubscribe if names.is_empty() => set.clear(),
            Action::Unsubscribe | Action::Punsubscribe => {
                for name in names {
                    set.remove(*name);
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "lowercase")]
enum Action {
    Subscribe,
    Unsubscribe,
    Psubscribe,
    Punsubscribe,
}

/// A client session: a command connection, a subscription connection, the subscriptions to keep
/// alive on the latter and the text of the last error.
///
/// Cloning is cheap, clones share the same connections. A background task checks both
/// connections every `check_interval`, reconnects the ones that dropped and replays the
/// subscriptions on a new subscription connection. The task ends with the last clone.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

struct Shared {
    config: Config,
    // The async mutex keeps a single command in flight.
    command: tokio::sync::Mutex<Connection>,
    // Held while the subscriptions change, so a replay never races a subscribe.
    subscriber: tokio::sync::Mutex<Subscriber>,
    subscriptions: Mutex<Subscriptions>,
    last_error: Mutex<String>,
    events: broadcast::Sender<Message>,
}

impl Session {
    /// Opens both connections and starts the liveness check.
    ///
    /// Failing to connect is not an error: the failure is logged, kept as the last error, and
    /// the liveness check keeps trying.
    #[instrument(name = "session", skip(config), fields(address = %config.address))]
    pub async fn connect(config: Config) -> Session {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let shared = Arc::new(Shared {
            command: tokio::sync::Mutex::new(Connection::new(&config)),
            subscriber: tokio::sync::Mutex::new(Subscriber::new(&config, events.clone())),
            subscriptions: Mutex::new(Subscriptions::default()),
            last_error: Mutex::new(String::new()),
            events,
            config,
        });

        {
            let mut command = shared.command.lock().await;
            shared.connect_command(&mut command).await;
        }
        {
            let mut subscriber = shared.subscriber.lock().await;
            shared.connect_subscriber(&mut subscriber).await;
        }

        tokio::spawn(check_periodically(
            Arc::downgrade(&shared),
            shared.config.check_interval,
        ));

        Session { shared }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Runs `name` with `args` on the command connection and returns the server's reply.
    ///
    /// An error reply is a reply, it is returned as `Ok(Reply::Error(_))` and also recorded as
    /// the last error. Timeouts, I/O and protocol failures are returned as errors, recorded, and
    /// leave the command connection closed until the next liveness check.
    pub async fn execute<I, A>(&self, name: &str, args: I) -> Result<Reply, Error>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        self.execute_command(Command::new(name).args(args)).await
    }

    pub async fn execute_command(&self, cmd: Command) -> Result<Reply, Error> {
        let result = {
            let mut command = self.shared.command.lock().await;
            command.execute(cmd).await
        };

        match result {
            Ok(Reply::Error(ref msg)) => self.shared.record_error(msg.as_str()),
            Ok(_) => {}
            Err(ref e) => self.shared.record_error(e.to_string()),
        }
        result
    }

    pub async fn subscribe(&self, channels: &[&str]) -> Result<(), Error> {
        self.update(Action::Subscribe, channels).await
    }

    /// Stops watching `channels`, or every channel when none is given.
    pub async fn unsubscribe(&self, channels: &[&str]) -> Result<(), Error> {
        self.update(Action::Unsubscribe, channels).await
    }

    pub async fn psubscribe(&self, patterns: &[&str]) -> Result<(), Error> {
        self.update(Action::Psubscribe, patterns).await
    }

    /// Stops watching `patterns`, or every pattern when none is given.
    pub async fn punsubscribe(&self, patterns: &[&str]) -> Result<(), Error> {
        self.update(Action::Punsubscribe, patterns).await
    }

    /// A new observer of the messages delivered on the subscription connection.
    pub fn messages(&self) -> broadcast::Receiver<Message> {
        self.shared.events.subscribe()
    }

    /// Calls `observer` for every message until the session is dropped.
    pub fn on_message<F>(&self, mut observer: F) -> JoinHandle<()>
    where
        F: FnMut(Message) + Send + 'static,
    {
        let mut messages = self.messages();
        tokio::spawn(async move {
            loop {
                match messages.recv().await {
                    Ok(message) => observer(message),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Message observer lagging, messages dropped")
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn last_error(&self) -> String {
        self.shared.last_error.lock().unwrap().clone()
    }

    pub fn subscriptions(&self) -> Subscriptions {
        self.shared.subscriptions.lock().unwrap().clone()
    }

    pub async fn command_status(&self) -> Status {
        self.shared.command.lock().await.refresh_status()
    }

    pub async fn subscription_status(&self) -> Status {
        self.shared.subscriber.lock().await.status()
    }

    /// Reconnects whichever connection is down. Runs periodically on its own, calling it
    /// directly forces a check.
    pub async fn check_liveness(&self) {
        self.shared.check().await
    }

    async fn update(&self, action: Action, names: &[&str]) -> Result<(), Error> {
        if names.is_empty() && matches!(action, Action::Subscribe | Action::Psubscribe) {
            return Ok(());
        }

        let mut subscriber = self.shared.subscriber.lock().await;
        self.shared
            .subscriptions
            .lock()
            .unwrap()
            .apply(action, names);

        match subscriber
            .send(Command::new(action.as_ref()).args(names))
            .await
        {
            Ok(()) => Ok(()),
            Err(Error::Disconnected) => {
                debug!(
                    action = action.as_ref(),
                    "Subscription connection down, change applies on reconnect"
                );
                Ok(())
            }
            Err(e) => {
                self.shared.record_error(e.to_string());
                Err(e)
            }
        }
    }
}

impl Shared {
    fn record_error(&self, msg: impl Into<String>) {
        *self.last_error.lock().unwrap() = msg.into();
    }

    async fn check(&self) {
        {
            let mut command = self.command.lock().await;
            if command.refresh_status() == Status::Disconnected {
                info!("Reconnecting command connection");
                self.connect_command(&mut command).await;
            }
        }

        let mut subscriber = self.subscriber.lock().await;
        if subscriber.status() == Status::Disconnected {
            info!("Reconnecting subscription connection");
            self.connect_subscriber(&mut subscriber).await;
        }
    }

    async fn connect_command(&self, command: &mut Connection) {
        if let Err(e) = command.connect().await {
            warn!("Failed to connect command connection: {}", e);
            self.record_error(e.to_string());
            return;
        }

        let Some(password) = self.config.password.as_deref() else {
            return;
        };
        match command.execute(Command::new("auth").arg(password)).await {
            Ok(Reply::Error(msg)) => {
                warn!("Authentication rejected: {}", msg);
                self.record_error(msg);
            }
            Ok(_) => debug!("Command connection authenticated"),
            Err(e) => self.record_error(e.to_string()),
        }
    }

    // Connects and replays every subscription, each name exactly once.
    async fn connect_subscriber(&self, subscriber: &mut Subscriber) {
        if let Err(e) = subscriber.connect().await {
            warn!("Failed to connect subscription connection: {}", e);
            self.record_error(e.to_string());
            return;
        }

        let mut replay = Vec::new();
        if let Some(password) = self.config.password.as_deref() {
            // The answer comes back through the reader and is not a message, so it is dropped.
            replay.push(Command::new("auth").arg(password));
        }
        {
            let subscriptions = self.subscriptions.lock().unwrap();
            replay.extend(subscriptions.channels().map(|c| Command::new("subscribe").arg(c)));
            replay.extend(subscriptions.patterns().map(|p| Command::new("psubscribe").arg(p)));
        }

        let count = replay.len();
        for cmd in replay {
            if let Err(e) = subscriber.send(cmd).await {
                warn!("Failed to replay subscriptions: {}", e);
                self.record_error(e.to_string());
                return;
            }
        }
        if count > 0 {
            info!(count, "Replayed subscriptions");
        }
    }
}

async fn check_periodically(shared: Weak<Shared>, period: Duration) {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.check().await;
    }

    debug!("Session dropped, liveness check stopped");
}
