pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
pub mod reply;
pub mod session;
pub mod source;
pub mod subscription;

pub use command::Command;
pub use config::{Address, Config};
pub use reply::{decode_rows, Kind, Reply};
pub use session::Session;
pub use subscription::Message;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
