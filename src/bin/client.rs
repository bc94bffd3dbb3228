use std::time::Duration;

use clap::Parser;
use itertools::Itertools;
use resplink::config::{Address, Config};
use resplink::{Error, Reply, Session};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(about = "Run a command and/or watch channels on a Redis server")]
struct Args {
    /// Server address, `host` or `host:port`
    #[arg(short, long, env = "RESPLINK_ADDR", default_value = "127.0.0.1:6379")]
    addr: Address,

    /// Password sent with AUTH after connecting
    #[arg(long, env = "RESPLINK_PASSWORD")]
    password: Option<String>,

    /// Milliseconds a read waits for new data
    #[arg(long, env = "RESPLINK_READ_TIMEOUT_MS", default_value_t = 1000)]
    read_timeout_ms: u64,

    /// Channel to watch, may be repeated
    #[arg(short, long = "subscribe")]
    subscribe: Vec<String>,

    /// Pattern to watch, may be repeated
    #[arg(short, long = "psubscribe")]
    psubscribe: Vec<String>,

    /// Command to run, followed by its arguments
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = tracing_subscriber::fmt()
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let args = Args::parse();

    let mut config = Config::default()
        .with_read_timeout(Duration::from_millis(args.read_timeout_ms));
    config.address = args.addr;
    if let Some(password) = args.password {
        config = config.with_password(password);
    }

    let session = Session::connect(config).await;

    if let Some((name, rest)) = args.command.split_first() {
        match session.execute(name, rest).await {
            Ok(reply) => print_reply(&reply, 0),
            Err(e) => eprintln!("(error) {}", e),
        }
    }

    if args.subscribe.is_empty() && args.psubscribe.is_empty() {
        return Ok(());
    }

    let channels = args.subscribe.iter().map(String::as_str).collect_vec();
    let patterns = args.psubscribe.iter().map(String::as_str).collect_vec();
    session.subscribe(&channels).await?;
    session.psubscribe(&patterns).await?;

    session.on_message(|message| match message.pattern {
        Some(pattern) => println!("{} ({}): {}", message.channel, pattern, message.payload),
        None => println!("{}: {}", message.channel, message.payload),
    });

    info!(
        channels = %channels.iter().join(","),
        patterns = %patterns.iter().join(","),
        "Watching, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c().await?;

    Ok(())
}

fn print_reply(reply: &Reply, indent: usize) {
    let prefix = "   ".repeat(indent);
    match reply {
        Reply::Array(children) if children.is_empty() => println!("{}(empty array)", prefix),
        Reply::Array(children) => {
            for (i, child) in children.iter().enumerate() {
                match child {
                    Reply::Array(_) => {
                        println!("{}{})", prefix, i + 1);
                        print_reply(child, indent + 1);
                    }
                    _ => println!("{}{}) {}", prefix, i + 1, child),
                }
            }
        }
        _ => println!("{}{}", prefix, reply),
    }
}
