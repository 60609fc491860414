//! flashkv-cli - Command-line client for RESP key-value servers
//!
//! Sends commands through a pipelined connection and prints the replies the
//! way redis-cli does. Commands come from the command line or, when none is
//! given, from stdin (one per line); every line is dispatched before the
//! first reply is awaited.

use flashkv_client::connection::{Connection, Handle};
use flashkv_client::protocol::{CommandArgs, CommandType, RespOutput, RespValue};
use flashkv_client::{ClientConfig, PushMessage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

/// Launcher configuration
struct Config {
    /// Server host
    host: String,
    /// Server port
    port: u16,
    password: Option<String>,
    db: u32,
    verbose: bool,
    /// Command given on the command line, if any
    command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: flashkv_client::DEFAULT_HOST.to_string(),
            port: flashkv_client::DEFAULT_PORT,
            password: None,
            db: 0,
            verbose: false,
            command: Vec::new(),
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => {
                    config.host = value_of(&args, i, "--host").to_string();
                    i += 2;
                }
                "--port" | "-p" => {
                    config.port = value_of(&args, i, "--port").parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid port number");
                        std::process::exit(1);
                    });
                    i += 2;
                }
                "--password" | "-a" => {
                    config.password = Some(value_of(&args, i, "--password").to_string());
                    i += 2;
                }
                "--db" | "-n" => {
                    config.db = value_of(&args, i, "--db").parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid database index");
                        std::process::exit(1);
                    });
                    i += 2;
                }
                "--verbose" => {
                    config.verbose = true;
                    i += 1;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("flashkv-cli version {}", flashkv_client::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    config.command = args[i..].to_vec();
                    break;
                }
            }
        }

        config
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn value_of<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    match args.get(i + 1) {
        Some(value) => value,
        None => {
            eprintln!("Error: {} requires a value", flag);
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        r#"
flashkv-cli - Pipelined command-line client for RESP key-value servers

USAGE:
    flashkv-cli [OPTIONS] [COMMAND [ARG ...]]

OPTIONS:
    -h, --host <HOST>          Server host (default: 127.0.0.1)
    -p, --port <PORT>          Server port (default: 6379)
    -a, --password <PASSWORD>  Password sent with AUTH on every (re)connect
    -n, --db <INDEX>           Database selected on every (re)connect
        --verbose              Log connection activity to stderr
    -v, --version              Print version information
        --help                 Print this help message

EXAMPLES:
    flashkv-cli PING
    flashkv-cli SET name Ariz
    printf 'INCR n\nINCR n\nGET n\n' | flashkv-cli
    flashkv-cli SUBSCRIBE news       # prints messages until Ctrl+C
"#
    );
}

/// Command names the launcher can send.
const COMMANDS: &[&str] = &[
    "PING", "ECHO", "GET", "SET", "DEL", "EXISTS", "INCR", "INCRBY", "DECR", "DECRBY", "MGET",
    "MSET", "APPEND", "STRLEN", "EXPIRE", "TTL", "PERSIST", "KEYS", "TYPE", "DBSIZE", "FLUSHDB",
    "INFO", "WATCH", "UNWATCH", "PUBLISH", "LPUSH", "RPUSH", "LPOP", "RPOP", "LRANGE", "LLEN",
];

fn command_type(name: &str) -> Option<CommandType> {
    let upper = name.to_ascii_uppercase();
    let command = match upper.as_str() {
        "AUTH" => CommandType::Auth,
        "SELECT" => CommandType::Select,
        "MULTI" => CommandType::Multi,
        "EXEC" => CommandType::Exec,
        "DISCARD" => CommandType::Discard,
        "SUBSCRIBE" => CommandType::Subscribe,
        "UNSUBSCRIBE" => CommandType::Unsubscribe,
        "PSUBSCRIBE" => CommandType::PSubscribe,
        "PUNSUBSCRIBE" => CommandType::PUnsubscribe,
        other => CommandType::Other(COMMANDS.iter().copied().find(|known| *known == other)?),
    };
    Some(command)
}

/// A reply the launcher is waiting for.
enum Reply {
    Value(Handle<RespValue>),
    Exec(Handle<Vec<RespValue>>),
    Failed(String),
}

impl Reply {
    async fn resolve(self) -> RespValue {
        let result = match self {
            Reply::Value(handle) => handle.wait().await,
            Reply::Exec(handle) => handle.wait().await.map(RespValue::Array),
            Reply::Failed(message) => return RespValue::Error(message),
        };
        result.unwrap_or_else(|e| RespValue::Error(e.to_string()))
    }
}

fn dispatch(conn: &Connection, line: &str) -> Option<Reply> {
    let mut words = line.split_whitespace();
    let name = words.next()?;

    let Some(command) = command_type(name) else {
        return Some(Reply::Failed(format!("unsupported command '{}'", name)));
    };
    let args = CommandArgs::new().add_all(words.map(|word| word.to_string()));
    debug!(command = %command, args = args.len(), "Dispatching");

    let reply = match command {
        CommandType::Exec => conn.exec().map(Reply::Exec),
        command => conn
            .dispatch(command, args, RespOutput::new())
            .map(Reply::Value),
    };
    Some(reply.unwrap_or_else(|e| Reply::Failed(e.to_string())))
}

/// Formats a reply like redis-cli.
fn render(value: &RespValue, indent: usize) -> String {
    match value {
        RespValue::SimpleString(s) => s.clone(),
        RespValue::Error(e) => format!("(error) {}", e),
        RespValue::Integer(n) => format!("(integer) {}", n),
        RespValue::BulkString(data) => format!("\"{}\"", String::from_utf8_lossy(data)),
        RespValue::NullBulk | RespValue::NullArray => "(nil)".to_string(),
        RespValue::Array(values) if values.is_empty() => "(empty array)".to_string(),
        RespValue::Array(values) => values
            .iter()
            .enumerate()
            .map(|(i, value)| {
                let pad = if i == 0 { String::new() } else { " ".repeat(indent) };
                format!("{}{}) {}", pad, i + 1, render(value, indent + 3))
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn render_push(message: &PushMessage) -> String {
    let text = |data: &bytes::Bytes| String::from_utf8_lossy(data).into_owned();
    match message {
        PushMessage::Message { channel, payload } => {
            format!("1) \"message\"\n2) \"{}\"\n3) \"{}\"", text(channel), text(payload))
        }
        PushMessage::PMessage {
            pattern,
            channel,
            payload,
        } => format!(
            "1) \"pmessage\"\n2) \"{}\"\n3) \"{}\"\n4) \"{}\"",
            text(pattern),
            text(channel),
            text(payload)
        ),
        PushMessage::Subscription { .. } => String::new(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    // Set up logging
    let level = if config.verbose { Level::DEBUG } else { Level::WARN };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let mut client_config = ClientConfig::builder().database(config.db);
    if let Some(password) = &config.password {
        client_config = client_config.password(password.clone());
    }
    let conn = Connection::open(config.address(), client_config.build()).await?;
    let mut messages = conn.push_messages();

    // Dispatch everything first, then wait for the replies in order.
    let mut replies = Vec::new();
    if config.command.is_empty() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            replies.extend(dispatch(&conn, &line));
        }
    } else {
        replies.extend(dispatch(&conn, &config.command.join(" ")));
    }

    for reply in replies {
        println!("{}", render(&reply.resolve().await, 0));
    }

    if conn.is_subscribed() {
        println!("Reading messages... (press Ctrl+C to quit)");
        loop {
            tokio::select! {
                message = messages.recv() => match message {
                    Some(message @ (PushMessage::Message { .. } | PushMessage::PMessage { .. })) => {
                        println!("{}", render_push(&message));
                    }
                    Some(_) => {}
                    None => break,
                },
                _ = signal::ctrl_c() => break,
            }
        }
    }

    conn.close();
    Ok(())
}
