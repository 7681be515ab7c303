//! The kvpipe executable supports the following command line arguments:
//!
//! `kvpipe ping [--addr IP-PORT]`
//!
//!     Ping the server.
//!
//! `kvpipe get <KEY> [--addr IP-PORT]`
//!
//!     Get the value of a given key.
//!
//! `kvpipe set <KEY> <VALUE> [--addr IP-PORT]`
//!
//!     Set the value of a key to a string.
//!
//! `kvpipe del <KEY> [--addr IP-PORT]`
//!
//!     Remove a given key.
//!
//! --addr accepts an IP address and a port number with the format IP:PORT.
//! If --addr is not specified then connect on 127.0.0.1:6379.
//! Print an error and return a non-zero exit code on server error, or if
//! IP-PORT does not parse as an address.

use std::process::exit;

use clap::{crate_version, App, Arg, ArgMatches, SubCommand};
use kvpipe::{Bulk, Client, NodeSpec, PipeError, Replies, Reply, Result, Value};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

const DEFAULT_ADDRESS: &str = "127.0.0.1:6379";

/// the command requested on the command line
#[derive(Debug)]
enum Command {
    Ping,
    Get { key: String },
    Set { key: String, value: String },
    Del { key: String },
}

/// ['Opt'] holds parsed and validated options from the command line
#[derive(Debug)]
struct Opt {
    addr: String,
    command: Command,
}

impl Opt {
    /// validates the `addr` parameter is a valid host and port
    /// # Errors
    /// returns [`PipeError::Parsing`] if the address is invalid
    fn build(addr: &str, command: Command) -> Result<Opt> {
        NodeSpec::parse(addr)?;
        Ok(Opt {
            addr: addr.to_string(),
            command,
        })
    }
}

fn main() -> Result<()> {
    // configure a subscriber that will log messages to STDERR
    subscriber_config();

    let matches = App::new("kvpipe")
        .version(crate_version!())
        .about("a pipelining client for RESP key-value servers")
        .subcommands(vec![
            SubCommand::with_name("ping").about("Ping the server"),
            SubCommand::with_name("get")
                .about("Get the value of a given key")
                .arg(Arg::with_name("KEY").required(true).index(1)),
            SubCommand::with_name("set")
                .about("Set the value of a key to a string")
                .arg(Arg::with_name("KEY").required(true).index(1))
                .arg(Arg::with_name("VALUE").required(true).index(2)),
            SubCommand::with_name("del")
                .about("Removes a given key")
                .arg(Arg::with_name("KEY").required(true).index(1)),
        ])
        .arg(
            Arg::with_name("addr")
                .long("addr")
                .value_name("IP_ADDR:PORT")
                .help("sets the IP_ADDR:PORT of the server to connect to")
                .default_value(DEFAULT_ADDRESS),
        )
        .get_matches();

    match parse_options(matches) {
        Ok(opt) => run(opt),
        Err(e) => {
            eprintln!("{:?}", e);
            exit(1);
        }
    }
}

/// runs the requested command against the server
fn run(opt: Opt) -> Result<()> {
    let client = Client::connect(&opt.addr)?;
    let reply = match opt.command {
        Command::Ping => client.execute(|s| s.ping())?,
        Command::Get { key } => client.execute(|s| s.get(&key))?,
        Command::Set { key, value } => client.execute(|s| s.set(&key, Value::from(value)))?,
        Command::Del { key } => client.execute(|s| s.del(&key))?,
    };
    match reply {
        Replies::One(reply) => println!("{}", render(&reply)),
        Replies::Many(replies) => {
            for reply in replies {
                println!("{}", render(&reply));
            }
        }
    }
    Ok(())
}

/// parses the matches from the command line into an [`Opt`] struct
fn parse_options(matches: ArgMatches) -> Result<Opt> {
    let addr = matches.value_of("addr").unwrap();
    match matches.subcommand() {
        ("ping", Some(_)) => Opt::build(addr, Command::Ping),
        ("get", Some(args)) => {
            let key = args.value_of("KEY").map(String::from).unwrap();
            Opt::build(addr, Command::Get { key })
        }
        ("set", Some(args)) => {
            let key = args.value_of("KEY").map(String::from).unwrap();
            let value = args.value_of("VALUE").map(String::from).unwrap();
            Opt::build(addr, Command::Set { key, value })
        }
        ("del", Some(args)) => {
            let key = args.value_of("KEY").map(String::from).unwrap();
            Opt::build(addr, Command::Del { key })
        }
        _ => Err(PipeError::Parsing(
            "expected one of: ping, get, set, del".to_string(),
        )),
    }
}

/// renders a reply for the terminal
fn render(reply: &Reply) -> String {
    match reply {
        Reply::Simple(s) => s.clone(),
        Reply::Int(n) => n.to_string(),
        Reply::Error(e) => format!("(error) {}", e.message),
        Reply::Bulk(Bulk::Nil) => "(nil)".to_string(),
        Reply::Bulk(Bulk::Text(s)) => s.clone(),
        Reply::Bulk(Bulk::Bytes(b)) => format!("{:02x?}", b),
        Reply::Bulk(Bulk::Object(v)) => v.to_string(),
        Reply::Array(None) => "(nil array)".to_string(),
        Reply::Array(Some(items)) => items
            .iter()
            .map(render)
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::WARN)
        // log to stderr instead of stdout so replies stay clean
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default subscriber failed");
}
