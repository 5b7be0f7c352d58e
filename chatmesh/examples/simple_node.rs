//! Interactive overlay node: binds a socket on the given IPv4 address and
//! drives the protocol from a line-based shell.
//!
//! Commands: `con <ip> <port>`, `dis <ip>`, `msg <ip> <text...>`,
//! `file <ip> <path>`, `ls`, `lsdb`, `acks`, `loglvl [LEVEL]`, `exit`.
//!
//! The initial log level comes from `LOG_LEVEL` (NONE, WARN, INFO, DEBUG;
//! anything else falls back to INFO).

use chatmesh::{Event, Node, ProtocolConfig};
use clap::Parser;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::metadata::LevelFilter;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

#[derive(Parser)]
struct Args {
    /// IPv4 address of the interface to bind.
    local_ip: Ipv4Addr,
}

fn level_from_name(name: &str) -> Option<LevelFilter> {
    match name {
        "NONE" => Some(LevelFilter::OFF),
        "WARN" => Some(LevelFilter::WARN),
        "INFO" => Some(LevelFilter::INFO),
        "DEBUG" => Some(LevelFilter::DEBUG),
        _ => None,
    }
}

fn init_tracing() -> reload::Handle<LevelFilter, tracing_subscriber::Registry> {
    use tracing_subscriber::layer::SubscriberExt;

    let initial = match std::env::var("LOG_LEVEL") {
        Ok(name) => level_from_name(&name).unwrap_or_else(|| {
            eprintln!("unknown log level '{name}', defaulting to INFO");
            LevelFilter::INFO
        }),
        Err(_) => LevelFilter::INFO,
    };

    let (filter, handle) = reload::Layer::new(initial);
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .init();
    handle
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_handle = init_tracing();
    let args = Args::parse();

    let (node, mut events) = Node::bind(args.local_ip, ProtocolConfig::default()).await?;
    let node = Arc::new(node);
    println!(
        "listening on {}",
        node.local_address().expect("socket is open")
    );

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                Event::Connected { peer } => println!("connected to {peer}"),
                Event::Disconnected { peer } => println!("disconnected from {peer}"),
                Event::MessageReceived { from, text } => println!("MSG {from}: {text}"),
                Event::FileReceived { from, path } => {
                    println!("FILE {from}: {}", path.display())
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, args)) = parts.split_first() else {
            continue;
        };

        match command {
            "con" => cmd_connect(&node, args),
            "dis" => cmd_disconnect(&node, args),
            "msg" => cmd_message(&node, args),
            "file" => cmd_file(&node, args),
            "ls" => cmd_list(&node),
            "lsdb" => cmd_lsdb(&node),
            "acks" => cmd_acks(&node),
            "loglvl" => cmd_loglvl(&log_handle, args),
            "exit" => break,
            _ => println!("unknown command: {command}"),
        }
    }

    node.shutdown();
    Ok(())
}

fn parse_ip(arg: &str) -> Option<Ipv4Addr> {
    match arg.parse() {
        Ok(ip) => Some(ip),
        Err(_) => {
            println!("invalid IPv4 address: {arg}");
            None
        }
    }
}

fn cmd_connect(node: &Arc<Node>, args: &[&str]) {
    let [ip, port] = args else {
        println!("usage: con <ip> <port>");
        return;
    };
    let (Some(ip), Ok(port)) = (parse_ip(ip), port.parse::<u16>()) else {
        println!("usage: con <ip> <port>");
        return;
    };

    let node = node.clone();
    tokio::spawn(async move {
        if let Err(e) = node.connect(SocketAddrV4::new(ip, port)).await {
            println!("failed to connect to {ip}: {e}");
        }
    });
}

fn cmd_disconnect(node: &Arc<Node>, args: &[&str]) {
    let [ip] = args else {
        println!("usage: dis <ip>");
        return;
    };
    let Some(ip) = parse_ip(ip) else { return };

    let node = node.clone();
    tokio::spawn(async move {
        if let Err(e) = node.disconnect(ip).await {
            println!("failed to disconnect from {ip}: {e}");
        }
    });
}

fn cmd_message(node: &Arc<Node>, args: &[&str]) {
    let Some((&ip, words)) = args.split_first() else {
        println!("usage: msg <ip> <text...>");
        return;
    };
    let Some(ip) = parse_ip(ip) else { return };
    let text = words.join(" ");

    let node = node.clone();
    tokio::spawn(async move {
        match node.send_message(ip, &text).await {
            Ok(()) => println!("message sent"),
            Err(e) => println!("failed to send message to {ip}: {e}"),
        }
    });
}

fn cmd_file(node: &Arc<Node>, args: &[&str]) {
    let [ip, path] = args else {
        println!("usage: file <ip> <path>");
        return;
    };
    let Some(ip) = parse_ip(ip) else { return };
    let path = PathBuf::from(path);

    let node = node.clone();
    tokio::spawn(async move {
        match node.send_file(ip, &path).await {
            Ok(()) => println!("file sent"),
            Err(e) => println!("failed to send file to {ip}: {e}"),
        }
    });
}

fn cmd_list(node: &Node) {
    println!("neighbors:");
    for (addr, next_hop) in node.neighbors() {
        println!("  {addr} via {next_hop}");
    }
    println!("routing table:");
    for (dest, next_hop) in node.routing_table() {
        println!("  {dest} -> {next_hop}");
    }
}

fn cmd_lsdb(node: &Node) {
    for (owner, lsa) in node.lsdb() {
        println!("{owner} seq {}: {:?}", lsa.seq_num, lsa.neighbors);
    }
}

fn cmd_acks(node: &Node) {
    for (dest, pkt_nums) in node.open_acks() {
        println!("{dest}: {pkt_nums:?}");
    }
    for (dest, cwnd) in node.congestion_windows() {
        println!("{dest}: cwnd {cwnd}");
    }
    for (dest, ssthresh) in node.slow_start_thresholds() {
        println!("{dest}: ssthresh {ssthresh}");
    }
}

fn cmd_loglvl(handle: &reload::Handle<LevelFilter, tracing_subscriber::Registry>, args: &[&str]) {
    match args {
        [] => {
            let current = handle.clone_current().map(|l| l.to_string());
            println!("log level: {}", current.unwrap_or_else(|| "?".to_string()));
        }
        [name] => match level_from_name(&name.to_uppercase()) {
            Some(level) => {
                if handle.reload(level).is_err() {
                    println!("failed to change log level");
                }
            }
            None => println!("usage: loglvl [NONE|WARN|INFO|DEBUG]"),
        },
        _ => println!("usage: loglvl [NONE|WARN|INFO|DEBUG]"),
    }
}
