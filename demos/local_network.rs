//! Spin up an in-memory network, send a direct and a group message, and
//! show who received what.
//!
//! Run: `cargo run --example local_network -- --nodes 20 --fail 3`

use std::time::Duration;

use clap::Parser;
use overlay_routing::{connection::SendStatus, Bytes, Config, Message, Testnet};
use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of nodes in the network
    #[arg(short, long, default_value_t = 10)]
    nodes: usize,
    /// Number of nodes made unreachable before sending
    #[arg(short, long, default_value_t = 0)]
    fail: usize,
    /// Close group size
    #[arg(short, long, default_value_t = 4)]
    group_size: usize,
    /// Log every send and retry
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            Level::TRACE
        } else {
            Level::INFO
        })
        .init();

    let config = Config {
        node_group_size: cli.group_size,
        ..Default::default()
    };

    let testnet = match Testnet::with_config(cli.nodes, config) {
        Ok(testnet) => testnet,
        Err(error) => {
            println!("Error: {}", error);
            return;
        }
    };
    let nodes = &testnet.nodes;

    if nodes.len() < 2 {
        println!("Need at least 2 nodes");
        return;
    }

    for node in nodes.iter().rev().take(cli.fail) {
        println!("Making {} unreachable", node.id());
        testnet
            .network
            .set_send_status(node.id(), Some(SendStatus::Failed(-1)));
    }

    let sender = &nodes[0];
    let receiver = &nodes[nodes.len() / 2];

    println!("\nDirect message {} -> {}", sender.id(), receiver.id());
    sender.engine.send_to_closest_node(Message::request(
        sender.id(),
        receiver.id(),
        Bytes::from_static(b"hello"),
    ));

    match receiver.recv_timeout(Duration::from_secs(2)) {
        Some(message) => println!("Delivered, route history: {:?}", message.route_history),
        None => println!("Not delivered"),
    }

    let target = nodes[nodes.len() - 1].id();
    println!("\nGroup message {} -> {}", sender.id(), target);
    sender.engine.send_to_closest_node(Message::group_request(
        sender.id(),
        target,
        Bytes::from_static(b"hello group"),
    ));

    std::thread::sleep(Duration::from_millis(500));

    for node in nodes {
        let delivered = node.delivered();
        if !delivered.is_empty() {
            println!(
                "{} received {} message(s), distance {}",
                node.id(),
                delivered.len(),
                node.id().xor(&target)
            );
        }
    }
}
