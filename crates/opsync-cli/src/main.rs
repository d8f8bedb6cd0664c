//! # opsync CLI
//!
//! Operator utilities for inspecting a device database, comparing clocks and
//! encoding remote store keys.

use anyhow::{Context, Result};
use opsync_agent::{OfflineQueue, QueueConfig, SqliteStore};
use opsync_core::ClockSnapshot;
use opsync_remote::{decode_key, encode_key};
use std::env;
use std::path::Path;
use std::time::Duration;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "queue" => {
            let db = required(&args, 2, "queue <db>");
            let queue = open_queue(db, QueueConfig::default())?;
            if queue.is_empty() {
                println!("queue is empty");
            }
            for entry in queue.prioritize_operations() {
                let op = &entry.operation;
                println!(
                    "{:<10} {:<10} {:<28} {} {}",
                    format!("{:?}", entry.priority()).to_lowercase(),
                    op.kind().to_string(),
                    op.entity_key().to_string(),
                    entry.enqueued_at.to_rfc3339(),
                    op.clock()
                );
            }
        }
        "compact" => {
            let db = required(&args, 2, "compact <db>");
            let mut queue = open_queue(db, QueueConfig::default())?;
            let removed = queue
                .compact_operation_log()
                .context("Failed to compact queue")?;
            println!("removed {removed}, {} remaining", queue.len());
        }
        "expire" => {
            let db = required(&args, 2, "expire <db> <ttl-secs>");
            let ttl: u64 = required(&args, 3, "expire <db> <ttl-secs>")
                .parse()
                .context("Invalid TTL")?;
            let mut queue = open_queue(db, QueueConfig::default())?;
            let removed = queue.clean_expired_operations(Duration::from_secs(ttl));
            println!("removed {removed}, {} remaining", queue.len());
        }
        "compare" => {
            let usage = "compare <clock-json> <clock-json>";
            let left = parse_clock(required(&args, 2, usage))?;
            let right = parse_clock(required(&args, 3, usage))?;
            let relation = serde_json::to_value(left.compare(&right))?;
            println!("{left} is {} {right}", relation.as_str().unwrap_or("?"));
        }
        "encode" => {
            let key = required(&args, 2, "encode <key>");
            println!("{}", encode_key(key));
        }
        "decode" => {
            let encoded = required(&args, 2, "decode <encoded>");
            let decoded = decode_key(encoded).context("Failed to decode")?;
            println!("{decoded}");
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn required<'a>(args: &'a [String], index: usize, usage: &str) -> &'a str {
    match args.get(index) {
        Some(value) => value,
        None => {
            eprintln!("Usage: opsync {usage}");
            std::process::exit(1);
        }
    }
}

fn open_queue(db: &str, config: QueueConfig) -> Result<OfflineQueue<SqliteStore>> {
    let store = SqliteStore::open(Path::new(db)).with_context(|| format!("Failed to open {db}"))?;
    OfflineQueue::open(store, config).context("Failed to load queue")
}

fn parse_clock(json: &str) -> Result<ClockSnapshot> {
    serde_json::from_str(json).with_context(|| format!("Invalid clock: {json}"))
}

fn print_help() {
    println!(
        r#"opsync CLI

USAGE:
    opsync <COMMAND> [OPTIONS]

COMMANDS:
    queue <db>                 List pending operations in delivery order
    compact <db>               Keep only the latest pending operation per entity
    expire <db> <ttl-secs>     Drop pending operations older than the TTL
    compare <clock> <clock>    Compare two vector clocks given as JSON maps
    encode <key>               Encode a remote store key to base64url (no padding)
    decode <encoded>           Decode a base64url-encoded key
    help                       Show this help message

EXAMPLES:
    opsync queue ./opsync.db
    opsync compare '{{"phone":2,"tablet":1}}' '{{"phone":1,"tablet":3}}'
    opsync encode "household/tasks"
"#
    );
}
