//! Publishes a steady stream of random payloads to one topic: connect,
//! send a single producer handshake carrying the payload, and let the
//! broker close the connection after ingesting it.

use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rand::Rng;
use uuid::Uuid;

use chronopub::codec::write_frame;
use chronopub::hlc::Hlc;
use chronopub::message::{ClientMessage, HlcMessage};

#[derive(Debug, Parser)]
struct Args {
  /// Broker address to connect to.
  #[arg(long, default_value = "127.0.0.1:8080")]
  broker_addr: String,

  /// Topic to publish on.
  #[arg(long, default_value = "test")]
  topic: String,

  /// Number of messages to send. 0 means run forever.
  #[arg(long, default_value_t = 0)]
  count: u64,

  /// Delay between publishes.
  #[arg(long, default_value_t = 1000)]
  interval_ms: u64,

  /// Length of the random payload.
  #[arg(long, default_value_t = 500)]
  payload_len: usize,
}

fn main() -> Result<()> {
  env_logger::init();
  let args = Args::parse();
  let clock = Hlc::new();

  let mut sent: u64 = 0;
  loop {
    if args.count != 0 && sent >= args.count {
      break;
    }

    let ts = clock.now();
    let payload = random_payload(args.payload_len);
    let msg = HlcMessage::new(Uuid::nil(), payload, ts);
    let handshake = ClientMessage::producer_handshake(&args.topic, "", msg);

    let mut stream = TcpStream::connect(&args.broker_addr)
      .with_context(|| format!("connecting to broker at {}", args.broker_addr))?;
    write_frame(&mut stream, &handshake).context("sending producer handshake")?;

    sent += 1;
    println!("sent message {sent} on topic {:?}", args.topic);
    thread::sleep(Duration::from_millis(args.interval_ms));
  }

  Ok(())
}

fn random_payload(len: usize) -> Vec<u8> {
  const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
  let mut rng = rand::rng();
  (0..len).map(|_| CHARSET[rng.random_range(0..CHARSET.len())]).collect()
}
