//! Subscribes to one topic and prints every delivered message, ack'ing
//! each one so the broker advances to the next pending message.

use std::io::BufReader;
use std::net::TcpStream;

use anyhow::{Context, Result};
use clap::Parser;

use chronopub::codec::{read_frame, write_frame};
use chronopub::connection::write_ack;
use chronopub::message::ClientMessage;

#[derive(Debug, Parser)]
struct Args {
  /// Broker address to connect to.
  #[arg(long, default_value = "127.0.0.1:8080")]
  broker_addr: String,

  /// Topic to subscribe to.
  #[arg(long, default_value = "test")]
  topic: String,

  /// Request a replay of the topic's existing log on subscribe.
  #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
  replay: bool,
}

fn main() -> Result<()> {
  env_logger::init();
  let args = Args::parse();

  let mut stream = TcpStream::connect(&args.broker_addr)
    .with_context(|| format!("connecting to broker at {}", args.broker_addr))?;

  let handshake = ClientMessage::consumer_handshake(&args.topic, "", args.replay);
  write_frame(&mut stream, &handshake).context("sending consumer handshake")?;

  let mut reader = BufReader::new(stream.try_clone().context("cloning stream for reading")?);
  loop {
    let delivery = match read_frame(&mut reader) {
      Ok(msg) => msg,
      Err(e) => {
        eprintln!("connection closed: {e}");
        break;
      }
    };

    if let Some(payload) = delivery.payload {
      println!(
        "received message {} at ({}, {}): {} bytes",
        payload.id(),
        payload.physical,
        payload.logical,
        payload.content.len()
      );
    }

    write_ack(&mut stream).context("sending ack")?;
  }

  Ok(())
}
