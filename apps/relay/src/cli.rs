use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use lantern_proto::{ClientMessage, ServerMessage};

#[derive(Parser, Debug)]
#[command(name = "lantern-relay")]
#[command(about = "Lantern signaling relay and debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join a room as a probe client and print every event received
    Debug {
        /// Relay URL (e.g. ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Room to join
        #[arg(short, long)]
        room: String,

        /// User id to join as
        #[arg(long, default_value = "debug-probe")]
        user: String,

        /// Display name to join as
        #[arg(long, default_value = "Debug Probe")]
        name: String,
    },
}

pub async fn run_debug_client(url: String, room: String, user: String, name: String) -> Result<()> {
    let ws_url = format!("{}/ws/{}", url.trim_end_matches('/'), room);
    debug!("connecting to {}", ws_url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("failed to connect to {}: {}", ws_url, e);
            return Err(anyhow::anyhow!("connection failed: {}", e));
        }
        Err(_) => {
            return Err(anyhow::anyhow!("connection to {} timed out", ws_url));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let join = ClientMessage::JoinRoom {
        room_id: room.clone(),
        user_id: user,
        display_name: name,
    };
    write
        .send(Message::Text(serde_json::to_string(&join)?.into()))
        .await?;
    println!("joined room {room}, waiting for events (ctrl-c to quit)");

    while let Some(frame) = read.next().await {
        match frame? {
            Message::Text(text) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(message) => println!("{}", serde_json::to_string_pretty(&message)?),
                Err(_) => println!("<unparsed> {text}"),
            },
            Message::Ping(payload) => {
                write.send(Message::Pong(payload)).await?;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    println!("relay closed the connection");
    Ok(())
}
