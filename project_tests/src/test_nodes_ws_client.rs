use chrono::{Duration, Utc};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Watches one host on a running server_nodes instance", long_about = None)]
struct Args {
    /// WebSocket endpoint of the server
    #[clap(short, long, default_value = "ws://127.0.0.1:9003/ws")]
    url: String,

    /// Host id to subscribe to (defaults to the first advertised host)
    #[clap(long)]
    host: Option<String>,

    /// Report interval in seconds
    #[clap(short, long, default_value_t = 60)]
    report_interval_seconds: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Frame {
    #[serde(rename = "type")]
    msg_type: String,
    host_id: Option<String>,
    hosts: Option<Vec<HostEntry>>,
    records: Option<Vec<serde_json::Value>>,
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HostEntry {
    id: String,
    name: String,
}

#[derive(Default)]
struct Stats {
    data_timestamps: VecDeque<chrono::DateTime<Utc>>,
    last_record_count: usize,
    errors: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let stats = Arc::new(Mutex::new(Stats::default()));

    // Clone for the reporter task
    let stats_reporter = Arc::clone(&stats);
    let report_interval_seconds = args.report_interval_seconds;
    tokio::spawn(async move {
        loop {
            sleep(std::time::Duration::from_secs(report_interval_seconds)).await;
            let now = Utc::now();
            let one_minute_ago = now - Duration::minutes(1);

            let mut data = stats_reporter.lock().unwrap();
            while data.data_timestamps.front().is_some_and(|&t| t < one_minute_ago) {
                data.data_timestamps.pop_front();
            }

            println!("\n----- 1-Minute Summary -----");
            println!("Data frames: {} msg/min", data.data_timestamps.len());
            println!("Resources in last frame: {}", data.last_record_count);
            println!("Errors so far: {}", data.errors);
            println!("----------------------------\n");
        }
    });

    println!("Connecting to {}...", args.url);
    let (ws_stream, _) = connect_async(args.url.as_str()).await?;
    let (mut write, mut read) = ws_stream.split();
    let mut wanted = args.host.clone();
    let mut subscribed = false;

    if let Some(host) = &wanted {
        let sub_msg = json!({ "type": "subscribe", "hostId": host }).to_string();
        write.send(Message::Text(sub_msg.into())).await?;
        subscribed = true;
    }

    while let Some(Ok(msg)) = read.next().await {
        let Message::Text(text) = msg else { continue };
        let Ok(frame) = serde_json::from_str::<Frame>(&text) else {
            println!("Unparsed frame: {}", text);
            continue;
        };
        match frame.msg_type.as_str() {
            "hosts" => {
                let hosts = frame.hosts.unwrap_or_default();
                for host in &hosts {
                    println!("Host available: {} ({})", host.id, host.name);
                }
                if !subscribed {
                    wanted = hosts.first().map(|h| h.id.clone());
                    if let Some(host) = &wanted {
                        let sub_msg = json!({ "type": "subscribe", "hostId": host }).to_string();
                        write.send(Message::Text(sub_msg.into())).await?;
                        subscribed = true;
                    }
                }
            }
            "data" => {
                let mut data = stats.lock().unwrap();
                data.data_timestamps.push_back(Utc::now());
                data.last_record_count = frame.records.map(|r| r.len()).unwrap_or(0);
            }
            "error" => {
                stats.lock().unwrap().errors += 1;
                println!(
                    "Error for {:?}: {} {}",
                    frame.host_id,
                    frame.code.unwrap_or_default(),
                    frame.message.unwrap_or_default()
                );
            }
            other => println!("{} {:?}", other, frame.host_id),
        }
    }
    println!("Connection closed.");
    Ok(())
}
