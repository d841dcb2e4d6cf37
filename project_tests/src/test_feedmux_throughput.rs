use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use lib_feedmux::{Request, RequestType, Response, ResponseType};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Connects N consumers to server_feedmux and reports update rates", long_about = None)]
struct Args {
    /// Server WebSocket URL
    #[clap(long, default_value = "ws://127.0.0.1:9010/ws")]
    url: String,

    /// Provider every consumer subscribes to
    #[clap(short, long)]
    provider: String,

    /// Number of concurrent consumers
    #[clap(short, long, default_value_t = 4)]
    consumers: usize,

    /// Report interval in seconds
    #[clap(short, long, default_value_t = 60)]
    report_interval_seconds: u64,
}

#[derive(Default)]
struct Stats {
    snapshot_rows: HashMap<usize, usize>,
    update_rows: HashMap<usize, VecDeque<(chrono::DateTime<Utc>, usize)>>,
    errors: HashMap<usize, usize>,
}

async fn run_consumer(consumer: usize, args: Arc<Args>, stats: Arc<Mutex<Stats>>) -> Result<()> {
    let (ws_stream, _) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("consumer {} connecting to {}", consumer, args.url))?;
    let (mut write, mut read) = ws_stream.split();

    let mut subscribe = Request::new(RequestType::Subscribe, args.provider.clone());
    subscribe.request_id = format!("sub-{}", consumer);
    write
        .send(Message::Text(serde_json::to_string(&subscribe)?.into()))
        .await?;

    while let Some(msg) = read.next().await {
        let Message::Text(text) = msg? else { continue };
        let Ok(response) = serde_json::from_str::<Response>(&text) else { continue };
        let rows = response.data.as_ref().map_or(0, Vec::len);
        let mut data = stats.lock().expect("stats lock poisoned");
        match response.kind {
            ResponseType::Snapshot => *data.snapshot_rows.entry(consumer).or_default() += rows,
            ResponseType::Update => data
                .update_rows
                .entry(consumer)
                .or_default()
                .push_back((Utc::now(), rows)),
            ResponseType::Clear => {
                data.snapshot_rows.insert(consumer, 0);
            }
            ResponseType::Error => {
                *data.errors.entry(consumer).or_default() += 1;
                if let Some(error) = &response.error {
                    println!("consumer {}: {} error: {}", consumer, error.kind, error.message);
                }
            }
            _ => {}
        }
    }
    println!("consumer {}: server closed the connection", consumer);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Arc::new(Args::parse());
    let stats = Arc::new(Mutex::new(Stats::default()));

    let stats_reporter = Arc::clone(&stats);
    let interval = args.report_interval_seconds.max(1);
    let consumers = args.consumers;
    tokio::spawn(async move {
        loop {
            sleep(std::time::Duration::from_secs(interval)).await;
            let window_start = Utc::now() - Duration::seconds(interval as i64);
            let mut data = stats_reporter.lock().expect("stats lock poisoned");

            println!("\n----- {}s Summary -----", interval);
            for consumer in 0..consumers {
                let updates = data.update_rows.entry(consumer).or_default();
                while updates.front().is_some_and(|&(t, _)| t < window_start) {
                    updates.pop_front();
                }
                let messages = updates.len();
                let rows: usize = updates.iter().map(|&(_, n)| n).sum();
                println!(
                    "consumer {}: snapshot rows {}, {} updates ({} rows, {:.1} rows/s), errors {}",
                    consumer,
                    data.snapshot_rows.get(&consumer).copied().unwrap_or(0),
                    messages,
                    rows,
                    rows as f64 / interval as f64,
                    data.errors.get(&consumer).copied().unwrap_or(0),
                );
            }
            println!("------------------------\n");
        }
    });

    println!("Connecting {} consumers to {}...", args.consumers, args.url);
    let mut tasks = Vec::with_capacity(args.consumers);
    for consumer in 0..args.consumers {
        tasks.push(tokio::spawn(run_consumer(consumer, Arc::clone(&args), Arc::clone(&stats))));
    }
    println!("Subscribed to '{}'. Press Ctrl+C to stop.", args.provider);

    for task in tasks {
        if let Err(e) = task.await? {
            println!("{:#}", e);
        }
    }
    Ok(())
}
