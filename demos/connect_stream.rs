use std::error::Error;
use std::time::Duration;

use arena_live_sdk::{StreamClient, StreamClientOptions, StreamHandlers, StreamMessage};
use serde_json::json;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:8080/live".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let handlers = StreamHandlers::new()
            .on_connect(|| println!("connected"))
            .on_disconnect(|| println!("disconnected"))
            .on_message(|message: &StreamMessage| {
                println!("type={} data={}", message.kind, message.data);
            });

        let client: StreamClient = StreamClient::builder(endpoint)
            .options(
                StreamClientOptions::default()
                    .with_reconnect_interval(Duration::from_secs(5))
                    .with_max_retries(5),
            )
            .handlers(handlers)
            .build();

        let mut states = client.state_receiver();
        while states.changed().await.is_ok() {
            let state = *states.borrow();
            println!("state={state:?} attempts={}", client.attempt_count());
            if state.is_open() {
                let _ = client.send(&json!({"type": "subscribe", "data": {"team": "all"}}));
            }
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
