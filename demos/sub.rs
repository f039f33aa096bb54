//! Subscribes to the `foo` channel and prints one message.
//!
//!     cargo run --example sub
//!
//! Then in another terminal:
//!
//!     cargo run --example pub

use redis_connection_core::config::Config;
use redis_connection_core::{Connection, ConnectionError};
use tokio::sync::mpsc;

#[tokio::main]
pub async fn main() -> Result<(), ConnectionError> {
    let connection = Connection::make(Config::tcp("127.0.0.1", 6379)).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    connection
        .subscribe(vec!["foo".into()], tx, None, None)
        .await?;

    if let Some(message) = rx.recv().await {
        println!(
            "got message on {:?}: {:?}",
            message.channel, message.payload
        );
    }

    connection.close().await;
    Ok(())
}
