//! Sends a couple of PINGs and prints the replies.
//!
//!     cargo run --example ping

use redis_connection_core::command;
use redis_connection_core::config::Config;
use redis_connection_core::{Connection, ConnectionError};

#[tokio::main]
pub async fn main() -> Result<(), ConnectionError> {
    let connection = Connection::make(Config::tcp("127.0.0.1", 6379)).await?;

    let replies = connection.send(vec![command::ping(None)]).await?;
    println!("empty ping response: {:?}", replies[0]);

    let replies = connection
        .send(vec![command::ping(Some("hello".into()))])
        .await?;
    println!("echoed ping response: {:?}", replies[0]);

    connection.close().await;
    Ok(())
}
