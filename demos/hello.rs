//! Connects, sets a key, then reads it back.
//!
//! Run against any RESP2-speaking server listening on 127.0.0.1:6379:
//!
//!     cargo run --example hello

use redis_connection_core::command;
use redis_connection_core::config::Config;
use redis_connection_core::{Connection, ConnectionError};

#[tokio::main]
pub async fn main() -> Result<(), ConnectionError> {
    let connection = Connection::make(Config::tcp("127.0.0.1", 6379)).await?;

    let replies = connection
        .send(vec![command::set("hello", "world")])
        .await?;
    println!("SET reply: {:?}", replies[0]);

    let replies = connection.send(vec![command::get("hello")]).await?;
    println!("GET reply: {:?}", replies[0]);

    connection.close().await;
    Ok(())
}
