//! Publishes one message on the `foo` channel.
//!
//! Run `cargo run --example sub` first, then in another terminal:
//!
//!     cargo run --example pub

use redis_connection_core::command;
use redis_connection_core::config::Config;
use redis_connection_core::{Connection, ConnectionError};

#[tokio::main]
async fn main() -> Result<(), ConnectionError> {
    let connection = Connection::make(Config::tcp("127.0.0.1", 6379)).await?;

    let replies = connection
        .send(vec![command::publish("foo", "bar")])
        .await?;
    println!("publish reply (subscriber count): {:?}", replies[0]);

    connection.close().await;
    Ok(())
}
