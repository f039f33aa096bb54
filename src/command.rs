//! Thin builders for the RESP commands this crate's own startup sequence and
//! test suite issue. Callers are free to build `RespValue::command(...)`
//! directly — these exist purely for convenience: small, obvious, one per
//! command, not a general command-builder framework.

use bytes::Bytes;

use crate::connection::frame::RespValue;

pub fn ping(message: Option<Bytes>) -> RespValue {
    match message {
        Some(msg) => RespValue::command("PING", vec![msg]),
        None => RespValue::command("PING", Vec::<Bytes>::new()),
    }
}

pub fn get(key: impl Into<Bytes>) -> RespValue {
    RespValue::command("GET", vec![key.into()])
}

pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> RespValue {
    RespValue::command("SET", vec![key.into(), value.into()])
}

pub fn setex(key: impl Into<Bytes>, value: impl Into<Bytes>, seconds: i64) -> RespValue {
    RespValue::command(
        "SETEX",
        vec![key.into(), Bytes::from(seconds.to_string()), value.into()],
    )
}

pub fn publish(channel: impl Into<Bytes>, message: impl Into<Bytes>) -> RespValue {
    RespValue::command("PUBLISH", vec![channel.into(), message.into()])
}

pub fn auth(username: Option<&str>, password: &str) -> RespValue {
    match username {
        Some(username) => RespValue::command(
            "AUTH",
            vec![
                Bytes::copy_from_slice(username.as_bytes()),
                Bytes::copy_from_slice(password.as_bytes()),
            ],
        ),
        None => RespValue::command("AUTH", vec![Bytes::copy_from_slice(password.as_bytes())]),
    }
}

pub fn select(database: i64) -> RespValue {
    RespValue::command("SELECT", vec![Bytes::from(database.to_string())])
}

pub fn quit() -> RespValue {
    RespValue::command("QUIT", Vec::<Bytes>::new())
}
