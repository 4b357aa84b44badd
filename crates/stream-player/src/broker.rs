//! Broker client: blocking stream reads over Redis.
//!
//! `XREAD` replies are validated against an explicit schema instead of being
//! indexed blindly:
//!
//! ```text
//! reply   := nil | [ [stream-name, entries] ]        (RESP2)
//!          | { stream-name => entries }              (RESP3)
//! entries := [ [id, fields] ... ]
//! fields  := [ name, value, name, value ... ] | { name => value } | nil
//! ```
//!
//! Any deviation is a [`BrokerError::Protocol`], which callers treat as fatal. An
//! entry whose fields do not contain the payload field yields an empty payload.

use std::time::Duration;

use redis::Value;
use thiserror::Error;

use crate::config::BrokerConfig;
use crate::entry::{StreamEntry, StreamToken};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("cannot connect to broker at {address}: {reason}")]
    Connect { address: String, reason: String },
    #[error("broker connection lost: {0}")]
    ConnectionLost(String),
    #[error("malformed broker reply: {0}")]
    Protocol(String),
    #[error("broker command failed: {0}")]
    Command(String),
}

impl BrokerError {
    /// Whether reconnecting may fix the error.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, BrokerError::ConnectionLost(_))
    }
}

/// Source of stream entries, abstracting the broker connection.
pub trait EntrySource {
    /// Read up to `count` entries strictly after `after`.
    ///
    /// `block = None` returns immediately; `Some(d)` waits up to `d` for data. An
    /// empty result means the wait elapsed without new entries.
    fn read(
        &mut self,
        after: &StreamToken,
        block: Option<Duration>,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError>;

    /// Token of the newest entry currently in the stream; `None` when it is empty.
    fn newest_token(&mut self) -> Result<Option<StreamToken>, BrokerError>;

    /// Read an integer state key; `None` when unset or not numeric.
    fn task_state(&mut self, key: &str) -> Result<Option<i64>, BrokerError>;

    /// Re-establish the connection after it was lost.
    fn reconnect(&mut self) -> Result<(), BrokerError>;
}

impl<S: EntrySource + ?Sized> EntrySource for Box<S> {
    fn read(
        &mut self,
        after: &StreamToken,
        block: Option<Duration>,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        (**self).read(after, block, count)
    }

    fn newest_token(&mut self) -> Result<Option<StreamToken>, BrokerError> {
        (**self).newest_token()
    }

    fn task_state(&mut self, key: &str) -> Result<Option<i64>, BrokerError> {
        (**self).task_state(key)
    }

    fn reconnect(&mut self) -> Result<(), BrokerError> {
        (**self).reconnect()
    }
}

/// Redis-backed [`EntrySource`]. The connection is closed when this is dropped.
pub struct RedisSource {
    client: redis::Client,
    conn: Option<redis::Connection>,
    config: BrokerConfig,
}

impl RedisSource {
    /// Connect and verify the broker answers `PING`.
    pub fn connect(config: BrokerConfig) -> Result<Self, BrokerError> {
        let client = redis::Client::open(config.address.url()).map_err(|e| BrokerError::Connect {
            address: config.address.to_string(),
            reason: e.to_string(),
        })?;
        let conn = open_connection(&client, &config)?;
        tracing::info!(
            address = %config.address,
            stream = %config.stream,
            field = %config.payload_field,
            "broker connection established"
        );
        Ok(Self {
            client,
            conn: Some(conn),
            config,
        })
    }

    fn connection(&mut self) -> Result<&mut redis::Connection, BrokerError> {
        self.conn
            .as_mut()
            .ok_or_else(|| BrokerError::ConnectionLost("not connected".to_string()))
    }

    fn fail(&mut self, err: redis::RedisError) -> BrokerError {
        let err = classify_error(err);
        if err.is_connection_lost() {
            self.conn = None;
        }
        err
    }
}

fn open_connection(
    client: &redis::Client,
    config: &BrokerConfig,
) -> Result<redis::Connection, BrokerError> {
    let connect_err = |e: redis::RedisError| BrokerError::Connect {
        address: config.address.to_string(),
        reason: e.to_string(),
    };
    let mut conn = client
        .get_connection_with_timeout(config.connect_timeout)
        .map_err(connect_err)?;
    redis::cmd("PING")
        .query::<String>(&mut conn)
        .map_err(connect_err)?;
    Ok(conn)
}

impl EntrySource for RedisSource {
    fn read(
        &mut self,
        after: &StreamToken,
        block: Option<Duration>,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut cmd = redis::cmd("XREAD");
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block_millis(block));
        }
        cmd.arg("COUNT")
            .arg(count.max(1))
            .arg("STREAMS")
            .arg(&self.config.stream)
            .arg(after.as_arg());

        let result = {
            let conn = self.connection()?;
            cmd.query::<Value>(conn)
        };
        let reply = result.map_err(|e| self.fail(e))?;
        parse_xread_reply(reply, &self.config.stream, &self.config.payload_field)
    }

    fn newest_token(&mut self) -> Result<Option<StreamToken>, BrokerError> {
        let mut cmd = redis::cmd("XREVRANGE");
        cmd.arg(&self.config.stream).arg("+").arg("-").arg("COUNT").arg(1);
        let result = {
            let conn = self.connection()?;
            cmd.query::<Value>(conn)
        };
        let reply = result.map_err(|e| self.fail(e))?;
        let entries = parse_range_reply(reply, &self.config.payload_field)?;
        Ok(entries.into_iter().next().map(|entry| entry.token))
    }

    fn task_state(&mut self, key: &str) -> Result<Option<i64>, BrokerError> {
        let result = {
            let conn = self.connection()?;
            redis::cmd("GET").arg(key).query::<Option<String>>(conn)
        };
        let raw = result.map_err(|e| self.fail(e))?;
        Ok(raw.and_then(|s| s.trim().parse().ok()))
    }

    fn reconnect(&mut self) -> Result<(), BrokerError> {
        self.conn = None;
        let conn = open_connection(&self.client, &self.config)
            .map_err(|e| BrokerError::ConnectionLost(e.to_string()))?;
        self.conn = Some(conn);
        Ok(())
    }
}

/// `BLOCK 0` means "forever" to the broker, so sub-millisecond waits round up.
fn block_millis(block: Duration) -> u64 {
    (block.as_millis() as u64).max(1)
}

fn classify_error(err: redis::RedisError) -> BrokerError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        BrokerError::ConnectionLost(err.to_string())
    } else if err.kind() == redis::ErrorKind::TypeError {
        BrokerError::Protocol(err.to_string())
    } else {
        BrokerError::Command(err.to_string())
    }
}

/// Validate an `XREAD` reply for a single `stream` and extract `field` payloads.
pub fn parse_xread_reply(
    reply: Value,
    stream: &str,
    field: &str,
) -> Result<Vec<StreamEntry>, BrokerError> {
    let streams: Vec<(Value, Value)> = match reply {
        Value::Nil => return Ok(Vec::new()),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Array(pair) => into_pair(pair, "stream element"),
                other => Err(protocol(format!("stream element is not an array: {other:?}"))),
            })
            .collect::<Result<_, _>>()?,
        Value::Map(pairs) => pairs,
        other => return Err(protocol(format!("unexpected reply type: {other:?}"))),
    };

    if streams.len() != 1 {
        return Err(protocol(format!(
            "expected exactly one stream in reply, got {}",
            streams.len()
        )));
    }

    let mut out = Vec::new();
    for (name, entries) in streams {
        let name = text(&name).ok_or_else(|| protocol("stream name is not a string"))?;
        if name != stream {
            return Err(protocol(format!("reply for unexpected stream {name:?}")));
        }
        let Value::Array(entries) = entries else {
            return Err(protocol(format!("entries for {stream:?} are not an array")));
        };
        for entry in entries {
            out.push(parse_entry(entry, field)?);
        }
    }
    Ok(out)
}

/// Validate an `XRANGE`/`XREVRANGE` reply: a flat array of entries.
pub fn parse_range_reply(reply: Value, field: &str) -> Result<Vec<StreamEntry>, BrokerError> {
    match reply {
        Value::Nil => Ok(Vec::new()),
        Value::Array(entries) => entries
            .into_iter()
            .map(|entry| parse_entry(entry, field))
            .collect(),
        other => Err(protocol(format!("unexpected range reply type: {other:?}"))),
    }
}

fn parse_entry(entry: Value, field: &str) -> Result<StreamEntry, BrokerError> {
    let Value::Array(parts) = entry else {
        return Err(protocol("entry is not an array"));
    };
    let (id, fields) = into_pair(parts, "entry")?;
    let id = text(&id).ok_or_else(|| protocol("entry id is not a string"))?;
    let token = StreamToken::parse(&id)
        .filter(|t| !t.is_latest())
        .ok_or_else(|| protocol(format!("invalid entry id {id:?}")))?;

    let pairs: Vec<(Value, Value)> = match fields {
        Value::Nil => Vec::new(),
        Value::Array(flat) => {
            if flat.len() % 2 != 0 {
                return Err(protocol(format!(
                    "entry {id} has an odd number of field elements ({})",
                    flat.len()
                )));
            }
            let mut it = flat.into_iter();
            let mut pairs = Vec::new();
            while let (Some(k), Some(v)) = (it.next(), it.next()) {
                pairs.push((k, v));
            }
            pairs
        }
        Value::Map(pairs) => pairs,
        other => return Err(protocol(format!("entry {id} fields have unexpected type: {other:?}"))),
    };

    let mut payload = None;
    for (k, v) in pairs {
        let key = text(&k).ok_or_else(|| protocol(format!("entry {id} has a non-string field name")))?;
        if key == field {
            payload = Some(match v {
                Value::BulkString(bytes) => bytes,
                Value::SimpleString(s) => s.into_bytes(),
                Value::Nil => Vec::new(),
                other => {
                    return Err(protocol(format!(
                        "entry {id} field {field:?} is not a byte string: {other:?}"
                    )));
                }
            });
        }
    }

    let payload = payload.unwrap_or_else(|| {
        tracing::debug!(id = %id, field, "entry has no payload field");
        Vec::new()
    });
    Ok(StreamEntry::new(token, payload))
}

fn into_pair(mut items: Vec<Value>, what: &str) -> Result<(Value, Value), BrokerError> {
    if items.len() != 2 {
        return Err(protocol(format!(
            "{what} has {} elements, expected 2",
            items.len()
        )));
    }
    let second = items.pop().unwrap_or(Value::Nil);
    let first = items.pop().unwrap_or(Value::Nil);
    Ok((first, second))
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
        Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

fn protocol(msg: impl Into<String>) -> BrokerError {
    BrokerError::Protocol(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    fn bytes(b: &[u8]) -> Value {
        Value::BulkString(b.to_vec())
    }

    fn entry(id: &str, fields: Vec<Value>) -> Value {
        Value::Array(vec![bulk(id), Value::Array(fields)])
    }

    fn reply(stream: &str, entries: Vec<Value>) -> Value {
        Value::Array(vec![Value::Array(vec![bulk(stream), Value::Array(entries)])])
    }

    #[test]
    fn nil_reply_is_timeout() {
        assert!(parse_xread_reply(Value::Nil, "audio", "audio").unwrap().is_empty());
    }

    #[test]
    fn extracts_payload_by_field_name() {
        let pcm = [0u8, 0, 128, 63];
        let r = reply(
            "audio",
            vec![
                entry("1-0", vec![bulk("ts"), bulk("17"), bulk("audio"), bytes(&pcm)]),
                entry("1-1", vec![bulk("audio"), bytes(&[])]),
            ],
        );
        let out = parse_xread_reply(r, "audio", "audio").unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].token, StreamToken::id(1, 0));
        assert_eq!(out[0].payload, pcm.to_vec());
        assert_eq!(out[1].token, StreamToken::id(1, 1));
        assert!(out[1].payload.is_empty());
    }

    #[test]
    fn missing_field_yields_empty_payload() {
        let r = reply("audio", vec![entry("3-0", vec![bulk("other"), bulk("x")])]);
        let out = parse_xread_reply(r, "audio", "audio").unwrap();
        assert_eq!(out, vec![StreamEntry::new(StreamToken::id(3, 0), Vec::new())]);
    }

    #[test]
    fn resp3_map_reply_is_accepted() {
        let r = Value::Map(vec![(
            bulk("pred_audio"),
            Value::Array(vec![Value::Array(vec![
                bulk("9-2"),
                Value::Map(vec![(bulk("audio"), bytes(&[1, 2, 3, 4]))]),
            ])]),
        )]);
        let out = parse_xread_reply(r, "pred_audio", "audio").unwrap();
        assert_eq!(out[0].token, StreamToken::id(9, 2));
        assert_eq!(out[0].payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn odd_field_count_is_protocol_error() {
        let r = reply("audio", vec![entry("1-0", vec![bulk("audio")])]);
        assert!(matches!(
            parse_xread_reply(r, "audio", "audio"),
            Err(BrokerError::Protocol(_))
        ));
    }

    #[test]
    fn wrong_element_counts_are_protocol_errors() {
        let short_entry = reply("audio", vec![Value::Array(vec![bulk("1-0")])]);
        assert!(matches!(
            parse_xread_reply(short_entry, "audio", "audio"),
            Err(BrokerError::Protocol(_))
        ));

        let two_streams = Value::Array(vec![
            Value::Array(vec![bulk("audio"), Value::Array(vec![])]),
            Value::Array(vec![bulk("other"), Value::Array(vec![])]),
        ]);
        assert!(matches!(
            parse_xread_reply(two_streams, "audio", "audio"),
            Err(BrokerError::Protocol(_))
        ));

        assert!(matches!(
            parse_xread_reply(Value::Int(3), "audio", "audio"),
            Err(BrokerError::Protocol(_))
        ));
    }

    #[test]
    fn unexpected_stream_or_bad_id_rejected() {
        let r = reply("video", vec![]);
        assert!(parse_xread_reply(r, "audio", "audio").is_err());

        let r = reply("audio", vec![entry("not-an-id", vec![])]);
        assert!(parse_xread_reply(r, "audio", "audio").is_err());

        let r = reply("audio", vec![entry("$", vec![])]);
        assert!(parse_xread_reply(r, "audio", "audio").is_err());
    }

    #[test]
    fn non_bytes_payload_is_protocol_error() {
        let r = reply("audio", vec![entry("1-0", vec![bulk("audio"), Value::Int(5)])]);
        assert!(matches!(
            parse_xread_reply(r, "audio", "audio"),
            Err(BrokerError::Protocol(_))
        ));
    }

    #[test]
    fn range_reply_yields_newest_entry() {
        let r = Value::Array(vec![entry("1700-4", vec![bulk("audio"), bytes(&[0, 0, 0, 0])])]);
        let out = parse_range_reply(r, "audio").unwrap();
        assert_eq!(out[0].token, StreamToken::id(1700, 4));

        assert!(parse_range_reply(Value::Array(vec![]), "audio").unwrap().is_empty());
        assert!(parse_range_reply(Value::Nil, "audio").unwrap().is_empty());
        assert!(matches!(
            parse_range_reply(Value::Int(1), "audio"),
            Err(BrokerError::Protocol(_))
        ));
    }

    #[test]
    fn block_never_sends_zero() {
        assert_eq!(block_millis(Duration::ZERO), 1);
        assert_eq!(block_millis(Duration::from_micros(300)), 1);
        assert_eq!(block_millis(Duration::from_secs(1)), 1000);
    }
}
