//! Redis Client
//!
//! [`KvClient`] backed by a synchronous `redis` connection to one shard.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use redis::{Connection, FromRedisValue, RedisError, RedisResult, Value};
use tracing::{debug, info, warn};

use super::{score_arg, Command, KvClient, LuaScript, ScriptReply, TransportResult};
use crate::error::{ConfigError, TransportError};
use crate::shard::ShardAddr;

// == Connect Options ==
/// Connection parameters shared by every shard.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Database index selected after connecting
    pub database: i64,
    /// Connect, read and write timeout
    pub timeout: Duration,
    /// AUTH password
    pub password: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            database: 0,
            timeout: Duration::from_secs(10),
            password: None,
        }
    }
}

// == Redis Client ==
/// Lazily connected client for a single Redis instance.
///
/// Compiled scripts are cached per instance, keyed by script name.
pub struct RedisClient {
    shard: ShardAddr,
    options: ConnectOptions,
    connection: Mutex<Option<Connection>>,
    scripts: Mutex<HashMap<&'static str, redis::Script>>,
}

impl RedisClient {
    /// Creates a client; no connection is opened until the first command.
    pub fn new(shard: ShardAddr, options: ConnectOptions) -> Self {
        Self {
            shard,
            options,
            connection: Mutex::new(None),
            scripts: Mutex::new(HashMap::new()),
        }
    }

    /// The shard this client talks to.
    pub fn shard(&self) -> &ShardAddr {
        &self.shard
    }

    /// Connection URL including password and database.
    fn url(&self) -> String {
        match &self.options.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.shard.host, self.shard.port, self.options.database
            ),
            None => format!(
                "redis://{}:{}/{}",
                self.shard.host, self.shard.port, self.options.database
            ),
        }
    }

    fn connect(&self) -> TransportResult<Connection> {
        let connect_error = |err: RedisError| TransportError::Connect {
            shard: self.shard.to_string(),
            message: err.to_string(),
        };
        let client = redis::Client::open(self.url()).map_err(connect_error)?;
        let connection = client
            .get_connection_with_timeout(self.options.timeout)
            .map_err(connect_error)?;
        connection
            .set_read_timeout(Some(self.options.timeout))
            .map_err(connect_error)?;
        connection
            .set_write_timeout(Some(self.options.timeout))
            .map_err(connect_error)?;
        info!(shard = %self.shard, database = self.options.database, "Connected to redis");
        Ok(connection)
    }

    /// Runs `f` on the connection, connecting first if needed.
    ///
    /// A broken connection is dropped so the next command reconnects.
    fn run<T>(
        &self,
        command: &'static str,
        f: impl FnOnce(&mut Connection) -> RedisResult<T>,
    ) -> TransportResult<T> {
        let mut guard = self.connection.lock();
        if guard.is_none() {
            *guard = Some(self.connect()?);
        }
        let Some(connection) = guard.as_mut() else {
            return Err(TransportError::Io {
                command,
                message: "connection unavailable".to_string(),
            });
        };

        f(connection).map_err(|err| {
            if err.is_timeout() || err.is_io_error() || err.is_connection_dropped() {
                warn!(shard = %self.shard, command, error = %err, "Dropping redis connection");
                *guard = None;
            }
            transport_error(command, err)
        })
    }

    /// Closes the connection; the next command reconnects.
    pub fn close(&self) {
        if self.connection.lock().take().is_some() {
            debug!(shard = %self.shard, "Closed redis connection");
        }
    }

    /// `redis_version` reported by INFO.
    pub fn server_version(&self) -> TransportResult<String> {
        let info: redis::InfoDict = self.run("INFO", |con| redis::cmd("INFO").query(con))?;
        info.get::<String>("redis_version")
            .ok_or_else(|| TransportError::Command {
                command: "INFO",
                message: "redis_version missing from INFO reply".to_string(),
            })
    }

    /// Fails with [`ConfigError::UnsupportedServer`] when the server is older than `required`.
    pub fn assert_version(&self, required: &str) -> crate::error::Result<()> {
        let version = self.server_version()?;
        if version_tuple(&version) < version_tuple(required) {
            return Err(ConfigError::UnsupportedServer {
                version,
                required: required.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn compiled(&self, script: &LuaScript) -> redis::Script {
        self.scripts
            .lock()
            .entry(script.name)
            .or_insert_with(|| redis::Script::new(&script.source))
            .clone()
    }
}

impl std::fmt::Debug for RedisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisClient")
            .field("shard", &self.shard)
            .field("database", &self.options.database)
            .finish()
    }
}

impl KvClient for RedisClient {
    fn set_nx(&self, key: &str, value: &[u8]) -> TransportResult<bool> {
        self.run("SETNX", |con| redis::cmd("SETNX").arg(key).arg(value).query(con))
    }

    fn get(&self, key: &str) -> TransportResult<Option<Vec<u8>>> {
        self.run("GET", |con| redis::cmd("GET").arg(key).query(con))
    }

    fn mget(&self, keys: &[String]) -> TransportResult<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.run("MGET", |con| redis::cmd("MGET").arg(keys).query(con))
    }

    fn get_set(&self, key: &str, value: &[u8]) -> TransportResult<Option<Vec<u8>>> {
        self.run("GETSET", |con| redis::cmd("GETSET").arg(key).arg(value).query(con))
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> TransportResult<()> {
        match ttl {
            Some(ttl) => self.run("SETEX", |con| {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("EX")
                    .arg(ttl.as_secs().max(1))
                    .query(con)
            }),
            None => self.run("SET", |con| redis::cmd("SET").arg(key).arg(value).query(con)),
        }
    }

    fn expire(&self, key: &str, ttl: Duration) -> TransportResult<bool> {
        self.run("EXPIRE", |con| {
            redis::cmd("EXPIRE").arg(key).arg(ttl.as_secs()).query(con)
        })
    }

    fn expire_at(&self, key: &str, unix_secs: i64) -> TransportResult<bool> {
        self.run("EXPIREAT", |con| {
            redis::cmd("EXPIREAT").arg(key).arg(unix_secs).query(con)
        })
    }

    fn del(&self, keys: &[String]) -> TransportResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.run("DEL", |con| redis::cmd("DEL").arg(keys).query(con))
    }

    fn sadd(&self, key: &str, members: &[String]) -> TransportResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        self.run("SADD", |con| redis::cmd("SADD").arg(key).arg(members).query(con))
    }

    fn srem(&self, key: &str, members: &[String]) -> TransportResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        self.run("SREM", |con| redis::cmd("SREM").arg(key).arg(members).query(con))
    }

    fn smembers(&self, key: &str) -> TransportResult<Vec<String>> {
        self.run("SMEMBERS", |con| redis::cmd("SMEMBERS").arg(key).query(con))
    }

    fn sunion(&self, keys: &[String]) -> TransportResult<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.run("SUNION", |con| redis::cmd("SUNION").arg(keys).query(con))
    }

    fn zadd(&self, key: &str, score: f64, member: &str) -> TransportResult<u64> {
        self.run("ZADD", |con| {
            redis::cmd("ZADD").arg(key).arg(score).arg(member).query(con)
        })
    }

    fn zrem(&self, key: &str, members: &[String]) -> TransportResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        self.run("ZREM", |con| redis::cmd("ZREM").arg(key).arg(members).query(con))
    }

    fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> TransportResult<Vec<String>> {
        self.run("ZRANGEBYSCORE", |con| {
            redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg(score_arg(min))
                .arg(score_arg(max))
                .query(con)
        })
    }

    fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> TransportResult<u64> {
        self.run("ZREMRANGEBYSCORE", |con| {
            redis::cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg(score_arg(min))
                .arg(score_arg(max))
                .query(con)
        })
    }

    fn keys(&self, pattern: &str) -> TransportResult<Vec<String>> {
        self.run("KEYS", |con| redis::cmd("KEYS").arg(pattern).query(con))
    }

    fn transaction(&self, commands: &[Command]) -> TransportResult<()> {
        let queued: Vec<&Command> = commands.iter().filter(|command| !command.is_noop()).collect();
        if queued.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in queued {
            queue(&mut pipe, command);
        }
        let reply: Value = self.run("EXEC", |con| pipe.query(con))?;
        match reply {
            Value::Nil => Err(TransportError::TransactionAborted),
            _ => Ok(()),
        }
    }

    fn eval_script(
        &self,
        script: &LuaScript,
        keys: &[String],
        args: &[String],
    ) -> TransportResult<ScriptReply> {
        let compiled = self.compiled(script);
        let mut invocation = compiled.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }
        debug!(script = script.name, keys = keys.len(), "Evaluating script");
        let reply: Value = self.run("EVALSHA", |con| invocation.invoke(con))?;
        script_reply(reply)
    }
}

impl Drop for RedisClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Adds a batched command to the MULTI block, discarding its individual reply.
fn queue(pipe: &mut redis::Pipeline, command: &Command) {
    match command {
        Command::Del(keys) => {
            pipe.cmd("DEL").arg(keys).ignore();
        }
        Command::SAdd { key, members } => {
            pipe.cmd("SADD").arg(key).arg(members).ignore();
        }
        Command::SRem { key, members } => {
            pipe.cmd("SREM").arg(key).arg(members).ignore();
        }
        Command::ZAdd { key, score, member } => {
            pipe.cmd("ZADD").arg(key).arg(*score).arg(member).ignore();
        }
        Command::ZRem { key, members } => {
            pipe.cmd("ZREM").arg(key).arg(members).ignore();
        }
        Command::ZRemRangeByScore { key, min, max } => {
            pipe.cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg(score_arg(*min))
                .arg(score_arg(*max))
                .ignore();
        }
    }
}

fn script_reply(reply: Value) -> TransportResult<ScriptReply> {
    match reply {
        Value::Nil => Ok(ScriptReply::Nil),
        Value::Int(n) => Ok(ScriptReply::Integer(n)),
        Value::Okay => Ok(ScriptReply::Status("OK".to_string())),
        Value::SimpleString(status) => Ok(ScriptReply::Status(status)),
        Value::Array(_) => Vec::<String>::from_redis_value(&reply)
            .map(ScriptReply::List)
            .map_err(|err| transport_error("EVALSHA", err)),
        other => Err(TransportError::Command {
            command: "EVALSHA",
            message: format!("unexpected script reply {:?}", other),
        }),
    }
}

fn transport_error(command: &'static str, err: RedisError) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout { command }
    } else if err.is_io_error() || err.is_connection_dropped() {
        TransportError::Io {
            command,
            message: err.to_string(),
        }
    } else {
        TransportError::Command {
            command,
            message: err.to_string(),
        }
    }
}

/// Parses `major.minor.patch` leniently; missing parts count as zero.
fn version_tuple(version: &str) -> (u32, u32, u32) {
    let mut parts = version
        .split('.')
        .map(|part| part.trim().parse::<u32>().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_tuple_ordering() {
        assert!(version_tuple("2.4.17") < version_tuple("2.6.0"));
        assert!(version_tuple("7.2.4") >= version_tuple("2.6.0"));
        assert_eq!(version_tuple("6"), (6, 0, 0));
    }

    #[test]
    fn test_url_includes_password_and_database() {
        let client = RedisClient::new(
            ShardAddr::new("cache.local", 6380),
            ConnectOptions {
                database: 3,
                password: Some("secret".to_string()),
                ..ConnectOptions::default()
            },
        );
        assert_eq!(client.url(), "redis://:secret@cache.local:6380/3");
    }

    #[test]
    fn test_script_reply_decoding() {
        assert_eq!(script_reply(Value::Int(1)).unwrap(), ScriptReply::Integer(1));
        assert_eq!(script_reply(Value::Nil).unwrap(), ScriptReply::Nil);
        let list = Value::Array(vec![
            Value::BulkString(b"a".to_vec()),
            Value::BulkString(b"b".to_vec()),
        ]);
        assert_eq!(
            script_reply(list).unwrap(),
            ScriptReply::List(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn test_unconnected_client_does_not_connect_on_creation() {
        let client = RedisClient::new(ShardAddr::new("127.0.0.1", 1), ConnectOptions::default());
        client.close();
        assert_eq!(client.shard().port, 1);
    }
}
