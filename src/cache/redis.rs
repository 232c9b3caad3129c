//! Redis-backed key-value store.
//!
//! Supported connection targets:
//!
//! - `redis://[user:pass@]host[:port][/db]` and `rediss://...` (TLS)
//! - `redis+unix:///path/to/socket` or `unix:///path/to/socket`
//! - `redis+sentinel://[user:pass@]h1:26379,h2:26379/<service>[/db]`
//!   (`rediss+sentinel://` connects to the master over TLS)
//! - `redis+cluster://[user:pass@]h1:6379,h2:6379` (`rediss+cluster://` for TLS)

use async_trait::async_trait;
use redis::aio::{ConnectionLike, MultiplexedConnection};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::sentinel::{SentinelClient, SentinelNodeConnectionInfo, SentinelServerType};
use redis::{FromRedisValue, RedisConnectionInfo, RedisResult};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;

use super::store::KeyValueStore;
use crate::errors::{CacheError, StoreError};

const DEFAULT_SENTINEL_PORT: u16 = 26379;
const DEFAULT_REDIS_PORT: u16 = 6379;

/// A parsed, validated connection target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTarget {
    /// Plain, TLS or unix-socket connection to a single server
    Single { url: String },
    Sentinel {
        /// `redis://host:port` URLs of the sentinels
        nodes: Vec<String>,
        service: String,
        db: i64,
        tls: bool,
        username: Option<String>,
        password: Option<String>,
    },
    Cluster {
        /// Seed node URLs, credentials included
        nodes: Vec<String>,
    },
}

impl ConnectionTarget {
    pub fn parse(raw: &str) -> Result<Self, CacheError> {
        let raw = raw.trim();
        let (scheme, rest) = raw.split_once("://").ok_or_else(|| {
            CacheError::configuration(format!("invalid store URL '{}': missing scheme", redact(raw)))
        })?;

        match scheme {
            "redis" | "rediss" => {
                let parsed = url::Url::parse(raw).map_err(|e| {
                    CacheError::configuration(format!("invalid store URL '{}': {e}", redact(raw)))
                })?;
                if parsed.host_str().map_or(true, str::is_empty) {
                    return Err(CacheError::configuration(format!(
                        "invalid store URL '{}': missing host",
                        redact(raw)
                    )));
                }
                Ok(Self::Single { url: raw.to_string() })
            }
            "redis+unix" | "unix" => {
                if rest.trim_start_matches('/').is_empty() {
                    return Err(CacheError::configuration(format!(
                        "invalid store URL '{raw}': missing socket path"
                    )));
                }
                Ok(Self::Single { url: raw.to_string() })
            }
            "redis+sentinel" | "rediss+sentinel" => parse_sentinel(raw, rest, scheme.starts_with("rediss")),
            "redis+cluster" | "rediss+cluster" => parse_cluster(raw, rest, scheme.starts_with("rediss")),
            other => Err(CacheError::configuration(format!(
                "unsupported store URL scheme '{other}' (expected redis, rediss, redis+unix, redis+sentinel or redis+cluster)"
            ))),
        }
    }
}

struct Authority<'a> {
    username: Option<String>,
    password: Option<String>,
    hosts: Vec<&'a str>,
    path: &'a str,
}

fn split_authority<'a>(raw: &str, rest: &'a str) -> Result<Authority<'a>, CacheError> {
    let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
    let (credentials, hosts) = match authority.rsplit_once('@') {
        Some((credentials, hosts)) => (Some(credentials), hosts),
        None => (None, authority),
    };
    let (username, password) = match credentials {
        Some(credentials) => match credentials.split_once(':') {
            Some((user, pass)) => (
                (!user.is_empty()).then(|| user.to_string()),
                Some(pass.to_string()),
            ),
            None => ((!credentials.is_empty()).then(|| credentials.to_string()), None),
        },
        None => (None, None),
    };
    let hosts: Vec<&str> = hosts.split(',').map(str::trim).collect();
    if hosts.iter().any(|h| h.is_empty()) {
        return Err(CacheError::configuration(format!(
            "invalid store URL '{}': empty host in node list",
            redact(raw)
        )));
    }
    Ok(Authority {
        username,
        password,
        hosts,
        path,
    })
}

fn node_url(scheme: &str, host: &str, default_port: u16, credentials: Option<&str>) -> String {
    let host = if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:{default_port}")
    };
    match credentials {
        Some(credentials) => format!("{scheme}://{credentials}@{host}"),
        None => format!("{scheme}://{host}"),
    }
}

fn parse_sentinel(raw: &str, rest: &str, tls: bool) -> Result<ConnectionTarget, CacheError> {
    let authority = split_authority(raw, rest)?;
    let mut segments = authority.path.split('/').filter(|s| !s.is_empty());
    let service = segments.next().ok_or_else(|| {
        CacheError::configuration(format!(
            "invalid store URL '{}': sentinel URLs need a service name",
            redact(raw)
        ))
    })?;
    let db = match segments.next() {
        Some(db) => db.parse::<i64>().map_err(|_| {
            CacheError::configuration(format!("invalid store URL '{}': bad db '{db}'", redact(raw)))
        })?,
        None => 0,
    };

    Ok(ConnectionTarget::Sentinel {
        nodes: authority
            .hosts
            .iter()
            .map(|h| node_url("redis", h, DEFAULT_SENTINEL_PORT, None))
            .collect(),
        service: service.to_string(),
        db,
        tls,
        username: authority.username,
        password: authority.password,
    })
}

fn parse_cluster(raw: &str, rest: &str, tls: bool) -> Result<ConnectionTarget, CacheError> {
    let authority = split_authority(raw, rest)?;
    let credentials = match (&authority.username, &authority.password) {
        (Some(user), Some(pass)) => Some(format!("{user}:{pass}")),
        (None, Some(pass)) => Some(format!(":{pass}")),
        (Some(user), None) => Some(user.clone()),
        (None, None) => None,
    };
    let scheme = if tls { "rediss" } else { "redis" };

    Ok(ConnectionTarget::Cluster {
        nodes: authority
            .hosts
            .iter()
            .map(|h| node_url(scheme, h, DEFAULT_REDIS_PORT, credentials.as_deref()))
            .collect(),
    })
}

/// Hides the password part of a URL for logs and error messages.
pub fn redact(raw: &str) -> String {
    let Some((scheme, rest)) = raw.split_once("://") else {
        return raw.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rsplit_once('@') {
        Some((credentials, hosts)) => {
            let user = credentials.split_once(':').map_or(credentials, |(user, _)| user);
            format!("{scheme}://{user}:***@{hosts}{}", &rest[authority_end..])
        }
        None => raw.to_string(),
    }
}

enum Backend {
    Single {
        client: redis::Client,
        connection: Mutex<Option<MultiplexedConnection>>,
    },
    Cluster {
        client: ClusterClient,
        connection: Mutex<Option<ClusterConnection>>,
    },
    Sentinel {
        client: Mutex<SentinelClient>,
    },
}

/// Key-value store backed by Redis, Redis Sentinel or Redis Cluster.
///
/// Connections are opened lazily on first use and shared by every call that
/// goes through the same store; a dropped connection is reopened on the next
/// operation. Each operation runs under `timeout`.
pub struct RedisStore {
    backend: Backend,
    timeout: Duration,
    display: String,
}

impl RedisStore {
    /// Builds a store for `url` without connecting.
    pub fn open(url: &str, timeout: Duration) -> Result<Self, CacheError> {
        let target = ConnectionTarget::parse(url)?;
        let invalid = |e: redis::RedisError| {
            CacheError::configuration(format!("invalid store URL '{}': {e}", redact(url)))
        };

        let backend = match target {
            ConnectionTarget::Single { url } => Backend::Single {
                client: redis::Client::open(url.as_str()).map_err(invalid)?,
                connection: Mutex::new(None),
            },
            ConnectionTarget::Cluster { nodes } => Backend::Cluster {
                client: ClusterClient::new(nodes).map_err(invalid)?,
                connection: Mutex::new(None),
            },
            ConnectionTarget::Sentinel {
                nodes,
                service,
                db,
                tls,
                username,
                password,
            } => {
                let node_info = SentinelNodeConnectionInfo {
                    tls_mode: tls.then_some(redis::TlsMode::Secure),
                    redis_connection_info: Some(RedisConnectionInfo {
                        db,
                        username,
                        password,
                        ..Default::default()
                    }),
                };
                let client =
                    SentinelClient::build(nodes, service, Some(node_info), SentinelServerType::Master)
                        .map_err(invalid)?;
                Backend::Sentinel {
                    client: Mutex::new(client),
                }
            }
        };

        Ok(Self {
            backend,
            timeout,
            display: redact(url),
        })
    }

    /// Redacted connection target
    pub fn target(&self) -> &str {
        &self.display
    }

    async fn query<T>(&self, cmd: redis::Cmd) -> Result<T, StoreError>
    where
        T: FromRedisValue + Send,
    {
        match tokio::time::timeout(self.timeout, self.dispatch(&cmd)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }

    async fn dispatch<T>(&self, cmd: &redis::Cmd) -> Result<T, StoreError>
    where
        T: FromRedisValue + Send,
    {
        match &self.backend {
            Backend::Single { client, connection } => {
                run_shared(connection, || client.get_multiplexed_async_connection(), cmd).await
            }
            Backend::Cluster { client, connection } => {
                run_shared(connection, || client.get_async_connection(), cmd).await
            }
            Backend::Sentinel { client } => {
                // The sentinel resolves the current master on every connect,
                // so failovers are picked up without extra bookkeeping.
                let mut connection = {
                    let mut sentinel = client.lock().await;
                    sentinel
                        .get_async_connection()
                        .await
                        .map_err(|e| StoreError::Connection(e.to_string()))?
                };
                let result: RedisResult<T> = cmd.query_async(&mut connection).await;
                result.map_err(StoreError::from)
            }
        }
    }
}

/// Runs `cmd` on a lazily opened, shared connection, dropping the connection
/// when it turns out to be broken.
async fn run_shared<C, F, Fut, T>(
    slot: &Mutex<Option<C>>,
    connect: F,
    cmd: &redis::Cmd,
) -> Result<T, StoreError>
where
    C: ConnectionLike + Clone + Send,
    F: FnOnce() -> Fut,
    Fut: Future<Output = RedisResult<C>>,
    T: FromRedisValue + Send,
{
    let mut connection = {
        let mut slot = slot.lock().await;
        match slot.as_ref() {
            Some(existing) => existing.clone(),
            None => {
                let fresh = connect()
                    .await
                    .map_err(|e| StoreError::Connection(e.to_string()))?;
                *slot = Some(fresh.clone());
                fresh
            }
        }
    };

    let result: RedisResult<T> = cmd.query_async(&mut connection).await;
    if let Err(err) = &result {
        if err.is_io_error() || err.is_connection_dropped() {
            tracing::debug!(error = %err, "Dropping broken store connection");
            *slot.lock().await = None;
        }
    }
    result.map_err(StoreError::from)
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.query(cmd).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        let millis = ttl.as_millis().clamp(1, u128::from(u64::MAX)) as u64;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("PX").arg(millis);
        self.query(cmd).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut cmd = redis::cmd("PTTL");
        cmd.arg(key);
        // -2: missing, -1: no expiry
        let millis: i64 = self.query(cmd).await?;
        Ok((millis >= 0).then(|| Duration::from_millis(millis as u64)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let millis = ttl.as_millis().clamp(1, u128::from(u64::MAX)) as u64;
        let mut cmd = redis::cmd("PEXPIRE");
        cmd.arg(key).arg(millis);
        let updated: i64 = self.query(cmd).await?;
        Ok(updated == 1)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let removed: i64 = self.query(cmd).await?;
        Ok(removed > 0)
    }
}
