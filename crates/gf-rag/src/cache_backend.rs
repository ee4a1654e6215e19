use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use gf_error::{GfError, Result};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client as RedisClient};
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, instrument};

use crate::clock::{Clock, SystemClock};

/// 缓存后端：带过期时间的键值存储
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// 批量读取，结果与 `keys` 顺序一致
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    async fn set_ex(&self, key: &str, value: String, ttl_seconds: u64) -> Result<()>;

    /// 返回实际删除的键数
    async fn delete(&self, keys: &[String]) -> Result<usize>;

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    async fn ping(&self) -> Result<()>;

    fn name(&self) -> &str;
}

const REDIS_OP_TIMEOUT: StdDuration = StdDuration::from_secs(2);
const SCAN_COUNT: usize = 100;

/// Redis 缓存后端，复用一个自动重连的连接
pub struct RedisCacheBackend {
    client: RedisClient,
    manager: OnceCell<ConnectionManager>,
    op_timeout: StdDuration,
}

impl RedisCacheBackend {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = RedisClient::open(redis_url).map_err(|e| GfError::Configuration {
            key: "cache.redis_url".to_string(),
            reason: format!("Invalid Redis URL: {}", e),
        })?;
        Ok(Self {
            client,
            manager: OnceCell::new(),
            op_timeout: REDIS_OP_TIMEOUT,
        })
    }

    /// 单次操作（含建连）的超时上限
    pub fn with_op_timeout(mut self, op_timeout: StdDuration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(GfError::from)
            })
            .await?;
        Ok(manager.clone())
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| GfError::CacheUnavailable {
                backend: "redis".to_string(),
                message: format!(
                    "{} timed out after {}ms",
                    operation,
                    self.op_timeout.as_millis()
                ),
            })?
    }
}

/// 转义 Redis glob 特殊字符
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.bounded("GET", async {
            let mut conn = self.connection().await?;
            Ok(conn.get::<_, Option<String>>(key).await?)
        })
        .await
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.bounded("MGET", async {
            let mut conn = self.connection().await?;
            let values: Vec<Option<String>> = redis::cmd("MGET")
                .arg(keys)
                .query_async(&mut conn)
                .await?;
            Ok(values)
        })
        .await
    }

    async fn set_ex(&self, key: &str, value: String, ttl_seconds: u64) -> Result<()> {
        self.bounded("SETEX", async {
            let mut conn = self.connection().await?;
            conn.set_ex::<_, _, ()>(key, value, ttl_seconds as usize)
                .await?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, keys), fields(count = keys.len()))]
    async fn delete(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.bounded("DEL", async {
            let mut conn = self.connection().await?;
            let deleted: usize = conn.del(keys).await?;
            Ok(deleted)
        })
        .await
    }

    /// 用 SCAN 游标遍历，不阻塞服务端
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}*", escape_glob(prefix));
        self.bounded("SCAN", async {
            let mut conn = self.connection().await?;
            let mut keys = Vec::new();
            let mut cursor: u64 = 0;
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .query_async(&mut conn)
                    .await?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            // SCAN 可能重复返回同一个键
            keys.sort();
            keys.dedup();
            Ok(keys)
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.bounded("PING", async {
            let mut conn = self.connection().await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    fn name(&self) -> &str {
        "redis"
    }
}

#[derive(Debug, Clone)]
struct MemoryValue {
    value: String,
    expires_at: DateTime<Utc>,
}

/// 进程内缓存后端，按注入的时钟判断过期
pub struct MemoryCacheBackend {
    entries: Arc<RwLock<HashMap<String, MemoryValue>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// 清理已过期条目
    async fn purge_expired(&self) {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, v| v.expires_at > now);
        if entries.len() != before {
            debug!(purged = before - entries.len(), "Purged expired cache entries");
        }
    }
}

impl Default for MemoryCacheBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        Ok(self
            .entries
            .read()
            .await
            .get(key)
            .filter(|v| v.expires_at > now)
            .map(|v| v.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: String, ttl_seconds: u64) -> Result<()> {
        let expires_at = self.clock.now() + Duration::seconds(ttl_seconds as i64);
        self.entries
            .write()
            .await
            .insert(key.to_string(), MemoryValue { value, expires_at });
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        self.purge_expired().await;
        let mut entries = self.entries.write().await;
        Ok(keys.iter().filter(|k| entries.remove(*k).is_some()).count())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.purge_expired().await;
        let mut keys: Vec<String> = self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_memory_backend_expiry() {
        let clock = Arc::new(ManualClock::default());
        let backend = MemoryCacheBackend::with_clock(clock.clone());
        backend.set_ex("gf:w1:a", "v".into(), 10).await.unwrap();

        clock.advance(Duration::seconds(9));
        assert_eq!(backend.get("gf:w1:a").await.unwrap().as_deref(), Some("v"));
        clock.advance(Duration::seconds(1));
        assert!(backend.get("gf:w1:a").await.unwrap().is_none());
        assert!(backend.keys_with_prefix("gf:").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_backend_prefix_and_delete() {
        let backend = MemoryCacheBackend::new();
        for key in ["gf:w1:a", "gf:w1:b", "gf:w2:a"] {
            backend.set_ex(key, "v".into(), 60).await.unwrap();
        }
        let keys = backend.keys_with_prefix("gf:w1:").await.unwrap();
        assert_eq!(keys, vec!["gf:w1:a".to_string(), "gf:w1:b".to_string()]);

        let deleted = backend
            .delete(&[keys[0].clone(), "gf:missing".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(backend.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_get_many_keeps_key_order() {
        let backend = MemoryCacheBackend::new();
        backend.set_ex("gf:w1:a", "va".into(), 60).await.unwrap();
        backend.set_ex("gf:w1:c", "vc".into(), 60).await.unwrap();

        let values = backend
            .get_many(&[
                "gf:w1:c".to_string(),
                "gf:w1:b".to_string(),
                "gf:w1:a".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(
            values,
            vec![Some("vc".to_string()), None, Some("va".to_string())]
        );
    }

    #[tokio::test]
    async fn test_silent_redis_server_times_out() {
        // 接受连接但从不应答
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let backend = RedisCacheBackend::new(&format!("redis://{}", addr))
            .unwrap()
            .with_op_timeout(StdDuration::from_millis(200));
        let started = std::time::Instant::now();
        let err = backend.ping().await.unwrap_err();
        assert!(matches!(err, GfError::CacheUnavailable { .. }));
        assert!(started.elapsed() < StdDuration::from_secs(5));

        let err = backend
            .keys_with_prefix("gf:w1:")
            .await
            .unwrap_err();
        assert!(matches!(err, GfError::CacheUnavailable { .. }));
        server.abort();
    }

    #[tokio::test]
    async fn test_refused_redis_is_cache_unavailable() {
        let backend = RedisCacheBackend::new("redis://127.0.0.1:1")
            .unwrap()
            .with_op_timeout(StdDuration::from_millis(500));
        assert!(matches!(
            backend.get("gf:w1:a").await,
            Err(GfError::CacheUnavailable { .. })
        ));
        assert!(backend.get_many(&[]).await.unwrap().is_empty());
    }

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("gf:w*1:"), "gf:w\\*1:");
        assert_eq!(escape_glob("gf:plain:"), "gf:plain:");
    }

    #[test]
    fn test_invalid_redis_url_is_configuration_error() {
        assert!(matches!(
            RedisCacheBackend::new("not a url"),
            Err(GfError::Configuration { .. })
        ));
    }
}
