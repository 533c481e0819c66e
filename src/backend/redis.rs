use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::backend::error::StorageError;
use crate::backend::traits::{KeyInfo, ProvisionContext, Provisioner, Storage, Validator};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(500);
const SCAN_COUNT: usize = 100;
const NONCE_LEN: usize = 12;

const UNLOCK_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// The JSON document stored under every key, compatible with Caddy's
/// `caddy-tlsredis` storage module.
#[derive(Debug, Serialize, Deserialize)]
struct StorageData {
    #[serde(with = "base64_bytes")]
    value: Vec<u8>,
    modified: DateTime<Utc>,
}

/// Keeps every key as a plain Redis string: `value_prefix` followed by the
/// JSON `{"value": <base64>, "modified": <RFC 3339>}`, AES-GCM sealed when
/// `aes_key` is set.
#[derive(Deserialize)]
#[serde(default)]
pub struct RedisStorage {
    /// `host:port`, takes precedence over `host` and `port` when set.
    pub address: Option<String>,
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub key_prefix: String,
    pub value_prefix: String,
    /// 32-byte key; values are stored as `nonce || ciphertext`.
    pub aes_key: Option<String>,
    pub timeout_secs: u64,
    pub lock_ttl_secs: u64,
    #[serde(skip)]
    conn: Mutex<Option<redis::Connection>>,
    /// Lock key → token for the locks this instance holds.
    #[serde(skip)]
    held_locks: Mutex<HashMap<String, String>>,
}

impl Default for RedisStorage {
    fn default() -> Self {
        Self {
            address: None,
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            username: None,
            password: None,
            key_prefix: "caddytls".to_string(),
            value_prefix: "caddy-storage-redis".to_string(),
            aes_key: None,
            timeout_secs: 5,
            lock_ttl_secs: 60,
            conn: Mutex::new(None),
            held_locks: Mutex::new(HashMap::new()),
        }
    }
}

impl RedisStorage {
    fn address(&self) -> String {
        match &self.address {
            Some(address) if !address.is_empty() => address.clone(),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    fn data_key(&self, key: &str) -> String {
        format!("{}/{}", self.key_prefix, normalize_key(key))
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}:lock:{}", self.key_prefix, normalize_key(key))
    }

    fn lock_token(&self) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        format!("{}-{}", std::process::id(), nanos)
    }

    fn cipher(&self) -> Result<Option<Aes256Gcm>, StorageError> {
        match self.aes_key.as_deref() {
            None | Some("") => Ok(None),
            Some(key) => Aes256Gcm::new_from_slice(key.as_bytes())
                .map(Some)
                .map_err(|_| StorageError::InvalidConfig("'aes_key' must be 32 bytes long".to_string())),
        }
    }

    fn encode(&self, data: &StorageData) -> Result<Vec<u8>, StorageError> {
        let json = serde_json::to_vec(data)
            .map_err(|e| StorageError::Other(format!("Failed to encode value: {}", e)))?;
        let body = match self.cipher()? {
            Some(cipher) => {
                let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
                let sealed = cipher
                    .encrypt(&nonce, json.as_slice())
                    .map_err(|_| StorageError::Other("Failed to encrypt value".to_string()))?;
                let mut body = nonce.to_vec();
                body.extend_from_slice(&sealed);
                body
            }
            None => json,
        };

        let mut raw = self.value_prefix.as_bytes().to_vec();
        raw.extend_from_slice(&body);
        Ok(raw)
    }

    fn decode(&self, key: &str, raw: &[u8]) -> Result<StorageData, StorageError> {
        let body = raw.strip_prefix(self.value_prefix.as_bytes()).unwrap_or(raw);
        let json = match self.cipher()? {
            Some(cipher) => {
                if body.len() < NONCE_LEN {
                    return Err(StorageError::Other(format!("Value of '{}' is too short", key)));
                }
                let (nonce, sealed) = body.split_at(NONCE_LEN);
                cipher
                    .decrypt(Nonce::from_slice(nonce), sealed)
                    .map_err(|_| StorageError::Other(format!("Failed to decrypt value of '{}'", key)))?
            }
            None => body.to_vec(),
        };
        serde_json::from_slice(&json)
            .map_err(|e| StorageError::Other(format!("Malformed value of '{}': {}", key, e)))
    }

    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let data_key = self.data_key(key);
        self.with_conn(|conn| redis::cmd("GET").arg(&data_key).query(conn))
    }

    fn held_locks(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StorageError> {
        self.held_locks
            .lock()
            .map_err(|_| StorageError::Other("Redis lock table mutex poisoned".to_string()))
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T, StorageError> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StorageError::Other("Redis connection mutex poisoned".to_string()))?;
        let conn = guard
            .as_mut()
            .ok_or_else(|| StorageError::Connection("Redis storage is not provisioned".to_string()))?;
        f(conn).map_err(|e| StorageError::Connection(e.to_string()))
    }

    fn connect(&self) -> Result<redis::Connection, StorageError> {
        let address = self.address();
        let timeout = Duration::from_secs(self.timeout_secs.max(1));

        let url = format!("redis://{}/", address);
        let client = redis::Client::open(url.as_str())
            .map_err(|e| StorageError::Connection(format!("Invalid address {}: {}", address, e)))?;
        let mut conn = client
            .get_connection_with_timeout(timeout)
            .map_err(|e| StorageError::Connection(format!("Failed to connect to {}: {}", address, e)))?;
        conn.set_read_timeout(Some(timeout))
            .and_then(|_| conn.set_write_timeout(Some(timeout)))
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        if let Some(password) = &self.password {
            let mut auth = redis::cmd("AUTH");
            if let Some(username) = &self.username {
                auth.arg(username);
            }
            auth.arg(password)
                .query::<()>(&mut conn)
                .map_err(|e| StorageError::Connection(format!("Authentication failed: {}", e)))?;
        }

        if self.db != 0 {
            redis::cmd("SELECT")
                .arg(self.db)
                .query::<()>(&mut conn)
                .map_err(|e| StorageError::Connection(format!("Failed to select db {}: {}", self.db, e)))?;
        }

        Ok(conn)
    }

    fn scan(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        self.with_conn(|conn| {
            let mut keys = Vec::new();
            let mut cursor: u64 = 0;
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .query(conn)?;
                keys.extend(batch);
                if next == 0 {
                    return Ok(keys);
                }
                cursor = next;
            }
        })
    }
}

impl Storage for RedisStorage {
    fn name(&self) -> &str {
        "redis"
    }

    fn store(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let data_key = self.data_key(key);
        let raw = self.encode(&StorageData {
            value: value.to_vec(),
            modified: Utc::now(),
        })?;
        self.with_conn(|conn| redis::cmd("SET").arg(&data_key).arg(raw).query::<()>(conn))
    }

    fn load(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let raw = self
            .get_raw(key)?
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(self.decode(key, &raw)?.value)
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let data_key = self.data_key(key);
        let removed: i64 = self.with_conn(|conn| redis::cmd("DEL").arg(&data_key).query(conn))?;
        if removed == 0 {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(())
    }

    fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<String>, StorageError> {
        let prefix = normalize_key(prefix);
        let pattern = if prefix.is_empty() {
            format!("{}/*", escape_glob(&self.key_prefix))
        } else {
            format!("{}/{}/*", escape_glob(&self.key_prefix), escape_glob(&prefix))
        };
        let strip = format!("{}/", self.key_prefix);

        let keys = self
            .scan(&pattern)?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&strip).map(str::to_string));

        if recursive {
            return Ok(keys.collect());
        }

        let depth = if prefix.is_empty() { 0 } else { prefix.split('/').count() };
        let children: BTreeSet<String> = keys
            .map(|k| k.split('/').take(depth + 1).collect::<Vec<_>>().join("/"))
            .collect();
        Ok(children.into_iter().collect())
    }

    fn stat(&self, key: &str) -> Result<KeyInfo, StorageError> {
        if let Some(raw) = self.get_raw(key)? {
            let data = self.decode(key, &raw)?;
            return Ok(KeyInfo {
                key: key.to_string(),
                modified: Some(SystemTime::from(data.modified)),
                size: data.value.len() as u64,
                is_terminal: true,
            });
        }

        if self.list(key, false)?.is_empty() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(KeyInfo {
            key: key.to_string(),
            modified: None,
            size: 0,
            is_terminal: false,
        })
    }

    fn lock(&self, key: &str) -> Result<(), StorageError> {
        let lock_key = self.lock_key(key);
        let token = self.lock_token();
        let ttl_ms = self.lock_ttl_secs.max(1) * 1000;

        loop {
            let acquired: Option<String> = self.with_conn(|conn| {
                redis::cmd("SET")
                    .arg(&lock_key)
                    .arg(&token)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query(conn)
            })?;
            if acquired.is_some() {
                debug!("Acquired lock {}", lock_key);
                self.held_locks()?.insert(lock_key, token);
                return Ok(());
            }
            thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    fn unlock(&self, key: &str) -> Result<(), StorageError> {
        let lock_key = self.lock_key(key);
        let Some(token) = self.held_locks()?.remove(&lock_key) else {
            return Err(StorageError::Lock(format!("'{}' is not locked by this storage", key)));
        };

        let script = redis::Script::new(UNLOCK_SCRIPT);
        let removed: i64 = self.with_conn(|conn| script.key(&lock_key).arg(&token).invoke(conn))?;
        if removed == 0 {
            return Err(StorageError::Lock(format!("Lock on '{}' expired", key)));
        }
        Ok(())
    }

    fn as_provisioner(&mut self) -> Option<&mut dyn Provisioner> {
        Some(self)
    }

    fn as_validator(&self) -> Option<&dyn Validator> {
        Some(self)
    }
}

impl Provisioner for RedisStorage {
    fn provision(&mut self, _ctx: &ProvisionContext) -> Result<(), StorageError> {
        let conn = self.connect()?;
        info!("Connected to redis at {}", self.address());
        let slot = self
            .conn
            .get_mut()
            .map_err(|_| StorageError::Other("Redis connection mutex poisoned".to_string()))?;
        *slot = Some(conn);
        Ok(())
    }
}

impl Validator for RedisStorage {
    fn validate(&self) -> Result<(), StorageError> {
        if self.address.is_none() && self.port == 0 {
            return Err(StorageError::InvalidConfig("'port' must not be 0".to_string()));
        }
        if self.key_prefix.is_empty() {
            return Err(StorageError::InvalidConfig("'key_prefix' must not be empty".to_string()));
        }
        self.cipher()?;
        self.with_conn(|conn| redis::cmd("PING").query::<String>(conn))
            .map(|_| ())
    }
}

/// Keys are stored without leading or trailing separators and with `/`
/// between segments, whatever platform produced them.
fn normalize_key(key: &str) -> String {
    key.split(['/', '\\'])
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    /// `null` is how an empty value written by Go's `encoding/json` looks.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD.decode(encoded).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

fn escape_glob(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
