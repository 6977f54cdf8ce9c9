// Runtime configuration.
//
// Two layers live here. ConfigStore is the in-memory typed map the
// running system reads and writes; entries flagged persistent are
// snapshotted into the K/V store under "cfg." keys and restored on
// the next boot. SystemConfig is the boot-time description of the
// whole runtime, deserialized from a RON file and validated before
// anything is initialized from it.

use std::collections::HashMap;
use std::fs::File;

use log::warn;
use serde::Deserialize;
use serde_json::Value as Json;

use crate::govern::RuntimeConfig;
use crate::storage::{PersistentStore, StoreError};
use crate::value::Value;


pub const CONFIG_KEY_PREFIX: &str = "cfg.";


#[derive(Clone, Debug, PartialEq)]
pub enum ConfigError {
    CapacityExhausted,
    NotFound,
    ReadError(String),
    ParseError(String),
    Invalid(&'static str),
    PersistFailed(StoreError),
}

pub type Result<T> = core::result::Result<T, ConfigError>;


struct Entry {
    value: Value,
    persistent: bool,
}


pub struct ConfigStore {
    entries: HashMap<String, Entry>,
    capacity: usize,
}

impl ConfigStore {
    pub fn new(capacity: usize) -> ConfigStore {
        ConfigStore {
            entries: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    pub fn set(&mut self, key: &str, value: Value, persistent: bool)
        -> Result<()>
    {
        if !self.entries.contains_key(key)
            && self.entries.len() >= self.capacity {
            return Err(ConfigError::CapacityExhausted);
        }
        self.entries.insert(String::from(key), Entry { value, persistent });
        Ok(())
    }

    pub fn set_bool(&mut self, key: &str, v: bool, persistent: bool) -> Result<()> {
        self.set(key, Value::Bool(v), persistent)
    }

    pub fn set_int(&mut self, key: &str, v: i32, persistent: bool) -> Result<()> {
        self.set(key, Value::Int(v), persistent)
    }

    pub fn set_float(&mut self, key: &str, v: f32, persistent: bool) -> Result<()> {
        self.set(key, Value::Float(v), persistent)
    }

    pub fn set_string(&mut self, key: &str, v: &str, persistent: bool) -> Result<()> {
        self.set(key, Value::Str(String::from(v)), persistent)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => *b,
            _ => default,
        }
    }

    pub fn get_int(&self, key: &str, default: i32) -> i32 {
        match self.get(key) {
            Some(Value::Int(i)) => *i,
            _ => default,
        }
    }

    pub fn get_float(&self, key: &str, default: f32) -> f32 {
        match self.get(key) {
            Some(Value::Float(f)) => *f,
            Some(Value::Int(i)) => *i as f32,
            _ => default,
        }
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Some(Value::Str(s)) => s.clone(),
            _ => String::from(default),
        }
    }

    pub fn remove(&mut self, key: &str) -> Result<()> {
        self.entries
            .remove(key)
            .map(|_| ())
            .ok_or(ConfigError::NotFound)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // Snapshot every persistent-flagged entry under cfg.<key>.
    pub fn save_persistent(&self, store: &mut PersistentStore)
        -> Result<usize>
    {
        let mut saved = 0;
        for (key, entry) in &self.entries {
            if !entry.persistent {
                continue;
            }
            let storage_key = format!("{}{}", CONFIG_KEY_PREFIX, key);
            let body = entry.value.to_json().to_string();
            store
                .write(&storage_key, body.as_bytes())
                .map_err(ConfigError::PersistFailed)?;
            saved += 1;
        }
        Ok(saved)
    }

    // Restore cfg.-prefixed snapshots. Unparseable entries are
    // skipped, not fatal: a half-readable store should not stop
    // boot.
    pub fn load_persistent(&mut self, store: &PersistentStore) -> usize {
        let mut loaded = 0;
        for storage_key in store.keys_with_prefix(CONFIG_KEY_PREFIX) {
            let key = &storage_key[CONFIG_KEY_PREFIX.len()..];
            let raw = match store.read(&storage_key) {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            let json: Json = match serde_json::from_slice(&raw) {
                Ok(json) => json,
                Err(e) => {
                    warn!("config: skipping {}: {}", storage_key, e);
                    continue;
                }
            };
            if self.set(key, Value::from_json(&json), true).is_ok() {
                loaded += 1;
            }
        }
        loaded
    }
}


// ---------------------------------------------------------------------------
// Boot configuration

#[derive(Deserialize, Debug, Copy, Clone, PartialEq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}


#[derive(Deserialize, Debug, Clone)]
pub enum StorageChoice {
    Memory(usize),
    File(String, usize),
    Directory(String),
}


#[derive(Deserialize, Debug, Copy, Clone)]
pub struct PlatformMemory {
    pub total_bytes: u32,
    pub available_bytes: u32,
}


#[derive(Deserialize, Debug, Clone)]
pub struct SystemConfig {
    pub device_name: String,
    pub max_tools: usize,
    pub max_tasks: usize,
    pub max_event_handlers: usize,
    pub event_queue_size: usize,
    pub max_sessions: usize,
    pub max_config_entries: usize,
    pub session_timeout_ms: u64,
    pub log_level: LogLevel,
    pub storage: StorageChoice,
    pub platform: PlatformMemory,
    pub bytecode: Option<RuntimeConfig>,
}

impl Default for SystemConfig {
    fn default() -> SystemConfig {
        SystemConfig {
            device_name: String::from("mcpos"),
            max_tools: 32,
            max_tasks: 16,
            max_event_handlers: 16,
            event_queue_size: 32,
            max_sessions: 4,
            max_config_entries: 64,
            session_timeout_ms: 300_000,
            log_level: LogLevel::Info,
            storage: StorageChoice::Memory(64 * 1024),
            platform: PlatformMemory {
                total_bytes: 256 * 1024,
                available_bytes: 128 * 1024,
            },
            bytecode: None,
        }
    }
}

impl SystemConfig {
    pub fn validate(self) -> Result<SystemConfig> {
        if self.device_name.is_empty() {
            return Err(ConfigError::Invalid("device_name is empty"));
        }
        if self.max_tools == 0 {
            return Err(ConfigError::Invalid("max_tools is zero"));
        }
        if self.event_queue_size == 0 {
            return Err(ConfigError::Invalid("event_queue_size is zero"));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::Invalid("max_sessions is zero"));
        }
        if self.platform.available_bytes > self.platform.total_bytes {
            return Err(ConfigError::Invalid(
                "available memory exceeds total memory"
            ));
        }
        Ok(self)
    }
}


pub fn load(path: &str) -> Result<SystemConfig> {
    let reader = File::open(path)
        .map_err(|e| ConfigError::ReadError(e.to_string()))?;
    let config: SystemConfig = ron::de::from_reader(reader)
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MediumBackend, MemMedium};

    fn store() -> PersistentStore {
        let medium = MemMedium::new(16 * 1024);
        let backend = MediumBackend::open(Box::new(medium)).unwrap();
        PersistentStore::new(Box::new(backend))
    }

    #[test]
    fn test_typed_access() {
        let mut cfg = ConfigStore::new(8);
        cfg.set_bool("echo", true, false).unwrap();
        cfg.set_int("retries", 3, false).unwrap();
        cfg.set_float("gain", 0.5, false).unwrap();
        cfg.set_string("name", "probe", false).unwrap();

        assert_eq!(cfg.get_bool("echo", false), true);
        assert_eq!(cfg.get_int("retries", 0), 3);
        assert_eq!(cfg.get_float("gain", 0.0), 0.5);
        assert_eq!(cfg.get_string("name", ""), "probe");
        // Type mismatch falls back to the default.
        assert_eq!(cfg.get_int("name", 7), 7);
        assert_eq!(cfg.get_bool("missing", true), true);
    }

    #[test]
    fn test_capacity() {
        let mut cfg = ConfigStore::new(1);
        cfg.set_int("a", 1, false).unwrap();
        assert_eq!(
            cfg.set_int("b", 2, false),
            Err(ConfigError::CapacityExhausted)
        );
        // Overwriting an existing key is always allowed.
        cfg.set_int("a", 3, false).unwrap();
        assert_eq!(cfg.get_int("a", 0), 3);
    }

    #[test]
    fn test_persistence_round_trip() {
        let mut store = store();

        let mut cfg = ConfigStore::new(8);
        cfg.set_int("interval", 250, true).unwrap();
        cfg.set_string("mode", "auto", true).unwrap();
        cfg.set_bool("scratch", true, false).unwrap();
        assert_eq!(cfg.save_persistent(&mut store).unwrap(), 2);

        let mut restored = ConfigStore::new(8);
        assert_eq!(restored.load_persistent(&store), 2);
        assert_eq!(restored.get_int("interval", 0), 250);
        assert_eq!(restored.get_string("mode", ""), "auto");
        // The non-persistent entry never reached the store.
        assert_eq!(restored.get_bool("scratch", false), false);
    }

    #[test]
    fn test_system_config_validation() {
        let good = SystemConfig::default();
        assert!(good.validate().is_ok());

        let mut bad = SystemConfig::default();
        bad.max_tools = 0;
        assert_eq!(
            bad.validate().err(),
            Some(ConfigError::Invalid("max_tools is zero"))
        );
    }
}
