use anyhow::{bail, Result};
use v::ConfigManager;

use crate::persist::PersistConfig;

/// 存储后端 / Storage backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    /// MongoDB + Redis
    External,
    /// 进程内存（开发用）/ Process memory (development)
    Memory,
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub host: String,
    pub grpc_port: u16,
    pub http_port: u16,
    pub backend: StorageBackend,
    pub mongo_uri: String,
    pub mongo_database: String,
    pub redis_url: String,
    pub persist: PersistConfig,
}

impl RelayConfig {
    pub fn from_manager(cm: &ConfigManager) -> Result<Self> {
        let backend = match cm.get_or("storage.backend", "external".to_string()).as_str() {
            "external" => StorageBackend::External,
            "memory" => StorageBackend::Memory,
            other => bail!("unknown storage.backend '{}' (expected external|memory)", other),
        };
        let defaults = PersistConfig::default();
        Ok(Self {
            host: cm.get_or("server.host", "127.0.0.1".to_string()),
            grpc_port: cm.get_int_or("server.grpc_port", 50051)?,
            http_port: cm.get_int_or("server.http_port", 8081)?,
            backend,
            mongo_uri: cm.get_or("mongo.uri", "mongodb://127.0.0.1:27017".to_string()),
            mongo_database: cm.get_or("mongo.database", "chat".to_string()),
            redis_url: cm.get_or("redis.url", "redis://127.0.0.1:6379".to_string()),
            persist: PersistConfig {
                workers: cm.get_int_or::<usize>("persist.workers", defaults.workers as i64)?.max(1),
                queue_capacity: cm.get_int_or::<usize>("persist.queue_capacity", defaults.queue_capacity as i64)?.max(1),
                max_attempts: cm.get_int_or::<u32>("persist.max_attempts", defaults.max_attempts as i64)?.max(1),
                retry_base_ms: cm.get_int_or("persist.retry_base_ms", defaults.retry_base_ms as i64)?,
                retry_max_ms: cm.get_int_or("persist.retry_max_ms", defaults.retry_max_ms as i64)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use v::ConfigSource;

    fn manager(toml: &str) -> ConfigManager {
        ConfigManager::from_sources_only(vec![ConfigSource::String {
            content: toml.to_string(),
            format: v::FileFormat::Toml,
        }])
        .unwrap()
    }

    #[test]
    fn defaults_apply() {
        let cfg = RelayConfig::from_manager(&manager("")).unwrap();
        assert_eq!(cfg.grpc_port, 50051);
        assert_eq!(cfg.backend, StorageBackend::External);
        assert_eq!(cfg.persist.max_attempts, 3);
    }

    #[test]
    fn reads_overrides_and_rejects_unknown_backend() {
        let cfg = RelayConfig::from_manager(&manager("[storage]\nbackend = \"memory\"\n[persist]\nworkers = 8")).unwrap();
        assert_eq!(cfg.backend, StorageBackend::Memory);
        assert_eq!(cfg.persist.workers, 8);
        assert!(RelayConfig::from_manager(&manager("[storage]\nbackend = \"sled\"")).is_err());
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(RelayConfig::from_manager(&manager("[server]\ngrpc_port = 70000")).is_err());
        assert!(RelayConfig::from_manager(&manager("[persist]\nmax_attempts = -3")).is_err());
    }
}
