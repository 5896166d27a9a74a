use anyhow::{anyhow, Result};
use config::{Config, ConfigBuilder, Environment, File};
pub use config::FileFormat;
use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

lazy_static! {
    static ref GLOBAL_CONFIG_MANAGER: RwLock<Option<Arc<ConfigManager>>> = RwLock::new(None);
}

/// 环境变量前缀 / Environment variable prefix
pub const ENV_PREFIX: &str = "V";

/// 配置错误类型 / Config error type
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("配置文件不存在 / config file not found: {path}")]
    FileNotFound { path: String },
    #[error("配置项 '{key}' 不存在 / config key not found")]
    KeyNotFound { key: String },
    #[error("配置项 '{key}' 类型转换失败 / type conversion failed: {message}")]
    TypeConversionError { key: String, message: String },
    #[error("配置初始化失败 / config initialization failed: {message}")]
    InitializationError { message: String },
}

/// 配置数据源信息 / Config source information
#[derive(Debug, Clone)]
pub struct ConfigSourceInfo {
    pub source_type: String,
    pub description: String,
    pub priority: u8,
    pub loaded: bool,
}

/// 配置管理器 / Config manager
pub struct ConfigManager {
    config: Config,
    sources_info: Vec<ConfigSourceInfo>,
}

impl ConfigManager {
    /// 创建配置管理器（仅默认配置源）/ Create manager with default sources only
    pub fn new() -> Result<Self> {
        Self::with_sources(vec![])
    }

    /// 使用指定的配置源创建配置管理器
    /// Create a manager with extra sources layered above the file defaults
    pub fn with_sources(sources: Vec<ConfigSource>) -> Result<Self> {
        // 优先级从低到高，后添加者优先生效
        // Lowest priority first; later sources win.
        // development.toml -> default.toml -> production.toml -> extra sources -> env
        let mut ordered = vec![
            ConfigSource::File { path: "config/development.toml".to_string(), format: Some(FileFormat::Toml), required: false },
            ConfigSource::File { path: "config/default.toml".to_string(), format: Some(FileFormat::Toml), required: false },
            ConfigSource::File { path: "config/production.toml".to_string(), format: Some(FileFormat::Toml), required: false },
        ];
        ordered.extend(sources);
        ordered.push(ConfigSource::Env { prefix: ENV_PREFIX.to_string(), separator: "__" });
        Self::build(ordered)
    }

    /// 不加载默认文件与环境变量，仅使用给定源（测试用）
    /// Build from the given sources only, no default files or env (for tests)
    pub fn from_sources_only(sources: Vec<ConfigSource>) -> Result<Self> {
        Self::build(sources)
    }

    fn build(sources: Vec<ConfigSource>) -> Result<Self> {
        let mut builder = Config::builder();
        let mut sources_info = Vec::new();

        for (idx, source) in sources.into_iter().enumerate() {
            let info = source.get_source_info(idx as u8 + 1);
            if let ConfigSource::File { path, required, .. } = &source {
                let exists = std::path::Path::new(path).exists();
                if !exists && *required {
                    return Err(ConfigError::FileNotFound { path: path.clone() }.into());
                }
                if !exists {
                    // 可选文件不存在，记录但不添加 / Optional file missing: record, skip
                    sources_info.push(info);
                    continue;
                }
            }
            builder = source.add_to_builder(builder)?;
            sources_info.push(ConfigSourceInfo { loaded: true, ..info });
        }

        let config = builder.build().map_err(|e| anyhow!("构建配置失败 / failed to build config: {}", e))?;
        Ok(Self { config, sources_info })
    }

    /// 获取指定 key 的配置值 / Get config value for key
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.config
            .get(key)
            .map_err(|e| anyhow!("获取配置 '{}' 失败 / failed to read config: {}", key, e))
    }

    /// 获取指定 key 的配置值，如果不存在返回默认值
    /// Get config value, falling back to default
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// 读取整数并检查目标类型范围，越界报错而不是截断
    /// Read an integer and range-check it into the target type; out-of-range values are an error, never truncated
    pub fn get_int_or<T: TryFrom<i64>>(&self, key: &str, default: i64) -> std::result::Result<T, ConfigError> {
        let raw: i64 = self.get_or(key, default);
        T::try_from(raw).map_err(|_| ConfigError::TypeConversionError {
            key: key.to_string(),
            message: format!("{} is out of range for {}", raw, std::any::type_name::<T>()),
        })
    }

    /// 安全获取配置值，返回详细错误信息 / Get value with a typed error
    pub fn get_safe<T: DeserializeOwned>(&self, key: &str) -> std::result::Result<T, ConfigError> {
        self.config.get(key).map_err(|e| match e {
            config::ConfigError::NotFound(_) => ConfigError::KeyNotFound { key: key.to_string() },
            other => ConfigError::TypeConversionError { key: key.to_string(), message: other.to_string() },
        })
    }

    /// 检查配置项是否存在 / Whether key exists
    pub fn exists(&self, key: &str) -> bool {
        self.config.get::<config::Value>(key).is_ok()
    }

    /// 获取当前活跃的配置源（已成功加载的）/ Sources that were loaded
    pub fn get_active_sources(&self) -> Vec<&ConfigSourceInfo> {
        self.sources_info.iter().filter(|info| info.loaded).collect()
    }

    /// 打印配置源详细信息 / Log config source details
    pub fn log_sources_info(&self) {
        for (index, info) in self.sources_info.iter().enumerate() {
            let status = if info.loaded { "✓ loaded" } else { "✗ skipped" };
            tracing::info!("⚙️  config source {}. {} - {} ({})", index + 1, info.source_type, status, info.description);
        }
    }

    /// 验证必需的配置项 / Validate required keys
    pub fn validate_required_keys(&self, required_keys: &[&str]) -> std::result::Result<(), ConfigError> {
        for key in required_keys {
            if !self.exists(key) {
                return Err(ConfigError::KeyNotFound { key: key.to_string() });
            }
        }
        Ok(())
    }
}

/// 配置源类型 / Config source type
pub enum ConfigSource {
    /// 文件配置源 / File source
    File { path: String, format: Option<FileFormat>, required: bool },
    /// 环境变量配置源 / Environment source
    Env { prefix: String, separator: &'static str },
    /// 内存配置源（HashMap）/ In-memory map source
    Memory(HashMap<String, serde_json::Value>),
    /// 字符串配置源 / Inline string source
    String { content: String, format: FileFormat },
}

impl ConfigSource {
    /// 获取配置源信息 / Describe the source
    pub fn get_source_info(&self, priority: u8) -> ConfigSourceInfo {
        let (source_type, description) = match self {
            ConfigSource::File { path, required, .. } => ("File", format!("{} (required: {})", path, required)),
            ConfigSource::Env { prefix, separator } => ("Environment", format!("prefix={} separator={}", prefix, separator)),
            ConfigSource::Memory(map) => ("Memory", format!("{} keys", map.len())),
            ConfigSource::String { .. } => ("String", "inline".to_string()),
        };
        ConfigSourceInfo { source_type: source_type.to_string(), description, priority, loaded: false }
    }

    pub fn add_to_builder(
        self,
        builder: ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<ConfigBuilder<config::builder::DefaultState>> {
        match self {
            ConfigSource::File { path, format, required } => {
                let file_source = match format {
                    Some(format) => File::with_name(&path).format(format),
                    None => File::with_name(&path),
                };
                Ok(builder.add_source(file_source.required(required)))
            }
            ConfigSource::Env { prefix, separator } => Ok(builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator(separator)
                    .prefix_separator("_")
                    .try_parsing(true)
                    .ignore_empty(true),
            )),
            ConfigSource::Memory(map) => {
                // 点号 key 展开成嵌套对象 / Expand dotted keys into nested tables
                let mut b = builder;
                for (key, value) in map {
                    b = b.set_override(key.as_str(), json_to_config_value(value))?;
                }
                Ok(b)
            }
            ConfigSource::String { content, format } => Ok(builder.add_source(File::from_str(&content, format))),
        }
    }
}

fn json_to_config_value(value: serde_json::Value) -> config::Value {
    use config::ValueKind;
    let kind = match value {
        serde_json::Value::Null => ValueKind::Nil,
        serde_json::Value::Bool(b) => ValueKind::Boolean(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => ValueKind::I64(i),
            None => ValueKind::Float(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => ValueKind::String(s),
        serde_json::Value::Array(items) => ValueKind::Array(items.into_iter().map(json_to_config_value).collect()),
        serde_json::Value::Object(map) => {
            ValueKind::Table(map.into_iter().map(|(k, v)| (k, json_to_config_value(v))).collect())
        }
    };
    config::Value::new(None, kind)
}

/// 使用指定配置文件初始化全局配置 / Initialize the global config with an explicit file
pub fn init_global_config_with_file(path: &str) -> Result<Arc<ConfigManager>> {
    let manager = ConfigManager::with_sources(vec![ConfigSource::File {
        path: path.to_string(),
        format: None,
        required: true,
    }])?;
    install_global_config(manager)
}

/// 安装全局配置（覆盖已有实例）/ Install the global config, replacing any previous one
pub fn install_global_config(manager: ConfigManager) -> Result<Arc<ConfigManager>> {
    let manager = Arc::new(manager);
    let mut slot = GLOBAL_CONFIG_MANAGER
        .write()
        .map_err(|e| anyhow!("获取全局配置管理器写锁失败 / global config lock poisoned: {}", e))?;
    *slot = Some(Arc::clone(&manager));
    Ok(manager)
}

/// 获取全局配置管理器实例（单例模式）/ Global config manager (singleton)
pub fn get_global_config_manager() -> Result<Arc<ConfigManager>> {
    {
        let manager = GLOBAL_CONFIG_MANAGER
            .read()
            .map_err(|e| anyhow!("读取全局配置管理器锁失败 / global config lock poisoned: {}", e))?;
        if let Some(ref config_manager) = *manager {
            return Ok(Arc::clone(config_manager));
        }
    }
    install_global_config(ConfigManager::new()?)
}
