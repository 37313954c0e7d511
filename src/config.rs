//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__PROVIDER=openai`）。
//! 加载后调用 `validate` 一次性校验，失败即 ConfigurationError。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::HiveError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub store: StoreSection,
    pub engine: EngineSection,
    pub managers: ManagersSection,
}

/// [app] 段：助手与默认用户、会话身份
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    pub assistant_id: String,
    pub assistant_name: String,
    pub user_id: String,
    pub user_name: String,
    pub session_id: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "hive".to_string(),
            assistant_id: "assistant".to_string(),
            assistant_name: "Hive".to_string(),
            user_id: "user".to_string(),
            user_name: "User".to_string(),
            session_id: "session".to_string(),
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub embedding_model: String,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            embedding_model: "text-embedding-3-small".to_string(),
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次请求超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [store] 段：数据库路径、向量维度、查询缓存
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// ":memory:" 表示内存数据库
    pub database_path: PathBuf,
    pub embedding_dimensions: usize,
    pub cache_capacity: usize,
    /// 0 表示不过期
    pub cache_ttl_secs: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/hive.db"),
            embedding_dimensions: 256,
            cache_capacity: 256,
            cache_ttl_secs: 300,
        }
    }
}

impl StoreSection {
    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl_secs > 0).then(|| Duration::from_secs(self.cache_ttl_secs))
    }
}

/// [engine] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// NewState 载入的近期交互条数（0 表示不限）
    pub recent_interactions: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            recent_interactions: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ManagersSection {
    pub insight: InsightSection,
}

/// [managers.insight] 段：检索条数与后台维护间隔
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InsightSection {
    pub maintenance_interval_secs: u64,
    pub session_limit: usize,
    pub actor_limit: usize,
    pub relevant_limit: usize,
}

impl Default for InsightSection {
    fn default() -> Self {
        Self {
            maintenance_interval_secs: 60,
            session_limit: 10,
            actor_limit: 10,
            relevant_limit: 5,
        }
    }
}

impl AppConfig {
    /// 构造前的一次性校验
    pub fn validate(&self) -> Result<(), HiveError> {
        let identities = [
            ("app.assistant_id", &self.app.assistant_id),
            ("app.assistant_name", &self.app.assistant_name),
            ("app.user_id", &self.app.user_id),
            ("app.session_id", &self.app.session_id),
        ];
        for (key, value) in identities {
            if value.trim().is_empty() {
                return Err(HiveError::configuration(format!("{key} must not be empty")));
            }
        }
        if self.app.assistant_id == self.app.user_id {
            return Err(HiveError::configuration(
                "app.assistant_id and app.user_id must differ",
            ));
        }
        if !matches!(self.llm.provider.as_str(), "openai" | "mock") {
            return Err(HiveError::configuration(format!(
                "llm.provider must be openai or mock, got {}",
                self.llm.provider
            )));
        }
        if self.llm.timeouts.request == 0 {
            return Err(HiveError::configuration("llm.timeouts.request must be positive"));
        }
        if self.store.embedding_dimensions == 0 {
            return Err(HiveError::configuration("store.embedding_dimensions must be positive"));
        }
        if self.store.cache_capacity == 0 {
            return Err(HiveError::configuration("store.cache_capacity must be positive"));
        }
        if self.managers.insight.maintenance_interval_secs == 0 {
            return Err(HiveError::configuration(
                "managers.insight.maintenance_interval_secs must be positive",
            ));
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
