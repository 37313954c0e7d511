//! 存储层数据类型：参与者、会话、片段与查询过滤器

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::HiveError;

pub type ActorId = String;
pub type SessionId = String;
pub type FragmentId = String;

/// 参与者（用户或助手），id 由外部分配
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub name: String,
    pub is_assistant: bool,
}

impl Actor {
    pub fn user(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_assistant: false,
        }
    }

    pub fn assistant(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_assistant: true,
        }
    }
}

/// 一条对话线程
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// 片段：不可变的记忆单元（消息、洞察、人格数据）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub id: FragmentId,
    pub actor_id: ActorId,
    pub session_id: SessionId,
    pub content: String,
    /// 可为空；非空时长度必须等于存储配置的维度
    #[serde(default)]
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// 为空时由存储在写入时赋值
    pub created_at: Option<DateTime<Utc>>,
}

impl Fragment {
    /// 新建片段（自动分配 UUID）
    pub fn new(
        actor_id: impl Into<String>,
        session_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            actor_id: actor_id.into(),
            session_id: session_id.into(),
            content: content.into(),
            embedding: Vec::new(),
            metadata: BTreeMap::new(),
            created_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }
}

/// 片段分区：同一 schema，分别查询
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Partition {
    Interaction,
    Personality,
    Insight,
    Custom(String),
}

impl Partition {
    pub fn name(&self) -> &str {
        match self {
            Self::Interaction => "interaction",
            Self::Personality => "personality",
            Self::Insight => "insight",
            Self::Custom(name) => name,
        }
    }

    /// 分区名会拼入表名，只允许 [a-z][a-z0-9_]*
    pub fn validate(&self) -> Result<(), HiveError> {
        let name = self.name();
        let mut chars = name.chars();
        let valid = matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
            && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if valid {
            Ok(())
        } else {
            Err(HiveError::configuration(format!(
                "invalid partition name '{name}'"
            )))
        }
    }

    pub fn table_name(&self) -> String {
        format!("fragments_{}", self.name())
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// 元数据比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MetadataOperator {
    #[serde(rename = "=")]
    Equals,
    #[serde(rename = "!=")]
    NotEquals,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "in")]
    In,
}

impl MetadataOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equals => "=",
            Self::NotEquals => "!=",
            Self::Contains => "contains",
            Self::In => "in",
        }
    }
}

/// 单个元数据条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataCondition {
    pub key: String,
    pub value: Value,
    pub operator: MetadataOperator,
}

impl MetadataCondition {
    pub fn equals(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
            operator: MetadataOperator::Equals,
        }
    }

    pub fn not_equals(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
            operator: MetadataOperator::NotEquals,
        }
    }

    pub fn contains(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
            operator: MetadataOperator::Contains,
        }
    }

    pub fn one_of(key: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            key: key.into(),
            value: Value::Array(values),
            operator: MetadataOperator::In,
        }
    }

    pub fn validate(&self) -> Result<(), HiveError> {
        if self.key.trim().is_empty() {
            return Err(HiveError::validation("metadata condition with empty key"));
        }
        if self.operator == MetadataOperator::In && !self.value.is_array() {
            return Err(HiveError::validation(format!(
                "metadata condition '{}' uses 'in' without an array value",
                self.key
            )));
        }
        Ok(())
    }

    /// 判断片段元数据是否满足条件
    pub fn matches(&self, metadata: &BTreeMap<String, Value>) -> bool {
        let actual = metadata.get(&self.key);
        match self.operator {
            MetadataOperator::Equals => actual == Some(&self.value),
            MetadataOperator::NotEquals => actual != Some(&self.value),
            MetadataOperator::Contains => match actual {
                Some(Value::Array(items)) => items.contains(&self.value),
                Some(Value::String(s)) => self.value.as_str().is_some_and(|needle| s.contains(needle)),
                Some(Value::Object(map)) => self.value.as_str().is_some_and(|k| map.contains_key(k)),
                _ => false,
            },
            MetadataOperator::In => match (&self.value, actual) {
                (Value::Array(options), Some(v)) => options.contains(v),
                _ => false,
            },
        }
    }
}

/// 查询描述符（所有条件为 AND 关系）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FragmentFilter {
    pub actor_id: Option<ActorId>,
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub metadata: Vec<MetadataCondition>,
    /// 包含
    pub start_time: Option<DateTime<Utc>>,
    /// 不包含
    pub end_time: Option<DateTime<Utc>>,
    /// 设置后按 L2 距离升序排列，否则按时间倒序
    pub embedding: Option<Vec<f32>>,
    /// 0 表示不限
    #[serde(default)]
    pub limit: usize,
}

impl FragmentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn condition(mut self, condition: MetadataCondition) -> Self {
        self.metadata.push(condition);
        self
    }

    pub fn since(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    pub fn until(mut self, end: DateTime<Utc>) -> Self {
        self.end_time = Some(end);
        self
    }

    pub fn similar_to(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn validate(&self, dimensions: Option<usize>) -> Result<(), HiveError> {
        for condition in &self.metadata {
            condition.validate()?;
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if start > end {
                return Err(HiveError::validation("filter start_time is after end_time"));
            }
        }
        if let Some(embedding) = &self.embedding {
            if embedding.is_empty() {
                return Err(HiveError::validation("filter embedding is empty"));
            }
            if let Some(dim) = dimensions {
                if embedding.len() != dim {
                    return Err(HiveError::validation(format!(
                        "filter embedding has {} dimensions, store expects {dim}",
                        embedding.len()
                    )));
                }
            }
        }
        Ok(())
    }

    /// 只检查精确条件（actor / session / 元数据 / 时间），不涉及向量
    pub fn matches(&self, fragment: &Fragment) -> bool {
        if self.actor_id.as_ref().is_some_and(|a| a != &fragment.actor_id) {
            return false;
        }
        if self.session_id.as_ref().is_some_and(|s| s != &fragment.session_id) {
            return false;
        }
        if let Some(created) = fragment.created_at {
            if self.start_time.is_some_and(|start| created < start) {
                return false;
            }
            if self.end_time.is_some_and(|end| created >= end) {
                return false;
            }
        }
        self.metadata.iter().all(|c| c.matches(&fragment.metadata))
    }
}

/// L2 距离
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}
