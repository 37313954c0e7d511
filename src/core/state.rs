//! 单轮状态：输入、近期交互与各管理器贡献的上下文数据
//!
//! State 只服务一轮对话，阶段按 Created → Processed → Responded → PostProcessed 单向推进。
//! `data` 的同名键按执行顺序后写覆盖先写。

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::HiveError;
use crate::store::types::{ActorId, Fragment, SessionId};

/// 回合阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TurnPhase {
    Created,
    Processed,
    Responded,
    PostProcessed,
}

/// 上下文值
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StateValue {
    Text(String),
    Fragments(Vec<Fragment>),
    Json(Value),
}

/// Context 钩子返回的一条贡献
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateData {
    pub key: String,
    pub value: StateValue,
}

impl StateData {
    pub fn text(key: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: StateValue::Text(text.into()),
        }
    }

    pub fn fragments(key: impl Into<String>, fragments: Vec<Fragment>) -> Self {
        Self {
            key: key.into(),
            value: StateValue::Fragments(fragments),
        }
    }

    pub fn json(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value: StateValue::Json(value),
        }
    }
}

/// 单轮状态
#[derive(Debug)]
pub struct State {
    pub actor_id: ActorId,
    pub session_id: SessionId,
    /// 用户输入片段（Process 成功后落库）
    pub input: Fragment,
    /// 最近交互，按时间正序
    pub recent_interactions: Vec<Fragment>,
    pub data: HashMap<String, StateValue>,
    response: Option<Fragment>,
    phase: TurnPhase,
    cancel: CancellationToken,
}

impl State {
    pub fn new(
        input: Fragment,
        recent_interactions: Vec<Fragment>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            actor_id: input.actor_id.clone(),
            session_id: input.session_id.clone(),
            input,
            recent_interactions,
            data: HashMap::new(),
            response: None,
            phase: TurnPhase::Created,
            cancel,
        }
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    /// 本轮的取消令牌，所有存储与模型调用都应传入
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// 模型回复（Responded 之后可用）
    pub fn response(&self) -> Option<&Fragment> {
        self.response.as_ref()
    }

    pub(crate) fn set_response(&mut self, response: Fragment) {
        self.response = Some(response);
    }

    pub fn input_text(&self) -> &str {
        &self.input.content
    }

    pub fn set(&mut self, key: impl Into<String>, value: StateValue) -> Option<StateValue> {
        self.data.insert(key.into(), value)
    }

    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.data.get(key)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.data.get(key) {
            Some(StateValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn fragments(&self, key: &str) -> Option<&[Fragment]> {
        match self.data.get(key) {
            Some(StateValue::Fragments(f)) => Some(f),
            _ => None,
        }
    }

    /// 合并 Context 贡献（后写覆盖）
    pub fn merge(&mut self, contributions: Vec<StateData>) {
        for item in contributions {
            self.data.insert(item.key, item.value);
        }
    }

    /// 阶段推进：当前阶段必须等于 `expected`
    pub(crate) fn ensure_phase(&self, expected: TurnPhase) -> Result<(), HiveError> {
        if self.phase != expected {
            return Err(HiveError::InvalidTransition {
                expected,
                actual: self.phase,
            });
        }
        Ok(())
    }

    pub(crate) fn advance(&mut self, next: TurnPhase) {
        self.phase = next;
    }
}
