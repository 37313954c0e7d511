//! 提示组装：从 State 生成模型请求
//!
//! 模板中的 `{{key}}` 由 state.data 替换：文本原样写入，片段列表每行一条（经格式化器），JSON 序列化。
//! `{{input}}` 为本轮输入。缺失的键替换为空串。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::core::state::{State, StateValue};
use crate::llm::{CompletionRequest, Message, ToolDefinition};
use crate::store::Fragment;

/// 片段格式化器：(片段, 作者显示名, 当前时间) -> 单行文本
pub type FragmentFormatter = Arc<dyn Fn(&Fragment, &str, DateTime<Utc>) -> String + Send + Sync>;

/// 默认格式：`[5m ago] Alice: content`
pub fn default_fragment_formatter(fragment: &Fragment, name: &str, now: DateTime<Utc>) -> String {
    let age = fragment
        .created_at
        .map(|at| format_age(now - at))
        .unwrap_or_else(|| "now".to_string());
    format!("[{age}] {name}: {}", fragment.content)
}

fn format_age(age: chrono::Duration) -> String {
    let secs = age.num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86400),
    }
}

/// 提示构建器
#[derive(Clone)]
pub struct PromptBuilder {
    assistant_id: String,
    system: Option<String>,
    user: String,
    include_history: bool,
    tools: Vec<ToolDefinition>,
    names: HashMap<String, String>,
    formatter: FragmentFormatter,
}

impl PromptBuilder {
    pub fn new(assistant_id: impl Into<String>, assistant_name: impl Into<String>) -> Self {
        let assistant_id = assistant_id.into();
        let mut names = HashMap::new();
        names.insert(assistant_id.clone(), assistant_name.into());
        Self {
            assistant_id,
            system: None,
            user: "{{input}}".to_string(),
            include_history: true,
            tools: Vec::new(),
            names,
            formatter: Arc::new(default_fragment_formatter),
        }
    }

    pub fn system(mut self, template: impl Into<String>) -> Self {
        self.system = Some(template.into());
        self
    }

    pub fn user(mut self, template: impl Into<String>) -> Self {
        self.user = template.into();
        self
    }

    /// 是否把近期交互作为对话历史消息带上（默认是）
    pub fn history(mut self, include: bool) -> Self {
        self.include_history = include;
        self
    }

    pub fn tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn actor_name(mut self, actor_id: impl Into<String>, name: impl Into<String>) -> Self {
        self.names.insert(actor_id.into(), name.into());
        self
    }

    pub fn formatter(mut self, formatter: FragmentFormatter) -> Self {
        self.formatter = formatter;
        self
    }

    pub fn build(&self, state: &State) -> CompletionRequest {
        let now = Utc::now();
        let mut messages = Vec::new();
        if let Some(system) = &self.system {
            messages.push(Message::system(self.render(system, state, now)));
        }
        if self.include_history {
            for fragment in &state.recent_interactions {
                if fragment.actor_id == self.assistant_id {
                    messages.push(Message::assistant(fragment.content.clone()));
                } else {
                    messages.push(Message::user(fragment.content.clone()));
                }
            }
        }
        messages.push(Message::user(self.render(&self.user, state, now)));
        CompletionRequest::new(messages).with_tools(self.tools.clone())
    }

    fn render(&self, template: &str, state: &State, now: DateTime<Utc>) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                out.push_str(&rest[start..]);
                return out;
            };
            let key = after[..end].trim();
            out.push_str(&self.value_for(key, state, now));
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        out
    }

    fn value_for(&self, key: &str, state: &State, now: DateTime<Utc>) -> String {
        if key == "input" && !state.data.contains_key("input") {
            return state.input.content.clone();
        }
        match state.get(key) {
            Some(StateValue::Text(text)) => text.clone(),
            Some(StateValue::Fragments(fragments)) => fragments
                .iter()
                .map(|f| (self.formatter)(f, self.display_name(&f.actor_id), now))
                .collect::<Vec<_>>()
                .join("\n"),
            Some(StateValue::Json(value)) => value.to_string(),
            None => String::new(),
        }
    }

    fn display_name<'a>(&'a self, actor_id: &'a str) -> &'a str {
        self.names.get(actor_id).map(String::as_str).unwrap_or(actor_id)
    }
}
