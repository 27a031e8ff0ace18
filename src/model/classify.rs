//! Priority and source-type classification of call records
//!
//! Classification is a pure function of the caller category, the callee
//! category and the length of the call stack. The first matching row wins:
//!
//! | Condition                                  | Priority | Source type  |
//! |--------------------------------------------|----------|--------------|
//! | caller=user, callee=agent, stack length 2  | 0        | `e2e`        |
//! | caller=user, otherwise                     | 1        | `user_agent` |
//! | caller=agent, callee is agent or llm       | 2        | `agent_agent`|
//! | callee=tool                                | 3        | `agent_tool` |
//! | anything else                              | 4        | `other`      |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a caller or callee in a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    User,
    Agent,
    Llm,
    Tool,
    #[serde(other)]
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::User => "user",
            Category::Agent => "agent",
            Category::Llm => "llm",
            Category::Tool => "tool",
            Category::Other => "other",
        }
    }

    /// Parse a category name; unknown names map to `Other`
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "user" => Category::User,
            "agent" | "flow" => Category::Agent,
            "llm" => Category::Llm,
            "tool" => Category::Tool,
            _ => Category::Other,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing priority, 0 (highest) to 4 (lowest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const END_TO_END: Priority = Priority(0);
    pub const USER_AGENT: Priority = Priority(1);
    pub const AGENT_AGENT: Priority = Priority(2);
    pub const AGENT_TOOL: Priority = Priority(3);
    pub const OTHER: Priority = Priority(4);
    pub const LOWEST: u8 = 4;

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if value <= Self::LOWEST {
            Ok(Priority(value))
        } else {
            Err(format!("priority {value} outside 0..={}", Self::LOWEST))
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Classification label of a QA unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    #[serde(rename = "e2e")]
    EndToEnd,
    UserAgent,
    AgentAgent,
    AgentTool,
    Other,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::EndToEnd => "e2e",
            SourceType::UserAgent => "user_agent",
            SourceType::AgentAgent => "agent_agent",
            SourceType::AgentTool => "agent_tool",
            SourceType::Other => "other",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub priority: Priority,
    pub source_type: SourceType,
}

/// Classify a call by caller/callee category and call stack length
pub fn classify(caller: Category, callee: Category, stack_len: usize) -> Classification {
    let (priority, source_type) = match (caller, callee) {
        (Category::User, Category::Agent) if stack_len == 2 => {
            (Priority::END_TO_END, SourceType::EndToEnd)
        }
        (Category::User, _) => (Priority::USER_AGENT, SourceType::UserAgent),
        (Category::Agent, Category::Agent | Category::Llm) => {
            (Priority::AGENT_AGENT, SourceType::AgentAgent)
        }
        (_, Category::Tool) => (Priority::AGENT_TOOL, SourceType::AgentTool),
        _ => (Priority::OTHER, SourceType::Other),
    };

    Classification {
        priority,
        source_type,
    }
}
