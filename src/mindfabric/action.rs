//! Handler action types.
//!
//! Every action a handler can take is one variant of [`HandlerAction`], a
//! tagged union carrying that action's parameter record. Buses and the
//! audit trail dispatch on the tag ([`HandlerActionType`]) instead of on
//! free-form strings, so an unknown action is a compile error rather than a
//! runtime surprise.

use crate::mindfabric::graph::{GraphNode, GraphScope, MemoryQuery, TsdbNode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// The closed set of handler action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandlerActionType {
    Observe,
    Speak,
    Tool,
    Memorize,
    Recall,
    Forget,
    Defer,
    Reject,
    Ponder,
    TaskComplete,
}

impl HandlerActionType {
    /// Every action kind, in declaration order. The feedback loop uses this
    /// as the expected-capability list when hunting for underused actions.
    pub const ALL: [HandlerActionType; 10] = [
        HandlerActionType::Observe,
        HandlerActionType::Speak,
        HandlerActionType::Tool,
        HandlerActionType::Memorize,
        HandlerActionType::Recall,
        HandlerActionType::Forget,
        HandlerActionType::Defer,
        HandlerActionType::Reject,
        HandlerActionType::Ponder,
        HandlerActionType::TaskComplete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerActionType::Observe => "OBSERVE",
            HandlerActionType::Speak => "SPEAK",
            HandlerActionType::Tool => "TOOL",
            HandlerActionType::Memorize => "MEMORIZE",
            HandlerActionType::Recall => "RECALL",
            HandlerActionType::Forget => "FORGET",
            HandlerActionType::Defer => "DEFER",
            HandlerActionType::Reject => "REJECT",
            HandlerActionType::Ponder => "PONDER",
            HandlerActionType::TaskComplete => "TASK_COMPLETE",
        }
    }
}

impl fmt::Display for HandlerActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A handler action with its parameter record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandlerAction {
    Observe {
        channel_id: Option<String>,
        active: bool,
    },
    Speak {
        channel_id: String,
        content: String,
    },
    Tool {
        name: String,
        parameters: Value,
    },
    Memorize {
        node: GraphNode,
    },
    Recall {
        query: MemoryQuery,
    },
    Forget {
        node_id: String,
        scope: GraphScope,
    },
    Defer {
        reason: String,
        defer_until: Option<DateTime<Utc>>,
    },
    Reject {
        reason: String,
    },
    Ponder {
        questions: Vec<String>,
    },
    TaskComplete {
        outcome: String,
    },
}

impl HandlerAction {
    /// Build the audit time-series node recording this action. The action
    /// tag and outcome land in the node's tag set, which is what the
    /// behavioral detectors group on later.
    pub fn audit_node(&self, outcome: &str, scope: GraphScope) -> TsdbNode {
        let mut tags = HashMap::new();
        if let HandlerAction::Tool { name, .. } = self {
            tags.insert("tool_name".to_string(), name.clone());
        }
        TsdbNode::audit(self.kind().as_str(), outcome, tags, scope)
    }

    /// The tag of this action.
    pub fn kind(&self) -> HandlerActionType {
        match self {
            HandlerAction::Observe { .. } => HandlerActionType::Observe,
            HandlerAction::Speak { .. } => HandlerActionType::Speak,
            HandlerAction::Tool { .. } => HandlerActionType::Tool,
            HandlerAction::Memorize { .. } => HandlerActionType::Memorize,
            HandlerAction::Recall { .. } => HandlerActionType::Recall,
            HandlerAction::Forget { .. } => HandlerActionType::Forget,
            HandlerAction::Defer { .. } => HandlerActionType::Defer,
            HandlerAction::Reject { .. } => HandlerActionType::Reject,
            HandlerAction::Ponder { .. } => HandlerActionType::Ponder,
            HandlerAction::TaskComplete { .. } => HandlerActionType::TaskComplete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_kind_matches_variant() {
        let action = HandlerAction::Speak {
            channel_id: "c1".to_string(),
            content: "hello".to_string(),
        };
        assert_eq!(action.kind(), HandlerActionType::Speak);
        assert_eq!(action.kind().as_str(), "SPEAK");
    }

    #[test]
    fn action_serializes_with_tag() {
        let action = HandlerAction::Reject {
            reason: "out of scope".to_string(),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "REJECT");
        assert_eq!(json["reason"], "out of scope");
    }

    #[test]
    fn tool_actions_carry_their_tool_name_into_audit_tags() {
        let action = HandlerAction::Tool {
            name: "calculator".to_string(),
            parameters: serde_json::json!({"expression": "1+1"}),
        };
        let node = action.audit_node("success", GraphScope::Local);
        assert_eq!(node.tags.get("action_type").map(String::as_str), Some("TOOL"));
        assert_eq!(node.tags.get("tool_name").map(String::as_str), Some("calculator"));
        assert_eq!(node.tags.get("outcome").map(String::as_str), Some("success"));
    }
}
