use crate::models::{Extension, ForwardingMode, MemberKind, RankMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub mod discovery;
pub mod dispatcher;
pub mod generator;

pub use discovery::TreeDiscovery;
pub use dispatcher::{DiagnosticReport, Dispatcher, RouteOutcome, RouteRequest};
pub use generator::RouteGenerator;

/// Per-request context: the opaque call identifier, the resolved caller and
/// the dialed number.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub call_id: String,
    pub caller: Extension,
    pub called: String,
}

impl CallContext {
    pub fn new(caller: Extension, called: String, call_id: Option<String>) -> Self {
        let call_id = call_id
            .filter(|id| !id.is_empty())
            .map(|id| sanitize_call_id(&id))
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        Self {
            call_id,
            caller,
            called,
        }
    }
}

/// Call ids become the middle part of `stage1-<call-id>-<tree-path>` names,
/// where `-` separates the id from the tree path. Externally-supplied ids
/// (e.g. an engine billing id) are reduced to alphanumerics so the name
/// parses back unambiguously.
fn sanitize_call_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Deterministic position of a node in the routing tree, e.g. `1`,
/// `1-fr0-3`, `1-fr0-3-fwd`. Doubles as the cache key suffix and as the
/// symbolic late-route name of inner nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TreePath(String);

impl TreePath {
    pub fn root() -> Self {
        Self("1".to_string())
    }

    pub fn rank_member(&self, rank_index: i32, position: usize) -> Self {
        Self(format!("{}-fr{}-{}", self.0, rank_index, position))
    }

    pub fn forward(&self) -> Self {
        Self(format!("{}-fwd", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One routing instruction for the telephone engine: a scheme+address target
/// and its parameter words. The ordered map keeps serialization stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallTarget {
    pub target: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl CallTarget {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.insert(key.into(), value.into());
    }
}

/// The generator's output per inner node and for the root: either an
/// immediate terminal instruction or a fork whose symbolic target is looked
/// up later through the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RoutingResult {
    Simple {
        target: CallTarget,
    },
    Fork {
        target: CallTarget,
        fork_targets: Vec<CallTarget>,
    },
}

impl RoutingResult {
    pub fn target(&self) -> &CallTarget {
        match self {
            RoutingResult::Simple { target } => target,
            RoutingResult::Fork { target, .. } => target,
        }
    }

    pub fn target_mut(&mut self) -> &mut CallTarget {
        match self {
            RoutingResult::Simple { target } => target,
            RoutingResult::Fork { target, .. } => target,
        }
    }

    pub fn is_fork(&self) -> bool {
        matches!(self, RoutingResult::Fork { .. })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
}

/// Discovery log attached to the node it was observed on.
#[derive(Debug, Clone, Serialize)]
pub struct NodeLog {
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related: Option<TreePath>,
}

/// ON_BUSY / ON_UNAVAILABLE forward: no discovery child, the engine resolves
/// the condition at call time from per-target parameters.
#[derive(Debug, Clone, Serialize)]
pub struct ConditionalForward {
    pub on: ForwardingMode,
    pub target_number: String,
}

impl ConditionalForward {
    /// Engine-side stop reason the condition maps to.
    pub fn stop_reason(&self) -> &'static str {
        match self.on {
            ForwardingMode::OnUnavailable => "offline",
            _ => "busy",
        }
    }
}

/// A fork rank as realized in the routing tree.
#[derive(Debug, Serialize)]
pub struct TreeRank {
    pub index: i32,
    pub mode: RankMode,
    pub delay: Option<i32>,
    /// Synthetic rank carrying a delayed forward target; its emission delay
    /// is resolved against the accumulated delays of the preceding ranks.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub forward_fallback: bool,
    pub members: Vec<TreeMember>,
}

#[derive(Debug, Serialize)]
pub struct TreeMember {
    #[serde(rename = "type")]
    pub kind: MemberKind,
    pub active: bool,
    pub node: MemberNode,
}

/// What a rank member rings: the owning extension's own device (multiring
/// self member, delayed-forward rank 0) or a child node of the tree.
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberNode {
    Device,
    Child(RouteNode),
}

/// A node of the per-request routing tree. The tree is strictly owned, one
/// parent per node; the extension graph's cycles are cut during discovery.
#[derive(Debug, Serialize)]
pub struct RouteNode {
    pub extension: Extension,
    pub tree_path: TreePath,
    pub active: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<NodeLog>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditional_forward: Option<ConditionalForward>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward: Option<Box<RouteNode>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fork_ranks: Vec<TreeRank>,
}

impl RouteNode {
    pub fn is_leaf(&self) -> bool {
        self.forward.is_none() && self.fork_ranks.is_empty()
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>, related: Option<TreePath>) {
        self.logs.push(NodeLog {
            level,
            message: message.into(),
            related,
        });
    }

    /// Active leaf extension ids of the subtree, in emission order.
    pub fn active_leaves(&self) -> Vec<i32> {
        let mut out = Vec::new();
        self.collect_active_leaves(&mut out);
        out
    }

    fn collect_active_leaves(&self, out: &mut Vec<i32>) {
        if !self.active {
            return;
        }
        if let Some(fwd) = &self.forward {
            fwd.collect_active_leaves(out);
            return;
        }
        if self.fork_ranks.is_empty() {
            out.push(self.extension.id);
            return;
        }
        for rank in &self.fork_ranks {
            for member in &rank.members {
                if !member.active {
                    continue;
                }
                match &member.node {
                    MemberNode::Device => out.push(self.extension.id),
                    MemberNode::Child(child) => child.collect_active_leaves(out),
                }
            }
        }
    }
}

/// Parse a symbolic late-route name, with or without the `lateroute/`
/// prefix, into (call id, tree path).
pub fn parse_symbolic(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix("lateroute/").unwrap_or(name);
    let rest = rest.strip_prefix("stage1-")?;
    let (call_id, tree_path) = rest.split_once('-')?;
    if call_id.is_empty() || tree_path.is_empty() {
        return None;
    }
    Some((call_id, tree_path))
}

/// The symbolic deferred-route target of an inner node.
pub fn symbolic_name(call_id: &str, tree_path: &TreePath) -> String {
    format!("lateroute/stage1-{}-{}", call_id, tree_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_path_assignment() {
        let root = TreePath::root();
        assert_eq!(root.as_str(), "1");
        let member = root.rank_member(0, 3);
        assert_eq!(member.as_str(), "1-fr0-3");
        assert_eq!(member.forward().as_str(), "1-fr0-3-fwd");
    }

    #[test]
    fn test_parse_symbolic_names() {
        let name = "lateroute/stage1-83ded8b334034789a2c0e1405a54af76-1-fr0-3";
        let (call_id, path) = parse_symbolic(name).unwrap();
        assert_eq!(call_id, "83ded8b334034789a2c0e1405a54af76");
        assert_eq!(path, "1-fr0-3");

        assert_eq!(parse_symbolic("stage1-abc-1"), Some(("abc", "1")));
        assert!(parse_symbolic("stage2-abc-1").is_none());
        assert!(parse_symbolic("stage1-abc").is_none());
        assert!(parse_symbolic("stage1--1").is_none());
    }

    #[test]
    fn test_routing_result_roundtrip() {
        let mut target = CallTarget::new("lateroute/stage1-abc-1");
        target.set("x_eventphone_id", "abc");
        let result = RoutingResult::Fork {
            target,
            fork_targets: vec![CallTarget::new("lateroute/2002"), CallTarget::new("|next=0")],
        };
        let bytes = result.to_bytes().unwrap();
        let back = RoutingResult::from_bytes(&bytes).unwrap();
        assert_eq!(result, back);
        // serialization is stable under re-serialize
        assert_eq!(bytes, back.to_bytes().unwrap());
    }

    #[test]
    fn test_call_context_generates_call_id() {
        let caller = Extension::external_placeholder("4748");
        let ctx = CallContext::new(caller.clone(), "2000".to_string(), None);
        assert_eq!(ctx.call_id.len(), 32);
        assert!(ctx.call_id.chars().all(|c| c.is_ascii_hexdigit()));

        let ctx = CallContext::new(caller, "2000".to_string(), Some("0xabc123".to_string()));
        assert_eq!(ctx.call_id, "0xabc123");
    }

    #[test]
    fn test_call_context_sanitizes_external_call_ids() {
        let caller = Extension::external_placeholder("4748");
        let ctx = CallContext::new(caller, "2000".to_string(), Some("PBX-42/77".to_string()));
        assert_eq!(ctx.call_id, "PBX_42_77");

        // the sanitized id keeps symbolic names parseable at the first dash
        let name = symbolic_name(&ctx.call_id, &TreePath::root().rank_member(0, 3));
        assert_eq!(parse_symbolic(&name), Some(("PBX_42_77", "1-fr0-3")));
    }
}
