use crate::error::RoutingError;
use crate::models::{Extension, ExtensionKind, ForkRank, ForwardingMode, MemberKind, RankMode};
use crate::routing::{
    CallContext, ConditionalForward, LogLevel, MemberNode, NodeLog, RouteNode, TreeMember,
    TreePath, TreeRank,
};
use crate::store::RoutingStore;
use futures::future::try_join_all;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Stage-1 phase A: breadth-first discovery of the routing tree.
///
/// All store loads of one layer are issued concurrently and joined before
/// classification; the call-wide duplicate set is updated sequentially in
/// member order, so the same inputs always produce the same tree.
pub struct TreeDiscovery<'a> {
    store: &'a dyn RoutingStore,
    forward_depth_limit: u32,
}

pub struct DiscoveryOutcome {
    pub root: RouteNode,
    /// Extension ids seen on active paths, caller included.
    pub visited: HashSet<i32>,
}

/// Node under construction. Children are arena indices; the arena is laid
/// out in BFS order, so every child has a higher index than its parent.
struct BuildNode {
    ext: Extension,
    path: TreePath,
    active: bool,
    expand: bool,
    forward_hops: u32,
    logs: Vec<NodeLog>,
    conditional_forward: Option<ConditionalForward>,
    forward_child: Option<usize>,
    ranks: Vec<BuildRank>,
}

struct BuildRank {
    index: i32,
    mode: RankMode,
    delay: Option<i32>,
    forward_fallback: bool,
    members: Vec<BuildMember>,
}

struct BuildMember {
    kind: MemberKind,
    active: bool,
    child: BuildChild,
}

enum BuildChild {
    /// The owning extension's own device.
    Device,
    /// Resolved child node.
    Node(usize),
    /// Waiting for the next layer's extension load.
    Unresolved,
    /// Referenced extension row does not exist; dropped from the tree.
    Missing,
}

/// Rank shape decided during classification, before the member extensions
/// are loaded.
struct RankLayout {
    index: i32,
    mode: RankMode,
    delay: Option<i32>,
    forward_fallback: bool,
    members: Vec<(MemberKind, bool, MemberSource)>,
}

enum MemberSource {
    Device,
    Extension(i32),
}

#[derive(Clone, Copy)]
enum Slot {
    Forward,
    Member { rank: usize, member: usize },
}

/// A child scheduled for materialization in the next layer.
struct ChildSpec {
    parent: usize,
    slot: Slot,
    extension_id: i32,
    path: TreePath,
    active: bool,
    expand: bool,
    forward_hops: u32,
}

struct LayerFetch {
    ranks: Option<Vec<ForkRank>>,
    conditional_target: Option<Extension>,
}

impl<'a> TreeDiscovery<'a> {
    pub fn new(store: &'a dyn RoutingStore, forward_depth_limit: u32) -> Self {
        Self {
            store,
            forward_depth_limit,
        }
    }

    pub async fn discover(&self, ctx: &CallContext) -> Result<DiscoveryOutcome, RoutingError> {
        // The caller is pre-inserted so a group containing the caller does
        // not ring the caller back.
        let mut visited: HashMap<i32, String> = HashMap::new();
        visited.insert(ctx.caller.id, "caller".to_string());

        let root_ext = self
            .store
            .extension_by_number(&ctx.called)
            .await?
            .ok_or_else(|| RoutingError::NoRoute(format!("no extension {}", ctx.called)))?;
        let root_path = TreePath::root();
        visited
            .entry(root_ext.id)
            .or_insert_with(|| root_path.as_str().to_string());

        let mut arena: Vec<BuildNode> = vec![BuildNode {
            ext: root_ext,
            path: root_path,
            active: true,
            expand: true,
            forward_hops: 0,
            logs: Vec::new(),
            conditional_forward: None,
            forward_child: None,
            ranks: Vec::new(),
        }];
        let mut layer: Vec<usize> = vec![0];

        while !layer.is_empty() {
            let fetches = self.fetch_layer(&arena, &layer).await?;

            let mut specs: Vec<ChildSpec> = Vec::new();
            for (&idx, fetch) in layer.iter().zip(fetches) {
                self.classify(&mut arena, idx, fetch, &mut visited, &mut specs)?;
            }

            layer = self.materialize(&mut arena, specs).await?;
        }

        debug!(
            called = %ctx.called,
            nodes = arena.len(),
            "routing tree discovery complete"
        );

        let root = assemble(arena, 0);
        Ok(DiscoveryOutcome {
            root,
            visited: visited.into_keys().collect(),
        })
    }

    /// Issue all store reads of the current layer concurrently and join.
    async fn fetch_layer(
        &self,
        arena: &[BuildNode],
        layer: &[usize],
    ) -> Result<Vec<LayerFetch>, RoutingError> {
        let plans: Vec<(i32, bool, Option<i32>)> = layer
            .iter()
            .map(|&idx| {
                let node = &arena[idx];
                if !node.expand {
                    return (node.ext.id, false, None);
                }
                let immediate =
                    node.ext.immediate_forward() && node.ext.forwarding_extension_id.is_some();
                let want_ranks = matches!(
                    node.ext.kind,
                    ExtensionKind::Group | ExtensionKind::Multiring
                ) && !immediate;
                let conditional = match node.ext.forwarding_mode {
                    ForwardingMode::OnBusy | ForwardingMode::OnUnavailable => {
                        node.ext.forwarding_extension_id
                    }
                    _ => None,
                };
                (node.ext.id, want_ranks, conditional)
            })
            .collect();

        let fetched = try_join_all(plans.into_iter().map(|(ext_id, want_ranks, conditional)| {
            let store = self.store;
            async move {
                let ranks = if want_ranks {
                    Some(store.fork_ranks_for(ext_id).await?)
                } else {
                    None
                };
                let conditional_target = match conditional {
                    Some(target_id) => store.extension_by_id(target_id).await?,
                    None => None,
                };
                Ok::<_, crate::store::StoreError>(LayerFetch {
                    ranks,
                    conditional_target,
                })
            }
        }))
        .await?;
        Ok(fetched)
    }

    /// Decide a node's expansion intent and schedule its children, checking
    /// every prospective child against the call-wide duplicate set.
    fn classify(
        &self,
        arena: &mut [BuildNode],
        idx: usize,
        fetch: LayerFetch,
        visited: &mut HashMap<i32, String>,
        specs: &mut Vec<ChildSpec>,
    ) -> Result<(), RoutingError> {
        let node = &mut arena[idx];
        if !node.expand || node.ext.kind == ExtensionKind::External {
            return Ok(());
        }

        if let Some(target) = fetch.conditional_target {
            node.conditional_forward = Some(ConditionalForward {
                on: node.ext.forwarding_mode,
                target_number: target.number,
            });
        }

        if node.ext.immediate_forward() {
            let Some(target_id) = node.ext.forwarding_extension_id else {
                node.logs.push(NodeLog {
                    level: LogLevel::Warn,
                    message: "forwarding enabled without a target".to_string(),
                    related: None,
                });
                return Ok(());
            };
            let hops = node.forward_hops + 1;
            if hops > self.forward_depth_limit {
                return Err(RoutingError::ForwardLoop(self.forward_depth_limit));
            }
            let path = node.path.forward();
            if let Some(existing) = visited.get(&target_id) {
                node.logs.push(NodeLog {
                    level: LogLevel::Warn,
                    message: format!(
                        "forward target already routed at {}, forward disabled",
                        existing
                    ),
                    related: Some(path),
                });
                return Ok(());
            }
            visited.insert(target_id, path.as_str().to_string());
            specs.push(ChildSpec {
                parent: idx,
                slot: Slot::Forward,
                extension_id: target_id,
                path,
                active: true,
                expand: true,
                forward_hops: hops,
            });
            return Ok(());
        }

        // Lay out the ranks: stored ranks, the own device as rank-0 self
        // member where the kind calls for it, and the synthetic fallback
        // rank of a delayed forward.
        let mut layout: Vec<RankLayout> = fetch
            .ranks
            .unwrap_or_default()
            .into_iter()
            .map(|rank| RankLayout {
                index: rank.index,
                mode: rank.mode,
                delay: rank.delay,
                forward_fallback: false,
                members: rank
                    .members
                    .into_iter()
                    .map(|m| (m.kind, m.active, MemberSource::Extension(m.extension_id)))
                    .collect(),
            })
            .collect();

        let delayed = node.ext.delayed_forward();
        if node.ext.has_device() && (node.ext.kind == ExtensionKind::Multiring || delayed) {
            if layout.is_empty() {
                layout.push(RankLayout {
                    index: 0,
                    mode: RankMode::Default,
                    delay: None,
                    forward_fallback: false,
                    members: Vec::new(),
                });
            }
            layout[0]
                .members
                .insert(0, (MemberKind::Default, true, MemberSource::Device));
        }
        if delayed {
            if let Some(target_id) = node.ext.forwarding_extension_id {
                let hops = node.forward_hops + 1;
                if hops > self.forward_depth_limit {
                    return Err(RoutingError::ForwardLoop(self.forward_depth_limit));
                }
                let index = layout.last().map(|r| r.index + 1).unwrap_or(0);
                layout.push(RankLayout {
                    index,
                    mode: RankMode::Drop,
                    delay: node.ext.forwarding_delay,
                    forward_fallback: true,
                    members: vec![(MemberKind::Default, true, MemberSource::Extension(target_id))],
                });
            }
        }

        // Materialize the layout, running every prospective child through
        // the call-wide duplicate set in member order.
        let forward_hops = node.forward_hops;
        let mut ranks: Vec<BuildRank> = Vec::with_capacity(layout.len());
        for (rank_pos, rank) in layout.into_iter().enumerate() {
            let mut members: Vec<BuildMember> = Vec::with_capacity(rank.members.len());
            for (member_pos, (kind, stored_active, source)) in rank.members.into_iter().enumerate()
            {
                let extension_id = match source {
                    MemberSource::Device => {
                        members.push(BuildMember {
                            kind,
                            active: true,
                            child: BuildChild::Device,
                        });
                        continue;
                    }
                    MemberSource::Extension(id) => id,
                };
                let path = node.path.rank_member(rank.index, member_pos);
                let mut active = stored_active;
                if active {
                    if let Some(existing) = visited.get(&extension_id) {
                        node.logs.push(NodeLog {
                            level: LogLevel::Warn,
                            message: format!(
                                "extension id {} already routed at {}, deactivating {}",
                                extension_id, existing, path
                            ),
                            related: Some(path.clone()),
                        });
                        active = false;
                    } else {
                        visited.insert(extension_id, path.as_str().to_string());
                    }
                }
                specs.push(ChildSpec {
                    parent: idx,
                    slot: Slot::Member {
                        rank: rank_pos,
                        member: member_pos,
                    },
                    extension_id,
                    path,
                    active,
                    expand: active,
                    forward_hops: if rank.forward_fallback {
                        forward_hops + 1
                    } else {
                        forward_hops
                    },
                });
                members.push(BuildMember {
                    kind,
                    active,
                    child: BuildChild::Unresolved,
                });
            }
            ranks.push(BuildRank {
                index: rank.index,
                mode: rank.mode,
                delay: rank.delay,
                forward_fallback: rank.forward_fallback,
                members,
            });
        }

        node.ranks = ranks;
        Ok(())
    }

    async fn materialize(
        &self,
        arena: &mut Vec<BuildNode>,
        specs: Vec<ChildSpec>,
    ) -> Result<Vec<usize>, RoutingError> {
        let loaded = try_join_all(specs.into_iter().map(|spec| {
            let store = self.store;
            async move {
                let ext = store.extension_by_id(spec.extension_id).await?;
                Ok::<_, crate::store::StoreError>((spec, ext))
            }
        }))
        .await?;

        let mut next_layer = Vec::new();
        for (spec, ext) in loaded {
            let Some(ext) = ext else {
                let parent = &mut arena[spec.parent];
                parent.logs.push(NodeLog {
                    level: LogLevel::Warn,
                    message: format!("referenced extension id {} does not exist", spec.extension_id),
                    related: Some(spec.path),
                });
                if let Slot::Member { rank, member } = spec.slot {
                    parent.ranks[rank].members[member].child = BuildChild::Missing;
                }
                continue;
            };
            let idx = arena.len();
            arena.push(BuildNode {
                ext,
                path: spec.path,
                active: spec.active,
                expand: spec.expand && spec.active,
                forward_hops: spec.forward_hops,
                logs: Vec::new(),
                conditional_forward: None,
                forward_child: None,
                ranks: Vec::new(),
            });
            match spec.slot {
                Slot::Forward => arena[spec.parent].forward_child = Some(idx),
                Slot::Member { rank, member } => {
                    arena[spec.parent].ranks[rank].members[member].child = BuildChild::Node(idx)
                }
            }
            if arena[idx].expand {
                next_layer.push(idx);
            }
        }
        Ok(next_layer)
    }
}

/// Turn the arena into the owned routing tree. Children always live at
/// higher indices than their parents, so a reverse sweep finishes every
/// child before its parent consumes it.
fn assemble(arena: Vec<BuildNode>, root: usize) -> RouteNode {
    let mut finished: Vec<Option<RouteNode>> = Vec::with_capacity(arena.len());
    finished.resize_with(arena.len(), || None);
    let mut builds: Vec<Option<BuildNode>> = arena.into_iter().map(Some).collect();

    for idx in (0..builds.len()).rev() {
        let Some(build) = builds[idx].take() else {
            continue;
        };
        let forward = build
            .forward_child
            .and_then(|child| finished[child].take())
            .map(Box::new);
        let fork_ranks = build
            .ranks
            .into_iter()
            .map(|rank| TreeRank {
                index: rank.index,
                mode: rank.mode,
                delay: rank.delay,
                forward_fallback: rank.forward_fallback,
                members: rank
                    .members
                    .into_iter()
                    .filter_map(|member| {
                        let node = match member.child {
                            BuildChild::Device => MemberNode::Device,
                            BuildChild::Node(child) => {
                                MemberNode::Child(finished[child].take()?)
                            }
                            BuildChild::Unresolved | BuildChild::Missing => return None,
                        };
                        Some(TreeMember {
                            kind: member.kind,
                            active: member.active,
                            node,
                        })
                    })
                    .collect(),
            })
            .collect();
        finished[idx] = Some(RouteNode {
            extension: build.ext,
            tree_path: build.path,
            active: build.active,
            logs: build.logs,
            conditional_forward: build.conditional_forward,
            forward,
            fork_ranks,
        });
    }

    finished[root]
        .take()
        .expect("arena root is assembled last in the reverse sweep")
}

/// Bottom-up prune pass: deactivate branches that cannot produce a route.
/// Returns whether the node is routable; an unroutable root means NO_ROUTE.
pub fn prune(node: &mut RouteNode) -> bool {
    if !node.active {
        return false;
    }
    if let Some(fwd) = node.forward.as_mut() {
        if prune(fwd) {
            return true;
        }
        // Immediate forward with a dead target: the own device and ranks
        // were suppressed at discovery, nothing is left to ring.
        let path = fwd.tree_path.clone();
        node.log(LogLevel::Warn, "forward target is unroutable", Some(path));
        return false;
    }
    if node.fork_ranks.is_empty() {
        return node.extension.has_device() || node.extension.kind == ExtensionKind::External;
    }
    let mut routable = false;
    let mut pruned: Vec<TreePath> = Vec::new();
    for rank in &mut node.fork_ranks {
        for member in &mut rank.members {
            if !member.active {
                continue;
            }
            match &mut member.node {
                MemberNode::Device => routable = true,
                MemberNode::Child(child) => {
                    if prune(child) {
                        routable = true;
                    } else {
                        member.active = false;
                        pruned.push(child.tree_path.clone());
                    }
                }
            }
        }
    }
    for path in pruned {
        node.log(LogLevel::Info, "pruned unroutable branch", Some(path));
    }
    routable
}
