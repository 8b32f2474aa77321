use crate::config::RoutingConfig;
use crate::error::RoutingError;
use crate::models::{MemberKind, RankMode};
use crate::routing::{
    symbolic_name, CallContext, CallTarget, MemberNode, RouteNode, RoutingResult, TreePath,
};
use tracing::debug;

/// Stage-1 phase B: a post-order fold over the routing tree. Parents consume
/// their children's already-built results; every inner node's result is
/// collected for the cache, children before parents.
pub struct RouteGenerator<'a> {
    ctx: &'a CallContext,
    cfg: &'a RoutingConfig,
    entries: Vec<(TreePath, RoutingResult)>,
}

impl<'a> RouteGenerator<'a> {
    pub fn new(ctx: &'a CallContext, cfg: &'a RoutingConfig) -> Self {
        Self {
            ctx,
            cfg,
            entries: Vec::new(),
        }
    }

    /// Returns the root result and the inner-node cache entries.
    pub fn generate(
        mut self,
        root: &RouteNode,
    ) -> Result<(RoutingResult, Vec<(TreePath, RoutingResult)>), RoutingError> {
        let mut result = self.visit(root)?;

        if let RoutingResult::Fork { target, .. } = &mut result {
            // The root is answered inline with its fork targets; its target
            // is the engine's fork primitive, never a deferred cache name.
            target.target = "fork".to_string();
        }
        let forwarded =
            root.forward.is_some() || root.fork_ranks.iter().any(|rank| rank.forward_fallback);
        if forwarded {
            let target = result.target_mut();
            target.set("x_originally_called", self.ctx.called.clone());
            target.set("osip_X-Originally-Called", self.ctx.called.clone());
        }
        self.patch_entry(&root.tree_path, &result);

        debug!(
            call_id = %self.ctx.call_id,
            entries = self.entries.len(),
            "route generation complete"
        );
        Ok((result, self.entries))
    }

    fn visit(&mut self, node: &RouteNode) -> Result<RoutingResult, RoutingError> {
        let mut result = self.visit_expansion(node)?;
        if let Some(cond) = &node.conditional_forward {
            let target = result.target_mut();
            target.set("fork.stop", cond.stop_reason());
            target.set("x_forward_to", format!("lateroute/{}", cond.target_number));
            self.patch_entry(&node.tree_path, &result);
        }
        Ok(result)
    }

    fn visit_expansion(&mut self, node: &RouteNode) -> Result<RoutingResult, RoutingError> {
        if let Some(fwd) = &node.forward {
            // Immediate forward: the node routes as its target does, under
            // its own deferred name.
            let result = self.visit(fwd)?;
            self.entries.push((node.tree_path.clone(), result.clone()));
            return Ok(result);
        }

        if node.fork_ranks.is_empty() {
            return Ok(RoutingResult::Simple {
                target: self.device_target(node)?,
            });
        }

        let forward_delay: Option<i64> = node
            .fork_ranks
            .iter()
            .any(|rank| rank.forward_fallback)
            .then(|| i64::from(node.extension.forwarding_delay.unwrap_or(0)));

        let mut fork_targets: Vec<CallTarget> = Vec::new();
        let mut accumulated: i64 = 0;
        let mut preempted = false;
        for rank in &node.fork_ranks {
            let mut rank_targets: Vec<CallTarget> = Vec::new();
            for member in &rank.members {
                let mut target = match &member.node {
                    MemberNode::Device => {
                        if !member.active {
                            continue;
                        }
                        self.device_target(node)?
                    }
                    MemberNode::Child(child) if !child.is_leaf() => {
                        // Inner children are visited even when they will not
                        // ring, so their deferred routes stay resolvable.
                        let result = self.visit(child)?;
                        if !member.active || !child.active {
                            continue;
                        }
                        result.target().clone()
                    }
                    MemberNode::Child(child) => {
                        if !member.active || !child.active {
                            continue;
                        }
                        self.visit(child)?.target().clone()
                    }
                };
                if member.kind == MemberKind::Auxiliary {
                    target.set("fork.calltype", "auxiliary");
                }
                rank_targets.push(target);
            }

            if preempted && !rank.forward_fallback {
                continue;
            }
            if rank_targets.is_empty() {
                continue;
            }
            if !fork_targets.is_empty() {
                let separator = if rank.forward_fallback {
                    let remaining = forward_delay
                        .map(|delay| (delay - accumulated).max(0))
                        .unwrap_or(0);
                    format!("|drop={}", remaining)
                } else {
                    let delay = i64::from(rank.delay.unwrap_or(0));
                    match rank.mode {
                        RankMode::Default => "|".to_string(),
                        RankMode::Next | RankMode::Drop => {
                            if let Some(limit) = forward_delay {
                                if accumulated + delay >= limit {
                                    // The forward fires before this rank
                                    // would start ringing.
                                    preempted = true;
                                    continue;
                                }
                            }
                            accumulated += delay;
                            if rank.mode == RankMode::Next {
                                format!("|next={}", delay)
                            } else {
                                format!("|drop={}", delay)
                            }
                        }
                    }
                };
                fork_targets.push(CallTarget::new(separator));
            }
            fork_targets.extend(rank_targets);
        }

        let mut target = CallTarget::new(symbolic_name(&self.ctx.call_id, &node.tree_path));
        self.apply_base_params(&mut target);
        let result = RoutingResult::Fork {
            target,
            fork_targets,
        };
        self.entries.push((node.tree_path.clone(), result.clone()));
        Ok(result)
    }

    /// Terminal routing target for an extension's own device, or for a
    /// number outside the PBX.
    fn device_target(&self, node: &RouteNode) -> Result<CallTarget, RoutingError> {
        let ext = &node.extension;
        let mut target = match ext.yate_id {
            Some(id) if id == self.cfg.local_server_id => {
                let mut target = CallTarget::new(format!("lateroute/{}", ext.number));
                // Tells the engine to consult stage 2 for registrations.
                target.set("eventphone_stage2", "1");
                target
            }
            Some(id) => match self.cfg.server(id) {
                Some(server) => {
                    let mut target =
                        CallTarget::new(format!("sip/sip:{}@{}", ext.number, server.address));
                    target.set("oconnection_id", server.oconnection_id.clone());
                    target
                }
                None => {
                    return Err(RoutingError::NoRoute(format!(
                        "unknown home server {} for {}",
                        id, ext.number
                    )))
                }
            },
            None => {
                if !self.ctx.caller.dialout_allowed {
                    return Err(RoutingError::Forbidden(ext.number.clone()));
                }
                CallTarget::new(format!(
                    "sip/sip:{}@{}",
                    ext.number, self.cfg.outbound_gateway
                ))
            }
        };
        self.apply_base_params(&mut target);
        if ext.yate_id.is_none() {
            // Outgoing caller-id overrides apply on the way out of the PBX.
            if let Some(number) = &self.ctx.caller.outgoing_extension {
                target.set("caller", number.clone());
            }
            if let Some(name) = &self.ctx.caller.outgoing_name {
                target.set("callername", name.clone());
            }
        }
        if let Some(name) = &ext.name {
            target.set("calledname", name.clone());
        }
        if ext.ringback {
            target.set("ringback", "1");
        }
        Ok(target)
    }

    /// The call id rides on every parameter map under both the internal and
    /// the outgoing-SIP-header key, so downstream hops keep correlation.
    fn apply_base_params(&self, target: &mut CallTarget) {
        target.set("x_eventphone_id", self.ctx.call_id.clone());
        target.set("osip_X-Eventphone-Id", self.ctx.call_id.clone());
        if let Some(name) = &self.ctx.caller.name {
            target.set("callername", name.clone());
        }
        if let Some(lang) = &self.ctx.caller.lang {
            target.set("osip_X-Caller-Language", lang.clone());
        }
    }

    fn patch_entry(&mut self, path: &TreePath, result: &RoutingResult) {
        if let Some(entry) = self.entries.iter_mut().rev().find(|(p, _)| p == path) {
            entry.1 = result.clone();
        }
    }
}
