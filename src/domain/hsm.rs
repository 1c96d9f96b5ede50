//! Hierarchical State Machine Engine
//!
//! Generic engine behind every device machine: states nest through
//! non-owning parent references, unhandled messages bubble from the active
//! leaf toward the root, and transitions follow the least-common-ancestor
//! protocol (children exit before their parent, a parent enters before its
//! children).
//!
//! The engine has no fatal-error path at runtime. An unknown transition
//! target or an undispatched message is accepted but inert; the only
//! rejections happen at registration time, where the hierarchy is validated
//! against [`MAX_STATE_DEPTH`].

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, warn};

/// Maximum depth of a state hierarchy (root counts as 1). Chains deeper than
/// this are rejected when the state is registered.
pub const MAX_STATE_DEPTH: usize = 5;

/// Outcome of a state's dispatch predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Not interested; the engine retries at the parent state.
    Unhandled,
    /// Consumed, optionally requesting a transition to the named state. The
    /// engine performs the transition after the handler returns, so handlers
    /// never re-enter the machine.
    Handled(Option<&'static str>),
}

/// One named state owned by a machine.
///
/// `parent` is a name reference only; the machine owns every state through
/// its registration map.
pub trait State<C, M>: Send {
    fn name(&self) -> &'static str;

    fn parent(&self) -> Option<&'static str> {
        None
    }

    fn on_entry(&mut self, _ctx: &mut C) {}

    fn on_exit(&mut self, _ctx: &mut C) {}

    fn dispatch(&mut self, ctx: &mut C, msg: &M) -> Dispatch;
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum HsmError {
    #[error("state hierarchy exceeds maximum depth {MAX_STATE_DEPTH}")]
    DepthExceeded,
    #[error("parent state `{0}` is not registered")]
    UnknownParent(&'static str),
}

/// The machine: an owner map of named states plus the active ancestor chain.
///
/// `active` always equals the parent chain of the active leaf, root first.
pub struct StateMachine<C, M> {
    states: HashMap<&'static str, Box<dyn State<C, M>>>,
    active: Vec<&'static str>,
}

impl<C, M> Default for StateMachine<C, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C, M> StateMachine<C, M> {
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
            active: Vec::new(),
        }
    }

    /// Register a state under its name. A name already present keeps its
    /// first registration and the call is a silent no-op. Parents must be
    /// registered before their children so the chain depth can be validated
    /// here rather than discovered at transition time.
    pub fn register(&mut self, state: Box<dyn State<C, M>>) -> Result<(), HsmError> {
        let name = state.name();
        if self.states.contains_key(name) {
            debug!(state = name, "duplicate state registration ignored");
            return Ok(());
        }

        let mut depth = 1;
        let mut cursor = state.parent();
        while let Some(parent) = cursor {
            let parent_state = self
                .states
                .get(parent)
                .ok_or(HsmError::UnknownParent(parent))?;
            depth += 1;
            if depth > MAX_STATE_DEPTH {
                return Err(HsmError::DepthExceeded);
            }
            cursor = parent_state.parent();
        }

        self.states.insert(name, state);
        Ok(())
    }

    /// Set the initial active leaf, entering from the root down. Unknown
    /// names leave the leaf unset.
    pub fn init_state(&mut self, ctx: &mut C, name: &'static str) {
        self.transition(ctx, name);
    }

    /// Least-common-ancestor transition to the named state.
    ///
    /// The destination's ancestor chain is compared with the current one;
    /// everything above the shared prefix is exited deepest first, then the
    /// new branch is entered shallowest first. An unregistered destination is
    /// a no-op.
    pub fn transition(&mut self, ctx: &mut C, name: &'static str) {
        let Some(dest) = self.chain_of(name) else {
            warn!(state = name, "transition to unregistered state ignored");
            return;
        };

        let common = self
            .active
            .iter()
            .zip(dest.iter())
            .take_while(|(a, b)| a == b)
            .count();

        for &exiting in self.active[common..].iter().rev() {
            if let Some(state) = self.states.get_mut(exiting) {
                state.on_exit(ctx);
            }
        }

        self.active = dest;

        for i in common..self.active.len() {
            let entering = self.active[i];
            if let Some(state) = self.states.get_mut(entering) {
                state.on_entry(ctx);
            }
        }
    }

    /// Deliver a message to the active leaf, bubbling to ancestors until one
    /// handles it. Returns whether any state did. Nothing changes when the
    /// message falls off the root.
    pub fn process_message(&mut self, ctx: &mut C, msg: &M) -> bool {
        let mut idx = self.active.len();
        while idx > 0 {
            idx -= 1;
            let name = self.active[idx];
            let outcome = match self.states.get_mut(name) {
                Some(state) => state.dispatch(ctx, msg),
                None => continue,
            };
            match outcome {
                Dispatch::Unhandled => continue,
                Dispatch::Handled(target) => {
                    if let Some(target) = target {
                        self.transition(ctx, target);
                    }
                    return true;
                }
            }
        }
        false
    }

    /// Name of the active leaf, if one has been initialized.
    pub fn state(&self) -> Option<&'static str> {
        self.active.last().copied()
    }

    /// Root-first ancestor chain of the named state, walking parent
    /// references. `None` when the name is unregistered.
    fn chain_of(&self, name: &'static str) -> Option<Vec<&'static str>> {
        if !self.states.contains_key(name) {
            return None;
        }
        let mut chain = Vec::with_capacity(MAX_STATE_DEPTH);
        let mut cursor = Some(name);
        while let Some(current) = cursor {
            chain.push(current);
            if chain.len() > MAX_STATE_DEPTH {
                // Unreachable when registration validated the chain.
                warn!(state = name, "ancestor chain exceeds maximum depth");
                return None;
            }
            cursor = self.states.get(current).and_then(|s| s.parent());
        }
        chain.reverse();
        Some(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Log = Vec<String>;

    /// Test state that records entry/exit/dispatch into the context log.
    struct Probe {
        name: &'static str,
        parent: Option<&'static str>,
        handles: &'static [&'static str],
        target: Option<&'static str>,
    }

    impl Probe {
        fn new(name: &'static str, parent: Option<&'static str>) -> Box<Self> {
            Box::new(Self {
                name,
                parent,
                handles: &[],
                target: None,
            })
        }

        fn handling(
            name: &'static str,
            parent: Option<&'static str>,
            handles: &'static [&'static str],
            target: Option<&'static str>,
        ) -> Box<Self> {
            Box::new(Self {
                name,
                parent,
                handles,
                target,
            })
        }
    }

    impl State<Log, &'static str> for Probe {
        fn name(&self) -> &'static str {
            self.name
        }

        fn parent(&self) -> Option<&'static str> {
            self.parent
        }

        fn on_entry(&mut self, log: &mut Log) {
            log.push(format!("enter {}", self.name));
        }

        fn on_exit(&mut self, log: &mut Log) {
            log.push(format!("exit {}", self.name));
        }

        fn dispatch(&mut self, log: &mut Log, msg: &&'static str) -> Dispatch {
            if self.handles.contains(msg) {
                log.push(format!("{} handled {}", self.name, msg));
                Dispatch::Handled(self.target)
            } else {
                Dispatch::Unhandled
            }
        }
    }

    /// root ── a ── a1
    ///      └─ b ── b1
    fn tree() -> StateMachine<Log, &'static str> {
        let mut hsm = StateMachine::new();
        hsm.register(Probe::new("root", None)).unwrap();
        hsm.register(Probe::new("a", Some("root"))).unwrap();
        hsm.register(Probe::new("a1", Some("a"))).unwrap();
        hsm.register(Probe::new("b", Some("root"))).unwrap();
        hsm.register(Probe::new("b1", Some("b"))).unwrap();
        hsm
    }

    #[test]
    fn first_registration_wins() {
        let mut hsm: StateMachine<Log, &'static str> = StateMachine::new();
        hsm.register(Probe::handling("s", None, &["m"], None))
            .unwrap();
        // Second registration under the same name is dropped silently.
        hsm.register(Probe::new("s", None)).unwrap();

        let mut log = Log::new();
        hsm.init_state(&mut log, "s");
        assert!(hsm.process_message(&mut log, &"m"));
        assert!(log.contains(&"s handled m".to_string()));
    }

    #[test]
    fn unknown_parent_is_rejected() {
        let mut hsm: StateMachine<Log, &'static str> = StateMachine::new();
        assert_eq!(
            hsm.register(Probe::new("child", Some("missing"))),
            Err(HsmError::UnknownParent("missing"))
        );
    }

    #[test]
    fn over_deep_chain_is_rejected() {
        let mut hsm: StateMachine<Log, &'static str> = StateMachine::new();
        hsm.register(Probe::new("d1", None)).unwrap();
        hsm.register(Probe::new("d2", Some("d1"))).unwrap();
        hsm.register(Probe::new("d3", Some("d2"))).unwrap();
        hsm.register(Probe::new("d4", Some("d3"))).unwrap();
        hsm.register(Probe::new("d5", Some("d4"))).unwrap();
        assert_eq!(
            hsm.register(Probe::new("d6", Some("d5"))),
            Err(HsmError::DepthExceeded)
        );
    }

    #[test]
    fn init_enters_root_down() {
        let mut hsm = tree();
        let mut log = Log::new();
        hsm.init_state(&mut log, "a1");
        assert_eq!(log, vec!["enter root", "enter a", "enter a1"]);
        assert_eq!(hsm.state(), Some("a1"));
    }

    #[test]
    fn init_with_unknown_name_leaves_leaf_unset() {
        let mut hsm = tree();
        let mut log = Log::new();
        hsm.init_state(&mut log, "nope");
        assert!(log.is_empty());
        assert_eq!(hsm.state(), None);
    }

    #[test]
    fn transition_exits_and_enters_around_common_ancestor() {
        let mut hsm = tree();
        let mut log = Log::new();
        hsm.init_state(&mut log, "a1");
        log.clear();

        hsm.transition(&mut log, "b1");
        // root is shared: children exit before parents, parents enter before
        // children, root itself is untouched.
        assert_eq!(log, vec!["exit a1", "exit a", "enter b", "enter b1"]);
        assert_eq!(hsm.state(), Some("b1"));
    }

    #[test]
    fn transition_to_ancestor_only_exits_children() {
        let mut hsm = tree();
        let mut log = Log::new();
        hsm.init_state(&mut log, "a1");
        log.clear();

        hsm.transition(&mut log, "root");
        assert_eq!(log, vec!["exit a1", "exit a"]);
        assert_eq!(hsm.state(), Some("root"));
    }

    #[test]
    fn transition_to_unknown_name_is_inert() {
        let mut hsm = tree();
        let mut log = Log::new();
        hsm.init_state(&mut log, "a1");
        log.clear();

        hsm.transition(&mut log, "ghost");
        assert!(log.is_empty());
        assert_eq!(hsm.state(), Some("a1"));
    }

    #[test]
    fn dispatch_bubbles_leaf_first() {
        let mut hsm: StateMachine<Log, &'static str> = StateMachine::new();
        hsm.register(Probe::handling("top", None, &["up", "both"], None))
            .unwrap();
        hsm.register(Probe::handling("leaf", Some("top"), &["both"], None))
            .unwrap();

        let mut log = Log::new();
        hsm.init_state(&mut log, "leaf");
        log.clear();

        assert!(hsm.process_message(&mut log, &"both"));
        assert_eq!(log, vec!["leaf handled both"]);

        log.clear();
        assert!(hsm.process_message(&mut log, &"up"));
        assert_eq!(log, vec!["top handled up"]);
    }

    #[test]
    fn unhandled_message_changes_nothing() {
        let mut hsm = tree();
        let mut log = Log::new();
        hsm.init_state(&mut log, "a1");
        log.clear();

        assert!(!hsm.process_message(&mut log, &"noise"));
        assert!(log.is_empty());
        assert_eq!(hsm.state(), Some("a1"));
    }

    #[test]
    fn handler_requested_transition_runs_after_dispatch() {
        let mut hsm: StateMachine<Log, &'static str> = StateMachine::new();
        hsm.register(Probe::new("root", None)).unwrap();
        hsm.register(Probe::handling("x", Some("root"), &["go"], Some("y")))
            .unwrap();
        hsm.register(Probe::new("y", Some("root"))).unwrap();

        let mut log = Log::new();
        hsm.init_state(&mut log, "x");
        log.clear();

        assert!(hsm.process_message(&mut log, &"go"));
        assert_eq!(log, vec!["x handled go", "exit x", "enter y"]);
        assert_eq!(hsm.state(), Some("y"));
    }
}
