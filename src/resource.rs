//! Resource tracking: which streams/connections opened by a method are
//! guaranteed closed on every path out of it. Facts follow the state
//! machine `Open -> { Closed, OpenOnExceptionPath }` per tracked
//! resource, with equivalence classes tying wrappers to the resources
//! they decorate.

use std::cell::RefCell;
use std::collections::BTreeMap;

use crate::cfg::{Cfg, Edge, EdgeKind, Location};
use crate::dataflow::{DataflowResult, Domain};
use crate::engine::Severity;
use crate::ir::{CallSite, InsnKind, Instruction, Pc};
use crate::Result;

/// One tracked resource instance, identified by its creation site.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct ResourceId(u32);

/// Lifecycle state of a tracked resource. Ordered for the join:
/// a resource open on any incoming path is open after the merge.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum ResourceState {
    Closed,
    /// Open only along paths that left the creation region through an
    /// exception edge.
    OpenOnExceptionPath,
    Open,
}

/// Signature of a call that produces a trackable resource.
#[derive(Clone, Debug)]
pub struct FactorySpec {
    pub owner: String,
    pub name: String,
    /// Decorator constructors: the produced resource is unioned with
    /// every tracked argument, so closing either closes both.
    pub wraps_argument: bool,
}

/// Signature of a call that releases its receiver.
#[derive(Clone, Debug)]
pub struct CloserSpec {
    pub name: String,
}

/// Configurable factory/closer signature tables.
#[derive(Clone, Debug, Default)]
pub struct ResourceTable {
    factories: Vec<FactorySpec>,
    closers: Vec<CloserSpec>,
}

impl ResourceTable {
    pub fn new() -> Self {
        ResourceTable::default()
    }

    pub fn factory(mut self, owner: &str, name: &str, wraps_argument: bool) -> Self {
        self.factories.push(FactorySpec {
            owner: owner.to_string(),
            name: name.to_string(),
            wraps_argument,
        });
        self
    }

    pub fn closer(mut self, name: &str) -> Self {
        self.closers.push(CloserSpec {
            name: name.to_string(),
        });
        self
    }

    /// The common java.io stream and reader signatures.
    pub fn jdk_io() -> Self {
        ResourceTable::new()
            .factory("java/io/FileInputStream", "<init>", false)
            .factory("java/io/FileOutputStream", "<init>", false)
            .factory("java/io/FileReader", "<init>", false)
            .factory("java/io/FileWriter", "<init>", false)
            .factory("java/nio/file/Files", "newInputStream", false)
            .factory("java/nio/file/Files", "newOutputStream", false)
            .factory("java/net/Socket", "<init>", false)
            .factory("java/sql/DriverManager", "getConnection", false)
            .factory("java/io/BufferedInputStream", "<init>", true)
            .factory("java/io/BufferedOutputStream", "<init>", true)
            .factory("java/io/BufferedReader", "<init>", true)
            .factory("java/io/BufferedWriter", "<init>", true)
            .factory("java/io/InputStreamReader", "<init>", true)
            .factory("java/io/OutputStreamWriter", "<init>", true)
            .closer("close")
    }

    fn matching_factory(&self, call: &CallSite) -> Option<&FactorySpec> {
        self.factories
            .iter()
            .find(|spec| spec.owner == call.owner && spec.name == call.name)
    }

    fn matches_closer(&self, call: &CallSite) -> bool {
        self.closers.iter().any(|spec| spec.name == call.name)
    }
}

/// Where a resource id came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
enum Site {
    /// Parameter slot: pre-opened, externally owned, never reported.
    Param(u16),
    /// Factory call at this pc.
    Created(Pc),
}

#[derive(Default)]
struct Registry {
    ids: BTreeMap<Site, ResourceId>,
    sites: Vec<Site>,
}

impl Registry {
    fn id_for(&mut self, site: Site) -> ResourceId {
        if let Some(id) = self.ids.get(&site) {
            return *id;
        }
        let id = ResourceId(self.sites.len() as u32);
        self.sites.push(site);
        self.ids.insert(site, id);
        id
    }
}

/// Per-point resource frame: which slots hold which resource, the
/// state of every tracked resource, and the wrapper equivalence
/// classes (union-find parent links, roots absent).
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceFrame {
    locals: Vec<Option<ResourceId>>,
    stack: Vec<Option<ResourceId>>,
    parents: BTreeMap<ResourceId, ResourceId>,
    /// States keyed by equivalence-class root.
    states: BTreeMap<ResourceId, ResourceState>,
}

impl ResourceFrame {
    fn find(&self, id: ResourceId) -> ResourceId {
        let mut current = id;
        while let Some(parent) = self.parents.get(&current) {
            current = *parent;
        }
        current
    }

    fn union(&mut self, a: ResourceId, b: ResourceId) {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a == root_b {
            return;
        }
        let (root, absorbed) = (root_a.min(root_b), root_a.max(root_b));
        self.parents.insert(absorbed, root);
        if let Some(state) = self.states.remove(&absorbed) {
            let joined = self
                .states
                .get(&root)
                .map(|existing| (*existing).max(state))
                .unwrap_or(state);
            self.states.insert(root, joined);
        }
    }

    fn set_state(&mut self, id: ResourceId, state: ResourceState) {
        let root = self.find(id);
        self.states.insert(root, state);
    }

    /// Current state of a resource, or `None` while untracked.
    pub fn state_of(&self, id: ResourceId) -> Option<ResourceState> {
        self.states.get(&self.find(id)).copied()
    }

    /// Members of the resource's equivalence class, given the universe
    /// of ids handed out so far.
    fn class_members(&self, root: ResourceId, universe: u32) -> Vec<ResourceId> {
        (0..universe)
            .map(ResourceId)
            .filter(|id| self.find(*id) == root)
            .collect()
    }
}

/// A resource left open on some path out of the method.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResourceLeak {
    pub created_at: Pc,
    pub state: ResourceState,
    pub severity: Severity,
}

/// Resource-tracking dataflow domain. One instance per method.
pub struct ResourceTracking {
    table: ResourceTable,
    registry: RefCell<Registry>,
}

impl ResourceTracking {
    pub fn new(table: ResourceTable) -> Self {
        ResourceTracking {
            table,
            registry: RefCell::new(Registry::default()),
        }
    }

    /// Id of the resource created by the factory call at `pc`, once the
    /// analysis has seen it.
    pub fn resource_created_at(&self, pc: Pc) -> Option<ResourceId> {
        self.registry.borrow().ids.get(&Site::Created(pc)).copied()
    }

    fn is_interesting(&self, id: ResourceId) -> bool {
        matches!(
            self.registry.borrow().sites[id.0 as usize],
            Site::Created(_)
        )
    }

    fn creation_pc(&self, id: ResourceId) -> Option<Pc> {
        match self.registry.borrow().sites[id.0 as usize] {
            Site::Created(pc) => Some(pc),
            Site::Param(_) => None,
        }
    }

    /// Leaks observable at the synthetic exit: resources still open
    /// (normal-path leak) or open only on exception paths (reduced
    /// priority). Classes containing an externally-owned parameter are
    /// never reported.
    pub fn leaks(
        &self,
        cfg: &Cfg,
        result: &DataflowResult<Option<ResourceFrame>>,
    ) -> Vec<ResourceLeak> {
        let Some(frame) = result.block_entry(cfg.exit()).as_ref() else {
            return Vec::new();
        };
        let universe = self.registry.borrow().sites.len() as u32;

        let mut leaks = Vec::new();
        for (root, state) in &frame.states {
            if *state == ResourceState::Closed {
                continue;
            }
            let members = frame.class_members(*root, universe);
            if !members.iter().all(|member| self.is_interesting(*member)) {
                continue;
            }
            let Some(created_at) = members
                .iter()
                .filter_map(|member| self.creation_pc(*member))
                .min()
            else {
                continue;
            };
            let severity = match state {
                ResourceState::Open => Severity::Normal,
                ResourceState::OpenOnExceptionPath => Severity::Low,
                ResourceState::Closed => continue,
            };
            leaks.push(ResourceLeak {
                created_at,
                state: *state,
                severity,
            });
        }
        leaks.sort_by_key(|leak| leak.created_at);
        leaks
    }

    fn pop(&self, frame: &mut ResourceFrame) -> Option<ResourceId> {
        frame.stack.pop().flatten()
    }

    fn exec(&self, frame: &mut ResourceFrame, insn: &Instruction) -> Result<()> {
        match &insn.kind {
            InsnKind::Invoke(call) => self.exec_call(frame, call, insn.pc)?,
            InsnKind::LoadLocal { slot } => {
                let value = frame.locals.get(*slot as usize).copied().flatten();
                frame.stack.push(value);
            }
            InsnKind::StoreLocal { slot } => {
                let value = self.pop(frame);
                if let Some(local) = frame.locals.get_mut(*slot as usize) {
                    *local = value;
                }
            }
            InsnKind::Dup => {
                let top = frame.stack.last().copied().flatten();
                frame.stack.push(top);
            }
            InsnKind::Const(_) => frame.stack.push(None),
            InsnKind::GetField(field) => {
                if !field.is_static {
                    self.pop(frame);
                }
                frame.stack.push(None);
            }
            InsnKind::PutField(field) => {
                self.pop(frame);
                if !field.is_static {
                    self.pop(frame);
                }
            }
            InsnKind::ArrayLoad => {
                self.pop(frame);
                self.pop(frame);
                frame.stack.push(None);
            }
            InsnKind::ArrayStore => {
                for _ in 0..3 {
                    self.pop(frame);
                }
            }
            InsnKind::ArrayLength => {
                self.pop(frame);
                frame.stack.push(None);
            }
            InsnKind::Arith(op) => {
                let pops = if *op == crate::ir::ArithOp::Neg { 1 } else { 2 };
                for _ in 0..pops {
                    self.pop(frame);
                }
                frame.stack.push(None);
            }
            InsnKind::Branch { with_zero, .. } => {
                let pops = if *with_zero { 1 } else { 2 };
                for _ in 0..pops {
                    self.pop(frame);
                }
            }
            InsnKind::Switch { .. } => {
                self.pop(frame);
            }
            InsnKind::Return { has_value } => {
                if *has_value {
                    self.pop(frame);
                }
            }
            InsnKind::Throw | InsnKind::Pop => {
                self.pop(frame);
            }
            InsnKind::Goto { .. } | InsnKind::Nop => {}
        }
        Ok(())
    }

    fn exec_call(&self, frame: &mut ResourceFrame, call: &CallSite, pc: Pc) -> Result<()> {
        let popped_count = call.popped_args()?;
        let mut popped = Vec::with_capacity(popped_count);
        for _ in 0..popped_count {
            popped.push(frame.stack.pop().flatten());
        }
        // `popped` is top-first; the receiver of an instance call is last.

        if let Some(factory) = self.table.matching_factory(call) {
            let id = self.registry.borrow_mut().id_for(Site::Created(pc));
            frame.set_state(id, ResourceState::Open);
            if factory.wraps_argument {
                for argument in popped.iter().flatten() {
                    frame.union(id, *argument);
                }
            }
            if call.pushes_result()? {
                frame.stack.push(Some(id));
            }
            return Ok(());
        }

        if self.table.matches_closer(call)
            && let Some(receiver) = popped.last().copied().flatten()
        {
            frame.set_state(receiver, ResourceState::Closed);
        }
        if call.pushes_result()? {
            frame.stack.push(None);
        }
        Ok(())
    }
}

impl Domain for ResourceTracking {
    /// `None` marks a not-yet-reached point.
    type Fact = Option<ResourceFrame>;

    fn name(&self) -> &'static str {
        "resource-tracking"
    }

    fn bottom(&self, _cfg: &Cfg) -> Self::Fact {
        None
    }

    fn initial(&self, cfg: &Cfg) -> Self::Fact {
        let mut registry = self.registry.borrow_mut();
        let mut locals = vec![None; cfg.max_locals() as usize];
        let mut states = BTreeMap::new();
        // Parameters are pre-opened but externally owned: tracked so
        // wrapper unions see them, never reported on their own.
        for slot in 0..cfg.param_slots() {
            let id = registry.id_for(Site::Param(slot));
            locals[slot as usize] = Some(id);
            states.insert(id, ResourceState::Open);
        }
        Some(ResourceFrame {
            locals,
            stack: Vec::new(),
            parents: BTreeMap::new(),
            states,
        })
    }

    fn transfer(
        &self,
        fact: &Self::Fact,
        insn: &Instruction,
        _location: Location,
    ) -> Result<Self::Fact> {
        let Some(frame) = fact else {
            return Ok(None);
        };
        let mut next = frame.clone();
        self.exec(&mut next, insn)?;
        Ok(Some(next))
    }

    fn join(&self, a: &Self::Fact, b: &Self::Fact) -> Self::Fact {
        let (a, b) = match (a, b) {
            (None, other) | (other, None) => return other.clone(),
            (Some(a), Some(b)) => (a, b),
        };
        if a == b {
            return Some(a.clone());
        }

        let mut merged = a.clone();
        // Union relations from both paths apply after the merge.
        for (child, parent) in &b.parents {
            merged.union(*child, *parent);
        }
        for (id, state) in &b.states {
            let root = merged.find(*id);
            let joined = merged
                .states
                .get(&root)
                .map(|existing| (*existing).max(*state))
                .unwrap_or(*state);
            merged.states.insert(root, joined);
        }

        // Slot-wise merge. A resource held on only one path stays
        // visible so a later close on the surviving reference counts;
        // the bias is toward missing a leak, not inventing one.
        let merge_slot = |left: Option<ResourceId>, right: Option<ResourceId>| match (left, right) {
            (Some(a), Some(b)) if merged.find(a) == merged.find(b) => Some(a.min(b)),
            (Some(_), Some(_)) => None,
            (one, None) | (None, one) => one,
        };
        let depth = merged.stack.len().min(b.stack.len());
        let locals: Vec<Option<ResourceId>> = merged
            .locals
            .iter()
            .enumerate()
            .map(|(slot, value)| merge_slot(*value, b.locals.get(slot).copied().flatten()))
            .collect();
        let stack: Vec<Option<ResourceId>> = merged.stack[..depth]
            .iter()
            .zip(&b.stack[..depth])
            .map(|(left, right)| merge_slot(*left, *right))
            .collect();
        merged.locals = locals;
        merged.stack = stack;

        Some(merged)
    }

    /// Exception edges (and exits from a throw) downgrade `Open` to
    /// `OpenOnExceptionPath`.
    fn edge(&self, fact: &Self::Fact, edge: &Edge, cfg: &Cfg) -> Result<Self::Fact> {
        let Some(frame) = fact else {
            return Ok(None);
        };
        let exceptional = edge.kind == EdgeKind::Exception
            || cfg
                .block_insns(edge.source)
                .last()
                .is_some_and(|insn| matches!(insn.kind, InsnKind::Throw));
        if !exceptional {
            return Ok(fact.clone());
        }
        let mut next = frame.clone();
        for state in next.states.values_mut() {
            if *state == ResourceState::Open {
                *state = ResourceState::OpenOnExceptionPath;
            }
        }
        Ok(Some(next))
    }
}
