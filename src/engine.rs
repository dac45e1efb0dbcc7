//! Analysis session: one class worth of method bodies with shared,
//! lazily-built CFGs and value numberings. A method whose analysis
//! fails is skipped with a warning; the rest of the class is still
//! analyzed.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::Context;
use log::warn;
use serde::Serialize;

use crate::callgraph::{CallGraph, SideEffectAccumulator, SideEffectMap, SideEffectStatus};
use crate::cfg::Cfg;
use crate::dataflow::{analyze, AnalysisConfig, DataflowResult};
use crate::ir::{MethodBody, MethodKey, Pc};
use crate::resource::{ResourceState, ResourceTable, ResourceTracking};
use crate::valnum::{Frame, ValueNumbering};
use crate::Result;

/// Report priority of a finding.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Normal,
    Low,
}

/// One reportable analysis result.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Finding {
    pub rule: String,
    pub severity: Severity,
    pub method: String,
    pub pc: Pc,
    pub message: String,
}

/// Consumer of findings: a collector, a formatter, a SARIF writer.
pub trait ReportSink {
    fn report(&mut self, finding: Finding);
}

impl ReportSink for Vec<Finding> {
    fn report(&mut self, finding: Finding) {
        self.push(finding);
    }
}

/// Value numbering of one method together with its per-point frames.
pub struct MethodValues {
    pub numbering: ValueNumbering,
    pub frames: DataflowResult<Option<Frame>>,
}

/// Shared analysis state for the methods of one class.
pub struct AnalysisSession {
    config: AnalysisConfig,
    methods: BTreeMap<MethodKey, MethodBody>,
    side_effects: SideEffectMap,
    cfgs: RefCell<BTreeMap<MethodKey, Option<Rc<Cfg>>>>,
    values: RefCell<BTreeMap<MethodKey, Option<Rc<MethodValues>>>>,
    skipped: RefCell<Vec<(MethodKey, String)>>,
}

impl AnalysisSession {
    /// Build a session over the given method bodies. Runs the
    /// interprocedural side-effect closure up front; per-method
    /// analyses stay lazy.
    pub fn new(
        methods: BTreeMap<MethodKey, MethodBody>,
        config: AnalysisConfig,
    ) -> Result<AnalysisSession> {
        let graph = CallGraph::build(&methods);
        let mut accumulator = SideEffectAccumulator::new();
        for (key, body) in &methods {
            accumulator.record(key.clone(), SideEffectStatus::of_body(&key.owner, body));
        }
        let side_effects = accumulator.finalize(&graph, &config)?;
        Ok(AnalysisSession {
            config,
            methods,
            side_effects,
            cfgs: RefCell::new(BTreeMap::new()),
            values: RefCell::new(BTreeMap::new()),
            skipped: RefCell::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodKey> {
        self.methods.keys()
    }

    pub fn body(&self, key: &MethodKey) -> Option<&MethodBody> {
        self.methods.get(key)
    }

    /// Interprocedural side-effect verdict for a known method.
    pub fn side_effect_of(&self, key: &MethodKey) -> Option<SideEffectStatus> {
        self.side_effects.get(key).copied()
    }

    /// Methods skipped so far, with the failure that caused each skip.
    pub fn skipped(&self) -> Vec<(MethodKey, String)> {
        self.skipped.borrow().clone()
    }

    /// CFG of one method, built on first use. `None` for unknown keys
    /// and for methods whose CFG construction failed.
    pub fn cfg(&self, key: &MethodKey) -> Option<Rc<Cfg>> {
        if let Some(cached) = self.cfgs.borrow().get(key) {
            return cached.clone();
        }
        let built = self.build_cfg(key);
        self.cfgs.borrow_mut().insert(key.clone(), built.clone());
        built
    }

    fn build_cfg(&self, key: &MethodKey) -> Option<Rc<Cfg>> {
        let body = self.methods.get(key)?;
        match Cfg::build(body).with_context(|| format!("building CFG of {key}")) {
            Ok(cfg) => Some(Rc::new(cfg)),
            Err(error) => {
                self.skip(key, &error);
                None
            }
        }
    }

    /// Value numbering of one method, run on first use with the
    /// session's side-effect map.
    pub fn values(&self, key: &MethodKey) -> Option<Rc<MethodValues>> {
        if let Some(cached) = self.values.borrow().get(key) {
            return cached.clone();
        }
        let computed = self.compute_values(key);
        self.values.borrow_mut().insert(key.clone(), computed.clone());
        computed
    }

    fn compute_values(&self, key: &MethodKey) -> Option<Rc<MethodValues>> {
        let cfg = self.cfg(key)?;
        let numbering = ValueNumbering::with_side_effects(self.side_effects.clone());
        match analyze(&cfg, &numbering, &self.config)
            .with_context(|| format!("value numbering of {key}"))
        {
            Ok(frames) => Some(Rc::new(MethodValues { numbering, frames })),
            Err(error) => {
                self.skip(key, &error);
                None
            }
        }
    }

    /// Run resource tracking over every method and report each leak.
    pub fn report_resource_leaks(&self, table: &ResourceTable, sink: &mut dyn ReportSink) {
        for key in self.methods.keys() {
            let Some(cfg) = self.cfg(key) else {
                continue;
            };
            let tracking = ResourceTracking::new(table.clone());
            let result = match analyze(&cfg, &tracking, &self.config)
                .with_context(|| format!("resource tracking of {key}"))
            {
                Ok(result) => result,
                Err(error) => {
                    self.skip(key, &error);
                    continue;
                }
            };
            for leak in tracking.leaks(&cfg, &result) {
                let message = match leak.state {
                    ResourceState::OpenOnExceptionPath => format!(
                        "resource opened at pc {} may stay open when an exception is thrown",
                        leak.created_at
                    ),
                    _ => format!(
                        "resource opened at pc {} is not closed on every path",
                        leak.created_at
                    ),
                };
                sink.report(Finding {
                    rule: "unclosed-resource".to_string(),
                    severity: leak.severity,
                    method: key.to_string(),
                    pc: leak.created_at,
                    message,
                });
            }
        }
    }

    fn skip(&self, key: &MethodKey, error: &anyhow::Error) {
        warn!("skipping {key}: {error:#}");
        self.skipped
            .borrow_mut()
            .push((key.clone(), format!("{error:#}")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Cmp, ConstValue, InsnKind};
    use crate::testkit::{
        branch, getfield, invoke_ctor, invoke_static, load, method, ret, store,
    };

    fn key(name: &str) -> MethodKey {
        MethodKey {
            owner: "com/example/App".to_string(),
            name: name.to_string(),
            descriptor: "()V".to_string(),
        }
    }

    fn leaky_body() -> MethodBody {
        method(vec![
            InsnKind::Const(ConstValue::Str("data.txt".to_string())), // 0
            invoke_ctor("java/io/FileInputStream", "(Ljava/lang/String;)V"), // 1
            store(1),                                                 // 2
            ret(false),                                               // 3
        ])
    }

    fn broken_body() -> MethodBody {
        // Branch into the middle of nowhere.
        method(vec![load(0), branch(Cmp::Ne, 77), ret(false)])
    }

    #[test]
    fn broken_methods_are_skipped_not_fatal() {
        let mut methods = BTreeMap::new();
        methods.insert(key("bad"), broken_body());
        methods.insert(key("good"), leaky_body());
        let session =
            AnalysisSession::new(methods, AnalysisConfig::default()).expect("session");

        assert!(session.cfg(&key("bad")).is_none());
        assert!(session.cfg(&key("good")).is_some());

        let skipped = session.skipped();
        assert_eq!(1, skipped.len());
        assert_eq!(key("bad"), skipped[0].0);

        let mut findings = Vec::new();
        session.report_resource_leaks(&ResourceTable::jdk_io(), &mut findings);
        assert_eq!(1, findings.len());
        assert_eq!("unclosed-resource", findings[0].rule);
        assert_eq!(1, findings[0].pc);
        assert_eq!(Severity::Normal, findings[0].severity);
        assert_eq!(key("good").to_string(), findings[0].method);
    }

    #[test]
    fn cfgs_are_built_once_and_shared() {
        let mut methods = BTreeMap::new();
        methods.insert(key("m"), leaky_body());
        let session =
            AnalysisSession::new(methods, AnalysisConfig::default()).expect("session");
        let first = session.cfg(&key("m")).expect("cfg");
        let second = session.cfg(&key("m")).expect("cfg");
        assert!(Rc::ptr_eq(&first, &second));
    }

    #[test]
    fn repeated_failures_are_recorded_once() {
        let mut methods = BTreeMap::new();
        methods.insert(key("bad"), broken_body());
        let session =
            AnalysisSession::new(methods, AnalysisConfig::default()).expect("session");
        assert!(session.cfg(&key("bad")).is_none());
        assert!(session.cfg(&key("bad")).is_none());
        assert_eq!(1, session.skipped().len());
    }

    #[test]
    fn pure_helpers_sharpen_value_numbering_across_calls() {
        let owner = "com/example/Holder";
        let caller = method(vec![
            load(0),
            getfield(owner, "count"), // 1
            store(1),
            invoke_static("com/example/App", "helper", "()V"), // 3
            load(0),
            getfield(owner, "count"), // 5
            ret(false),
        ]);
        let mut methods = BTreeMap::new();
        methods.insert(key("caller"), caller);
        methods.insert(key("helper"), method(vec![ret(false)]));
        let session =
            AnalysisSession::new(methods, AnalysisConfig::default()).expect("session");
        assert_eq!(
            Some(SideEffectStatus::None),
            session.side_effect_of(&key("helper"))
        );

        let values = session.values(&key("caller")).expect("values");
        let cfg = session.cfg(&key("caller")).expect("cfg");
        let number_at = |pc: u32| {
            values
                .frames
                .fact_after(cfg.location_of_pc(pc).expect("location"))
                .as_ref()
                .expect("frame")
                .top()
                .expect("stack value")
        };
        assert_eq!(number_at(1), number_at(5));
    }
}
