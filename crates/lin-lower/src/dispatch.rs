//! Rule registration and the conversion driver.
//!
//! [`populate_linear_patterns`] registers one rule per host operator kind and
//! marks the kind illegal on the [`ConversionTarget`]. [`apply_conversion`]
//! then walks the schedule and rewrites every illegal host operator whose
//! rule matches. Each attempt runs inside its own [`Builder`] transaction, so
//! a declined or failed attempt leaves the graph exactly as it was.

use std::fmt;

use lin_ir::{Graph, LinearKind, LinearOp, Op, TensorType, ValueId};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, instrument};

use crate::builder::Builder;
use crate::conv::ConvolutionRule;
use crate::flip::FlipRule;
use crate::matmul::{BmmRule, MatmulRule, MmRule};
use crate::trilinear::TrilinearRule;
use crate::{LowerConfig, LowerError};

/// A rewrite of one host operator kind.
pub trait LoweringRule {
    /// Rule name, used in reports.
    fn name(&self) -> &'static str;

    /// The operator kind this rule rewrites.
    fn kind(&self) -> LinearKind;

    /// Builds the replacement of `op` and returns the value standing in for
    /// its result.
    ///
    /// # Errors
    ///
    /// Returns [`LowerError::NoMatch`] when the rule does not apply, or a
    /// fatal error when the operator is invalid.
    fn lower(
        &self,
        op: &LinearOp,
        result: &TensorType,
        b: &mut Builder<'_>,
        config: &LowerConfig,
    ) -> Result<ValueId, LowerError>;
}

/// Rules keyed by the operator kind they rewrite, tried in registration
/// order.
#[derive(Default)]
pub struct RuleSet {
    rules: FxHashMap<LinearKind, Vec<Box<dyn LoweringRule>>>,
}

impl RuleSet {
    /// Creates an empty rule set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a rule.
    pub fn add(&mut self, rule: impl LoweringRule + 'static) {
        self.rules.entry(rule.kind()).or_default().push(Box::new(rule));
    }

    /// Returns the rules for `kind`.
    #[must_use]
    pub fn rules_for(&self, kind: LinearKind) -> &[Box<dyn LoweringRule>] {
        self.rules.get(&kind).map_or(&[], Vec::as_slice)
    }

    /// Returns the total number of registered rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.values().map(Vec::len).sum()
    }

    /// Returns true if no rule is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self
            .rules
            .values()
            .flatten()
            .map(|rule| rule.name())
            .collect();
        names.sort_unstable();
        f.debug_struct("RuleSet").field("rules", &names).finish()
    }
}

/// The operator kinds a conversion must eliminate.
#[derive(Clone, Debug, Default)]
pub struct ConversionTarget {
    illegal: FxHashSet<LinearKind>,
}

impl ConversionTarget {
    /// Creates a target where every kind is legal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `kind` as one the conversion rewrites.
    pub fn add_illegal(&mut self, kind: LinearKind) {
        self.illegal.insert(kind);
    }

    /// Returns true if operators of `kind` may stay in the graph.
    #[must_use]
    pub fn is_legal(&self, kind: LinearKind) -> bool {
        !self.illegal.contains(&kind)
    }
}

/// Registers the rules for `mm`, `matmul`, `bmm`, `convolution`, `trilinear`
/// and `flip`, and marks each kind illegal.
pub fn populate_linear_patterns(rules: &mut RuleSet, target: &mut ConversionTarget) {
    target.add_illegal(LinearKind::Mm);
    rules.add(MmRule);
    target.add_illegal(LinearKind::Flip);
    rules.add(FlipRule);
    target.add_illegal(LinearKind::Matmul);
    rules.add(MatmulRule);
    target.add_illegal(LinearKind::Bmm);
    rules.add(BmmRule);
    target.add_illegal(LinearKind::Convolution);
    rules.add(ConvolutionRule);
    target.add_illegal(LinearKind::Trilinear);
    rules.add(TrilinearRule);
}

/// A host operator that was rewritten.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lowered {
    /// The erased operator.
    pub op: ValueId,
    /// Its kind.
    pub kind: LinearKind,
    /// The rule that rewrote it.
    pub rule: &'static str,
    /// The value that replaced it.
    pub replacement: ValueId,
    /// Number of nodes the rewrite created.
    pub created: usize,
}

/// A host operator left in place.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Declined {
    /// The operator.
    pub op: ValueId,
    /// Its kind.
    pub kind: LinearKind,
    /// The rule that declined last, if any rule exists for the kind.
    pub rule: Option<&'static str>,
    /// Why.
    pub reason: String,
}

/// Outcome of one conversion.
#[derive(Clone, Debug, Default)]
pub struct ConversionReport {
    /// Rewritten operators, in schedule order.
    pub lowered: Vec<Lowered>,
    /// Operators left for the host.
    pub declined: Vec<Declined>,
    /// Nodes removed by dead-code pruning.
    pub pruned: usize,
}

impl ConversionReport {
    /// Returns true if every illegal operator was rewritten.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.declined.is_empty()
    }
}

impl fmt::Display for ConversionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Lowered: {}", self.lowered.len())?;
        for l in &self.lowered {
            writeln!(
                f,
                "  {} {}: {} -> {} ({} nodes)",
                l.kind, l.op, l.rule, l.replacement, l.created
            )?;
        }
        if !self.declined.is_empty() {
            writeln!(f, "Declined: {}", self.declined.len())?;
            for d in &self.declined {
                writeln!(f, "  {} {}: {}", d.kind, d.op, d.reason)?;
            }
        }
        write!(f, "Pruned: {}", self.pruned)
    }
}

enum Attempt {
    Lowered(Lowered),
    Declined(Declined),
}

/// Tries every rule for the host operator `id`.
fn lower_op(
    graph: &mut Graph,
    id: ValueId,
    op: &LinearOp,
    rules: &RuleSet,
    config: &LowerConfig,
) -> Result<Attempt, LowerError> {
    let kind = op.kind();
    let result = graph.tensor_type(id)?.clone();
    let mut declined = Declined {
        op: id,
        kind,
        rule: None,
        reason: format!("no rule for {kind}"),
    };
    for rule in rules.rules_for(kind) {
        let mut b = Builder::new(graph);
        match rule.lower(op, &result, &mut b, config) {
            Ok(replacement) => {
                let created = b.commit_before(id)?;
                graph.replace_all_uses(id, replacement);
                graph.erase(id);
                debug!(%kind, rule = rule.name(), nodes = created.len(), "lowered");
                return Ok(Attempt::Lowered(Lowered {
                    op: id,
                    kind,
                    rule: rule.name(),
                    replacement,
                    created: created.len(),
                }));
            }
            Err(LowerError::NoMatch { reason }) => {
                b.rollback();
                debug!(%kind, rule = rule.name(), %reason, "declined");
                declined.rule = Some(rule.name());
                declined.reason = reason;
            }
            Err(err) => {
                b.rollback();
                return Err(err);
            }
        }
    }
    Ok(Attempt::Declined(declined))
}

/// Rewrites every illegal host operator of `graph`, then prunes dead nodes.
///
/// # Errors
///
/// Returns the first fatal error a rule reports. Operators rewritten before
/// the failure stay rewritten; the failing operator is left untouched.
#[instrument(skip_all, fields(nodes = graph.len()))]
pub fn apply_conversion(
    graph: &mut Graph,
    rules: &RuleSet,
    target: &ConversionTarget,
    config: &LowerConfig,
) -> Result<ConversionReport, LowerError> {
    let mut report = ConversionReport::default();
    for id in graph.host_ops() {
        let op = match &graph.node(id)?.op {
            Op::Linear(op) if !target.is_legal(op.kind()) => op.clone(),
            _ => continue,
        };
        match lower_op(graph, id, &op, rules, config)? {
            Attempt::Lowered(lowered) => report.lowered.push(lowered),
            Attempt::Declined(declined) => report.declined.push(declined),
        }
    }
    report.pruned = graph.prune_dead();
    debug!(
        lowered = report.lowered.len(),
        declined = report.declined.len(),
        pruned = report.pruned,
        "conversion finished"
    );
    Ok(report)
}

/// A configured conversion with the standard rules.
#[derive(Debug)]
pub struct Lowering {
    rules: RuleSet,
    target: ConversionTarget,
    config: LowerConfig,
}

impl Lowering {
    /// Creates a conversion with every linear rule registered.
    #[must_use]
    pub fn new(config: LowerConfig) -> Self {
        let mut rules = RuleSet::new();
        let mut target = ConversionTarget::new();
        populate_linear_patterns(&mut rules, &mut target);
        Self {
            rules,
            target,
            config,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &LowerConfig {
        &self.config
    }

    /// Runs the conversion over `graph`.
    ///
    /// # Errors
    ///
    /// See [`apply_conversion`].
    pub fn run(&self, graph: &mut Graph) -> Result<ConversionReport, LowerError> {
        apply_conversion(graph, &self.rules, &self.target, &self.config)
    }
}

impl Default for Lowering {
    fn default() -> Self {
        Self::new(LowerConfig::default())
    }
}

/// Lowers every linear operator of `graph` with the standard rules.
///
/// # Errors
///
/// See [`apply_conversion`].
pub fn lower_graph(graph: &mut Graph, config: &LowerConfig) -> Result<ConversionReport, LowerError> {
    Lowering::new(config.clone()).run(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lin_ir::{BinaryOperands, DType, Dim, Shape, ValueType};

    fn matrix(g: &mut Graph, name: &str, rows: Dim, cols: Dim) -> ValueId {
        g.input(name, TensorType::new(DType::Float32, Shape::new([rows, cols])))
    }

    fn mm(g: &mut Graph, lhs: ValueId, rhs: ValueId, result: Shape) -> ValueId {
        g.push(
            Op::Linear(LinearOp::Mm(BinaryOperands { lhs, rhs })),
            ValueType::Tensor(TensorType::new(DType::Float32, result)),
        )
    }

    // === Registration ===

    #[test]
    fn test_populate_registers_every_kind() {
        let mut rules = RuleSet::new();
        let mut target = ConversionTarget::new();
        populate_linear_patterns(&mut rules, &mut target);
        assert_eq!(rules.len(), 6);
        for kind in [
            LinearKind::Mm,
            LinearKind::Matmul,
            LinearKind::Bmm,
            LinearKind::Convolution,
            LinearKind::Trilinear,
            LinearKind::Flip,
        ] {
            assert!(!target.is_legal(kind));
            assert_eq!(rules.rules_for(kind).len(), 1);
            assert_eq!(rules.rules_for(kind)[0].kind(), kind);
        }
    }

    // === Conversion ===

    #[test]
    fn test_lowering_replaces_uses() {
        let mut g = Graph::new();
        let a = matrix(&mut g, "a", Dim::Static(2), Dim::Static(3));
        let b = matrix(&mut g, "b", Dim::Static(3), Dim::Static(4));
        let op = mm(&mut g, a, b, Shape::from_static([2, 4]));
        g.set_outputs([op]);

        let report = lower_graph(&mut g, &LowerConfig::default()).unwrap();
        assert!(report.is_complete());
        assert_eq!(report.lowered.len(), 1);
        assert_eq!(report.lowered[0].rule, "mm");
        assert!(g.host_ops().is_empty());
        assert_ne!(g.outputs()[0], op);
        g.verify().unwrap();
    }

    #[test]
    fn test_declined_op_is_untouched() {
        let mut g = Graph::new();
        let a = g.input("a", TensorType::new(DType::Float32, Shape::from_static([2])));
        let op = mm(&mut g, a, a, Shape::scalar());
        g.set_outputs([op]);
        let before: Vec<_> = g.schedule().to_vec();

        let report = lower_graph(&mut g, &LowerConfig::default()).unwrap();
        assert_eq!(report.declined.len(), 1);
        assert_eq!(report.declined[0].rule, Some("mm"));
        assert_eq!(g.schedule(), before.as_slice());
        assert_eq!(g.outputs(), &[op]);
    }

    #[test]
    fn test_fatal_error_aborts() {
        let mut g = Graph::new();
        let a = matrix(&mut g, "a", Dim::Static(2), Dim::Static(3));
        let b = matrix(&mut g, "b", Dim::Static(5), Dim::Static(4));
        let op = mm(&mut g, a, b, Shape::from_static([2, 4]));
        g.set_outputs([op]);
        let len = g.len();

        let err = lower_graph(&mut g, &LowerConfig::default()).unwrap_err();
        assert!(matches!(err, LowerError::StaticShapeMismatch { .. }));
        assert_eq!(g.len(), len);
        assert_eq!(g.host_ops(), vec![op]);
    }

    #[test]
    fn test_legal_kinds_are_skipped() {
        let mut g = Graph::new();
        let a = matrix(&mut g, "a", Dim::Static(2), Dim::Static(2));
        let op = mm(&mut g, a, a, Shape::from_static([2, 2]));
        g.set_outputs([op]);

        let mut rules = RuleSet::new();
        rules.add(MmRule);
        let target = ConversionTarget::new();
        let report = apply_conversion(&mut g, &rules, &target, &LowerConfig::default()).unwrap();
        assert!(report.lowered.is_empty());
        assert!(report.declined.is_empty());
        assert_eq!(g.host_ops(), vec![op]);
    }

    #[test]
    fn test_dynamic_sizes_keep_guards() {
        let mut g = Graph::new();
        let a = matrix(&mut g, "a", Dim::Dynamic, Dim::Dynamic);
        let b = matrix(&mut g, "b", Dim::Dynamic, Dim::Dynamic);
        let op = mm(&mut g, a, b, Shape::new([Dim::Dynamic, Dim::Dynamic]));
        g.set_outputs([op]);

        lower_graph(&mut g, &LowerConfig::default()).unwrap();
        let guards = g
            .iter()
            .filter(|(_, node)| matches!(node.op, Op::Guard(_)))
            .count();
        assert_eq!(guards, 1);
        g.verify().unwrap();
    }

    #[test]
    fn test_report_display() {
        let mut g = Graph::new();
        let a = matrix(&mut g, "a", Dim::Static(2), Dim::Static(2));
        let op = mm(&mut g, a, a, Shape::from_static([2, 2]));
        g.set_outputs([op]);
        let report = Lowering::default().run(&mut g).unwrap();
        let text = report.to_string();
        assert!(text.starts_with("Lowered: 1"));
        assert!(text.contains("mm"));
    }
}
