//! Graph rewrites: substitution and extraction of lift markers.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::node::{pending_order, Expr, NodeId, Op};

/// Rebuilds `roots` bottom-up, mapping every node through `memo` first. Nodes whose
/// operands are unchanged keep their identity.
fn rebuild(
    roots: &[Expr],
    memo: &mut HashMap<NodeId, Expr>,
    mut visit: impl FnMut(&Expr, &mut HashMap<NodeId, Expr>) -> Result<Option<Expr>>,
) -> Result<Vec<Expr>> {
    let order = pending_order(roots, |id| memo.contains_key(&id));
    for node in order {
        let replaced = match visit(&node, memo)? {
            Some(replacement) => replacement,
            None => {
                let deps: Vec<Expr> = node
                    .deps()
                    .iter()
                    .map(|d| memo.get(&d.id()).cloned().unwrap_or_else(|| d.clone()))
                    .collect();
                node.with_deps(deps)?
            }
        };
        memo.insert(node.id(), replaced);
    }
    Ok(roots
        .iter()
        .map(|r| memo.get(&r.id()).cloned().unwrap_or_else(|| r.clone()))
        .collect())
}

fn check_pairs(op: &str, vars: &[Expr], replacements: &[Expr]) -> Result<()> {
    if vars.len() != replacements.len() {
        return Err(Error::InvalidArgument(format!(
            "{op}: {} variables but {} replacements",
            vars.len(),
            replacements.len()
        )));
    }
    for (v, r) in vars.iter().zip(replacements) {
        if !v.is_symbol() {
            return Err(Error::InvalidArgument(format!(
                "{op}: can only substitute symbols, got {v}"
            )));
        }
        if v.shape() != r.shape() {
            return Err(Error::shape("substitute", v.shape(), r.shape()));
        }
    }
    Ok(())
}

/// Replaces every occurrence of `vars[i]` in `exprs` by `replacements[i]`.
pub fn substitute(exprs: &[Expr], vars: &[Expr], replacements: &[Expr]) -> Result<Vec<Expr>> {
    check_pairs("substitute", vars, replacements)?;
    let mut memo: HashMap<NodeId, Expr> = vars
        .iter()
        .zip(replacements)
        .map(|(v, r)| (v.id(), r.clone()))
        .collect();
    rebuild(exprs, &mut memo, |_, _| Ok(None))
}

/// Sequential substitution.
///
/// `defs[i]` may reference `vars[j]` only for `j < i`; after the call every definition
/// and every entry of `exprs` is expressed without any of `vars`.
pub fn substitute_in_place(vars: &[Expr], defs: &mut [Expr], exprs: &mut [Expr]) -> Result<()> {
    check_pairs("substitute_in_place", vars, defs)?;
    // Memo keys are node addresses: the original definitions must outlive the memo.
    let originals: Vec<Expr> = defs.to_vec();
    let mut pending: HashSet<NodeId> = vars.iter().map(Expr::id).collect();
    let mut memo: HashMap<NodeId, Expr> = HashMap::new();
    for (i, var) in vars.iter().enumerate() {
        let rewritten = rebuild(std::slice::from_ref(&originals[i]), &mut memo, |node, _| {
            if pending.contains(&node.id()) {
                return Err(Error::Substitution(format!(
                    "definition {i} references '{}', which is not defined before it",
                    node.name().unwrap_or("?")
                )));
            }
            Ok(None)
        })?;
        defs[i] = rewritten.into_iter().next().unwrap_or_else(|| originals[i].clone());
        pending.remove(&var.id());
        memo.insert(var.id(), defs[i].clone());
    }
    let rewritten = rebuild(exprs, &mut memo, |_, _| Ok(None))?;
    for (slot, e) in exprs.iter_mut().zip(rewritten) {
        *slot = e;
    }
    Ok(())
}

/// Result of [`extract_lifted`].
#[derive(Debug, Clone)]
pub struct LiftedGraph {
    /// One fresh symbol per lift marker, in dependency order.
    pub variables: Vec<Expr>,
    /// `definitions[i]` is the marked expression, written in terms of `variables[..i]`.
    pub definitions: Vec<Expr>,
    pub outputs: Vec<Expr>,
}

/// Replaces every `lift` marker reachable from `outputs` by a fresh symbol.
pub fn extract_lifted(outputs: &[Expr], prefix: &str) -> Result<LiftedGraph> {
    let mut variables = Vec::new();
    let mut definitions = Vec::new();
    let mut memo = HashMap::new();
    let rewritten = rebuild(outputs, &mut memo, |node, memo| {
        if !matches!(node.op(), Op::Lift) {
            return Ok(None);
        }
        let inner = &node.deps()[0];
        let definition = memo.get(&inner.id()).cloned().unwrap_or_else(|| inner.clone());
        let var = Expr::symbol(
            format!("{prefix}{}", variables.len()),
            node.rows(),
            node.cols(),
        );
        variables.push(var.clone());
        definitions.push(definition);
        Ok(Some(var))
    })?;
    Ok(LiftedGraph {
        variables,
        definitions,
        outputs: rewritten,
    })
}
