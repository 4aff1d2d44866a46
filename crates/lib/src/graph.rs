//! Dependency graphs over derivation outputs.
//!
//! Nodes are [`DerivationOutput`]s and edges point from a consumer to each
//! of its dependencies. Two flavors are built the same way:
//!
//! - build time: every declared dependency of the producing derivation
//! - runtime: only the dependencies whose hashes appear in the built
//!   output's own [`Output::dependencies`](crate::derivation::Output), i.e.
//!   what has to be on disk to use the output
//!
//! When the roots span more than one output, a synthetic
//! [`DerivationOutput::fake_root`] node links them so the graph has a single
//! entry point.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;
use tracing::debug;

use crate::derivation::{Derivation, DerivationOutput};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum GraphError {
  #[error("derivation {filename} needed for output {output_name:?} is not in the store")]
  NotFound { filename: String, output_name: String },

  #[error("output {output_name:?} of derivation {filename} has not been built")]
  MissingOutput { filename: String, output_name: String },

  #[error("dependency cycle detected")]
  CycleDetected,

  #[error(transparent)]
  Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
  BuildTime,
  Runtime,
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
  graph: DiGraph<DerivationOutput, ()>,
  nodes: HashMap<DerivationOutput, NodeIndex>,
  root: Option<NodeIndex>,
}

impl DependencyGraph {
  /// Everything needed to build `drv`.
  pub fn build_time(store: &Store, drv: &Derivation) -> Result<Self, GraphError> {
    Self::from_derivations(store, std::slice::from_ref(drv))
  }

  /// Everything needed to build any of `drvs`. Derivations in `drvs` don't
  /// have to be in the store; their dependencies do.
  pub fn from_derivations(store: &Store, drvs: &[Derivation]) -> Result<Self, GraphError> {
    Self::walk(store, drvs, Kind::BuildTime)
  }

  /// Everything the built outputs of `drv` reference at run time.
  pub fn runtime(store: &Store, drv: &Derivation) -> Result<Self, GraphError> {
    Self::walk(store, std::slice::from_ref(drv), Kind::Runtime)
  }

  fn walk(store: &Store, roots: &[Derivation], kind: Kind) -> Result<Self, GraphError> {
    let given: HashMap<String, &Derivation> = roots.iter().map(|d| (d.filename(), d)).collect();
    let load = |node: &DerivationOutput| -> Result<Derivation, GraphError> {
      if let Some(drv) = given.get(&node.filename) {
        return Ok((*drv).clone());
      }
      store.load_derivation(&node.filename)?.ok_or_else(|| GraphError::NotFound {
        filename: node.filename.clone(),
        output_name: node.output_name.clone(),
      })
    };

    let mut g = Self::default();
    let root_nodes: Vec<DerivationOutput> = roots.iter().flat_map(Derivation::derivation_outputs).collect();
    let mut queue: VecDeque<DerivationOutput> = root_nodes.iter().cloned().collect();
    let mut seen = HashSet::new();

    while let Some(node) = queue.pop_front() {
      if !seen.insert(node.clone()) {
        continue;
      }
      let idx = g.add_node(node.clone());
      let drv = load(&node)?;

      let referenced: Option<HashSet<String>> = match kind {
        Kind::BuildTime => None,
        Kind::Runtime => {
          let output = drv.output(&node.output_name).ok_or_else(|| GraphError::MissingOutput {
            filename: node.filename.clone(),
            output_name: node.output_name.clone(),
          })?;
          Some(output.dependencies.iter().cloned().collect())
        }
      };

      for dep in &drv.dependencies {
        let dep_node = DerivationOutput::new(&dep.filename, &dep.output_name);
        if let Some(referenced) = &referenced {
          let hash = match &dep.output {
            Some(hash) => Some(hash.clone()),
            None => load(&dep_node)?.output(&dep.output_name).map(|o| o.path.clone()),
          };
          if !hash.is_some_and(|h| referenced.contains(&h)) {
            continue;
          }
        }
        let dep_idx = g.add_node(dep_node.clone());
        g.graph.update_edge(idx, dep_idx, ());
        queue.push_back(dep_node);
      }
    }

    g.root = match root_nodes.as_slice() {
      [] => None,
      [only] => g.nodes.get(only).copied(),
      many => {
        let fake = g.add_node(DerivationOutput::fake_root());
        for node in many {
          let idx = g.nodes[node];
          g.graph.update_edge(fake, idx, ());
        }
        Some(fake)
      }
    };

    g.validate()?;
    debug!(nodes = g.node_count(), edges = g.edge_count(), ?kind, "built dependency graph");
    Ok(g)
  }

  fn add_node(&mut self, node: DerivationOutput) -> NodeIndex {
    if let Some(&idx) = self.nodes.get(&node) {
      return idx;
    }
    let idx = self.graph.add_node(node.clone());
    self.nodes.insert(node, idx);
    idx
  }

  /// Fails if the graph has a cycle.
  pub fn validate(&self) -> Result<(), GraphError> {
    toposort(&self.graph, None).map_err(|_| GraphError::CycleDetected)?;
    Ok(())
  }

  /// The single entry point: the fake root, or the only root output.
  pub fn root(&self) -> Option<&DerivationOutput> {
    self.root.map(|idx| &self.graph[idx])
  }

  pub fn has_fake_root(&self) -> bool {
    self.root().is_some_and(|r| *r == DerivationOutput::fake_root())
  }

  pub fn contains(&self, node: &DerivationOutput) -> bool {
    self.nodes.contains_key(node)
  }

  /// Direct dependencies of `node`.
  pub fn dependencies(&self, node: &DerivationOutput) -> Vec<DerivationOutput> {
    let Some(&idx) = self.nodes.get(node) else {
      return Vec::new();
    };
    let mut deps: Vec<DerivationOutput> = self
      .graph
      .neighbors_directed(idx, Direction::Outgoing)
      .map(|i| self.graph[i].clone())
      .collect();
    deps.sort();
    deps
  }

  pub fn nodes(&self) -> Vec<DerivationOutput> {
    let mut nodes: Vec<DerivationOutput> = self.nodes.keys().cloned().collect();
    nodes.sort();
    nodes
  }

  pub fn node_count(&self) -> usize {
    self.graph.node_count()
  }

  pub fn edge_count(&self) -> usize {
    self.graph.edge_count()
  }

  /// Nodes ordered so that every dependency comes before its consumers.
  pub fn topological(&self) -> Result<Vec<DerivationOutput>, GraphError> {
    let order = toposort(&self.graph, None).map_err(|_| GraphError::CycleDetected)?;
    Ok(order.into_iter().rev().map(|idx| self.graph[idx].clone()).collect())
  }

  /// Derivation filenames grouped into waves: every dependency of a
  /// derivation sits in an earlier wave. The fake root is left out.
  pub fn waves(&self) -> Result<Vec<Vec<String>>, GraphError> {
    let order = toposort(&self.graph, None).map_err(|_| GraphError::CycleDetected)?;
    let mut level: HashMap<NodeIndex, usize> = HashMap::new();
    for &idx in order.iter().rev() {
      let l = self
        .graph
        .neighbors_directed(idx, Direction::Outgoing)
        .map(|dep| level[&dep] + 1)
        .max()
        .unwrap_or(0);
      level.insert(idx, l);
    }

    let fake = DerivationOutput::fake_root();
    let mut by_filename: BTreeMap<&str, usize> = BTreeMap::new();
    for (idx, l) in &level {
      let node = &self.graph[*idx];
      if *node == fake {
        continue;
      }
      let entry = by_filename.entry(node.filename.as_str()).or_insert(0);
      *entry = (*entry).max(*l);
    }

    let depth = by_filename.values().copied().max().map_or(0, |m| m + 1);
    let mut waves = vec![Vec::new(); depth];
    for (filename, l) in by_filename {
      waves[l].push(filename.to_string());
    }
    Ok(waves)
  }
}
