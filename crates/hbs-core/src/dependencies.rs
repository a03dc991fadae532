//! Table dependency graphs and leaf fingerprints.
//!
//! A derived table depends on the tables of its year-resolved `table_list`,
//! transitively, down to base tables. The graph records the raw schema node
//! of every derived table and a fingerprint of every base table's processed
//! file, so a cached result is stale as soon as either changes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use indexmap::IndexMap;
use rayon::prelude::*;
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};

use hbs_metadata::{MetaValue, MetadataContext};
use hbs_model::{HbsError, Result};

const TABLE_LIST_KEY: &str = "table_list";

/// Size and SHA-256 of a processed base table file; both `None` when the
/// file does not exist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LeafFingerprint {
    pub size: Option<u64>,
    pub sha256: Option<String>,
}

impl LeafFingerprint {
    pub fn of_file(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        let file = File::open(path).map_err(|e| HbsError::io(path, e))?;
        let size = file.metadata().map_err(|e| HbsError::io(path, e))?.len();
        let mut hasher = Sha256::new();
        io::copy(&mut BufReader::new(file), &mut hasher).map_err(|e| HbsError::io(path, e))?;
        Ok(Self {
            size: Some(size),
            sha256: Some(hex::encode(hasher.finalize())),
        })
    }
}

/// A node of the dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Dependency {
    /// A derived table and its unresolved schema node.
    Derived(MetaValue),
    /// A base table.
    Base(LeafFingerprint),
}

/// Every table a requested table depends on, in discovery order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyGraph {
    nodes: IndexMap<String, Dependency>,
}

impl DependencyGraph {
    pub fn get(&self, table: &str) -> Option<&Dependency> {
        self.nodes.get(table)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Dependency)> {
        self.nodes.iter().map(|(name, node)| (name.as_str(), node))
    }

    /// Names of the base tables, in discovery order.
    pub fn base_tables(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| matches!(node, Dependency::Base(_)))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// The graph as a metadata value, the shape it has in a cache sidecar.
    pub fn to_meta(&self) -> Result<MetaValue> {
        serde_yaml::to_value(self)
            .map(MetaValue::from)
            .map_err(|e| HbsError::metadata("dependencies", e.to_string()))
    }

    /// Cache sidecar text: `{dependencies: <graph>}`.
    pub fn to_sidecar_yaml(&self) -> Result<String> {
        #[derive(Serialize)]
        struct Sidecar<'a> {
            dependencies: &'a DependencyGraph,
        }
        serde_yaml::to_string(&Sidecar { dependencies: self })
            .map_err(|e| HbsError::metadata("dependencies", e.to_string()))
    }

    /// Whether a sidecar records exactly this graph.
    ///
    /// Unreadable sidecars never match.
    pub fn matches_sidecar(&self, text: &str) -> bool {
        let Ok(stored) = MetaValue::from_yaml_str(text, "cache sidecar") else {
            return false;
        };
        match (stored.get("dependencies"), self.to_meta()) {
            (Some(stored), Ok(current)) => *stored == current,
            _ => false,
        }
    }
}

impl Serialize for DependencyGraph {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_map(&self.nodes)
    }
}

/// Upstream table names of a schema node for `year`.
pub fn upstream_tables(ctx: &MetadataContext, table: &str, year: i64) -> Result<Option<Vec<String>>> {
    let Some(node) = ctx.resolved_schema_node(table, year)? else {
        return Ok(None);
    };
    let Some(list) = node.get(TABLE_LIST_KEY) else {
        return Ok(None);
    };
    list.to_str_list().map(Some).ok_or_else(|| {
        HbsError::metadata(
            format!("schema.{table}.{TABLE_LIST_KEY}"),
            "expected a table name or a list of table names",
        )
    })
}

/// Builds the dependency graph of `table` for `year`.
///
/// Leaf fingerprints are computed on the worker pool.
pub fn extract_dependencies(ctx: &MetadataContext, table: &str, year: i64) -> Result<DependencyGraph> {
    let mut nodes: IndexMap<String, Option<MetaValue>> = IndexMap::new();
    let mut edges: HashMap<String, Vec<String>> = HashMap::new();
    let mut queue = VecDeque::from([(table.to_string(), None::<String>)]);

    while let Some((name, referenced_by)) = queue.pop_front() {
        if nodes.contains_key(&name) {
            continue;
        }
        if let Some(upstream) = upstream_tables(ctx, &name, year)? {
            let raw = ctx.schema_node(&name).cloned().unwrap_or_default();
            for next in &upstream {
                queue.push_back((next.clone(), Some(name.clone())));
            }
            edges.insert(name.clone(), upstream);
            nodes.insert(name, Some(raw));
        } else if ctx.is_base_table(&name) {
            nodes.insert(name, None);
        } else {
            return Err(match referenced_by {
                Some(referenced_by) => HbsError::UnresolvableReference {
                    table: name,
                    referenced_by,
                },
                None => HbsError::TableNotFound { table: name, year },
            });
        }
    }
    if let Some(cycle) = find_cycle(table, &edges) {
        return Err(HbsError::CyclicDependency { cycle });
    }

    let paths = ctx.paths();
    let leaves: Vec<&String> = nodes
        .iter()
        .filter(|(_, node)| node.is_none())
        .map(|(name, _)| name)
        .collect();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(ctx.settings().worker_threads.max(1))
        .build()
        .map_err(|e| HbsError::InvalidSettings {
            source_name: "worker_threads".to_string(),
            reason: e.to_string(),
        })?;
    let fingerprints: Vec<Result<LeafFingerprint>> = pool.install(|| {
        leaves
            .par_iter()
            .map(|name| LeafFingerprint::of_file(&paths.processed_file(name, year)))
            .collect()
    });
    let mut fingerprints: HashMap<String, LeafFingerprint> = leaves
        .into_iter()
        .cloned()
        .zip(fingerprints)
        .map(|(name, fingerprint)| fingerprint.map(|f| (name, f)))
        .collect::<Result<_>>()?;

    let nodes = nodes
        .into_iter()
        .map(|(name, node)| {
            let dependency = match node {
                Some(raw) => Dependency::Derived(raw),
                None => Dependency::Base(fingerprints.remove(&name).unwrap_or_default()),
            };
            (name, dependency)
        })
        .collect();
    tracing::debug!(table, year, "dependency graph extracted");
    Ok(DependencyGraph { nodes })
}

/// First cycle reachable from `start`, as a path that ends where it starts.
fn find_cycle(start: &str, edges: &HashMap<String, Vec<String>>) -> Option<Vec<String>> {
    fn visit(
        node: &str,
        edges: &HashMap<String, Vec<String>>,
        path: &mut Vec<String>,
        done: &mut HashSet<String>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = path.iter().position(|seen| seen == node) {
            let mut cycle = path[pos..].to_vec();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        if done.contains(node) {
            return None;
        }
        path.push(node.to_string());
        for next in edges.get(node).into_iter().flatten() {
            if let Some(cycle) = visit(next, edges, path, done) {
                return Some(cycle);
            }
        }
        path.pop();
        done.insert(node.to_string());
        None
    }

    visit(start, edges, &mut Vec::new(), &mut HashSet::new())
}
