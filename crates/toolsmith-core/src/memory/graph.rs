//! # Relation Graph
//!
//! Undirected adjacency view over stored edges, used by `related`.
//! Traversal is breadth-first with a visited set, so cycles terminate and
//! each tool is reported at its shortest distance.

use super::RelationEdge;
use crate::ToolHash;
use crate::primitives::MAX_RELATED_DEPTH;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// A tool reached from the start of a traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatedHit {
    pub neighbor: ToolHash,
    pub edge: RelationEdge,
    /// Hops from the start (1 = direct relation).
    pub depth: usize,
}

/// Borrowed adjacency lists, in edge insertion order.
#[derive(Debug, Default)]
pub struct RelationGraph<'a> {
    adjacency: BTreeMap<&'a ToolHash, Vec<(&'a ToolHash, &'a RelationEdge)>>,
}

impl<'a> RelationGraph<'a> {
    #[must_use]
    pub fn build(edges: &'a [RelationEdge]) -> Self {
        let mut adjacency: BTreeMap<&ToolHash, Vec<(&ToolHash, &RelationEdge)>> = BTreeMap::new();
        for edge in edges {
            adjacency.entry(&edge.from).or_default().push((&edge.to, edge));
            if edge.from != edge.to {
                adjacency.entry(&edge.to).or_default().push((&edge.from, edge));
            }
        }
        Self { adjacency }
    }

    /// Direct neighbors of `hash` with the connecting edge.
    #[must_use]
    pub fn neighbors(&self, hash: &ToolHash) -> &[(&'a ToolHash, &'a RelationEdge)] {
        self.adjacency.get(hash).map_or(&[], Vec::as_slice)
    }

    /// Breadth-first walk from `start` up to `depth` hops.
    ///
    /// `depth` is clamped to [`MAX_RELATED_DEPTH`]. When several edges join
    /// the same pair of tools, each edge is reported. The start itself is
    /// never reported.
    #[must_use]
    pub fn traverse(&self, start: &ToolHash, depth: usize) -> Vec<RelatedHit> {
        let depth = depth.min(MAX_RELATED_DEPTH);
        let mut visited: BTreeSet<&ToolHash> = BTreeSet::new();
        let mut queue: VecDeque<(&ToolHash, usize)> = VecDeque::new();
        let mut hits = Vec::new();

        visited.insert(start);
        queue.push_back((start, 0));

        while let Some((current, current_depth)) = queue.pop_front() {
            if current_depth >= depth {
                continue;
            }

            let mut discovered: Vec<&ToolHash> = Vec::new();
            for &(next, edge) in self.neighbors(current) {
                if visited.contains(next) {
                    continue;
                }
                hits.push(RelatedHit {
                    neighbor: next.clone(),
                    edge: edge.clone(),
                    depth: current_depth + 1,
                });
                if !discovered.contains(&next) {
                    discovered.push(next);
                }
            }
            for next in discovered {
                visited.insert(next);
                queue.push_back((next, current_depth + 1));
            }
        }

        hits
    }
}
