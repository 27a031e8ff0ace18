//! Arena-backed parent/child tree over the units of one trace
//!
//! Units are stored once in a flat vector and linked by index, so traversal
//! never recurses and a dangling or cyclic `parent_id` cannot loop forever.

use super::unit::QAUnit;
use serde::Serialize;
use std::collections::HashMap;

/// Owned nested view of a subtree, for API responses
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeNode {
    #[serde(flatten)]
    pub unit: QAUnit,
    pub children: Vec<TreeNode>,
}

#[derive(Debug, Clone, Default)]
pub struct UnitTree {
    nodes: Vec<QAUnit>,
    index: HashMap<String, usize>,
    children: Vec<Vec<usize>>,
    parent: Vec<Option<usize>>,
    roots: Vec<usize>,
}

impl UnitTree {
    /// Link units by `parent_id`; units whose parent is absent become roots
    pub fn build(mut units: Vec<QAUnit>) -> Self {
        units.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.data_id.cmp(&b.data_id))
        });

        let index: HashMap<String, usize> = units
            .iter()
            .enumerate()
            .map(|(i, u)| (u.data_id.clone(), i))
            .collect();

        let mut children = vec![Vec::new(); units.len()];
        let mut parent = vec![None; units.len()];
        for (i, unit) in units.iter().enumerate() {
            let resolved = unit
                .parent_id
                .as_ref()
                .and_then(|p| index.get(p).copied())
                .filter(|&p| p != i);
            if let Some(p) = resolved {
                children[p].push(i);
                parent[i] = Some(p);
            }
        }

        let mut tree = Self {
            nodes: units,
            index,
            children,
            parent,
            roots: Vec::new(),
        };
        tree.roots = (0..tree.nodes.len())
            .filter(|&i| tree.parent[i].is_none())
            .collect();
        tree.break_cycles();
        tree
    }

    /// Nodes unreachable from any root sit on a parent cycle; promote one per cycle
    fn break_cycles(&mut self) {
        let mut visited = self.visit_from(&self.roots.clone());
        for i in 0..self.nodes.len() {
            if visited[i] {
                continue;
            }
            if let Some(p) = self.parent[i].take() {
                self.children[p].retain(|&c| c != i);
            }
            self.roots.push(i);
            for (j, seen) in self.visit_from(&[i]).into_iter().enumerate() {
                visited[j] |= seen;
            }
        }
    }

    fn visit_from(&self, starts: &[usize]) -> Vec<bool> {
        let mut visited = vec![false; self.nodes.len()];
        let mut stack: Vec<usize> = starts.to_vec();
        while let Some(i) = stack.pop() {
            if visited[i] {
                continue;
            }
            visited[i] = true;
            stack.extend(self.children[i].iter().copied());
        }
        visited
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, data_id: &str) -> Option<&QAUnit> {
        self.index.get(data_id).map(|&i| &self.nodes[i])
    }

    pub fn roots(&self) -> impl Iterator<Item = &QAUnit> {
        self.roots.iter().map(|&i| &self.nodes[i])
    }

    pub fn children(&self, data_id: &str) -> Vec<&QAUnit> {
        self.index
            .get(data_id)
            .map(|&i| self.children[i].iter().map(|&c| &self.nodes[c]).collect())
            .unwrap_or_default()
    }

    pub fn parent(&self, data_id: &str) -> Option<&QAUnit> {
        let i = *self.index.get(data_id)?;
        self.parent[i].map(|p| &self.nodes[p])
    }

    /// Units from `data_id` up to its root, starting with the unit itself
    pub fn path_to_root(&self, data_id: &str) -> Vec<&QAUnit> {
        let mut path = Vec::new();
        let mut current = self.index.get(data_id).copied();
        while let Some(i) = current {
            if path.len() > self.nodes.len() {
                break;
            }
            path.push(&self.nodes[i]);
            current = self.parent[i];
        }
        path
    }

    /// All units below `data_id`, in depth-first order
    pub fn descendants(&self, data_id: &str) -> Vec<&QAUnit> {
        let Some(&start) = self.index.get(data_id) else {
            return Vec::new();
        };
        self.preorder(&[start])
            .into_iter()
            .skip(1)
            .map(|(_, i)| &self.nodes[i])
            .collect()
    }

    /// Every unit with its depth, roots first, depth-first
    pub fn depth_first(&self) -> Vec<(usize, &QAUnit)> {
        self.preorder(&self.roots)
            .into_iter()
            .map(|(depth, i)| (depth, &self.nodes[i]))
            .collect()
    }

    fn preorder(&self, starts: &[usize]) -> Vec<(usize, usize)> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<(usize, usize)> = starts.iter().rev().map(|&i| (0, i)).collect();
        while let Some((depth, i)) = stack.pop() {
            order.push((depth, i));
            stack.extend(self.children[i].iter().rev().map(|&c| (depth + 1, c)));
        }
        order
    }

    /// Nested owned view of the whole forest
    pub fn to_nested(&self) -> Vec<TreeNode> {
        let order = self.preorder(&self.roots);
        let mut built: Vec<Option<TreeNode>> = (0..self.nodes.len()).map(|_| None).collect();
        // Reverse preorder visits every child before its parent
        for &(_, i) in order.iter().rev() {
            let children = self.children[i]
                .iter()
                .filter_map(|&c| built[c].take())
                .collect();
            built[i] = Some(TreeNode {
                unit: self.nodes[i].clone(),
                children,
            });
        }
        self.roots.iter().filter_map(|&r| built[r].take()).collect()
    }
}
