//! Start/stop ordering from `after` edges

use indexmap::IndexMap;
use std::collections::HashSet;

/// Servers in dependency order
///
/// The shutdown order is always the exact reverse of the launch order.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Server names in launch order
    order: Vec<String>,
}

impl DependencyGraph {
    /// Order servers so that each one comes after everything it starts after
    ///
    /// `edges` maps every server name to its `after` list. Roots are visited
    /// in map order and dependencies in declaration order, so the result is
    /// stable for a given input.
    pub fn build(edges: &IndexMap<String, Vec<String>>) -> Result<Self, DependencyError> {
        let mut order: Vec<String> = Vec::with_capacity(edges.len());
        let mut placed: HashSet<&str> = HashSet::with_capacity(edges.len());

        for root in edges.keys() {
            if placed.contains(root.as_str()) {
                continue;
            }

            // Explicit DFS stack of (server, index of next dependency to visit)
            let mut stack: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
            let mut on_stack: HashSet<&str> = HashSet::from([root.as_str()]);

            while let Some(top) = stack.last_mut() {
                let name = top.0;
                let deps = &edges[name];

                if top.1 < deps.len() {
                    let dep = deps[top.1].as_str();
                    top.1 += 1;

                    if !edges.contains_key(dep) {
                        return Err(DependencyError::UnknownDependency {
                            server: name.to_string(),
                            dependency: dep.to_string(),
                        });
                    }
                    if placed.contains(dep) {
                        continue;
                    }
                    if on_stack.contains(dep) {
                        let mut chain: Vec<String> =
                            stack.iter().map(|(n, _)| n.to_string()).collect();
                        chain.push(dep.to_string());
                        return Err(DependencyError::CyclicDependency(chain));
                    }

                    on_stack.insert(dep);
                    stack.push((dep, 0));
                } else {
                    stack.pop();
                    on_stack.remove(name);
                    placed.insert(name);
                    order.push(name.to_string());
                }
            }
        }

        Ok(Self { order })
    }

    /// Get the launch order (reverse of shutdown order)
    pub fn launch_order(&self) -> impl DoubleEndedIterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Get the shutdown order (reverse of launch order)
    pub fn shutdown_order(&self) -> impl Iterator<Item = &str> {
        self.launch_order().rev()
    }

    /// Number of servers in the graph
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the graph has no servers
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Errors that can occur when ordering servers
#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("Server '{server}' starts after unknown server '{dependency}'")]
    UnknownDependency { server: String, dependency: String },

    #[error("Cyclic dependency detected: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),
}
