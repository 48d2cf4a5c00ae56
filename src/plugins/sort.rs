//! Dependency ordering for plugin loading.
//!
//! A depth-first topological sort over manifest `dependencies`. Unknown
//! dependencies are treated as external and skipped; a back-edge means a
//! cycle and aborts the entire batch.

use anyhow::Result;
use std::collections::HashMap;

use super::manifest::PluginManifest;

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Return indices into `manifests` such that every plugin appears after its
/// dependencies.
pub fn dependency_order(manifests: &[PluginManifest]) -> Result<Vec<usize>> {
    let by_name: HashMap<&str, usize> = manifests
        .iter()
        .enumerate()
        .map(|(i, m)| (m.name.as_str(), i))
        .collect();

    let mut marks = vec![Mark::Unvisited; manifests.len()];
    let mut order = Vec::with_capacity(manifests.len());

    fn visit(
        idx: usize,
        manifests: &[PluginManifest],
        by_name: &HashMap<&str, usize>,
        marks: &mut [Mark],
        order: &mut Vec<usize>,
    ) -> Result<()> {
        match marks[idx] {
            Mark::Done => return Ok(()),
            Mark::InProgress => {
                anyhow::bail!(
                    "plugin dependency cycle involving '{}'",
                    manifests[idx].name
                );
            }
            Mark::Unvisited => {}
        }
        marks[idx] = Mark::InProgress;
        for dep in &manifests[idx].dependencies {
            // Unknown dependencies are external; nothing to order against.
            if let Some(&dep_idx) = by_name.get(dep.as_str()) {
                visit(dep_idx, manifests, by_name, marks, order)?;
            }
        }
        marks[idx] = Mark::Done;
        order.push(idx);
        Ok(())
    }

    for idx in 0..manifests.len() {
        visit(idx, manifests, &by_name, &mut marks, &mut order)?;
    }
    Ok(order)
}
