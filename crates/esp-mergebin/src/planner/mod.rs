use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};

pub type TaskId = String;

/// Prefix of the provide tokens that name user-selectable targets (`target:mergebin`).
pub const TARGET_PREFIX: &str = "target:";

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    /// Longer help text shown by `plan`.
    pub description: Option<String>,
    pub module: String,
    pub phase: String,
    /// Task ids or provide tokens; a trailing `?` marks the dependency optional.
    pub after: Vec<String>,
    pub provides: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
}

impl Plan {
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::msg(format!("duplicate task id '{}'", task.id)));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Names selectable with `--target`, without the `target:` prefix.
    pub fn targets(&self) -> Vec<&str> {
        self.tasks
            .values()
            .flat_map(|t| t.provides.iter())
            .filter_map(|p| p.strip_prefix(TARGET_PREFIX))
            .collect()
    }

    fn provides_index(&self) -> Result<BTreeMap<&str, &str>> {
        let mut out: BTreeMap<&str, &str> = BTreeMap::new();
        for (id, task) in &self.tasks {
            for p in &task.provides {
                if let Some(existing) = out.insert(p.as_str(), id.as_str()) {
                    return Err(Error::msg(format!(
                        "provide token '{}' is produced by both '{}' and '{}'",
                        p, existing, id
                    )));
                }
            }
        }
        Ok(out)
    }

    // Resolve one `after` entry to a task id; `None` for a missing optional dependency.
    fn resolve_dep<'a>(
        &'a self,
        provides: &BTreeMap<&'a str, &'a str>,
        dep: &'a str,
    ) -> Result<Option<&'a str>> {
        let (dep, optional) = match dep.strip_suffix('?') {
            Some(d) => (d, true),
            None => (dep, false),
        };
        if let Some((id, _)) = self.tasks.get_key_value(dep) {
            return Ok(Some(id.as_str()));
        }
        if let Some(&provider) = provides.get(dep) {
            return Ok(Some(provider));
        }
        if optional {
            Ok(None)
        } else {
            Err(Error::msg(format!("unknown dependency '{}'", dep)))
        }
    }

    // Edges as (dependency, dependent) pairs.
    fn edges(&self) -> Result<Vec<(&str, &str)>> {
        let provides = self.provides_index()?;
        let mut out = Vec::new();
        for (id, task) in &self.tasks {
            for dep in &task.after {
                let resolved = self.resolve_dep(&provides, dep).map_err(|e| {
                    Error::msg(format!(
                        "task '{}' has invalid dependency '{}': {}",
                        id, dep, e
                    ))
                })?;
                if let Some(dep_id) = resolved {
                    out.push((dep_id, id.as_str()));
                }
            }
        }
        Ok(out)
    }

    /// Tasks in dependency order; ties are broken by task id so the order is stable.
    pub fn ordered(&self) -> Result<Vec<&Task>> {
        let mut incoming: BTreeMap<&str, usize> =
            self.tasks.keys().map(|k| (k.as_str(), 0)).collect();
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (dep, dependent) in self.edges()? {
            if outgoing.entry(dep).or_default().insert(dependent) {
                *incoming.entry(dependent).or_default() += 1;
            }
        }

        let mut q: VecDeque<&str> = incoming
            .iter()
            .filter_map(|(k, v)| (*v == 0).then_some(*k))
            .collect();
        let mut out: Vec<&Task> = Vec::with_capacity(self.tasks.len());

        while let Some(n) = q.pop_front() {
            if let Some(task) = self.tasks.get(n) {
                out.push(task);
            }
            for &m in outgoing.get(n).into_iter().flatten() {
                if let Some(slot) = incoming.get_mut(m) {
                    *slot -= 1;
                    if *slot == 0 {
                        q.push_back(m);
                    }
                }
            }
        }

        if out.len() != self.tasks.len() {
            let remaining: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, v)| (*v > 0).then_some(*k))
                .collect();
            return Err(Error::msg(format!(
                "task graph contains a cycle; remaining nodes: {}",
                remaining.join(", ")
            )));
        }
        Ok(out)
    }

    /// Restrict the plan to `target` and everything it transitively depends on.
    ///
    /// `target` is a task id, a provide token, or a bare target name (`mergebin`).
    pub fn select(&self, target: &str) -> Result<Plan> {
        let provides = self.provides_index()?;
        let target = target.trim();
        let token = format!("{TARGET_PREFIX}{target}");
        let root = if self.tasks.contains_key(target) {
            target
        } else if let Some(&id) = provides.get(target).or_else(|| provides.get(token.as_str())) {
            id
        } else {
            return Err(Error::msg(format!(
                "unknown target '{}' (known: {})",
                target,
                self.targets().join(", ")
            )));
        };

        let mut deps_of: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (dep, dependent) in self.edges()? {
            deps_of.entry(dependent).or_default().push(dep);
        }

        let mut keep: BTreeSet<&str> = BTreeSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if keep.insert(id) {
                stack.extend(deps_of.get(id).into_iter().flatten().copied());
            }
        }

        let mut out = Plan::default();
        for id in keep {
            if let Some(task) = self.tasks.get(id) {
                out.add(task.clone())?;
            }
        }
        Ok(out)
    }

    pub fn to_dot(&self) -> Result<String> {
        let mut out = String::from("digraph plan {\n  rankdir=LR;\n");
        for task in self.tasks.values() {
            let tooltip = task
                .description
                .as_deref()
                .map(|d| format!(", tooltip=\"{d}\""))
                .unwrap_or_default();
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}:{}\"{}];\n",
                task.id, task.label, task.module, task.phase, tooltip
            ));
        }
        for (dep, dependent) in self.edges()? {
            out.push_str(&format!("  \"{}\" -> \"{}\";\n", dep, dependent));
        }
        out.push_str("}\n");
        Ok(out)
    }
}
