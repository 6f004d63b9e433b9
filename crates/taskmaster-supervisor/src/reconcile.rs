//! Diff between the running program set and a newly supplied one.
//!
//! The diff is pure: it only says which names were added, removed or changed.
//! Whether a change disrupts running instances is decided by the engine.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use taskmaster_core::{ActionKind, ProcessSpec};

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
	Add(Arc<ProcessSpec>),
	Remove(String),
	Update {
		name: String,
		old: Arc<ProcessSpec>,
		new: Arc<ProcessSpec>,
	},
}

impl Change {
	pub fn name(&self) -> &str {
		match self {
			Change::Add(spec) => &spec.name,
			Change::Remove(name) => name,
			Change::Update { name, .. } => name,
		}
	}

	pub fn kind(&self) -> ActionKind {
		match self {
			Change::Add(_) => ActionKind::Add,
			Change::Remove(_) => ActionKind::Remove,
			Change::Update { .. } => ActionKind::Update,
		}
	}
}

/// Removals first, then updates, then additions, each sorted by name.
/// Identical specs produce no change.
pub fn diff(current: &BTreeMap<String, Arc<ProcessSpec>>, next: &[ProcessSpec]) -> Vec<Change> {
	let next: BTreeMap<&str, &ProcessSpec> = next.iter().map(|s| (s.name.as_str(), s)).collect();
	let mut removes = Vec::new();
	let mut updates = Vec::new();
	let mut adds = Vec::new();

	for (name, old) in current {
		match next.get(name.as_str()) {
			None => removes.push(Change::Remove(name.clone())),
			Some(new) if old.as_ref() != *new => updates.push(Change::Update {
				name: name.clone(),
				old: Arc::clone(old),
				new: Arc::new((*new).clone()),
			}),
			Some(_) => {}
		}
	}

	let known: BTreeSet<&str> = current.keys().map(String::as_str).collect();
	for (name, spec) in &next {
		if !known.contains(name) {
			adds.push(Change::Add(Arc::new((*spec).clone())));
		}
	}

	removes.into_iter().chain(updates).chain(adds).collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn spec(name: &str, command: &str) -> ProcessSpec {
		ProcessSpec::new(name, command)
	}

	fn current(specs: &[ProcessSpec]) -> BTreeMap<String, Arc<ProcessSpec>> {
		specs
			.iter()
			.map(|s| (s.name.clone(), Arc::new(s.clone())))
			.collect()
	}

	#[test]
	fn identical_sets_produce_nothing() {
		let specs = vec![spec("a", "/bin/a"), spec("b", "/bin/b")];
		assert!(diff(&current(&specs), &specs).is_empty());
	}

	#[test]
	fn add_remove_update() {
		let old = current(&[spec("a", "/bin/a"), spec("b", "/bin/b"), spec("c", "/bin/c")]);
		let mut b2 = spec("b", "/bin/b");
		b2.instances = 3;
		let new = vec![spec("a", "/bin/a"), b2.clone(), spec("d", "/bin/d")];

		let changes = diff(&old, &new);
		let summary: Vec<(ActionKind, &str)> =
			changes.iter().map(|c| (c.kind(), c.name())).collect();
		assert_eq!(
			summary,
			vec![
				(ActionKind::Remove, "c"),
				(ActionKind::Update, "b"),
				(ActionKind::Add, "d"),
			]
		);

		match &changes[1] {
			Change::Update { old, new, .. } => {
				assert_eq!(old.instances, 1);
				assert_eq!(new.as_ref(), &b2);
			}
			other => panic!("expected update, got {:?}", other),
		}
	}

	#[test]
	fn non_disruptive_change_is_still_an_update() {
		let old = current(&[spec("a", "/bin/a")]);
		let mut a2 = spec("a", "/bin/a");
		a2.stdout = Some("/tmp/a.log".into());
		let changes = diff(&old, &[a2]);
		assert_eq!(changes.len(), 1);
		assert_eq!(changes[0].kind(), ActionKind::Update);
	}

	#[test]
	fn order_is_by_kind_then_name() {
		let old = current(&[spec("z", "/bin/z"), spec("y", "/bin/y")]);
		let new = vec![spec("b", "/bin/b"), spec("a", "/bin/a")];
		let changes = diff(&old, &new);
		let names: Vec<&str> = changes.iter().map(|c| c.name()).collect();
		assert_eq!(names, vec!["y", "z", "a", "b"]);
	}

	#[test]
	fn empty_new_set_removes_everything() {
		let old = current(&[spec("a", "/bin/a"), spec("b", "/bin/b")]);
		let changes = diff(&old, &[]);
		assert!(changes.iter().all(|c| c.kind() == ActionKind::Remove));
		assert_eq!(changes.len(), 2);
	}
}
