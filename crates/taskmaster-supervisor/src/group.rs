use crate::instance::ProcessInstance;
use crate::output::OutputCapture;
use std::sync::Arc;
use taskmaster_core::{InstanceStatus, ProcessSpec};
use tokio::time::Instant;

/// Instances added or retired by [`ProcessGroup::resize`], by index.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Resize {
	pub created: Vec<usize>,
	pub revived: Vec<usize>,
	pub retired: Vec<usize>,
}

/// All instances of one named program, sharing one spec.
pub struct ProcessGroup {
	spec: Arc<ProcessSpec>,
	instances: Vec<ProcessInstance>,
	removing: bool,
}

impl ProcessGroup {
	pub fn new(spec: Arc<ProcessSpec>) -> Self {
		let instances = (0..spec.instances)
			.map(|i| ProcessInstance::new(i, OutputCapture::new(&spec, i)))
			.collect();
		Self {
			spec,
			instances,
			removing: false,
		}
	}

	pub fn spec(&self) -> &Arc<ProcessSpec> {
		&self.spec
	}

	pub fn set_spec(&mut self, spec: Arc<ProcessSpec>) {
		self.spec = spec;
	}

	pub fn instances(&self) -> &[ProcessInstance] {
		&self.instances
	}

	pub fn instances_mut(&mut self) -> &mut [ProcessInstance] {
		&mut self.instances
	}

	pub fn instance(&self, index: usize) -> Option<&ProcessInstance> {
		self.instances.iter().find(|i| i.index() == index)
	}

	pub fn instance_mut(&mut self, index: usize) -> Option<&mut ProcessInstance> {
		self.instances.iter_mut().find(|i| i.index() == index)
	}

	/// The instance whose current child is `pid` from the spawn `token`.
	pub fn position_of_child(&self, pid: u32, token: u64) -> Option<usize> {
		self.instances.iter().position(|i| i.owns_child(pid, token))
	}

	/// Any instance has an operation in flight.
	pub fn is_busy(&self) -> bool {
		self.instances.iter().any(|i| i.pending().is_some())
	}

	pub fn is_removing(&self) -> bool {
		self.removing
	}

	pub fn mark_removing(&mut self) {
		self.removing = true;
		for inst in &mut self.instances {
			inst.retire();
		}
	}

	/// A removed group whose last instance is gone.
	pub fn is_drained(&self) -> bool {
		self.removing && self.instances.is_empty()
	}

	/// Adjusts the instance count to `count`. Instances past the new count are
	/// only marked retiring; the caller stops them and [`prune`](Self::prune)
	/// drops them once they have no process.
	pub fn resize(&mut self, count: usize) -> Resize {
		let mut resize = Resize::default();
		for inst in &mut self.instances {
			if inst.index() >= count && !inst.is_retiring() {
				inst.retire();
				resize.retired.push(inst.index());
			} else if inst.index() < count && inst.is_retiring() {
				inst.revive();
				resize.revived.push(inst.index());
			}
		}
		for index in 0..count {
			if self.instance(index).is_none() {
				self.instances
					.push(ProcessInstance::new(index, OutputCapture::new(&self.spec, index)));
				resize.created.push(index);
			}
		}
		self.instances.sort_by_key(|i| i.index());
		resize
	}

	/// Drops retiring instances that no longer own a process.
	pub fn prune(&mut self) -> usize {
		let before = self.instances.len();
		self.instances
			.retain(|i| !(i.is_retiring() && !i.state().has_process()));
		before - self.instances.len()
	}

	pub fn statuses(&self, name: &str, now: Instant) -> Vec<InstanceStatus> {
		self.instances.iter().map(|i| i.status(name, now)).collect()
	}
}
