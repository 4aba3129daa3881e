use std::{
	collections::HashMap,
	fmt::Display,
	time::{Duration, Instant},
};

/// Possible causes a VM exit (guest -> host transition)
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum VmExit {
	PortRead,
	PortWrite,
	Hlt,
	Shutdown,
	Unknown,
}

#[derive(Debug, Clone)]
pub struct CpuStats {
	id: u32,
	vm_exits: HashMap<VmExit, usize>,
	runtime: Option<Duration>,
	start_time: Option<Instant>,
}
impl CpuStats {
	pub(crate) fn new(id: u32) -> Self {
		Self {
			id,
			vm_exits: HashMap::new(),
			runtime: None,
			start_time: None,
		}
	}

	#[inline]
	pub(crate) fn increment_val(&mut self, val: VmExit) {
		*self.vm_exits.entry(val).or_insert(0) += 1;
	}

	pub(crate) fn start_time_measurement(&mut self) {
		let _ = self.start_time.insert(Instant::now());
	}

	pub(crate) fn stop_time_measurement(&mut self) {
		if let Some(start_time) = self.start_time {
			self.runtime = Some(start_time.elapsed());
		}
	}

	/// Number of exits of the given kind.
	pub fn exits(&self, exit: VmExit) -> usize {
		self.vm_exits.get(&exit).copied().unwrap_or(0)
	}

	pub fn total_exits(&self) -> usize {
		self.vm_exits.values().sum()
	}

	pub fn runtime(&self) -> Option<Duration> {
		self.runtime
	}
}
impl Display for CpuStats {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		writeln!(f, "VM exits of cpu{}:  {:>6.}", self.id, self.total_exits())?;
		let mut exits = self.vm_exits.iter().collect::<Vec<_>>();
		exits.sort();
		for (exit, count) in exits {
			writeln!(f, "  {:<16} {count:>6.}", format!("{exit:?}:"))?;
		}
		if let Some(runtime) = self.runtime {
			writeln!(f, "CPU runtime: {runtime:?}")?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_stats() {
		let mut s = CpuStats::new(0);
		s.start_time_measurement();
		s.increment_val(VmExit::PortWrite);
		s.increment_val(VmExit::PortWrite);
		s.increment_val(VmExit::PortRead);
		s.increment_val(VmExit::Hlt);
		s.stop_time_measurement();
		println!("{s}");

		assert_eq!(s.exits(VmExit::PortWrite), 2);
		assert_eq!(s.exits(VmExit::PortRead), 1);
		assert_eq!(s.exits(VmExit::Shutdown), 0);
		assert_eq!(s.total_exits(), 4);
		assert!(s.runtime().is_some());

		let rendered = s.to_string();
		assert!(rendered.contains("PortWrite:"));
		assert!(rendered.contains("CPU runtime:"));
	}

	#[test]
	fn test_stats_without_measurement() {
		let s = CpuStats::new(0);
		assert_eq!(s.total_exits(), 0);
		assert!(s.runtime().is_none());
		assert!(!s.to_string().contains("CPU runtime:"));
	}
}
