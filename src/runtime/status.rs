use crate::common::*;

/// Diagnostic snapshot of one node of the process tree, or of one
/// simulation hosted by a process, with the statuses gathered below it.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Status {
    pub description: String,
    pub machine: Option<MachineId>,
    pub mp: Option<MP>,
    pub mpo: Option<MPO>,
    pub logical_thread_ids: Vec<LogicalThreadId>,
    pub reads: Vec<(MPO, TimeStamp)>,
    pub writes: Vec<(MPO, TimeStamp)>,
    pub children: Vec<Status>,
}

impl Status {
    pub fn new(description: impl Into<String>) -> Self {
        Self { description: description.into(), ..Default::default() }
    }
    /// Depth-first walk over this node and every node below it.
    pub fn iter(&self) -> impl Iterator<Item = &Status> + '_ {
        let mut pending = vec![self];
        std::iter::from_fn(move || {
            let next = pending.pop()?;
            pending.extend(next.children.iter().rev());
            Some(next)
        })
    }
    pub fn find_mpo(&self, mpo: MPO) -> Option<&Status> {
        self.iter().find(|status| status.mpo == Some(mpo))
    }
    fn print(&self, f: &mut Formatter, depth: usize) -> std::fmt::Result {
        let indent = depth * 2;
        write!(f, "{:indent$}{}", "", self.description, indent = indent)?;
        if let Some(mpo) = self.mpo {
            write!(f, " mpo={}", mpo)?;
        } else if let Some(mp) = self.mp {
            write!(f, " mp={}", mp)?;
        } else if let Some(machine) = self.machine {
            write!(f, " machine={}", machine)?;
        }
        writeln!(f)?;
        if !self.logical_thread_ids.is_empty() {
            writeln!(f, "{:indent$}  threads {:?}", "", self.logical_thread_ids, indent = indent)?;
        }
        for (mpo, ts) in self.reads.iter() {
            writeln!(f, "{:indent$}  read by {} at {}", "", mpo, ts, indent = indent)?;
        }
        for (mpo, ts) in self.writes.iter() {
            writeln!(f, "{:indent$}  written by {} at {}", "", mpo, ts, indent = indent)?;
        }
        for child in self.children.iter() {
            child.print(f, depth + 1)?;
        }
        Ok(())
    }
}
impl Display for Status {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        self.print(f, 0)
    }
}
