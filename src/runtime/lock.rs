use super::*;
use crate::runtime::{error::LockMode, roles::Router, status::Status};

/// State delta carried by a write release: slot writes applied atomically
/// with the TimeStamp advance.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Transaction {
    pub records: Vec<TransactionRecord>,
}
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TransactionRecord {
    pub slot: u32,
    pub value: Payload,
}

/// Lock table of the simulations hosted by one process.
///
/// For every hosted MPO, records which MPOs hold read or write locks on it
/// and at what TimeStamp each was granted. A resource has any number of
/// readers or exactly one writer, never both. Acquisition order across
/// resources is up to the caller; see `acquire_in_order`.
#[derive(Debug, Default)]
pub struct LockTable {
    host: RwLock<Option<MP>>,
    owners: Mutex<U32Stream>,
    // structural changes take the outer lock for writing
    entries: RwLock<BTreeMap<MPO, Mutex<LockEntry>>>,
}

#[derive(Debug, Default)]
struct LockEntry {
    timestamp: TimeStamp,
    reads: BTreeMap<MPO, TimeStamp>,
    writes: BTreeMap<MPO, TimeStamp>,
    state: BTreeMap<u32, Payload>,
    error: Option<String>,
}

/////////////////
impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with(mut self, slot: u32, value: impl Into<Payload>) -> Self {
        self.records.push(TransactionRecord { slot, value: value.into() });
        self
    }
}
impl LockEntry {
    fn check_healthy(&self, mpo: MPO) -> Result<(), RuntimeError> {
        match &self.error {
            Some(what) => Err(RuntimeError::SimulationError { mpo, what: what.clone() }),
            None => Ok(()),
        }
    }
}
impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }
    /// Sets the process the table's simulations live in; needed by `create`.
    pub fn set_host(&self, mp: MP) {
        *write_lock(&self.host) = Some(mp);
    }
    pub fn host(&self) -> Option<MP> {
        *read_lock(&self.host)
    }

    fn with_entry<R>(
        &self,
        mpo: MPO,
        f: impl FnOnce(&mut LockEntry) -> Result<R, RuntimeError>,
    ) -> Result<R, RuntimeError> {
        let entries = read_lock(&self.entries);
        let entry = entries.get(&mpo).ok_or(RuntimeError::UnknownSimulation(mpo))?;
        let mut entry = mutex_lock(entry);
        f(&mut entry)
    }

    /// New simulation with an empty state at TimeStamp 0.
    pub fn create(&self) -> Result<MPO, RuntimeError> {
        let mp = self
            .host()
            .ok_or_else(|| RuntimeError::Enrolment("simulation host is not enrolled".into()))?;
        let owner = mutex_lock(&self.owners)
            .next()
            .ok_or_else(|| RuntimeError::fault("owner ids exhausted"))?;
        let mpo = MPO { mp, owner };
        write_lock(&self.entries).insert(mpo, Default::default());
        Ok(mpo)
    }
    pub fn destroy(&self, mpo: MPO) -> Result<(), RuntimeError> {
        match write_lock(&self.entries).remove(&mpo) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::UnknownSimulation(mpo)),
        }
    }

    /// Grants `from` a read lock on `to` unless `to` has a writer, returning
    /// the TimeStamp of the state `from` may read. Asking again while
    /// holding the read returns the TimeStamp it was granted at.
    pub fn read(&self, from: MPO, to: MPO) -> Result<TimeStamp, RuntimeError> {
        self.with_entry(to, |entry| {
            entry.check_healthy(to)?;
            if !entry.writes.is_empty() {
                return Err(RuntimeError::LockConflict { from, resource: to, mode: LockMode::Read });
            }
            let timestamp = entry.timestamp;
            Ok(*entry.reads.entry(from).or_insert(timestamp))
        })
    }
    /// Grants `from` the writer slot on `to` unless anyone else (or `from`
    /// itself, as a reader) holds a lock, returning the TimeStamp the write
    /// produces on release.
    pub fn write(&self, from: MPO, to: MPO) -> Result<TimeStamp, RuntimeError> {
        self.with_entry(to, |entry| {
            entry.check_healthy(to)?;
            if let Some(&granted) = entry.writes.get(&from) {
                return granted.successor().ok_or_else(|| RuntimeError::fault("timestamps exhausted"));
            }
            if !entry.reads.is_empty() || !entry.writes.is_empty() {
                return Err(RuntimeError::LockConflict { from, resource: to, mode: LockMode::Write });
            }
            let produces =
                entry.timestamp.successor().ok_or_else(|| RuntimeError::fault("timestamps exhausted"))?;
            entry.writes.insert(from, entry.timestamp);
            Ok(produces)
        })
    }
    /// Releases whatever `from` holds on `to`. Releasing a write applies
    /// `transaction` and advances the TimeStamp. Releasing nothing is a no-op.
    /// Returns the TimeStamp of `to` afterwards.
    pub fn release(
        &self,
        from: MPO,
        to: MPO,
        transaction: Transaction,
    ) -> Result<TimeStamp, RuntimeError> {
        self.with_entry(to, |entry| {
            if entry.writes.remove(&from).is_some() {
                let next = entry
                    .timestamp
                    .successor()
                    .ok_or_else(|| RuntimeError::fault("timestamps exhausted"))?;
                for TransactionRecord { slot, value } in transaction.records {
                    entry.state.insert(slot, value);
                }
                entry.timestamp = next;
            } else {
                entry.reads.remove(&from);
            }
            Ok(entry.timestamp)
        })
    }
    pub fn error_check(&self, mpo: MPO) -> Result<(), RuntimeError> {
        self.with_entry(mpo, |entry| entry.check_healthy(mpo))
    }
    /// Marks `mpo` faulted. Later lock requests and error checks report it.
    pub fn record_error(&self, mpo: MPO, what: impl Into<String>) -> Result<(), RuntimeError> {
        let what = what.into();
        self.with_entry(mpo, move |entry| {
            entry.error.get_or_insert(what);
            Ok(())
        })
    }

    pub fn snapshot(&self, mpo: MPO) -> Result<(TimeStamp, BTreeMap<u32, Payload>), RuntimeError> {
        self.with_entry(mpo, |entry| Ok((entry.timestamp, entry.state.clone())))
    }
    pub fn readers(&self, mpo: MPO) -> Result<Vec<MPO>, RuntimeError> {
        self.with_entry(mpo, |entry| Ok(entry.reads.keys().copied().collect()))
    }
    pub fn writer(&self, mpo: MPO) -> Result<Option<MPO>, RuntimeError> {
        self.with_entry(mpo, |entry| Ok(entry.writes.keys().next().copied()))
    }
    pub fn simulations(&self) -> Vec<MPO> {
        read_lock(&self.entries).keys().copied().collect()
    }
    pub fn status(&self) -> Vec<Status> {
        read_lock(&self.entries)
            .iter()
            .map(|(mpo, entry)| {
                let entry = mutex_lock(entry);
                let description = match &entry.error {
                    Some(what) => format!("simulation at {} FAILED: {}", entry.timestamp, what),
                    None => format!("simulation at {}", entry.timestamp),
                };
                Status {
                    mpo: Some(*mpo),
                    reads: entry.reads.iter().map(|(k, v)| (*k, *v)).collect(),
                    writes: entry.writes.iter().map(|(k, v)| (*k, *v)).collect(),
                    description,
                    ..Default::default()
                }
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl RequestHandler for LockTable {
    async fn handle(
        &self,
        _thread: &mut LogicalThread,
        request: Request,
    ) -> Result<Response, RuntimeError> {
        Ok(match request {
            Request::SimLockRead { from, to } => Response::SimLockRead(self.read(from, to)?),
            Request::SimLockWrite { from, to } => Response::SimLockWrite(self.write(from, to)?),
            Request::SimLockRelease { from, to, transaction } => {
                Response::SimLockRelease(self.release(from, to, transaction)?)
            }
            Request::SimErrorCheck(mpo) => {
                self.error_check(mpo)?;
                Response::SimErrorCheck
            }
            Request::SimCreate => Response::SimCreate(self.create()?),
            Request::SimDestroy(mpo) => {
                self.destroy(mpo)?;
                Response::SimDestroy
            }
            other => return Err(RuntimeError::DispatchFailure { kind: other.kind() }),
        })
    }
}
impl LockTable {
    pub(crate) const REQUESTS: &'static [MessageKind] = &[
        MessageKind::SimLockReadRequest,
        MessageKind::SimLockWriteRequest,
        MessageKind::SimLockReleaseRequest,
        MessageKind::SimErrorCheckRequest,
        MessageKind::SimCreateRequest,
        MessageKind::SimDestroyRequest,
    ];
}

/// Locks every MPO in `resources` for `from`, in ascending MPO order so that
/// callers following the same rule cannot deadlock. On the first failure the
/// locks already granted are released and the failure returned.
pub async fn acquire_in_order<R: Router + ?Sized>(
    router: &R,
    thread: &mut LogicalThread,
    from: MPO,
    resources: &[MPO],
    mode: LockMode,
) -> Result<Vec<(MPO, TimeStamp)>, RuntimeError> {
    let mut ordered = resources.to_vec();
    ordered.sort();
    ordered.dedup();
    let mut granted = Vec::with_capacity(ordered.len());
    for to in ordered {
        let result = match router.mpo_request(thread, to) {
            Ok(mut sender) => match mode {
                LockMode::Read => sender.sim_lock_read(from, to).await,
                LockMode::Write => sender.sim_lock_write(from, to).await,
            },
            Err(error) => Err(error),
        };
        match result {
            Ok(timestamp) => granted.push((to, timestamp)),
            Err(error) => {
                release_all(router, thread, from, &granted).await;
                return Err(error);
            }
        }
    }
    Ok(granted)
}

// best effort: a lock that cannot be released here is reported by its holder
async fn release_all<R: Router + ?Sized>(
    router: &R,
    thread: &mut LogicalThread,
    from: MPO,
    granted: &[(MPO, TimeStamp)],
) {
    for &(to, _) in granted.iter().rev() {
        let result = match router.mpo_request(thread, to) {
            Ok(mut sender) => sender.sim_lock_release(from, to, Transaction::new()).await,
            Err(error) => Err(error),
        };
        if let Err(error) = result {
            log!(thread.logger, "releasing {:?} on {:?} failed: {}", from, to, error);
        }
    }
}
