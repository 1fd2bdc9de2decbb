///////////////////// PRELUDE /////////////////////

pub(crate) use crate::runtime::{
    error::{RuntimeError, TransportError},
    logging::{Logger, SharedLogger},
};

pub(crate) use core::{
    fmt::{Debug, Display, Formatter},
    hash::Hash,
    time::Duration,
};
pub(crate) use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    io::{Read, Write},
    net::SocketAddr,
    sync::{Arc, Mutex, RwLock, Weak},
    time::Instant,
};

pub type MachineId = u32;
pub type ProcessId = u32;
pub type OwnerId = u32;

// One OS process of the cluster.
#[derive(
    Copy,
    Clone,
    Default,
    Eq,
    PartialEq,
    Ord,
    Hash,
    PartialOrd,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct MP {
    pub machine: MachineId,
    pub process: ProcessId,
}

// One simulation instance hosted by a process.
// Ordering is (machine, process, owner): the order locks are acquired in.
#[derive(
    Copy,
    Clone,
    Default,
    Eq,
    PartialEq,
    Ord,
    Hash,
    PartialOrd,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct MPO {
    pub mp: MP,
    pub owner: OwnerId,
}

/// Per-MPO version counter. Advances only on write lock release.
#[derive(
    Copy,
    Clone,
    Default,
    Eq,
    PartialEq,
    Ord,
    Hash,
    PartialOrd,
    serde::Serialize,
    serde::Deserialize,
    derive_more::From,
    derive_more::Into,
)]
pub struct TimeStamp(u32);

/// Identity of one transport endpoint as seen from one process.
/// `nonce` distinguishes OS processes, `index` endpoints within one.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, Hash, PartialOrd, serde::Serialize, serde::Deserialize,
)]
pub struct ConnectionId {
    pub(crate) nonce: u32,
    pub(crate) index: u32,
}

/// Identity of one conversation, end-to-end across every process it touches.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, Hash, PartialOrd, serde::Serialize, serde::Deserialize,
)]
pub struct LogicalThreadId {
    pub(crate) owning_connection: ConnectionId,
    pub(crate) counter: u64,
}

#[derive(Debug, Default)]
pub struct U32Stream {
    next: u32,
}

#[derive(Default, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct Payload(Arc<Vec<u8>>);

lazy_static::lazy_static! {
    // random per OS process; keeps connection ids of distinct processes apart
    static ref PROCESS_NONCE: u32 = {
        let mut bytes = [0u8; 4];
        match getrandom::getrandom(&mut bytes) {
            Ok(()) => u32::from_le_bytes(bytes),
            Err(_) => std::process::id(),
        }
    };
}
static NEXT_CONNECTION_INDEX: std::sync::atomic::AtomicU32 =
    std::sync::atomic::AtomicU32::new(0);

///////////////////// IMPL /////////////////////
impl U32Stream {
    pub(crate) fn next(&mut self) -> Option<u32> {
        let next = self.next;
        self.next = next.checked_add(1)?;
        Some(next)
    }
    pub(crate) fn starting_at(next: u32) -> Self {
        Self { next }
    }
}
impl MP {
    pub const fn new(machine: MachineId, process: ProcessId) -> Self {
        Self { machine, process }
    }
}
impl MPO {
    pub const fn new(machine: MachineId, process: ProcessId, owner: OwnerId) -> Self {
        Self { mp: MP::new(machine, process), owner }
    }
}
impl TimeStamp {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }
    pub fn value(self) -> u32 {
        self.0
    }
    // None only when the counter is exhausted
    pub(crate) fn successor(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}
impl ConnectionId {
    // fresh and never reused within this OS process
    pub(crate) fn fresh() -> Self {
        use std::sync::atomic::Ordering::SeqCst;
        Self { nonce: *PROCESS_NONCE, index: NEXT_CONNECTION_INDEX.fetch_add(1, SeqCst) }
    }
}
impl LogicalThreadId {
    pub(crate) fn new(owning_connection: ConnectionId, counter: u64) -> Self {
        Self { owning_connection, counter }
    }
    pub fn owning_connection(&self) -> ConnectionId {
        self.owning_connection
    }
}
impl From<&[u8]> for Payload {
    fn from(s: &[u8]) -> Payload {
        Payload(Arc::new(s.to_vec()))
    }
}
impl From<Vec<u8>> for Payload {
    fn from(s: Vec<u8>) -> Self {
        Self(s.into())
    }
}
impl Payload {
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}
impl serde::Serialize for Payload {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let inner: &Vec<u8> = &self.0;
        inner.serialize(serializer)
    }
}
impl<'de> serde::Deserialize<'de> for Payload {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let inner: Vec<u8> = Vec::deserialize(deserializer)?;
        Ok(Self(Arc::new(inner)))
    }
}
impl Debug for MP {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "mp({}.{})", self.machine, self.process)
    }
}
impl Debug for MPO {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "mpo({}.{}.{})", self.mp.machine, self.mp.process, self.owner)
    }
}
impl Debug for TimeStamp {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "ts({})", self.0)
    }
}
impl Debug for ConnectionId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "cn({:x}'{})", self.nonce, self.index)
    }
}
impl Debug for LogicalThreadId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "lt({:x}'{}'{})",
            self.owning_connection.nonce, self.owning_connection.index, self.counter
        )
    }
}
impl Debug for Payload {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Payload{:x?}", self.as_slice())
    }
}
impl Display for MP {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}.{}", self.machine, self.process)
    }
}
impl Display for MPO {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.mp.machine, self.mp.process, self.owner)
    }
}
impl Display for TimeStamp {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}
impl Display for LogicalThreadId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}
