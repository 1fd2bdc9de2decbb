use crate::common::*;
use crate::runtime::{lock::Transaction, roles::LeafKind, status::Status};

/// Discriminant of every message on the wire. `is_request` is a pure
/// function of it.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub enum MessageKind {
    PingRequest,
    PingResponse,
    GetStatusRequest,
    GetStatusResponse,
    EnroleDaemonRequest,
    EnroleDaemonResponse,
    EnroleLeafRequest,
    EnroleLeafResponse,
    SimLockReadRequest,
    SimLockReadResponse,
    SimLockWriteRequest,
    SimLockWriteResponse,
    SimLockReleaseRequest,
    SimLockReleaseResponse,
    SimErrorCheckRequest,
    SimErrorCheckResponse,
    SimCreateRequest,
    SimCreateResponse,
    SimDestroyRequest,
    SimDestroyResponse,
    MPRootRequest,
    MPUpRequest,
    MPDownRequest,
    MPODownRequest,
    MPOUpRequest,
    ErrorResponse,
    ErrorDisconnect,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Request {
    Ping(String),
    // statuses already gathered by the caller, merged into the reply
    GetStatus(Vec<Status>),
    EnroleDaemon,
    EnroleLeaf(LeafKind),
    SimLockRead { from: MPO, to: MPO },
    SimLockWrite { from: MPO, to: MPO },
    SimLockRelease { from: MPO, to: MPO, transaction: Transaction },
    SimErrorCheck(MPO),
    SimCreate,
    SimDestroy(MPO),
    // routing envelopes; each is answered with the inner request's response
    MPRoot { request: Box<Request>, mp: MP },
    MPUp { request: Box<Request>, mp: MP },
    MPDown { request: Box<Request>, mp: MP },
    MPODown { request: Box<Request>, mpo: MPO },
    MPOUp { request: Box<Request>, mpo: MPO },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Response {
    Ping(String),
    Status(Status),
    EnroleDaemon(MachineId),
    EnroleLeaf(MP),
    SimLockRead(TimeStamp),
    SimLockWrite(TimeStamp),
    SimLockRelease(TimeStamp),
    SimErrorCheck,
    SimCreate(MPO),
    SimDestroy,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum MsgBody {
    Request(Request),
    Response(Response),
    Error(RuntimeError),
    // synthesized locally when `sender_connection` is lost; never sent
    Disconnect,
}

/// Unit of exchange between endpoints. Immutable once sent, except that the
/// receiving transport stamps `sender_connection` with its own id for the
/// link the message arrived on.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    pub logical_thread_id: LogicalThreadId,
    pub sender_connection: ConnectionId,
    pub body: MsgBody,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MalformedMessage;

/////////////////////
impl MessageKind {
    pub fn is_request(self) -> bool {
        use MessageKind as Mk;
        matches!(
            self,
            Mk::PingRequest
                | Mk::GetStatusRequest
                | Mk::EnroleDaemonRequest
                | Mk::EnroleLeafRequest
                | Mk::SimLockReadRequest
                | Mk::SimLockWriteRequest
                | Mk::SimLockReleaseRequest
                | Mk::SimErrorCheckRequest
                | Mk::SimCreateRequest
                | Mk::SimDestroyRequest
                | Mk::MPRootRequest
                | Mk::MPUpRequest
                | Mk::MPDownRequest
                | Mk::MPODownRequest
                | Mk::MPOUpRequest
        )
    }
}
impl Request {
    pub fn kind(&self) -> MessageKind {
        use MessageKind as Mk;
        match self {
            Request::Ping(..) => Mk::PingRequest,
            Request::GetStatus(..) => Mk::GetStatusRequest,
            Request::EnroleDaemon => Mk::EnroleDaemonRequest,
            Request::EnroleLeaf(..) => Mk::EnroleLeafRequest,
            Request::SimLockRead { .. } => Mk::SimLockReadRequest,
            Request::SimLockWrite { .. } => Mk::SimLockWriteRequest,
            Request::SimLockRelease { .. } => Mk::SimLockReleaseRequest,
            Request::SimErrorCheck(..) => Mk::SimErrorCheckRequest,
            Request::SimCreate => Mk::SimCreateRequest,
            Request::SimDestroy(..) => Mk::SimDestroyRequest,
            Request::MPRoot { .. } => Mk::MPRootRequest,
            Request::MPUp { .. } => Mk::MPUpRequest,
            Request::MPDown { .. } => Mk::MPDownRequest,
            Request::MPODown { .. } => Mk::MPODownRequest,
            Request::MPOUp { .. } => Mk::MPOUpRequest,
        }
    }
    // the response kind a caller should expect, looking through envelopes
    pub fn response_kind(&self) -> MessageKind {
        use MessageKind as Mk;
        match self {
            Request::Ping(..) => Mk::PingResponse,
            Request::GetStatus(..) => Mk::GetStatusResponse,
            Request::EnroleDaemon => Mk::EnroleDaemonResponse,
            Request::EnroleLeaf(..) => Mk::EnroleLeafResponse,
            Request::SimLockRead { .. } => Mk::SimLockReadResponse,
            Request::SimLockWrite { .. } => Mk::SimLockWriteResponse,
            Request::SimLockRelease { .. } => Mk::SimLockReleaseResponse,
            Request::SimErrorCheck(..) => Mk::SimErrorCheckResponse,
            Request::SimCreate => Mk::SimCreateResponse,
            Request::SimDestroy(..) => Mk::SimDestroyResponse,
            Request::MPRoot { request, .. }
            | Request::MPUp { request, .. }
            | Request::MPDown { request, .. }
            | Request::MPODown { request, .. }
            | Request::MPOUp { request, .. } => request.response_kind(),
        }
    }
}
impl Response {
    pub fn kind(&self) -> MessageKind {
        use MessageKind as Mk;
        match self {
            Response::Ping(..) => Mk::PingResponse,
            Response::Status(..) => Mk::GetStatusResponse,
            Response::EnroleDaemon(..) => Mk::EnroleDaemonResponse,
            Response::EnroleLeaf(..) => Mk::EnroleLeafResponse,
            Response::SimLockRead(..) => Mk::SimLockReadResponse,
            Response::SimLockWrite(..) => Mk::SimLockWriteResponse,
            Response::SimLockRelease(..) => Mk::SimLockReleaseResponse,
            Response::SimErrorCheck => Mk::SimErrorCheckResponse,
            Response::SimCreate(..) => Mk::SimCreateResponse,
            Response::SimDestroy => Mk::SimDestroyResponse,
        }
    }
}
impl Message {
    pub fn request(logical_thread_id: LogicalThreadId, request: Request) -> Self {
        Self::new(logical_thread_id, MsgBody::Request(request))
    }
    pub fn response(logical_thread_id: LogicalThreadId, response: Response) -> Self {
        Self::new(logical_thread_id, MsgBody::Response(response))
    }
    pub fn error(logical_thread_id: LogicalThreadId, error: RuntimeError) -> Self {
        Self::new(logical_thread_id, MsgBody::Error(error))
    }
    pub(crate) fn disconnect(logical_thread_id: LogicalThreadId, lost: ConnectionId) -> Self {
        Self { logical_thread_id, sender_connection: lost, body: MsgBody::Disconnect }
    }
    fn new(logical_thread_id: LogicalThreadId, body: MsgBody) -> Self {
        // sender_connection is overwritten on receipt
        Self { logical_thread_id, sender_connection: logical_thread_id.owning_connection, body }
    }
    pub fn kind(&self) -> MessageKind {
        match &self.body {
            MsgBody::Request(request) => request.kind(),
            MsgBody::Response(response) => response.kind(),
            MsgBody::Error(..) => MessageKind::ErrorResponse,
            MsgBody::Disconnect => MessageKind::ErrorDisconnect,
        }
    }
    pub fn is_request(&self) -> bool {
        self.kind().is_request()
    }
    pub fn logical_thread_id(&self) -> LogicalThreadId {
        self.logical_thread_id
    }
    pub(crate) fn received_on(mut self, connection: ConnectionId) -> Self {
        self.sender_connection = connection;
        self
    }
}

/////////////////////
// uses variable-length encoding everywhere
fn bincode_opts() -> impl bincode::config::Options {
    bincode::config::DefaultOptions::default()
}

/// Serializes one message into its wire bytes.
pub fn encode(msg: &Message) -> Result<Vec<u8>, MalformedMessage> {
    use bincode::config::Options;
    bincode_opts().serialize(msg).map_err(|_| MalformedMessage)
}

/// Decodes the message at the front of `inbox`, returning it with the number
/// of bytes it occupied. `Ok(None)` means the inbox holds only a prefix.
pub fn decode(inbox: &[u8]) -> Result<Option<(Message, usize)>, MalformedMessage> {
    use bincode::config::Options;
    // `reading_slice` is advanced in place by read(); what it lost is the message
    let mut reading_slice = inbox;
    match bincode_opts().deserialize_from(&mut reading_slice) {
        Ok(msg) => Ok(Some((msg, inbox.len() - reading_slice.len()))),
        Err(e) => match *e {
            bincode::ErrorKind::Io(k) if k.kind() == std::io::ErrorKind::UnexpectedEof => {
                Ok(None)
            }
            _ => Err(MalformedMessage),
        },
    }
}
