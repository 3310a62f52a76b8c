use std::fmt;
use std::sync::{Arc, OnceLock};

use accord_store::{Belief, Cell, Ref};
use accord_types::Hash;
use bytes::Bytes;
use tracing::warn;

use crate::connection::Connection;
use crate::data::{decode_multi, encode_multi, Payload};
use crate::error::{ProtocolError, ProtocolResult};

/// Kinds of message exchanged between peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// One or more cells, usually answering a [`MessageType::MissingData`].
    Data,
    /// A belief delta plus the novel cells needed to resolve it.
    Belief,
    Challenge,
    Response,
    /// Outcome of a request, correlated by id.
    Result,
    Goodbye,
    Status,
    Query,
    Transact,
    /// Request for the cell with a given hash.
    MissingData,
}

impl MessageType {
    pub const ALL: [MessageType; 10] = [
        Self::Data,
        Self::Belief,
        Self::Challenge,
        Self::Response,
        Self::Result,
        Self::Goodbye,
        Self::Status,
        Self::Query,
        Self::Transact,
        Self::MissingData,
    ];

    /// Stable wire code.
    pub fn code(self) -> u8 {
        match self {
            Self::Data => 1,
            Self::Belief => 2,
            Self::Challenge => 3,
            Self::Response => 4,
            Self::Result => 5,
            Self::Goodbye => 6,
            Self::Status => 7,
            Self::Query => 8,
            Self::Transact => 9,
            Self::MissingData => 10,
        }
    }

    pub fn from_code(code: u8) -> ProtocolResult<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.code() == code)
            .ok_or(ProtocolError::InvalidMessageType(code))
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Data => "DATA",
            Self::Belief => "BELIEF",
            Self::Challenge => "CHALLENGE",
            Self::Response => "RESPONSE",
            Self::Result => "RESULT",
            Self::Goodbye => "GOODBYE",
            Self::Status => "STATUS",
            Self::Query => "QUERY",
            Self::Transact => "TRANSACT",
            Self::MissingData => "MISSING_DATA",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error kinds carried in `RESULT` messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Missing,
    Format,
    Signature,
    Load,
    Unexpected,
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        match self {
            Self::Missing => 1,
            Self::Format => 2,
            Self::Signature => 3,
            Self::Load => 4,
            Self::Unexpected => 5,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        [
            Self::Missing,
            Self::Format,
            Self::Signature,
            Self::Load,
            Self::Unexpected,
        ]
        .into_iter()
        .find(|c| c.code() == code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Missing => "MISSING",
            Self::Format => "FORMAT",
            Self::Signature => "SIGNATURE",
            Self::Load => "LOAD",
            Self::Unexpected => "UNEXPECTED",
        };
        f.write_str(name)
    }
}

/// A decoded `RESULT` body: `[id, error code, value]`, with `Nil` standing
/// in for an absent id or code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultRecord {
    pub id: Option<i64>,
    pub error: Option<ErrorCode>,
    pub value: Ref,
}

impl ResultRecord {
    fn to_cell(&self) -> Cell {
        let id = self.id.map_or(Cell::Nil, Cell::Long);
        let code = self.error.map_or(Cell::Nil, |c| Cell::Long(c.code()));
        Cell::Vector(vec![Ref::new(id), Ref::new(code), self.value.clone()])
    }

    fn from_cell(cell: &Cell) -> ProtocolResult<Self> {
        let unexpected = |detail: &str| ProtocolError::UnexpectedPayload {
            kind: MessageType::Result,
            detail: detail.to_string(),
        };
        let Cell::Vector(items) = cell else {
            return Err(unexpected("not a vector"));
        };
        let [id, code, value] = items.as_slice() else {
            return Err(unexpected("expected three elements"));
        };
        let id = match id.direct_value().map(|c| c.as_ref()) {
            Some(Cell::Nil) => None,
            Some(Cell::Long(id)) => Some(*id),
            _ => return Err(unexpected("id is not a long")),
        };
        let error = match code.direct_value().map(|c| c.as_ref()) {
            Some(Cell::Nil) => None,
            Some(Cell::Long(code)) => {
                Some(ErrorCode::from_code(*code).ok_or_else(|| unexpected("unknown error code"))?)
            }
            _ => return Err(unexpected("error code is not a long")),
        };
        Ok(Self {
            id,
            error,
            value: value.clone(),
        })
    }
}

/// A message to or from a specific connection.
///
/// Holds the raw message data and decodes it on first access to
/// [`payload`](Self::payload). Messages built locally start with the payload
/// already decoded.
#[derive(Clone)]
pub struct Message {
    kind: MessageType,
    data: Bytes,
    payload: OnceLock<Arc<Payload>>,
    connection: Option<Arc<dyn Connection>>,
}

impl Message {
    /// A message with a single-cell payload.
    pub fn new(kind: MessageType, value: Cell) -> Self {
        Self::with_cells(kind, Ref::new(value), Vec::new())
    }

    /// A message with a root cell and further cells to resolve it.
    pub fn with_cells(kind: MessageType, root: Ref, cells: Vec<Ref>) -> Self {
        let data = match root.direct_value() {
            Some(value) => encode_multi(value, &cells),
            None => encode_multi(&Cell::Nil, &cells),
        };
        let payload = OnceLock::new();
        let _ = payload.set(Arc::new(Payload::new(root, cells)));
        Self {
            kind,
            data: Bytes::from(data),
            payload,
            connection: None,
        }
    }

    /// A message received as raw data. Nothing is decoded yet.
    pub fn from_data(kind: MessageType, data: Bytes) -> Self {
        Self {
            kind,
            data,
            payload: OnceLock::new(),
            connection: None,
        }
    }

    /// Attach the connection replies should go to.
    pub fn with_connection(mut self, connection: Arc<dyn Connection>) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn belief(belief: Belief, novelty: Vec<Ref>) -> Self {
        Self::with_cells(MessageType::Belief, Ref::new(Cell::Belief(belief)), novelty)
    }

    /// `DATA` carrying `cells`. The first cell is the root.
    pub fn data_cells(mut cells: Vec<Ref>) -> Self {
        if cells.is_empty() {
            return Self::new(MessageType::Data, Cell::Nil);
        }
        let root = cells.remove(0);
        Self::with_cells(MessageType::Data, root, cells)
    }

    pub fn missing_data(hash: Hash) -> Self {
        // A 32-byte blob always fits in one chunk.
        let cell = Cell::Blob(hash.as_bytes().to_vec());
        Self::new(MessageType::MissingData, cell)
    }

    pub fn result(record: ResultRecord) -> Self {
        let extra = if record.value.is_embedded() {
            Vec::new()
        } else {
            vec![record.value.clone()]
        };
        Self::with_cells(MessageType::Result, Ref::new(record.to_cell()), extra)
    }

    pub fn status(id: i64) -> Self {
        Self::new(MessageType::Status, Cell::Long(id))
    }

    pub fn goodbye() -> Self {
        Self::new(MessageType::Goodbye, Cell::Nil)
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    /// Raw encoded message data.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn connection(&self) -> Option<&Arc<dyn Connection>> {
        self.connection.as_ref()
    }

    /// The decoded payload. Decoding happens once; corrupt data fails every
    /// time it is accessed.
    pub fn payload(&self) -> ProtocolResult<Arc<Payload>> {
        if let Some(payload) = self.payload.get() {
            return Ok(Arc::clone(payload));
        }
        let decoded = decode_multi(&self.data).map_err(|e| {
            warn!(kind = %self.kind, origin = %self.origin(), error = %e, "bad format in message payload");
            ProtocolError::Payload(e)
        })?;
        Ok(Arc::clone(self.payload.get_or_init(|| Arc::new(decoded))))
    }

    /// Correlation id of the message, for the kinds that carry one.
    ///
    /// `QUERY` and `TRANSACT` carry it as the first vector element, `RESULT`
    /// in its record and `STATUS` as the whole payload.
    pub fn id(&self) -> ProtocolResult<Option<i64>> {
        let payload = self.payload()?;
        let value = payload.value();
        let unexpected = |detail: &str| ProtocolError::UnexpectedPayload {
            kind: self.kind,
            detail: detail.to_string(),
        };
        match self.kind {
            MessageType::Query | MessageType::Transact => {
                let Cell::Vector(items) = value else {
                    return Err(unexpected("not a vector"));
                };
                match items.first().and_then(|r| r.direct_value()).map(|c| c.as_ref()) {
                    Some(Cell::Long(id)) => Ok(Some(*id)),
                    _ => Err(unexpected("first element is not a long id")),
                }
            }
            MessageType::Result => Ok(ResultRecord::from_cell(value)?.id),
            MessageType::Status => match value {
                Cell::Long(id) => Ok(Some(*id)),
                _ => Err(unexpected("status id is not a long")),
            },
            _ => Ok(None),
        }
    }

    /// Decode a `RESULT` payload.
    pub fn result_record(&self) -> ProtocolResult<ResultRecord> {
        ResultRecord::from_cell(self.payload()?.value())
    }

    /// The hash requested by a `MISSING_DATA` message.
    pub fn requested_hash(&self) -> ProtocolResult<Hash> {
        let payload = self.payload()?;
        match payload.value() {
            Cell::Blob(bytes) if self.kind == MessageType::MissingData => Hash::from_slice(bytes)
                .map_err(|e| ProtocolError::UnexpectedPayload {
                    kind: self.kind,
                    detail: e.to_string(),
                }),
            other => Err(ProtocolError::UnexpectedPayload {
                kind: self.kind,
                detail: format!("expected hash blob, found {}", other.type_name()),
            }),
        }
    }

    /// Where the message came from, for logging.
    pub fn origin(&self) -> String {
        self.connection
            .as_ref()
            .map_or_else(|| "local".to_string(), |c| c.label())
    }

    fn reply(&self, message: Message) -> ProtocolResult<()> {
        let connection = self.connection.as_ref().ok_or(ProtocolError::NoConnection)?;
        connection.send(message)
    }

    /// Send `value` back as the successful result of this message.
    pub fn report_result(&self, value: Cell) -> ProtocolResult<()> {
        let id = self.id().unwrap_or(None);
        self.reply(Message::result(ResultRecord {
            id,
            error: None,
            value: Ref::new(value),
        }))
    }

    /// Send an error result for this message. `detail` rides in the value.
    pub fn report_error(&self, code: ErrorCode, detail: Cell) -> ProtocolResult<()> {
        let id = self.id().unwrap_or(None);
        self.reply(Message::result(ResultRecord {
            id,
            error: Some(code),
            value: Ref::new(detail),
        }))
    }

    /// Ask the sender of this message for the cell with `hash`.
    pub fn send_missing_data(&self, hash: Hash) -> ProtocolResult<()> {
        self.reply(Message::missing_data(hash))
    }

    /// Send cells to the sender of this message.
    pub fn send_data(&self, cells: Vec<Ref>) -> ProtocolResult<()> {
        self.reply(Message::data_cells(cells))
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("data_len", &self.data.len())
            .field("decoded", &self.payload.get().is_some())
            .field("origin", &self.origin())
            .finish()
    }
}
