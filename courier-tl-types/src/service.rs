//! MTProto service-layer constructors.
//!
//! These are the messages the protocol state machine itself understands: the
//! dispatch set is closed, so each type is written by hand rather than
//! generated. Conventions:
//!
//! * `deserialize` reads the boxed form, constructor ID included, and fails
//!   with [`Error::UnexpectedConstructor`] on a mismatch;
//! * `serialize` writes the constructor ID followed by the fields.

use crate::deserialize::{Cursor, Error, Result};
use crate::{Deserializable, Identifiable, RemoteCall, Serializable};

fn expect_id<T: Identifiable>(buf: &mut Cursor) -> Result<()> {
    let id = u32::deserialize(buf)?;
    if id == T::CONSTRUCTOR_ID {
        Ok(())
    } else {
        Err(Error::UnexpectedConstructor { id })
    }
}

// ─── rpc_result / rpc_error ──────────────────────────────────────────────────

/// `rpc_result#f35c6d01 req_msg_id:long result:Object`.
///
/// The result object is kept as raw bytes; only the awaiting caller knows its
/// concrete type.
#[derive(Clone, Debug, PartialEq)]
pub struct RpcResult {
    pub req_msg_id: i64,
    pub body: Vec<u8>,
}

impl Identifiable for RpcResult {
    const CONSTRUCTOR_ID: u32 = 0xf35c6d01;
}

impl Deserializable for RpcResult {
    fn deserialize(buf: &mut Cursor) -> Result<Self> {
        expect_id::<Self>(buf)?;
        Ok(Self {
            req_msg_id: i64::deserialize(buf)?,
            body: buf.read_to_end(),
        })
    }
}

/// `rpc_error#2144ca19 error_code:int error_message:string`.
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    pub error_code: i32,
    pub error_message: String,
}

impl Identifiable for RpcError {
    const CONSTRUCTOR_ID: u32 = 0x2144ca19;
}

impl Deserializable for RpcError {
    fn deserialize(buf: &mut Cursor) -> Result<Self> {
        expect_id::<Self>(buf)?;
        Ok(Self {
            error_code: i32::deserialize(buf)?,
            error_message: String::deserialize(buf)?,
        })
    }
}

// ─── Containers and compression ──────────────────────────────────────────────

/// One message inside a [`MessageContainer`], body kept raw.
#[derive(Clone, Debug, PartialEq)]
pub struct ContainedMessage {
    pub msg_id: i64,
    pub seq_no: i32,
    pub body: Vec<u8>,
}

/// `msg_container#73f1f8dc messages:vector<%Message>`.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageContainer {
    pub messages: Vec<ContainedMessage>,
}

impl Identifiable for MessageContainer {
    const CONSTRUCTOR_ID: u32 = 0x73f1f8dc;
}

impl Deserializable for MessageContainer {
    fn deserialize(buf: &mut Cursor) -> Result<Self> {
        expect_id::<Self>(buf)?;
        let count = i32::deserialize(buf)? as usize;
        let mut messages = Vec::with_capacity(count);
        for _ in 0..count {
            let msg_id = i64::deserialize(buf)?;
            let seq_no = i32::deserialize(buf)?;
            let len = i32::deserialize(buf)?;
            if len < 0 {
                return Err(Error::UnexpectedEof);
            }
            messages.push(ContainedMessage {
                msg_id,
                seq_no,
                body: buf.read_raw(len as usize)?,
            });
        }
        Ok(Self { messages })
    }
}

/// `gzip_packed#3072cfa1 packed_data:bytes`.
#[derive(Clone, Debug, PartialEq)]
pub struct GzipPacked {
    pub packed_data: Vec<u8>,
}

impl Identifiable for GzipPacked {
    const CONSTRUCTOR_ID: u32 = 0x3072cfa1;
}

impl Deserializable for GzipPacked {
    fn deserialize(buf: &mut Cursor) -> Result<Self> {
        expect_id::<Self>(buf)?;
        Ok(Self {
            packed_data: buf.read_tl_bytes()?,
        })
    }
}

// ─── Ping / Pong ─────────────────────────────────────────────────────────────

/// `ping#7abe77ec ping_id:long = Pong`.
#[derive(Clone, Debug, PartialEq)]
pub struct Ping {
    pub ping_id: i64,
}

impl Identifiable for Ping {
    const CONSTRUCTOR_ID: u32 = 0x7abe77ec;
}

impl Serializable for Ping {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.ping_id.serialize(buf);
    }
}

impl RemoteCall for Ping {
    type Return = Pong;
}

/// `pong#347773c5 msg_id:long ping_id:long`.
#[derive(Clone, Debug, PartialEq)]
pub struct Pong {
    pub msg_id: i64,
    pub ping_id: i64,
}

impl Identifiable for Pong {
    const CONSTRUCTOR_ID: u32 = 0x347773c5;
}

impl Serializable for Pong {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.msg_id.serialize(buf);
        self.ping_id.serialize(buf);
    }
}

impl Deserializable for Pong {
    fn deserialize(buf: &mut Cursor) -> Result<Self> {
        expect_id::<Self>(buf)?;
        Ok(Self {
            msg_id: i64::deserialize(buf)?,
            ping_id: i64::deserialize(buf)?,
        })
    }
}

// ─── Salt and session notifications ──────────────────────────────────────────

/// `bad_server_salt#edab447b bad_msg_id:long bad_msg_seqno:int error_code:int
/// new_server_salt:long`.
#[derive(Clone, Debug, PartialEq)]
pub struct BadServerSalt {
    pub bad_msg_id: i64,
    pub bad_msg_seqno: i32,
    pub error_code: i32,
    pub new_server_salt: i64,
}

impl Identifiable for BadServerSalt {
    const CONSTRUCTOR_ID: u32 = 0xedab447b;
}

impl Serializable for BadServerSalt {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.bad_msg_id.serialize(buf);
        self.bad_msg_seqno.serialize(buf);
        self.error_code.serialize(buf);
        self.new_server_salt.serialize(buf);
    }
}

impl Deserializable for BadServerSalt {
    fn deserialize(buf: &mut Cursor) -> Result<Self> {
        expect_id::<Self>(buf)?;
        Ok(Self {
            bad_msg_id: i64::deserialize(buf)?,
            bad_msg_seqno: i32::deserialize(buf)?,
            error_code: i32::deserialize(buf)?,
            new_server_salt: i64::deserialize(buf)?,
        })
    }
}

/// `bad_msg_notification#a7eff811 bad_msg_id:long bad_msg_seqno:int
/// error_code:int`.
#[derive(Clone, Debug, PartialEq)]
pub struct BadMsgNotification {
    pub bad_msg_id: i64,
    pub bad_msg_seqno: i32,
    pub error_code: i32,
}

impl Identifiable for BadMsgNotification {
    const CONSTRUCTOR_ID: u32 = 0xa7eff811;
}

impl Serializable for BadMsgNotification {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.bad_msg_id.serialize(buf);
        self.bad_msg_seqno.serialize(buf);
        self.error_code.serialize(buf);
    }
}

impl Deserializable for BadMsgNotification {
    fn deserialize(buf: &mut Cursor) -> Result<Self> {
        expect_id::<Self>(buf)?;
        Ok(Self {
            bad_msg_id: i64::deserialize(buf)?,
            bad_msg_seqno: i32::deserialize(buf)?,
            error_code: i32::deserialize(buf)?,
        })
    }
}

/// `new_session_created#9ec20908 first_msg_id:long unique_id:long
/// server_salt:long`.
#[derive(Clone, Debug, PartialEq)]
pub struct NewSessionCreated {
    pub first_msg_id: i64,
    pub unique_id: i64,
    pub server_salt: i64,
}

impl Identifiable for NewSessionCreated {
    const CONSTRUCTOR_ID: u32 = 0x9ec20908;
}

impl Serializable for NewSessionCreated {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.first_msg_id.serialize(buf);
        self.unique_id.serialize(buf);
        self.server_salt.serialize(buf);
    }
}

impl Deserializable for NewSessionCreated {
    fn deserialize(buf: &mut Cursor) -> Result<Self> {
        expect_id::<Self>(buf)?;
        Ok(Self {
            first_msg_id: i64::deserialize(buf)?,
            unique_id: i64::deserialize(buf)?,
            server_salt: i64::deserialize(buf)?,
        })
    }
}

// ─── Acknowledgements and message state ──────────────────────────────────────

/// `msgs_ack#62d6b459 msg_ids:Vector<long>`.
#[derive(Clone, Debug, PartialEq)]
pub struct MsgsAck {
    pub msg_ids: Vec<i64>,
}

impl Identifiable for MsgsAck {
    const CONSTRUCTOR_ID: u32 = 0x62d6b459;
}

impl Serializable for MsgsAck {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.msg_ids.serialize(buf);
    }
}

impl Deserializable for MsgsAck {
    fn deserialize(buf: &mut Cursor) -> Result<Self> {
        expect_id::<Self>(buf)?;
        Ok(Self {
            msg_ids: Vec::<i64>::deserialize(buf)?,
        })
    }
}

/// `msg_detailed_info#276d3ec6 msg_id:long answer_msg_id:long bytes:int
/// status:int`.
#[derive(Clone, Debug, PartialEq)]
pub struct MsgDetailedInfo {
    pub msg_id: i64,
    pub answer_msg_id: i64,
    pub bytes: i32,
    pub status: i32,
}

impl Identifiable for MsgDetailedInfo {
    const CONSTRUCTOR_ID: u32 = 0x276d3ec6;
}

impl Serializable for MsgDetailedInfo {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.msg_id.serialize(buf);
        self.answer_msg_id.serialize(buf);
        self.bytes.serialize(buf);
        self.status.serialize(buf);
    }
}

impl Deserializable for MsgDetailedInfo {
    fn deserialize(buf: &mut Cursor) -> Result<Self> {
        expect_id::<Self>(buf)?;
        Ok(Self {
            msg_id: i64::deserialize(buf)?,
            answer_msg_id: i64::deserialize(buf)?,
            bytes: i32::deserialize(buf)?,
            status: i32::deserialize(buf)?,
        })
    }
}

/// `msg_new_detailed_info#809db6df answer_msg_id:long bytes:int status:int`.
#[derive(Clone, Debug, PartialEq)]
pub struct MsgNewDetailedInfo {
    pub answer_msg_id: i64,
    pub bytes: i32,
    pub status: i32,
}

impl Identifiable for MsgNewDetailedInfo {
    const CONSTRUCTOR_ID: u32 = 0x809db6df;
}

impl Serializable for MsgNewDetailedInfo {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.answer_msg_id.serialize(buf);
        self.bytes.serialize(buf);
        self.status.serialize(buf);
    }
}

impl Deserializable for MsgNewDetailedInfo {
    fn deserialize(buf: &mut Cursor) -> Result<Self> {
        expect_id::<Self>(buf)?;
        Ok(Self {
            answer_msg_id: i64::deserialize(buf)?,
            bytes: i32::deserialize(buf)?,
            status: i32::deserialize(buf)?,
        })
    }
}

/// `msgs_state_req#da69fb52 msg_ids:Vector<long>`.
#[derive(Clone, Debug, PartialEq)]
pub struct MsgsStateReq {
    pub msg_ids: Vec<i64>,
}

impl Identifiable for MsgsStateReq {
    const CONSTRUCTOR_ID: u32 = 0xda69fb52;
}

impl Serializable for MsgsStateReq {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.msg_ids.serialize(buf);
    }
}

impl Deserializable for MsgsStateReq {
    fn deserialize(buf: &mut Cursor) -> Result<Self> {
        expect_id::<Self>(buf)?;
        Ok(Self {
            msg_ids: Vec::<i64>::deserialize(buf)?,
        })
    }
}

/// `msg_resend_req#7d861a08 msg_ids:Vector<long>`.
#[derive(Clone, Debug, PartialEq)]
pub struct MsgResendReq {
    pub msg_ids: Vec<i64>,
}

impl Identifiable for MsgResendReq {
    const CONSTRUCTOR_ID: u32 = 0x7d861a08;
}

impl Serializable for MsgResendReq {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.msg_ids.serialize(buf);
    }
}

impl Deserializable for MsgResendReq {
    fn deserialize(buf: &mut Cursor) -> Result<Self> {
        expect_id::<Self>(buf)?;
        Ok(Self {
            msg_ids: Vec::<i64>::deserialize(buf)?,
        })
    }
}

/// `msgs_state_info#04deb57d req_msg_id:long info:bytes`.
///
/// `info` holds one status byte per message id that was asked about.
#[derive(Clone, Debug, PartialEq)]
pub struct MsgsStateInfo {
    pub req_msg_id: i64,
    pub info: Vec<u8>,
}

impl Identifiable for MsgsStateInfo {
    const CONSTRUCTOR_ID: u32 = 0x04deb57d;
}

impl Serializable for MsgsStateInfo {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.req_msg_id.serialize(buf);
        self.info.as_slice().serialize(buf);
    }
}

impl Deserializable for MsgsStateInfo {
    fn deserialize(buf: &mut Cursor) -> Result<Self> {
        expect_id::<Self>(buf)?;
        Ok(Self {
            req_msg_id: i64::deserialize(buf)?,
            info: buf.read_tl_bytes()?,
        })
    }
}

/// `msgs_all_info#8cc0d131 msg_ids:Vector<long> info:bytes`.
#[derive(Clone, Debug, PartialEq)]
pub struct MsgsAllInfo {
    pub msg_ids: Vec<i64>,
    pub info: Vec<u8>,
}

impl Identifiable for MsgsAllInfo {
    const CONSTRUCTOR_ID: u32 = 0x8cc0d131;
}

impl Serializable for MsgsAllInfo {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.msg_ids.serialize(buf);
        self.info.as_slice().serialize(buf);
    }
}

impl Deserializable for MsgsAllInfo {
    fn deserialize(buf: &mut Cursor) -> Result<Self> {
        expect_id::<Self>(buf)?;
        Ok(Self {
            msg_ids: Vec::<i64>::deserialize(buf)?,
            info: buf.read_tl_bytes()?,
        })
    }
}

// ─── Future salts ────────────────────────────────────────────────────────────

/// `future_salt#0949d9dc valid_since:int valid_until:int salt:long`.
#[derive(Clone, Debug, PartialEq)]
pub struct FutureSalt {
    pub valid_since: i32,
    pub valid_until: i32,
    pub salt: i64,
}

impl Identifiable for FutureSalt {
    const CONSTRUCTOR_ID: u32 = 0x0949d9dc;
}

impl Serializable for FutureSalt {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.valid_since.serialize(buf);
        self.valid_until.serialize(buf);
        self.salt.serialize(buf);
    }
}

impl Deserializable for FutureSalt {
    fn deserialize(buf: &mut Cursor) -> Result<Self> {
        expect_id::<Self>(buf)?;
        Ok(Self {
            valid_since: i32::deserialize(buf)?,
            valid_until: i32::deserialize(buf)?,
            salt: i64::deserialize(buf)?,
        })
    }
}

/// `future_salts#ae500895 req_msg_id:long now:int salts:vector<future_salt>`.
///
/// `salts` is a bare vector: a count followed by the items, no `Vector`
/// constructor header.
#[derive(Clone, Debug, PartialEq)]
pub struct FutureSalts {
    pub req_msg_id: i64,
    pub now: i32,
    pub salts: Vec<FutureSalt>,
}

impl Identifiable for FutureSalts {
    const CONSTRUCTOR_ID: u32 = 0xae500895;
}

impl Serializable for FutureSalts {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.req_msg_id.serialize(buf);
        self.now.serialize(buf);
        (self.salts.len() as i32).serialize(buf);
        for salt in &self.salts {
            salt.serialize(buf);
        }
    }
}

impl Deserializable for FutureSalts {
    fn deserialize(buf: &mut Cursor) -> Result<Self> {
        expect_id::<Self>(buf)?;
        let req_msg_id = i64::deserialize(buf)?;
        let now = i32::deserialize(buf)?;
        let count = i32::deserialize(buf)? as usize;
        let salts = (0..count)
            .map(|_| FutureSalt::deserialize(buf))
            .collect::<Result<_>>()?;
        Ok(Self { req_msg_id, now, salts })
    }
}

/// `get_future_salts#b921bd04 num:int = FutureSalts`.
#[derive(Clone, Debug, PartialEq)]
pub struct GetFutureSalts {
    pub num: i32,
}

impl Identifiable for GetFutureSalts {
    const CONSTRUCTOR_ID: u32 = 0xb921bd04;
}

impl Serializable for GetFutureSalts {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.num.serialize(buf);
    }
}

impl RemoteCall for GetFutureSalts {
    type Return = FutureSalts;
}

// ─── Service RPCs with irregular replies ─────────────────────────────────────

/// `auth.logOut#3e72ba19 = Bool`.
///
/// This RPC never receives an `rpc_result`; the server's `msgs_ack` is the
/// only confirmation, which the sender translates into a `true` reply.
#[derive(Clone, Debug, PartialEq)]
pub struct LogOut;

impl Identifiable for LogOut {
    const CONSTRUCTOR_ID: u32 = 0x3e72ba19;
}

impl Serializable for LogOut {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
    }
}

impl RemoteCall for LogOut {
    type Return = bool;
}

// ─── Foreign constructor IDs the dispatcher recognizes ───────────────────────

/// `upload.file#096ae87b` — stray download chunks are dropped silently.
pub const UPLOAD_FILE_ID: u32 = 0x096ae87b;
/// `upload.fileCdnRedirect#f18cda44`.
pub const UPLOAD_FILE_CDN_REDIRECT_ID: u32 = 0xf18cda44;

/// Constructor IDs of the `Updates` type family, forwarded raw to the update
/// callback rather than handled by the state machine.
pub const UPDATE_IDS: [u32; 6] = [
    0xe317af7e, // updatesTooLong
    0x313bc7f8, // updateShortMessage
    0x4d6deea5, // updateShortChatMessage
    0x78d4dec1, // updateShort
    0x725b04c3, // updatesCombined
    0x74ae4240, // updates
];

// ─── ServiceMessage ──────────────────────────────────────────────────────────

/// A decoded service-layer message, ready for dispatch.
///
/// The set is closed: every constructor the server may legitimately place at
/// the top level of a decrypted message is either listed here or belongs to
/// the `Updates` family and is forwarded raw.
#[derive(Clone, Debug, PartialEq)]
pub enum ServiceMessage {
    RpcResult(RpcResult),
    Container(MessageContainer),
    Gzip(GzipPacked),
    Pong(Pong),
    BadServerSalt(BadServerSalt),
    BadMsgNotification(BadMsgNotification),
    NewSessionCreated(NewSessionCreated),
    Ack(MsgsAck),
    DetailedInfo(MsgDetailedInfo),
    NewDetailedInfo(MsgNewDetailedInfo),
    FutureSalts(FutureSalts),
    StateReq(MsgsStateReq),
    ResendReq(MsgResendReq),
    AllInfo(MsgsAllInfo),
    /// An `Updates` constructor, kept raw for the update callback.
    Update(Vec<u8>),
}

impl ServiceMessage {
    /// Decode the body of a decrypted message.
    ///
    /// Unknown constructors come back as
    /// [`Error::UnexpectedConstructor`]; the remaining bytes of the frame are
    /// skippable.
    pub fn from_bytes(body: &[u8]) -> Result<Self> {
        let id = {
            let mut peek = Cursor::from_slice(body);
            u32::deserialize(&mut peek)?
        };
        let mut buf = Cursor::from_slice(body);
        Ok(match id {
            RpcResult::CONSTRUCTOR_ID => Self::RpcResult(RpcResult::deserialize(&mut buf)?),
            MessageContainer::CONSTRUCTOR_ID => {
                Self::Container(MessageContainer::deserialize(&mut buf)?)
            }
            GzipPacked::CONSTRUCTOR_ID => Self::Gzip(GzipPacked::deserialize(&mut buf)?),
            Pong::CONSTRUCTOR_ID => Self::Pong(Pong::deserialize(&mut buf)?),
            BadServerSalt::CONSTRUCTOR_ID => {
                Self::BadServerSalt(BadServerSalt::deserialize(&mut buf)?)
            }
            BadMsgNotification::CONSTRUCTOR_ID => {
                Self::BadMsgNotification(BadMsgNotification::deserialize(&mut buf)?)
            }
            NewSessionCreated::CONSTRUCTOR_ID => {
                Self::NewSessionCreated(NewSessionCreated::deserialize(&mut buf)?)
            }
            MsgsAck::CONSTRUCTOR_ID => Self::Ack(MsgsAck::deserialize(&mut buf)?),
            MsgDetailedInfo::CONSTRUCTOR_ID => {
                Self::DetailedInfo(MsgDetailedInfo::deserialize(&mut buf)?)
            }
            MsgNewDetailedInfo::CONSTRUCTOR_ID => {
                Self::NewDetailedInfo(MsgNewDetailedInfo::deserialize(&mut buf)?)
            }
            FutureSalts::CONSTRUCTOR_ID => Self::FutureSalts(FutureSalts::deserialize(&mut buf)?),
            MsgsStateReq::CONSTRUCTOR_ID => Self::StateReq(MsgsStateReq::deserialize(&mut buf)?),
            MsgResendReq::CONSTRUCTOR_ID => Self::ResendReq(MsgResendReq::deserialize(&mut buf)?),
            MsgsAllInfo::CONSTRUCTOR_ID => Self::AllInfo(MsgsAllInfo::deserialize(&mut buf)?),
            id if UPDATE_IDS.contains(&id) => Self::Update(body.to_vec()),
            id => return Err(Error::UnexpectedConstructor { id }),
        })
    }
}
