//! Request/response frames
//!
//! ```text
//! +------+----+-------+-----+-----------+-----+------+-------+
//! | kind | op | table | key | timestamp | seq | body | crc32 |
//! |  u8  | u8 |  u32  | u64 |    u64    | u64 | ...  |  u32  |
//! +------+----+-------+-----+-----------+-----+------+-------+
//! ```
//!
//! All integers are little-endian. `timestamp` is a snapshot number: the
//! read snapshot for snapshot reads, the requester's current SS otherwise.
//! `seq` pairs a reply with its request. The CRC covers every preceding
//! byte.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use epochkv_core::{Key, TableId};
use std::io::{self, Cursor, Read};
use thiserror::Error;

const KIND_REQUEST: u8 = 0;
const KIND_REPLY: u8 = 1;

const HEADER_LEN: usize = 1 + 1 + 4 + 8 + 8 + 8;
const CRC_LEN: usize = 4;

/// Frame decoding failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Frame ended early
    #[error("truncated frame")]
    Truncated,

    /// CRC mismatch
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    Checksum {
        /// CRC stored in the frame
        expected: u32,
        /// CRC computed over the frame
        actual: u32,
    },

    /// Unknown frame kind byte
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),

    /// Unknown operation byte
    #[error("unknown op {0}")]
    UnknownOp(u8),

    /// Unknown body tag
    #[error("unknown body tag {0:#04x}")]
    UnknownTag(u8),

    /// Unknown deny reason
    #[error("unknown deny reason {0}")]
    UnknownReason(u8),

    /// Body tag does not belong to the header's op
    #[error("body does not match op {0:?}")]
    OpMismatch(Op),

    /// Bytes left between body and checksum
    #[error("{0} trailing bytes")]
    Trailing(usize),

    /// Value does not fit the length field
    #[error("value too large: {0} bytes")]
    TooLarge(usize),
}

/// Operation carried in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    /// READ_REQ: snapshot read or read lease
    ReadReq = 0,
    /// WRITE_REQ: exclusive lock
    WriteReq = 1,
    /// RELEASE_REQ: optional write-back then unlock, or a lease given back
    ReleaseReq = 2,
}

impl TryFrom<u8> for Op {
    type Error = FrameError;

    fn try_from(b: u8) -> Result<Self, FrameError> {
        match b {
            0 => Ok(Op::ReadReq),
            1 => Ok(Op::WriteReq),
            2 => Ok(Op::ReleaseReq),
            other => Err(FrameError::UnknownOp(other)),
        }
    }
}

/// Fixed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Operation
    pub op: Op,
    /// Target table
    pub table: TableId,
    /// Target key
    pub key: Key,
    /// Snapshot number
    pub timestamp: u64,
    /// Request sequence number, echoed by the reply
    pub seq: u64,
}

/// A committed version carried on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// Commit snapshot
    pub stamp: u64,
    /// Commit sequence
    pub seq: u64,
    /// Value bytes, `None` for a delete
    pub value: Option<Vec<u8>>,
}

/// Request bodies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Read the version visible at `header.timestamp`
    SnapshotRead,
    /// Take a read lease ending at `end` and read the latest version
    LeaseRead {
        /// Lease expiry snapshot
        end: u64,
    },
    /// Take the exclusive lock
    Lock {
        /// Lock owner token
        owner: u64,
        /// Requester's begin sequence for the first-committer-wins check
        begin_seq: u64,
        /// Expiry of the requester's own lease on the record, upgraded in
        /// place when it is the only holder
        lease: Option<u64>,
    },
    /// Optionally install a version, then unlock
    Release {
        /// Lock owner token
        owner: u64,
        /// Version to install before unlocking
        write_back: Option<Payload>,
    },
    /// Give back a read lease granted until `end`
    ReleaseLease {
        /// Expiry the lease was granted with
        end: u64,
    },
}

impl Request {
    /// Header op for this request
    pub fn op(&self) -> Op {
        match self {
            Request::SnapshotRead | Request::LeaseRead { .. } => Op::ReadReq,
            Request::Lock { .. } => Op::WriteReq,
            Request::Release { .. } | Request::ReleaseLease { .. } => Op::ReleaseReq,
        }
    }
}

/// Why a request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DenyReason {
    /// Exclusively locked by another owner
    Locked = 0,
    /// Covered by an unexpired read lease
    Leased = 1,
    /// Key absent
    NotFound = 2,
    /// No room for the key
    StoreFull = 3,
    /// Table not declared on the partition
    UnknownTable = 4,
    /// Release by a transaction that does not hold the lock
    NotOwner = 5,
    /// A newer version was committed after the requester began
    Conflict = 6,
}

impl TryFrom<u8> for DenyReason {
    type Error = FrameError;

    fn try_from(b: u8) -> Result<Self, FrameError> {
        Ok(match b {
            0 => DenyReason::Locked,
            1 => DenyReason::Leased,
            2 => DenyReason::NotFound,
            3 => DenyReason::StoreFull,
            4 => DenyReason::UnknownTable,
            5 => DenyReason::NotOwner,
            6 => DenyReason::Conflict,
            other => return Err(FrameError::UnknownReason(other)),
        })
    }
}

/// Reply bodies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Snapshot read result
    Value {
        /// Record slot, when the key exists
        slot: Option<u64>,
        /// Visible version, if any
        version: Option<Payload>,
    },
    /// Lease granted
    LeaseGranted {
        /// Effective lease expiry (may exceed the request's)
        end: u64,
        /// Record slot, when the key exists
        slot: Option<u64>,
        /// Latest version, if any
        version: Option<Payload>,
    },
    /// Lock granted
    LockGranted {
        /// Record slot
        slot: u64,
    },
    /// Unlocked
    Released,
    /// Refused
    Denied(DenyReason),
}

/// Frame body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Client to server
    Request(Request),
    /// Server to client
    Reply(Reply),
}

/// A complete frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Fixed header
    pub header: Header,
    /// Request or reply body
    pub body: Body,
}

mod tag {
    pub const SNAPSHOT_READ: u8 = 0x00;
    pub const LEASE_READ: u8 = 0x01;
    pub const LOCK: u8 = 0x02;
    pub const RELEASE: u8 = 0x03;
    pub const RELEASE_LEASE: u8 = 0x04;
    pub const VALUE: u8 = 0x10;
    pub const LEASE_GRANTED: u8 = 0x11;
    pub const LOCK_GRANTED: u8 = 0x12;
    pub const RELEASED: u8 = 0x13;
    pub const DENIED: u8 = 0x14;
}

impl Frame {
    /// Build a request frame; the op follows the request
    pub fn request(table: TableId, key: Key, timestamp: u64, seq: u64, request: Request) -> Self {
        Self {
            header: Header {
                op: request.op(),
                table,
                key,
                timestamp,
                seq,
            },
            body: Body::Request(request),
        }
    }

    /// Build the reply to `request` with the same header
    pub fn reply_to(request: &Header, reply: Reply) -> Self {
        Self {
            header: *request,
            body: Body::Reply(reply),
        }
    }

    /// Serialize with trailing CRC
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 32 + CRC_LEN);
        self.write_into(&mut buf)?;
        let crc = crc32fast::hash(&buf);
        buf.write_u32::<LittleEndian>(crc)?;
        Ok(buf)
    }

    fn write_into(&self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        let kind = match self.body {
            Body::Request(_) => KIND_REQUEST,
            Body::Reply(_) => KIND_REPLY,
        };
        buf.write_u8(kind)?;
        buf.write_u8(self.header.op as u8)?;
        buf.write_u32::<LittleEndian>(self.header.table.0)?;
        buf.write_u64::<LittleEndian>(self.header.key)?;
        buf.write_u64::<LittleEndian>(self.header.timestamp)?;
        buf.write_u64::<LittleEndian>(self.header.seq)?;

        match &self.body {
            Body::Request(Request::SnapshotRead) => buf.write_u8(tag::SNAPSHOT_READ)?,
            Body::Request(Request::LeaseRead { end }) => {
                buf.write_u8(tag::LEASE_READ)?;
                buf.write_u64::<LittleEndian>(*end)?;
            }
            Body::Request(Request::Lock {
                owner,
                begin_seq,
                lease,
            }) => {
                buf.write_u8(tag::LOCK)?;
                buf.write_u64::<LittleEndian>(*owner)?;
                buf.write_u64::<LittleEndian>(*begin_seq)?;
                write_opt_u64(buf, *lease)?;
            }
            Body::Request(Request::Release { owner, write_back }) => {
                buf.write_u8(tag::RELEASE)?;
                buf.write_u64::<LittleEndian>(*owner)?;
                write_payload(buf, write_back.as_ref())?;
            }
            Body::Request(Request::ReleaseLease { end }) => {
                buf.write_u8(tag::RELEASE_LEASE)?;
                buf.write_u64::<LittleEndian>(*end)?;
            }
            Body::Reply(Reply::Value { slot, version }) => {
                buf.write_u8(tag::VALUE)?;
                write_opt_u64(buf, *slot)?;
                write_payload(buf, version.as_ref())?;
            }
            Body::Reply(Reply::LeaseGranted { end, slot, version }) => {
                buf.write_u8(tag::LEASE_GRANTED)?;
                buf.write_u64::<LittleEndian>(*end)?;
                write_opt_u64(buf, *slot)?;
                write_payload(buf, version.as_ref())?;
            }
            Body::Reply(Reply::LockGranted { slot }) => {
                buf.write_u8(tag::LOCK_GRANTED)?;
                buf.write_u64::<LittleEndian>(*slot)?;
            }
            Body::Reply(Reply::Released) => buf.write_u8(tag::RELEASED)?,
            Body::Reply(Reply::Denied(reason)) => {
                buf.write_u8(tag::DENIED)?;
                buf.write_u8(*reason as u8)?;
            }
        }
        Ok(())
    }

    /// Parse and verify a frame
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LEN + 1 + CRC_LEN {
            return Err(FrameError::Truncated);
        }
        let (content, trailer) = bytes.split_at(bytes.len() - CRC_LEN);
        let mut crc_reader = trailer;
        let expected = crc_reader.read_u32::<LittleEndian>()?;
        let actual = crc32fast::hash(content);
        if expected != actual {
            return Err(FrameError::Checksum { expected, actual });
        }

        let mut r = Cursor::new(content);
        let kind = r.read_u8()?;
        let op = Op::try_from(r.read_u8()?)?;
        let header = Header {
            op,
            table: TableId(r.read_u32::<LittleEndian>()?),
            key: r.read_u64::<LittleEndian>()?,
            timestamp: r.read_u64::<LittleEndian>()?,
            seq: r.read_u64::<LittleEndian>()?,
        };

        let body_tag = r.read_u8()?;
        let body = match (kind, body_tag) {
            (KIND_REQUEST, tag::SNAPSHOT_READ) => Body::Request(Request::SnapshotRead),
            (KIND_REQUEST, tag::LEASE_READ) => Body::Request(Request::LeaseRead {
                end: r.read_u64::<LittleEndian>()?,
            }),
            (KIND_REQUEST, tag::LOCK) => Body::Request(Request::Lock {
                owner: r.read_u64::<LittleEndian>()?,
                begin_seq: r.read_u64::<LittleEndian>()?,
                lease: read_opt_u64(&mut r)?,
            }),
            (KIND_REQUEST, tag::RELEASE) => Body::Request(Request::Release {
                owner: r.read_u64::<LittleEndian>()?,
                write_back: read_payload(&mut r)?,
            }),
            (KIND_REQUEST, tag::RELEASE_LEASE) => Body::Request(Request::ReleaseLease {
                end: r.read_u64::<LittleEndian>()?,
            }),
            (KIND_REPLY, tag::VALUE) => Body::Reply(Reply::Value {
                slot: read_opt_u64(&mut r)?,
                version: read_payload(&mut r)?,
            }),
            (KIND_REPLY, tag::LEASE_GRANTED) => Body::Reply(Reply::LeaseGranted {
                end: r.read_u64::<LittleEndian>()?,
                slot: read_opt_u64(&mut r)?,
                version: read_payload(&mut r)?,
            }),
            (KIND_REPLY, tag::LOCK_GRANTED) => Body::Reply(Reply::LockGranted {
                slot: r.read_u64::<LittleEndian>()?,
            }),
            (KIND_REPLY, tag::RELEASED) => Body::Reply(Reply::Released),
            (KIND_REPLY, tag::DENIED) => {
                Body::Reply(Reply::Denied(DenyReason::try_from(r.read_u8()?)?))
            }
            (KIND_REQUEST | KIND_REPLY, other) => return Err(FrameError::UnknownTag(other)),
            (other, _) => return Err(FrameError::UnknownKind(other)),
        };

        if let Body::Request(req) = &body {
            if req.op() != header.op {
                return Err(FrameError::OpMismatch(header.op));
            }
        }

        let left = content.len() - r.position() as usize;
        if left != 0 {
            return Err(FrameError::Trailing(left));
        }
        Ok(Frame { header, body })
    }
}

// Reads only fail on a short buffer and writes go to a Vec
impl From<io::Error> for FrameError {
    fn from(_: io::Error) -> Self {
        FrameError::Truncated
    }
}

fn write_opt_u64(buf: &mut Vec<u8>, v: Option<u64>) -> Result<(), FrameError> {
    match v {
        Some(v) => {
            buf.write_u8(1)?;
            buf.write_u64::<LittleEndian>(v)?;
        }
        None => buf.write_u8(0)?,
    }
    Ok(())
}

fn read_opt_u64(r: &mut Cursor<&[u8]>) -> Result<Option<u64>, FrameError> {
    match r.read_u8()? {
        0 => Ok(None),
        _ => Ok(Some(r.read_u64::<LittleEndian>()?)),
    }
}

fn write_payload(buf: &mut Vec<u8>, p: Option<&Payload>) -> Result<(), FrameError> {
    let Some(p) = p else {
        buf.write_u8(0)?;
        return Ok(());
    };
    buf.write_u8(1)?;
    buf.write_u64::<LittleEndian>(p.stamp)?;
    buf.write_u64::<LittleEndian>(p.seq)?;
    match &p.value {
        Some(v) => {
            let len = u32::try_from(v.len()).map_err(|_| FrameError::TooLarge(v.len()))?;
            buf.write_u8(1)?;
            buf.write_u32::<LittleEndian>(len)?;
            buf.extend_from_slice(v);
        }
        None => buf.write_u8(0)?,
    }
    Ok(())
}

fn read_payload(r: &mut Cursor<&[u8]>) -> Result<Option<Payload>, FrameError> {
    if r.read_u8()? == 0 {
        return Ok(None);
    }
    let stamp = r.read_u64::<LittleEndian>()?;
    let seq = r.read_u64::<LittleEndian>()?;
    let value = match r.read_u8()? {
        0 => None,
        _ => {
            let len = r.read_u32::<LittleEndian>()? as usize;
            let remaining = r.get_ref().len() - r.position() as usize;
            if len > remaining {
                return Err(FrameError::Truncated);
            }
            let mut bytes = vec![0u8; len];
            r.read_exact(&mut bytes)?;
            Some(bytes)
        }
    };
    Ok(Some(Payload { stamp, seq, value }))
}
