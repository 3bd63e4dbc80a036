// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Intent Log - Record codec
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Encodes and decodes individual log records.
//
// On-media format (all integers u64 in the block's byte order, every record
// padded to a multiple of 8 bytes):
//   [txtype]  -- kind code 1..=12; top bit set for case-insensitive names
//   [reclen]  -- total record length including this prefix and padding
//   [txg]     -- generation the operation was assigned to
//   [seq]     -- record sequence number, strictly increasing per log
//   [body]    -- kind-specific fields, then variable-length names or data
//
// Write records carry their data either *by value* (appended after the
// fixed body; `reclen > WRITE_FIXED_LEN`) or *by reference* (the embedded
// block pointer names where the data already lives).
//
// Entry names and symlink targets are UTF-8. A record whose name bytes are
// not valid UTF-8 decodes as `MalformedRecord`, which stops replay.

use std::fmt;

use crate::blkptr::{BlockPtr, ByteOrder, Decoder, BLKPTR_SIZE};
use crate::error::{LogError, LogResult};

/// Size of the common record prefix.
pub const RECORD_PREFIX_LEN: usize = 4 * 8;

/// Byte offset of the sequence number inside the record prefix.
pub const RECORD_SEQ_OFFSET: usize = 3 * 8;

/// Length of a write record without inline data.
pub const WRITE_FIXED_LEN: usize = RECORD_PREFIX_LEN + 4 * 8 + BLKPTR_SIZE;

/// Largest fixed (name- and data-free) record length of any kind.
pub const MAX_FIXED_RECORD_LEN: usize = WRITE_FIXED_LEN;

/// Top bit of the type code marks case-insensitive name handling.
pub const TXTYPE_CASE_INSENSITIVE: u64 = 1 << 63;

/// Round `len` up to the record alignment. Saturates near `usize::MAX`.
pub fn pad8(len: usize) -> usize {
    len.saturating_add(7) & !7
}

// ---------------------------------------------------------------------------
// ObjectId
// ---------------------------------------------------------------------------

/// A filesystem object (file, directory, ...) inside a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// RecordKind
// ---------------------------------------------------------------------------

/// The operation a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Create a regular file.
    Create = 1,
    /// Create a directory.
    Mkdir = 2,
    /// Create an extended-attribute directory.
    Mkxattr = 3,
    /// Create a symbolic link.
    Symlink = 4,
    /// Remove a file.
    Remove = 5,
    /// Remove a directory.
    Rmdir = 6,
    /// Add a hard link.
    Link = 7,
    /// Rename an entry.
    Rename = 8,
    /// Write data.
    Write = 9,
    /// Free a byte range.
    Truncate = 10,
    /// Change attributes.
    Setattr = 11,
    /// Replace an ACL.
    Acl = 12,
}

impl RecordKind {
    /// Decode a type code (without the case-insensitive bit).
    pub fn from_code(code: u64) -> LogResult<Self> {
        Ok(match code {
            1 => Self::Create,
            2 => Self::Mkdir,
            3 => Self::Mkxattr,
            4 => Self::Symlink,
            5 => Self::Remove,
            6 => Self::Rmdir,
            7 => Self::Link,
            8 => Self::Rename,
            9 => Self::Write,
            10 => Self::Truncate,
            11 => Self::Setattr,
            12 => Self::Acl,
            other => return Err(LogError::UnknownRecordKind(other)),
        })
    }

    /// The on-media type code.
    pub fn code(self) -> u64 {
        self as u64
    }

    /// Kinds that may be logged after a later operation already removed
    /// their target object, so replay must tolerate a missing object.
    pub fn may_be_out_of_order(self) -> bool {
        matches!(
            self,
            Self::Write | Self::Truncate | Self::Setattr | Self::Acl
        )
    }
}

// ---------------------------------------------------------------------------
// Record bodies
// ---------------------------------------------------------------------------

/// Body shared by create, mkdir, mkxattr and symlink.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CreateBody {
    /// Parent directory.
    pub doid: ObjectId,
    /// Object being created.
    pub foid: ObjectId,
    pub mode: u64,
    pub uid: u64,
    pub gid: u64,
    /// Object generation number.
    pub gen: u64,
    /// Creation time in seconds.
    pub crtime: u64,
    /// Device number for special files.
    pub rdev: u64,
    /// Entry name. Must be UTF-8.
    pub name: String,
    /// Link target (symlinks only).
    pub target: String,
}

/// Body shared by remove and rmdir.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoveBody {
    /// Directory holding the entry.
    pub doid: ObjectId,
    /// Entry name.
    pub name: String,
}

/// Hard link body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinkBody {
    /// Directory receiving the new entry.
    pub doid: ObjectId,
    /// Object being linked.
    pub link_obj: ObjectId,
    /// New entry name.
    pub name: String,
}

/// Rename body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RenameBody {
    /// Source directory.
    pub sdoid: ObjectId,
    /// Target directory.
    pub tdoid: ObjectId,
    /// Object being renamed.
    pub foid: ObjectId,
    /// Source name.
    pub sname: String,
    /// Target name.
    pub tname: String,
}

/// Write body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WriteBody {
    /// File being written.
    pub foid: ObjectId,
    /// File offset of the write.
    pub offset: u64,
    /// Length of the write.
    pub length: u64,
    /// Offset of the write within the referenced data block.
    pub blkoff: u64,
    /// Location of the data when logged by reference.
    pub blkptr: Option<BlockPtr>,
    /// The data when logged by value.
    pub data: Option<Vec<u8>>,
}

/// Truncate body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TruncateBody {
    pub foid: ObjectId,
    pub offset: u64,
    pub length: u64,
}

/// Setattr body. `mask` says which of the following fields are meaningful.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SetattrBody {
    pub foid: ObjectId,
    pub mask: u64,
    pub mode: u64,
    pub uid: u64,
    pub gid: u64,
    pub size: u64,
    pub atime: u64,
    pub mtime: u64,
}

/// ACL body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AclBody {
    pub foid: ObjectId,
    /// Number of ACL entries encoded in `data`.
    pub entry_count: u64,
    /// Opaque ACL entries.
    pub data: Vec<u8>,
}

/// Typed record payload. The variant determines the record kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    Create(CreateBody),
    Mkdir(CreateBody),
    Mkxattr(CreateBody),
    Symlink(CreateBody),
    Remove(RemoveBody),
    Rmdir(RemoveBody),
    Link(LinkBody),
    Rename(RenameBody),
    Write(WriteBody),
    Truncate(TruncateBody),
    Setattr(SetattrBody),
    Acl(AclBody),
}

impl RecordBody {
    /// Kind of this body.
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Create(_) => RecordKind::Create,
            Self::Mkdir(_) => RecordKind::Mkdir,
            Self::Mkxattr(_) => RecordKind::Mkxattr,
            Self::Symlink(_) => RecordKind::Symlink,
            Self::Remove(_) => RecordKind::Remove,
            Self::Rmdir(_) => RecordKind::Rmdir,
            Self::Link(_) => RecordKind::Link,
            Self::Rename(_) => RecordKind::Rename,
            Self::Write(_) => RecordKind::Write,
            Self::Truncate(_) => RecordKind::Truncate,
            Self::Setattr(_) => RecordKind::Setattr,
            Self::Acl(_) => RecordKind::Acl,
        }
    }

    /// The object an itx carrying this body is queued under.
    pub fn object(&self) -> ObjectId {
        match self {
            Self::Create(b) | Self::Mkdir(b) | Self::Mkxattr(b) | Self::Symlink(b) => b.foid,
            Self::Remove(b) | Self::Rmdir(b) => b.doid,
            Self::Link(b) => b.link_obj,
            Self::Rename(b) => b.foid,
            Self::Write(b) => b.foid,
            Self::Truncate(b) => b.foid,
            Self::Setattr(b) => b.foid,
            Self::Acl(b) => b.foid,
        }
    }
}

// ---------------------------------------------------------------------------
// LogRecord
// ---------------------------------------------------------------------------

/// One decoded (or to-be-encoded) log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Names are compared case-insensitively when replaying.
    pub case_insensitive: bool,
    /// Generation the operation belongs to.
    pub txg: u64,
    /// Sequence number (0 until committed).
    pub seq: u64,
    /// Typed payload.
    pub body: RecordBody,
}

impl LogRecord {
    /// A record for `body` with no generation or sequence yet.
    pub fn new(body: RecordBody) -> Self {
        Self {
            case_insensitive: false,
            txg: 0,
            seq: 0,
            body,
        }
    }

    /// Kind of the record.
    pub fn kind(&self) -> RecordKind {
        self.body.kind()
    }

    /// Encoded length of the record as it currently stands.
    pub fn encoded_len(&self) -> usize {
        RECORD_PREFIX_LEN + body_len(&self.body)
    }

    fn txtype(&self) -> u64 {
        let mut txtype = self.kind().code();
        if self.case_insensitive {
            txtype |= TXTYPE_CASE_INSENSITIVE;
        }
        txtype
    }
}

fn body_len(body: &RecordBody) -> usize {
    match body {
        RecordBody::Create(b) | RecordBody::Mkdir(b) | RecordBody::Mkxattr(b) | RecordBody::Symlink(b) => {
            10 * 8 + pad8(b.name.len() + b.target.len())
        }
        RecordBody::Remove(b) | RecordBody::Rmdir(b) => 2 * 8 + pad8(b.name.len()),
        RecordBody::Link(b) => 3 * 8 + pad8(b.name.len()),
        RecordBody::Rename(b) => 5 * 8 + pad8(b.sname.len() + b.tname.len()),
        RecordBody::Write(b) => {
            WRITE_FIXED_LEN - RECORD_PREFIX_LEN + b.data.as_ref().map_or(0, |d| pad8(d.len()))
        }
        RecordBody::Truncate(_) => 3 * 8,
        RecordBody::Setattr(_) => 8 * 8,
        RecordBody::Acl(b) => 3 * 8 + pad8(b.data.len()),
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a record in the host byte order.
pub fn encode_record(record: &LogRecord) -> Vec<u8> {
    encode_record_in(record, ByteOrder::NATIVE)
}

/// Encode a record in an explicit byte order.
pub fn encode_record_in(record: &LogRecord, order: ByteOrder) -> Vec<u8> {
    let reclen = record.encoded_len();
    let mut out = Vec::with_capacity(reclen);
    put_prefix(&mut out, record.txtype(), reclen, record, order);

    match &record.body {
        RecordBody::Create(b) | RecordBody::Mkdir(b) | RecordBody::Mkxattr(b) | RecordBody::Symlink(b) => {
            for v in [b.doid.0, b.foid.0, b.mode, b.uid, b.gid, b.gen, b.crtime, b.rdev] {
                order.put_u64(&mut out, v);
            }
            order.put_u64(&mut out, b.name.len() as u64);
            order.put_u64(&mut out, b.target.len() as u64);
            out.extend_from_slice(b.name.as_bytes());
            out.extend_from_slice(b.target.as_bytes());
        }
        RecordBody::Remove(b) | RecordBody::Rmdir(b) => {
            order.put_u64(&mut out, b.doid.0);
            order.put_u64(&mut out, b.name.len() as u64);
            out.extend_from_slice(b.name.as_bytes());
        }
        RecordBody::Link(b) => {
            order.put_u64(&mut out, b.doid.0);
            order.put_u64(&mut out, b.link_obj.0);
            order.put_u64(&mut out, b.name.len() as u64);
            out.extend_from_slice(b.name.as_bytes());
        }
        RecordBody::Rename(b) => {
            for v in [b.sdoid.0, b.tdoid.0, b.foid.0] {
                order.put_u64(&mut out, v);
            }
            order.put_u64(&mut out, b.sname.len() as u64);
            order.put_u64(&mut out, b.tname.len() as u64);
            out.extend_from_slice(b.sname.as_bytes());
            out.extend_from_slice(b.tname.as_bytes());
        }
        RecordBody::Write(b) => {
            put_write_fixed(&mut out, b, order);
            if let Some(data) = &b.data {
                out.extend_from_slice(data);
            }
        }
        RecordBody::Truncate(b) => {
            for v in [b.foid.0, b.offset, b.length] {
                order.put_u64(&mut out, v);
            }
        }
        RecordBody::Setattr(b) => {
            for v in [b.foid.0, b.mask, b.mode, b.uid, b.gid, b.size, b.atime, b.mtime] {
                order.put_u64(&mut out, v);
            }
        }
        RecordBody::Acl(b) => {
            order.put_u64(&mut out, b.foid.0);
            order.put_u64(&mut out, b.entry_count);
            order.put_u64(&mut out, b.data.len() as u64);
            out.extend_from_slice(&b.data);
        }
    }

    out.resize(reclen, 0);
    out
}

/// Encode the fixed part of a write record whose `data_len` bytes of inline
/// data will be copied in directly after it. The returned prefix declares the
/// full record length; the caller appends `pad8(data_len)` bytes of data.
pub fn encode_write_prefix(record: &LogRecord, data_len: usize) -> LogResult<Vec<u8>> {
    let RecordBody::Write(body) = &record.body else {
        return Err(LogError::MalformedRecord {
            offset: 0,
            reason: format!("{:?} record cannot carry write data", record.kind()),
        });
    };
    let reclen = WRITE_FIXED_LEN + pad8(data_len);
    let order = ByteOrder::NATIVE;
    let mut out = Vec::with_capacity(WRITE_FIXED_LEN);
    put_prefix(&mut out, record.txtype(), reclen, record, order);
    put_write_fixed(&mut out, body, order);
    Ok(out)
}

fn put_prefix(out: &mut Vec<u8>, txtype: u64, reclen: usize, record: &LogRecord, order: ByteOrder) {
    order.put_u64(out, txtype);
    order.put_u64(out, reclen as u64);
    order.put_u64(out, record.txg);
    order.put_u64(out, record.seq);
}

fn put_write_fixed(out: &mut Vec<u8>, body: &WriteBody, order: ByteOrder) {
    for v in [body.foid.0, body.offset, body.length, body.blkoff] {
        order.put_u64(out, v);
    }
    BlockPtr::encode_into(body.blkptr.as_ref(), out, order);
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode the record at the start of `data`. Returns the record and its
/// encoded length.
pub fn decode_record(data: &[u8], order: ByteOrder) -> LogResult<(LogRecord, usize)> {
    let malformed = |reason: &str| LogError::MalformedRecord {
        offset: 0,
        reason: reason.to_string(),
    };

    let mut dec = Decoder::new(data, order);
    let txtype = dec.u64().ok_or_else(|| malformed("truncated record prefix"))?;
    let reclen = dec.u64().ok_or_else(|| malformed("truncated record prefix"))?;
    let txg = dec.u64().ok_or_else(|| malformed("truncated record prefix"))?;
    let seq = dec.u64().ok_or_else(|| malformed("truncated record prefix"))?;

    let reclen = usize::try_from(reclen).map_err(|_| malformed("record length overflows"))?;
    if reclen < RECORD_PREFIX_LEN || reclen % 8 != 0 {
        return Err(malformed("record length is not a multiple of 8 or too short"));
    }
    if reclen > data.len() {
        return Err(malformed("record length exceeds block"));
    }

    let kind = RecordKind::from_code(txtype & !TXTYPE_CASE_INSENSITIVE)?;
    let mut body_dec = Decoder::new(&data[RECORD_PREFIX_LEN..reclen], order);
    let body = decode_body(kind, &mut body_dec, reclen).ok_or_else(|| malformed("truncated record body"))??;

    Ok((
        LogRecord {
            case_insensitive: txtype & TXTYPE_CASE_INSENSITIVE != 0,
            txg,
            seq,
            body,
        },
        reclen,
    ))
}

fn take_string(dec: &mut Decoder<'_>, len: u64) -> Option<LogResult<String>> {
    let bytes = dec.bytes(usize::try_from(len).ok()?)?;
    Some(String::from_utf8(bytes.to_vec()).map_err(|_| LogError::MalformedRecord {
        offset: 0,
        reason: "name is not valid UTF-8".to_string(),
    }))
}

/// Outer `None` means the body ran past the record.
fn decode_body(kind: RecordKind, dec: &mut Decoder<'_>, reclen: usize) -> Option<LogResult<RecordBody>> {
    let body = match kind {
        RecordKind::Create | RecordKind::Mkdir | RecordKind::Mkxattr | RecordKind::Symlink => {
            let doid = ObjectId(dec.u64()?);
            let foid = ObjectId(dec.u64()?);
            let mode = dec.u64()?;
            let uid = dec.u64()?;
            let gid = dec.u64()?;
            let gen = dec.u64()?;
            let crtime = dec.u64()?;
            let rdev = dec.u64()?;
            let name_len = dec.u64()?;
            let target_len = dec.u64()?;
            let name = match take_string(dec, name_len)? {
                Ok(name) => name,
                Err(e) => return Some(Err(e)),
            };
            let target = match take_string(dec, target_len)? {
                Ok(target) => target,
                Err(e) => return Some(Err(e)),
            };
            let body = CreateBody {
                doid,
                foid,
                mode,
                uid,
                gid,
                gen,
                crtime,
                rdev,
                name,
                target,
            };
            match kind {
                RecordKind::Create => RecordBody::Create(body),
                RecordKind::Mkdir => RecordBody::Mkdir(body),
                RecordKind::Mkxattr => RecordBody::Mkxattr(body),
                _ => RecordBody::Symlink(body),
            }
        }
        RecordKind::Remove | RecordKind::Rmdir => {
            let doid = ObjectId(dec.u64()?);
            let name_len = dec.u64()?;
            let name = match take_string(dec, name_len)? {
                Ok(name) => name,
                Err(e) => return Some(Err(e)),
            };
            let body = RemoveBody { doid, name };
            if kind == RecordKind::Remove {
                RecordBody::Remove(body)
            } else {
                RecordBody::Rmdir(body)
            }
        }
        RecordKind::Link => {
            let doid = ObjectId(dec.u64()?);
            let link_obj = ObjectId(dec.u64()?);
            let name_len = dec.u64()?;
            let name = match take_string(dec, name_len)? {
                Ok(name) => name,
                Err(e) => return Some(Err(e)),
            };
            RecordBody::Link(LinkBody { doid, link_obj, name })
        }
        RecordKind::Rename => {
            let sdoid = ObjectId(dec.u64()?);
            let tdoid = ObjectId(dec.u64()?);
            let foid = ObjectId(dec.u64()?);
            let sname_len = dec.u64()?;
            let tname_len = dec.u64()?;
            let sname = match take_string(dec, sname_len)? {
                Ok(name) => name,
                Err(e) => return Some(Err(e)),
            };
            let tname = match take_string(dec, tname_len)? {
                Ok(name) => name,
                Err(e) => return Some(Err(e)),
            };
            RecordBody::Rename(RenameBody {
                sdoid,
                tdoid,
                foid,
                sname,
                tname,
            })
        }
        RecordKind::Write => {
            let foid = ObjectId(dec.u64()?);
            let offset = dec.u64()?;
            let length = dec.u64()?;
            let blkoff = dec.u64()?;
            let blkptr = dec.blkptr()?;
            let data = if reclen > WRITE_FIXED_LEN {
                let len = usize::try_from(length).ok()?;
                if pad8(len) != reclen - WRITE_FIXED_LEN {
                    return Some(Err(LogError::MalformedRecord {
                        offset: 0,
                        reason: "inline data length disagrees with record length".to_string(),
                    }));
                }
                Some(dec.bytes(len)?.to_vec())
            } else {
                None
            };
            RecordBody::Write(WriteBody {
                foid,
                offset,
                length,
                blkoff,
                blkptr,
                data,
            })
        }
        RecordKind::Truncate => RecordBody::Truncate(TruncateBody {
            foid: ObjectId(dec.u64()?),
            offset: dec.u64()?,
            length: dec.u64()?,
        }),
        RecordKind::Setattr => RecordBody::Setattr(SetattrBody {
            foid: ObjectId(dec.u64()?),
            mask: dec.u64()?,
            mode: dec.u64()?,
            uid: dec.u64()?,
            gid: dec.u64()?,
            size: dec.u64()?,
            atime: dec.u64()?,
            mtime: dec.u64()?,
        }),
        RecordKind::Acl => {
            let foid = ObjectId(dec.u64()?);
            let entry_count = dec.u64()?;
            let data_len = usize::try_from(dec.u64()?).ok()?;
            let data = dec.bytes(data_len)?.to_vec();
            RecordBody::Acl(AclBody {
                foid,
                entry_count,
                data,
            })
        }
    };
    Some(Ok(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blkptr::{ChainSeed, DeviceId};

    fn write_record(data: Option<Vec<u8>>) -> LogRecord {
        let length = data.as_ref().map_or(4096, |d| d.len() as u64);
        LogRecord {
            case_insensitive: false,
            txg: 12,
            seq: 40,
            body: RecordBody::Write(WriteBody {
                foid: ObjectId(9),
                offset: 8192,
                length,
                blkoff: 0,
                blkptr: None,
                data,
            }),
        }
    }

    #[test]
    fn test_write_by_value_and_reference() {
        let by_value = write_record(Some(b"hello, log".to_vec()));
        let encoded = encode_record(&by_value);
        assert_eq!(encoded.len(), WRITE_FIXED_LEN + 16);
        let (decoded, len) = decode_record(&encoded, ByteOrder::NATIVE).unwrap();
        assert_eq!(len, encoded.len());
        assert_eq!(decoded, by_value);

        let mut by_ref = write_record(None);
        if let RecordBody::Write(body) = &mut by_ref.body {
            body.blkptr = Some(BlockPtr {
                device: DeviceId(0),
                offset: 0x10000,
                size: 4096,
                birth: 11,
                seed: ChainSeed::default(),
                order: ByteOrder::NATIVE,
                encrypted: false,
            });
        }
        let encoded = encode_record(&by_ref);
        assert_eq!(encoded.len(), WRITE_FIXED_LEN);
        assert_eq!(decode_record(&encoded, ByteOrder::NATIVE).unwrap().0, by_ref);
    }

    #[test]
    fn test_rename_case_insensitive_foreign_order() {
        let record = LogRecord {
            case_insensitive: true,
            txg: 3,
            seq: 13,
            body: RecordBody::Rename(RenameBody {
                sdoid: ObjectId(1),
                tdoid: ObjectId(2),
                foid: ObjectId(5),
                sname: "old.txt".to_string(),
                tname: "new-name.txt".to_string(),
            }),
        };
        let order = ByteOrder::NATIVE.swapped();
        let encoded = encode_record_in(&record, order);
        assert_eq!(encoded.len() % 8, 0);
        let (decoded, _) = decode_record(&encoded, order).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.kind(), RecordKind::Rename);
    }

    #[test]
    fn test_write_prefix_declares_full_length() {
        let record = write_record(None);
        let prefix = encode_write_prefix(&record, 4096).unwrap();
        assert_eq!(prefix.len(), WRITE_FIXED_LEN);

        let mut full = prefix;
        full.extend(std::iter::repeat(0xab).take(4096));
        let (decoded, len) = decode_record(&full, ByteOrder::NATIVE).unwrap();
        assert_eq!(len, WRITE_FIXED_LEN + 4096);
        match decoded.body {
            RecordBody::Write(body) => assert_eq!(body.data, Some(vec![0xab; 4096])),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_inline_length_mismatch_is_malformed() {
        let record = write_record(None);
        // Declares 8 bytes of inline data for a 4096-byte write.
        let mut full = encode_write_prefix(&record, 8).unwrap();
        full.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            decode_record(&full, ByteOrder::NATIVE),
            Err(LogError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn test_write_prefix_rejects_non_write() {
        let record = LogRecord::new(RecordBody::Truncate(TruncateBody::default()));
        assert!(encode_write_prefix(&record, 8).is_err());
    }

    #[test]
    fn test_reclen_beyond_buffer_is_malformed() {
        let record = LogRecord::new(RecordBody::Remove(RemoveBody {
            doid: ObjectId(1),
            name: "f".to_string(),
        }));
        let encoded = encode_record(&record);
        let err = decode_record(&encoded[..encoded.len() - 8], ByteOrder::NATIVE).unwrap_err();
        assert!(matches!(err, LogError::MalformedRecord { .. }));
    }

    #[test]
    fn test_non_utf8_name_is_malformed() {
        let record = LogRecord {
            case_insensitive: false,
            txg: 3,
            seq: 1,
            body: RecordBody::Remove(RemoveBody {
                doid: ObjectId(2),
                name: "abcd".to_string(),
            }),
        };
        let mut encoded = encode_record(&record);
        let name_at = RECORD_PREFIX_LEN + 2 * 8;
        encoded[name_at] = 0xff;

        let err = decode_record(&encoded, ByteOrder::NATIVE).unwrap_err();
        assert!(matches!(err, LogError::MalformedRecord { .. }));
        assert!(!err.is_end_of_chain());
    }

    #[test]
    fn test_unknown_kind() {
        let record = LogRecord::new(RecordBody::Truncate(TruncateBody::default()));
        let mut encoded = encode_record(&record);
        ByteOrder::NATIVE.write_u64_at(&mut encoded, 0, 99);
        assert!(matches!(
            decode_record(&encoded, ByteOrder::NATIVE),
            Err(LogError::UnknownRecordKind(99))
        ));
    }

    #[test]
    fn test_out_of_order_kinds() {
        assert!(RecordKind::Write.may_be_out_of_order());
        assert!(RecordKind::Acl.may_be_out_of_order());
        assert!(!RecordKind::Rename.may_be_out_of_order());
        assert!(!RecordKind::Create.may_be_out_of_order());
    }

    #[test]
    fn test_every_kind_code() {
        for code in 1..=12u64 {
            assert_eq!(RecordKind::from_code(code).unwrap().code(), code);
        }
        assert!(RecordKind::from_code(0).is_err());
    }
}
