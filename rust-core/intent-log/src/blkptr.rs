// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Intent Log - Block pointers and chain seeds
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A `BlockPtr` names one block on one device together with everything a
// reader needs to validate it: the generation it was born in, the chain seed
// its trailer must carry, the byte order it was written in, and whether its
// records were sealed by a block transform.
//
// On-media format of a block pointer (9 x u64, byte order of the enclosing
// structure):
//   [device] [offset] [size] [birth] [guid0] [guid1] [dataset] [seq] [flags]
//
// An all-zero pointer is a *hole* and decodes to `None`. Every real pointer
// has `FLAG_PRESENT` set, so a hole can never be mistaken for block 0.

use std::fmt;

use uuid::Uuid;

/// Encoded size of a block pointer in bytes.
pub const BLKPTR_SIZE: usize = 9 * 8;

/// Encoded size of a chain seed in bytes.
pub const SEED_SIZE: usize = 4 * 8;

const FLAG_PRESENT: u64 = 1 << 0;
const FLAG_BIG_ENDIAN: u64 = 1 << 1;
const FLAG_ENCRYPTED: u64 = 1 << 2;

// ---------------------------------------------------------------------------
// ByteOrder
// ---------------------------------------------------------------------------

/// Byte order a block (or header) was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    /// Least significant byte first.
    Little,
    /// Most significant byte first.
    Big,
}

impl ByteOrder {
    /// Byte order of the running host.
    pub const NATIVE: ByteOrder = if cfg!(target_endian = "big") {
        ByteOrder::Big
    } else {
        ByteOrder::Little
    };

    /// The opposite byte order.
    pub fn swapped(self) -> Self {
        match self {
            ByteOrder::Little => ByteOrder::Big,
            ByteOrder::Big => ByteOrder::Little,
        }
    }

    /// Returns `true` if data in this order can be used without swapping.
    pub fn is_native(self) -> bool {
        self == Self::NATIVE
    }

    /// Append `value` to `out` in this byte order.
    pub fn put_u64(self, out: &mut Vec<u8>, value: u64) {
        match self {
            ByteOrder::Little => out.extend_from_slice(&value.to_le_bytes()),
            ByteOrder::Big => out.extend_from_slice(&value.to_be_bytes()),
        }
    }

    /// Overwrite the 8 bytes at `at` with `value` in this byte order.
    pub fn write_u64_at(self, buf: &mut [u8], at: usize, value: u64) {
        let bytes = match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        };
        buf[at..at + 8].copy_from_slice(&bytes);
    }

    /// Interpret 8 bytes in this byte order.
    pub fn get_u64(self, bytes: [u8; 8]) -> u64 {
        match self {
            ByteOrder::Little => u64::from_le_bytes(bytes),
            ByteOrder::Big => u64::from_be_bytes(bytes),
        }
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Forward-only cursor over an encoded buffer. Every accessor returns `None`
/// instead of reading past the end.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    order: ByteOrder,
}

impl<'a> Decoder<'a> {
    /// Create a cursor at the start of `data`.
    pub fn new(data: &'a [u8], order: ByteOrder) -> Self {
        Self { data, pos: 0, order }
    }

    /// Current offset from the start of the buffer.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left after the cursor.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Read one u64.
    pub fn u64(&mut self) -> Option<u64> {
        let bytes = self.bytes(8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(bytes);
        Some(self.order.get_u64(word))
    }

    /// Read `len` raw bytes.
    pub fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    /// Read an optional block pointer.
    pub fn blkptr(&mut self) -> Option<Option<BlockPtr>> {
        let bytes = self.bytes(BLKPTR_SIZE)?;
        Some(BlockPtr::decode(bytes, self.order))
    }

    /// Read a chain seed.
    pub fn seed(&mut self) -> Option<ChainSeed> {
        Some(ChainSeed {
            guid: [self.u64()?, self.u64()?],
            dataset: self.u64()?,
            seq: self.u64()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// A storage device (vdev) that can hold log blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Physical address of a block, independent of its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockAddr {
    /// Device holding the block.
    pub device: DeviceId,
    /// Byte offset on the device.
    pub offset: u64,
}

// ---------------------------------------------------------------------------
// ChainSeed
// ---------------------------------------------------------------------------

/// The rolling verifier carried by every log block.
///
/// A block is valid only if its trailer carries exactly the seed its
/// predecessor predicted. The guid is random per chain, so blocks from an
/// older chain that happen to sit at the same address are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChainSeed {
    /// Random chain identity.
    pub guid: [u64; 2],
    /// Owning dataset.
    pub dataset: u64,
    /// Block sequence number within the chain, starting at 1.
    pub seq: u64,
}

impl ChainSeed {
    /// Seed for the first block of a brand new chain.
    pub fn new_chain(dataset: u64) -> Self {
        let (hi, lo) = Uuid::new_v4().as_u64_pair();
        Self {
            guid: [hi, lo],
            dataset,
            seq: 1,
        }
    }

    /// Seed the next block in the chain must carry.
    pub fn successor(&self) -> Self {
        Self {
            seq: self.seq + 1,
            ..*self
        }
    }

    /// Append the encoded seed.
    pub fn encode_into(&self, out: &mut Vec<u8>, order: ByteOrder) {
        order.put_u64(out, self.guid[0]);
        order.put_u64(out, self.guid[1]);
        order.put_u64(out, self.dataset);
        order.put_u64(out, self.seq);
    }
}

// ---------------------------------------------------------------------------
// BlockPtr
// ---------------------------------------------------------------------------

/// Pointer to a log block or to a block of write data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockPtr {
    /// Device holding the block.
    pub device: DeviceId,
    /// Byte offset on the device.
    pub offset: u64,
    /// Allocated size in bytes.
    pub size: u64,
    /// Generation in which the block was allocated.
    pub birth: u64,
    /// Seed the block's trailer must carry (zero for data blocks).
    pub seed: ChainSeed,
    /// Byte order the block contents were written in.
    pub order: ByteOrder,
    /// Whether the block's private record regions are sealed.
    pub encrypted: bool,
}

impl BlockPtr {
    /// Physical address of the block.
    pub fn addr(&self) -> BlockAddr {
        BlockAddr {
            device: self.device,
            offset: self.offset,
        }
    }

    /// Append the encoding of `ptr` (a hole when `None`).
    pub fn encode_into(ptr: Option<&BlockPtr>, out: &mut Vec<u8>, order: ByteOrder) {
        let Some(bp) = ptr else {
            out.extend_from_slice(&[0u8; BLKPTR_SIZE]);
            return;
        };
        let mut flags = FLAG_PRESENT;
        if bp.order == ByteOrder::Big {
            flags |= FLAG_BIG_ENDIAN;
        }
        if bp.encrypted {
            flags |= FLAG_ENCRYPTED;
        }
        order.put_u64(out, u64::from(bp.device.0));
        order.put_u64(out, bp.offset);
        order.put_u64(out, bp.size);
        order.put_u64(out, bp.birth);
        bp.seed.encode_into(out, order);
        order.put_u64(out, flags);
    }

    /// Decode a pointer from exactly [`BLKPTR_SIZE`] bytes. Holes and
    /// pointers without the present flag decode to `None`.
    pub fn decode(bytes: &[u8], order: ByteOrder) -> Option<BlockPtr> {
        if bytes.len() != BLKPTR_SIZE || bytes.iter().all(|b| *b == 0) {
            return None;
        }
        let mut dec = Decoder::new(bytes, order);
        let device = dec.u64()?;
        let offset = dec.u64()?;
        let size = dec.u64()?;
        let birth = dec.u64()?;
        let seed = dec.seed()?;
        let flags = dec.u64()?;
        if flags & FLAG_PRESENT == 0 {
            return None;
        }
        Some(BlockPtr {
            device: DeviceId(u32::try_from(device).ok()?),
            offset,
            size,
            birth,
            seed,
            order: if flags & FLAG_BIG_ENDIAN != 0 {
                ByteOrder::Big
            } else {
                ByteOrder::Little
            },
            encrypted: flags & FLAG_ENCRYPTED != 0,
        })
    }
}

impl fmt::Display for BlockPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<{}:{:#x}:{:#x} birth={} seq={}>",
            self.device, self.offset, self.size, self.birth, self.seed.seq
        )
    }
}
