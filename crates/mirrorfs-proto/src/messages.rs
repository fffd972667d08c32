// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Coordinator protocol records and the DAX mapping message

/// Size of every coordinator record, request or reply.
pub const COORD_RECORD_LEN: usize = 32;

const OP_GET: u32 = 1;
const OP_PUT: u32 = 2;
const OP_VERSION: u32 = 3;

/// Decode failure for a coordinator record
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("bad record length: {0}")]
    BadLength(usize),
    #[error("unknown opcode: {0}")]
    BadOpcode(u32),
}

/// Request sent to the version coordinator.
///
/// `handle` is an opaque correlation value chosen by the sender and echoed
/// back verbatim in the matching reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinatorRequest {
    /// Ask for a version slot covering (dev, ino).
    Get { handle: u64, dev: u64, ino: u64 },
    /// Drop a previously granted slot reference.
    Put { refid: u64 },
}

impl CoordinatorRequest {
    pub fn to_bytes(&self) -> [u8; COORD_RECORD_LEN] {
        let mut buf = [0u8; COORD_RECORD_LEN];
        match *self {
            CoordinatorRequest::Get { handle, dev, ino } => {
                buf[0..4].copy_from_slice(&OP_GET.to_le_bytes());
                buf[8..16].copy_from_slice(&handle.to_le_bytes());
                buf[16..24].copy_from_slice(&dev.to_le_bytes());
                buf[24..32].copy_from_slice(&ino.to_le_bytes());
            }
            CoordinatorRequest::Put { refid } => {
                buf[0..4].copy_from_slice(&OP_PUT.to_le_bytes());
                buf[16..24].copy_from_slice(&refid.to_le_bytes());
            }
        }
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        if data.len() != COORD_RECORD_LEN {
            return Err(WireError::BadLength(data.len()));
        }
        let op = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let handle = u64::from_le_bytes(data[8..16].try_into().unwrap());
        let a = u64::from_le_bytes(data[16..24].try_into().unwrap());
        let b = u64::from_le_bytes(data[24..32].try_into().unwrap());
        match op {
            OP_GET => Ok(CoordinatorRequest::Get {
                handle,
                dev: a,
                ino: b,
            }),
            OP_PUT => Ok(CoordinatorRequest::Put { refid: a }),
            other => Err(WireError::BadOpcode(other)),
        }
    }
}

/// Reply from the version coordinator to a `Get` request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoordinatorReply {
    /// Correlation value copied from the request.
    pub handle: u64,
    /// Slot index in the shared version table.
    pub slot: u64,
    /// Reference id used to release the slot later.
    pub refid: u64,
}

impl CoordinatorReply {
    pub fn to_bytes(&self) -> [u8; COORD_RECORD_LEN] {
        let mut buf = [0u8; COORD_RECORD_LEN];
        buf[0..4].copy_from_slice(&OP_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.handle.to_le_bytes());
        buf[16..24].copy_from_slice(&self.slot.to_le_bytes());
        buf[24..32].copy_from_slice(&self.refid.to_le_bytes());
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        if data.len() != COORD_RECORD_LEN {
            return Err(WireError::BadLength(data.len()));
        }
        let op = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if op != OP_VERSION {
            return Err(WireError::BadOpcode(op));
        }
        Ok(CoordinatorReply {
            handle: u64::from_le_bytes(data[8..16].try_into().unwrap()),
            slot: u64::from_le_bytes(data[16..24].try_into().unwrap()),
            refid: u64::from_le_bytes(data[24..32].try_into().unwrap()),
        })
    }
}

/// Number of ranges a single DAX mapping message can carry.
pub const DAX_MAPPING_ENTRIES: usize = 8;

/// Map the range read-only.
pub const DAX_MAP_FLAG_R: u64 = 1 << 0;
/// Map the range read-write.
pub const DAX_MAP_FLAG_W: u64 = 1 << 1;

/// Mapping message submitted to the DAX transport.
///
/// Parallel arrays describe up to [`DAX_MAPPING_ENTRIES`] ranges: byte
/// offset in the backing file, length, target offset in the shared cache
/// window, and access flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DaxMappingMsg {
    pub fd_offset: [u64; DAX_MAPPING_ENTRIES],
    pub len: [u64; DAX_MAPPING_ENTRIES],
    pub cache_offset: [u64; DAX_MAPPING_ENTRIES],
    pub flags: [u64; DAX_MAPPING_ENTRIES],
}

impl DaxMappingMsg {
    /// Build a single-range message.
    pub fn single(fd_offset: u64, len: u64, cache_offset: u64, flags: u64) -> Self {
        let mut msg = Self::default();
        msg.fd_offset[0] = fd_offset;
        msg.len[0] = len;
        msg.cache_offset[0] = cache_offset;
        msg.flags[0] = flags;
        msg
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 * 8 * DAX_MAPPING_ENTRIES);
        for arr in [&self.fd_offset, &self.len, &self.cache_offset, &self.flags] {
            for v in arr {
                buf.extend_from_slice(&v.to_le_bytes());
            }
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_roundtrip() {
        let req = CoordinatorRequest::Get {
            handle: 7,
            dev: 0x1234,
            ino: 0xdead_beef,
        };
        let bytes = req.to_bytes();
        assert_eq!(bytes.len(), COORD_RECORD_LEN);
        assert_eq!(CoordinatorRequest::parse(&bytes).unwrap(), req);
    }

    #[test]
    fn test_put_roundtrip() {
        let req = CoordinatorRequest::Put { refid: 99 };
        assert_eq!(CoordinatorRequest::parse(&req.to_bytes()).unwrap(), req);
    }

    #[test]
    fn test_reply_roundtrip() {
        let reply = CoordinatorReply {
            handle: 42,
            slot: 17,
            refid: 5,
        };
        assert_eq!(CoordinatorReply::parse(&reply.to_bytes()).unwrap(), reply);
    }

    #[test]
    fn test_reply_rejects_request_opcode() {
        let req = CoordinatorRequest::Put { refid: 1 }.to_bytes();
        assert_eq!(CoordinatorReply::parse(&req), Err(WireError::BadOpcode(2)));
    }

    #[test]
    fn test_short_record_rejected() {
        assert_eq!(
            CoordinatorRequest::parse(&[0u8; 16]),
            Err(WireError::BadLength(16))
        );
    }

    #[test]
    fn test_dax_single_range() {
        let msg = DaxMappingMsg::single(4096, 8192, 0, DAX_MAP_FLAG_R | DAX_MAP_FLAG_W);
        assert_eq!(msg.fd_offset[0], 4096);
        assert_eq!(msg.len[0], 8192);
        assert_eq!(msg.flags[0], 3);
        assert_eq!(msg.len[1], 0);
        assert_eq!(msg.to_bytes().len(), 4 * 8 * DAX_MAPPING_ENTRIES);
    }
}
