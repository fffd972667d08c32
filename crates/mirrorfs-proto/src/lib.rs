// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Wire formats for MirrorFS
//!
//! Fixed-size binary records exchanged with the version coordinator, plus
//! the DAX mapping message handed to the virtualization transport. Record
//! layouts are shared across processes, so every field is encoded with an
//! explicit offset and little-endian byte order.

pub mod messages;

pub use messages::{
    CoordinatorReply, CoordinatorRequest, DaxMappingMsg, WireError, COORD_RECORD_LEN,
    DAX_MAPPING_ENTRIES, DAX_MAP_FLAG_R, DAX_MAP_FLAG_W,
};
