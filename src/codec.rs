// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

// The payload codec the extraction engine unpacks checkpoint files through.
//
// A production embedding of this engine would likely own a richer,
// self-describing codec (e.g. MessagePack). This module ships one concrete,
// minimal implementation behind the `PayloadCodec` trait so the crate is
// self-contained and its extraction logic can actually decode the snapshots
// it compares - callers are free to swap in their own codec.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// A map of embedding id to its current vector value.
pub type PayloadMap = BTreeMap<u32, Vec<f64>>;

/// Packs and unpacks a [`PayloadMap`] to/from an opaque byte buffer.
pub trait PayloadCodec {
    fn pack(map: &PayloadMap) -> Vec<u8>;
    fn unpack(bytes: &[u8]) -> Result<PayloadMap>;
}

/// Wire format: `u32` entry count, then per entry `u32` key, `u32` vector
/// length, and that many little-endian `f64` elements. Keys are written in
/// ascending order (matching `BTreeMap`'s iteration order) though `unpack`
/// does not depend on that.
pub struct DefaultCodec;

impl PayloadCodec for DefaultCodec {
    fn pack(map: &PayloadMap) -> Vec<u8> {
        let mut buf = Vec::new();

        #[allow(clippy::cast_possible_truncation)]
        buf.write_u32::<LittleEndian>(map.len() as u32)
            .expect("writing to a Vec cannot fail");

        for (&key, values) in map {
            buf.write_u32::<LittleEndian>(key)
                .expect("writing to a Vec cannot fail");

            #[allow(clippy::cast_possible_truncation)]
            buf.write_u32::<LittleEndian>(values.len() as u32)
                .expect("writing to a Vec cannot fail");

            for &value in values {
                buf.write_f64::<LittleEndian>(value)
                    .expect("writing to a Vec cannot fail");
            }
        }

        buf
    }

    fn unpack(bytes: &[u8]) -> Result<PayloadMap> {
        let mut cursor = Cursor::new(bytes);
        let entry_count = read_u32(&mut cursor)?;

        let mut map = PayloadMap::new();

        for _ in 0..entry_count {
            let key = read_u32(&mut cursor)?;
            let len = read_u32(&mut cursor)?;

            let mut values = Vec::with_capacity(len as usize);
            for _ in 0..len {
                values.push(
                    cursor
                        .read_f64::<LittleEndian>()
                        .map_err(|_| Error::CorruptManifest("truncated payload vector".into()))?,
                );
            }

            map.insert(key, values);
        }

        Ok(map)
    }
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| Error::CorruptManifest("truncated payload header".into()))
}

/// Writes `map` packed with `C` to `path`, returning the byte length written.
pub fn pack_to_file<C: PayloadCodec>(path: &std::path::Path, map: &PayloadMap) -> Result<u64> {
    let bytes = C::pack(map);
    let mut file = std::fs::File::create(path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    Ok(bytes.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn roundtrip_preserves_map() {
        let mut map = PayloadMap::new();
        map.insert(1, vec![1.0, 2.0]);
        map.insert(5, vec![]);
        map.insert(2, vec![3.5]);

        let packed = DefaultCodec::pack(&map);
        let unpacked = DefaultCodec::unpack(&packed).unwrap();

        assert_eq!(map, unpacked);
    }

    #[test]
    fn empty_map_roundtrips() {
        let map = PayloadMap::new();
        let packed = DefaultCodec::pack(&map);
        assert_eq!(DefaultCodec::unpack(&packed).unwrap(), map);
    }

    #[test]
    fn truncated_buffer_is_corrupt() {
        let mut map = PayloadMap::new();
        map.insert(1, vec![1.0]);
        let mut packed = DefaultCodec::pack(&map);
        packed.truncate(packed.len() - 2);

        assert!(DefaultCodec::unpack(&packed).is_err());
    }
}
