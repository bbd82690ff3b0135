// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

// Manifest wire format: one whitespace-separated record per line, and the
// append-only log plus atomic-rewrite cycle built on top of it.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::descriptor::{Descriptor, Tag};
use crate::error::{Error, Result};
use crate::file::rewrite_atomic;

/// Serializes one descriptor as a manifest line. `DELETED` descriptors are
/// never serialized (callers should not pass them).
#[must_use]
pub fn encode_record(d: &Descriptor) -> String {
    match d.tag {
        Tag::Deleted => String::new(),
        Tag::Flag => format!("{} {} {}\n", Tag::Flag.as_wire(), d.level, d.column),
        Tag::New | Tag::Merged => format!(
            "{} {} {} {} {} {} {} {} {} {}\n",
            d.tag.as_wire(),
            d.start,
            d.length,
            d.level,
            d.column,
            d.number,
            d.smallest,
            d.largest,
            d.filter_start,
            d.filter_length,
        ),
        Tag::MergedRef => unreachable!("merged-ref records are encoded separately"),
    }
}

/// Serializes a `MERGED_REF` record for `number` with the given live count.
#[must_use]
pub fn encode_merged_ref(number: u64, refcount: u64) -> String {
    format!("{} {} {}\n", Tag::MergedRef.as_wire(), number, refcount)
}

/// The result of replaying a manifest: every live fragment descriptor, plus
/// the reference counts for concatenated files.
#[derive(Debug, Default)]
pub struct Replayed {
    pub descriptors: Vec<Descriptor>,
    pub merged_refs: HashMap<u64, u64>,
}

/// Parses one manifest line into either a descriptor or a merged-ref entry.
fn parse_line(line: &str, out: &mut Replayed) -> Result<()> {
    let mut fields = line.split_whitespace();

    let tag_raw: u8 = fields
        .next()
        .ok_or_else(|| Error::CorruptManifest("empty manifest line".into()))?
        .parse()
        .map_err(|_| Error::CorruptManifest("non-numeric tag".into()))?;

    let tag = Tag::from_wire(tag_raw)
        .ok_or_else(|| Error::CorruptManifest(format!("unknown tag {tag_raw}")))?;

    let next_u64 = |fields: &mut std::str::SplitWhitespace<'_>, what: &str| -> Result<u64> {
        fields
            .next()
            .ok_or_else(|| Error::CorruptManifest(format!("missing field: {what}")))?
            .parse()
            .map_err(|_| Error::CorruptManifest(format!("non-numeric field: {what}")))
    };

    match tag {
        Tag::Deleted => Err(Error::CorruptManifest(
            "DELETED records should never appear on disk".into(),
        )),
        Tag::Flag => {
            let level = next_u64(&mut fields, "level")? as u32;
            let column = next_u64(&mut fields, "column")? as u32;
            out.descriptors.push(Descriptor::flag(level, column));
            Ok(())
        }
        Tag::New | Tag::Merged => {
            let start = next_u64(&mut fields, "start")?;
            let length = next_u64(&mut fields, "length")?;
            let level = next_u64(&mut fields, "level")? as u32;
            let column = next_u64(&mut fields, "column")? as u32;
            let number = next_u64(&mut fields, "number")?;
            let smallest = next_u64(&mut fields, "smallest")? as u32;
            let largest = next_u64(&mut fields, "largest")? as u32;
            let filter_start = next_u64(&mut fields, "filter_start")?;
            let filter_length = next_u64(&mut fields, "filter_length")?;

            out.descriptors.push(Descriptor {
                tag,
                start,
                length,
                level,
                column,
                number,
                smallest,
                largest,
                filter_start,
                filter_length,
            });
            Ok(())
        }
        Tag::MergedRef => {
            let number = next_u64(&mut fields, "number")?;
            let refcount = next_u64(&mut fields, "refcount")?;
            if refcount != 0 {
                out.merged_refs.insert(number, refcount);
            }
            Ok(())
        }
    }
}

/// Replays every line of the manifest at `path` (assumed to exist).
pub fn replay(path: &Path) -> Result<Replayed> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut out = Replayed::default();

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        parse_line(&line, &mut out)?;
    }

    Ok(out)
}

/// A handle to the append-only manifest file.
pub struct Manifest {
    path: PathBuf,
    file: File,
}

impl Manifest {
    /// Opens (creating if absent) the manifest at `path` in append mode.
    pub fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self { path, file })
    }

    /// Appends one descriptor record, flushing before returning.
    pub fn append(&mut self, d: &Descriptor) -> Result<()> {
        let record = encode_record(d);
        self.file.write_all(record.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }

    /// Rewrites the manifest from scratch: every live (non-`DELETED`)
    /// descriptor, followed by every nonzero merged-ref entry.
    pub fn rewrite(
        &mut self,
        descriptors: &[Descriptor],
        merged_refs: &HashMap<u64, u64>,
    ) -> Result<()> {
        let mut buf = String::new();

        for d in descriptors {
            if d.tag == Tag::Deleted {
                continue;
            }
            buf.push_str(&encode_record(d));
        }

        for (&number, &refcount) in merged_refs {
            if refcount > 0 {
                buf.push_str(&encode_merged_ref(number, refcount));
            }
        }

        rewrite_atomic(&self.path, buf.as_bytes())?;

        // Reopen in append mode so subsequent `append` calls land after the
        // rewritten content.
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        Ok(())
    }
}
