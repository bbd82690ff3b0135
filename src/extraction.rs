// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

// The background extraction engine: selects overlap candidates via the
// bloom filter, splits each candidate against the new snapshot ("base")
// into a retained part (keys absent from base) and an extracted part (keys
// present in base), and installs the results back into the version index.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::bloom;
use crate::codec::{pack_to_file, PayloadCodec, PayloadMap};
use crate::descriptor::{Descriptor, Tag};
use crate::error::Result;
use crate::fs::make_file_name;
use crate::index::VersionIndex;

/// The subset of `Engine`'s open configuration the extraction pass needs.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionConfig {
    pub do_concat: bool,
    pub extract_thres: f32,
}

/// What the engine needs to do after an extraction pass returns: unlink
/// standalone files whose descriptors were consumed, and unlink
/// concatenated files whose reference count dropped to zero.
#[derive(Debug, Default)]
pub struct ExtractionOutcome {
    pub did_any_work: bool,
    pub files_to_unlink: Vec<PathBuf>,
}

/// Runs one extraction pass with the column the engine just joined
/// (identified by `base_column`) as base.
#[allow(clippy::too_many_arguments)]
pub fn run<C: PayloadCodec>(
    dir: &Path,
    index: &mut VersionIndex,
    merged_refs: &mut HashMap<u64, u64>,
    filter_path: &Path,
    filter_file: &mut File,
    config: ExtractionConfig,
    base_column: u32,
    base_keys: &[u32],
) -> Result<ExtractionOutcome> {
    let mut outcome = ExtractionOutcome::default();

    let candidates = select_candidates(index, filter_path, config, base_keys)?;
    if candidates.is_empty() {
        return Ok(outcome);
    }

    let base_descriptor = index
        .get_version(base_column)?
        .into_iter()
        .next()
        .expect("the base column always has at least a level-0 descriptor");
    let base_path = fragment_path(dir, &base_descriptor);
    let base_map = read_fragment::<C>(&base_path, base_descriptor.start, base_descriptor.length)?;

    if base_map.is_empty() {
        return Ok(outcome);
    }

    let mut touched_columns = HashSet::new();
    let mut concat_streams = ConcatStreams::default();

    for candidate in candidates {
        let candidate_path = fragment_path(dir, &candidate);
        let candidate_map =
            read_fragment::<C>(&candidate_path, candidate.start, candidate.length)?;

        if candidate_map.is_empty() {
            continue;
        }

        let (extracted, retained) = split_overlap(&base_map, &candidate_map, &candidate);

        #[allow(clippy::cast_precision_loss)]
        let threshold_count = base_map.len() as f64 * f64::from(config.extract_thres);

        if extracted.len() as f64 <= threshold_count {
            // Not enough overlap to bother lifting; leave the column alone.
            continue;
        }

        outcome.did_any_work = true;
        touched_columns.insert(candidate.column);

        let (retained_loc, extracted_loc) = materialize::<C>(
            dir,
            index,
            merged_refs,
            &mut concat_streams,
            config.do_concat,
            &retained,
            &extracted,
        )?;

        install_results(
            index,
            filter_file,
            config.do_concat,
            candidate.column,
            retained_loc.map(|loc| (loc, &retained)),
            extracted_loc,
        )?;

        match candidate.tag {
            Tag::New => outcome.files_to_unlink.push(candidate_path),
            Tag::Merged => {
                let refcount = merged_refs.entry(candidate.number).or_insert(0);
                *refcount = refcount.saturating_sub(1);
                if *refcount == 0 {
                    merged_refs.remove(&candidate.number);
                    outcome
                        .files_to_unlink
                        .push(make_file_name(dir, candidate.number, "tdc"));
                }
            }
            _ => {}
        }
    }

    index.move_other_to_deeper(&touched_columns);
    concat_streams.finish()?;

    Ok(outcome)
}

/// Candidate selection: size gate, key-range overlap, then filter screen.
fn select_candidates(
    index: &VersionIndex,
    filter_path: &Path,
    config: ExtractionConfig,
    base_keys: &[u32],
) -> Result<Vec<Descriptor>> {
    if config.extract_thres > 0.0 && base_keys.len() <= 100 {
        return Ok(Vec::new());
    }

    let overlapped = index.get_overlapped_files_l0();
    if overlapped.is_empty() {
        return Ok(Vec::new());
    }

    #[allow(clippy::cast_precision_loss)]
    let threshold = base_keys.len() as f32 * config.extract_thres;

    let mut reader = File::open(filter_path).ok();
    let mut accepted = Vec::new();

    for candidate in overlapped {
        if candidate.filter_length == 0 {
            continue;
        }

        let Some(reader) = reader.as_mut() else {
            continue;
        };

        let mut buf = vec![0u8; candidate.filter_length as usize];
        if reader.seek(SeekFrom::Start(candidate.filter_start)).is_err() {
            continue;
        }
        if reader.read_exact(&mut buf).is_err() {
            // Filter entry unavailable; tolerate and skip this candidate.
            continue;
        }

        let hits = base_keys
            .iter()
            .filter(|&&k| bloom::key_may_match(k, &buf))
            .count();

        #[allow(clippy::cast_precision_loss)]
        if hits as f32 > threshold {
            accepted.push(candidate);
        }
    }

    Ok(accepted)
}

fn fragment_path(dir: &Path, d: &Descriptor) -> PathBuf {
    make_file_name(dir, d.number, "tdc")
}

fn read_fragment<C: PayloadCodec>(path: &Path, start: u64, length: u64) -> Result<PayloadMap> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    let mut buf = vec![0u8; length as usize];
    file.read_exact(&mut buf)?;
    C::unpack(&buf)
}

/// Two-pointer merge of the candidate's keys against the base map.
///
/// As an optimization, if the candidate's smallest key is greater than the
/// base's smallest key, we can skip the base keys strictly below it; if
/// that leaves no base key within the candidate's range, the candidate has
/// no overlap with the base at all and everything is retained.
fn split_overlap(
    base: &PayloadMap,
    candidate: &PayloadMap,
    candidate_desc: &Descriptor,
) -> (PayloadMap, PayloadMap) {
    let mut extracted = PayloadMap::new();
    let mut retained = PayloadMap::new();

    let mut base_iter = base.iter().peekable();

    if let Some((&first_base, _)) = base.iter().next() {
        if candidate_desc.smallest > first_base {
            while let Some(&(&k, _)) = base_iter.peek() {
                if k >= candidate_desc.smallest {
                    break;
                }
                base_iter.next();
            }

            let no_overlap = match base_iter.peek() {
                Some(&(&k, _)) => k > candidate_desc.largest,
                None => true,
            };

            if no_overlap {
                retained.extend(candidate.iter().map(|(&k, v)| (k, v.clone())));
                return (extracted, retained);
            }
        }
    }

    let mut cand_iter = candidate.iter().peekable();

    loop {
        let Some(&(&cand_key, cand_val)) = cand_iter.peek() else {
            break;
        };
        let base_key = base_iter.peek().map(|&(&k, _)| k);

        match base_key {
            Some(bk) if bk < cand_key => {
                base_iter.next();
            }
            Some(bk) if bk == cand_key => {
                extracted.insert(cand_key, cand_val.clone());
                cand_iter.next();
                base_iter.next();
            }
            _ => {
                // base exhausted, or base_key > cand_key
                retained.insert(cand_key, cand_val.clone());
                cand_iter.next();
            }
        }
    }

    (extracted, retained)
}

/// Where a materialized output landed: file number plus byte range plus key
/// range, everything `install_results` needs to build a descriptor.
#[derive(Debug, Clone, Copy)]
struct FragmentLocation {
    number: u64,
    start: u64,
    length: u64,
    smallest: u32,
    largest: u32,
}

#[derive(Default)]
struct ConcatStreams {
    extracted: Option<(u64, File)>,
    retained: Option<(u64, File)>,
}

impl ConcatStreams {
    fn finish(self) -> Result<()> {
        if let Some((_, mut f)) = self.extracted {
            f.flush()?;
        }
        if let Some((_, mut f)) = self.retained {
            f.flush()?;
        }
        Ok(())
    }
}

fn location_of(map: &PayloadMap, number: u64, start: u64, length: u64) -> FragmentLocation {
    FragmentLocation {
        number,
        start,
        length,
        smallest: *map.keys().next().expect("map is non-empty"),
        largest: *map.keys().next_back().expect("map is non-empty"),
    }
}

#[allow(clippy::too_many_arguments)]
fn materialize<C: PayloadCodec>(
    dir: &Path,
    index: &mut VersionIndex,
    merged_refs: &mut HashMap<u64, u64>,
    streams: &mut ConcatStreams,
    do_concat: bool,
    retained: &PayloadMap,
    extracted: &PayloadMap,
) -> Result<(Option<FragmentLocation>, Option<FragmentLocation>)> {
    if !do_concat {
        let retained_loc = if retained.is_empty() {
            None
        } else {
            let number = index.next_file_number();
            let path = make_file_name(dir, number, "tdc");
            let length = pack_to_file::<C>(&path, retained)?;
            Some(location_of(retained, number, 0, length))
        };

        let extracted_loc = if extracted.is_empty() {
            None
        } else {
            let number = index.next_file_number();
            let path = make_file_name(dir, number, "tdc");
            let length = pack_to_file::<C>(&path, extracted)?;
            Some(location_of(extracted, number, 0, length))
        };

        return Ok((retained_loc, extracted_loc));
    }

    // Concatenated mode: lazily open the shared streams (and allocate their
    // number pair) on the first non-empty output of this whole pass.
    if (!retained.is_empty() || !extracted.is_empty()) && streams.extracted.is_none() {
        let extracted_number = index.next_file_number();
        let retained_number = index.next_file_number();

        let extracted_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(make_file_name(dir, extracted_number, "tdc"))?;
        let retained_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(make_file_name(dir, retained_number, "tdc"))?;

        streams.extracted = Some((extracted_number, extracted_file));
        streams.retained = Some((retained_number, retained_file));
        merged_refs.entry(extracted_number).or_insert(0);
        merged_refs.entry(retained_number).or_insert(0);
    }

    let extracted_loc = if extracted.is_empty() {
        None
    } else {
        let (number, file) = streams.extracted.as_mut().expect("allocated above");
        let start = file.stream_position()?;
        let bytes = C::pack(extracted);
        file.write_all(&bytes)?;
        #[allow(clippy::cast_possible_truncation)]
        let length = bytes.len() as u64;
        *merged_refs.entry(*number).or_insert(0) += 1;
        Some(location_of(extracted, *number, start, length))
    };

    let retained_loc = if retained.is_empty() {
        None
    } else {
        let (number, file) = streams.retained.as_mut().expect("allocated above");
        let start = file.stream_position()?;
        let bytes = C::pack(retained);
        file.write_all(&bytes)?;
        #[allow(clippy::cast_possible_truncation)]
        let length = bytes.len() as u64;
        *merged_refs.entry(*number).or_insert(0) += 1;
        Some(location_of(retained, *number, start, length))
    };

    Ok((retained_loc, extracted_loc))
}

/// Appends a filter over `keys` and returns its `(start, length)`.
fn append_filter(filter_file: &mut File, keys: &[u32]) -> Result<(u64, u64)> {
    let bytes = bloom::create_filter(keys);
    let start = filter_file.stream_position()?;
    filter_file.write_all(&bytes)?;
    filter_file.flush()?;
    #[allow(clippy::cast_possible_truncation)]
    Ok((start, bytes.len() as u64))
}

fn descriptor_from_location(tag: Tag, level: u32, column: u32, loc: FragmentLocation) -> Descriptor {
    Descriptor {
        tag,
        start: loc.start,
        length: loc.length,
        level,
        column,
        number: loc.number,
        smallest: loc.smallest,
        largest: loc.largest,
        filter_start: 0,
        filter_length: 0,
    }
}

/// Replaces the candidate's descriptors at `column` with the extraction
/// output. Only the retained output gets a bloom filter: extracted
/// fragments are about to be discarded or folded into the base and never
/// screened again, so building one over that side would be wasted work.
fn install_results(
    index: &mut VersionIndex,
    filter_file: &mut File,
    do_concat: bool,
    column: u32,
    retained: Option<(FragmentLocation, &PayloadMap)>,
    extracted_loc: Option<FragmentLocation>,
) -> Result<()> {
    let tag = if do_concat { Tag::Merged } else { Tag::New };

    match retained {
        Some((loc, map)) => {
            let keys: Vec<u32> = map.keys().copied().collect();
            let (filter_start, filter_length) = append_filter(filter_file, &keys)?;

            let mut d = descriptor_from_location(tag, 0, column, loc);
            d.filter_start = filter_start;
            d.filter_length = filter_length;
            index.replace_l0_node(column, d)?;
        }
        None => {
            index.replace_l0_node(column, Descriptor::flag(0, column))?;
        }
    }

    if let Some(loc) = extracted_loc {
        let d = descriptor_from_location(tag, 1, column, loc);
        index.extract_one_child(column, d)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DefaultCodec;
    use test_log::test;

    fn map(pairs: &[(u32, f64)]) -> PayloadMap {
        pairs.iter().map(|&(k, v)| (k, vec![v])).collect()
    }

    fn desc(smallest: u32, largest: u32) -> Descriptor {
        Descriptor::new_l0(1, 0, smallest, largest, 0, 0)
    }

    #[test]
    fn split_overlap_classifies_shared_and_unique_keys() {
        let base = map(&[(2, 0.0), (3, 0.0), (5, 0.0)]);
        let candidate = map(&[(1, 0.0), (2, 0.0), (4, 0.0), (5, 0.0)]);
        let d = desc(1, 5);

        let (extracted, retained) = split_overlap(&base, &candidate, &d);

        assert_eq!(
            extracted.keys().copied().collect::<Vec<_>>(),
            vec![2, 5]
        );
        assert_eq!(
            retained.keys().copied().collect::<Vec<_>>(),
            vec![1, 4]
        );
    }

    #[test]
    fn split_overlap_seeks_past_base_keys_below_candidate_range() {
        let base = map(&[(1, 0.0), (2, 0.0), (100, 0.0)]);
        let candidate = map(&[(100, 0.0), (101, 0.0)]);
        let d = desc(100, 101);

        let (extracted, retained) = split_overlap(&base, &candidate, &d);

        assert_eq!(extracted.keys().copied().collect::<Vec<_>>(), vec![100]);
        assert_eq!(retained.keys().copied().collect::<Vec<_>>(), vec![101]);
    }

    #[test]
    fn split_overlap_short_circuits_when_base_never_reaches_candidate_range() {
        let base = map(&[(1, 0.0), (2, 0.0)]);
        let candidate = map(&[(50, 0.0), (51, 0.0)]);
        let d = desc(50, 51);

        let (extracted, retained) = split_overlap(&base, &candidate, &d);

        assert!(extracted.is_empty());
        assert_eq!(retained.len(), 2);
    }

    #[test]
    fn materialize_without_concat_writes_one_file_per_output() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut index = VersionIndex::default();
        index.add_l0_node(desc(1, 10));
        let mut merged_refs = HashMap::new();
        let mut streams = ConcatStreams::default();

        let retained = map(&[(1, 1.0)]);
        let extracted = map(&[(2, 2.0)]);

        let (retained_loc, extracted_loc) = materialize::<DefaultCodec>(
            dir.path(),
            &mut index,
            &mut merged_refs,
            &mut streams,
            false,
            &retained,
            &extracted,
        )?;

        let retained_loc = retained_loc.unwrap();
        let extracted_loc = extracted_loc.unwrap();
        assert_ne!(retained_loc.number, extracted_loc.number);
        assert!(merged_refs.is_empty());

        Ok(())
    }

    #[test]
    fn materialize_with_concat_shares_one_file_pair_and_tracks_refs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut index = VersionIndex::default();
        index.add_l0_node(desc(1, 10));
        let mut merged_refs = HashMap::new();
        let mut streams = ConcatStreams::default();

        let a = materialize::<DefaultCodec>(
            dir.path(),
            &mut index,
            &mut merged_refs,
            &mut streams,
            true,
            &map(&[(1, 1.0)]),
            &map(&[(2, 2.0)]),
        )?;
        let b = materialize::<DefaultCodec>(
            dir.path(),
            &mut index,
            &mut merged_refs,
            &mut streams,
            true,
            &map(&[(3, 3.0)]),
            &PayloadMap::new(),
        )?;

        assert_eq!(a.0.unwrap().number, b.0.unwrap().number);
        assert_eq!(*merged_refs.get(&a.0.unwrap().number).unwrap(), 2);

        streams.finish()?;
        Ok(())
    }

    #[test]
    fn install_results_replaces_l0_and_extracts_child() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let filter_path = dir.path().join("FILTER");
        let mut filter_file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&filter_path)?;

        let mut index = VersionIndex::default();
        index.add_l0_node(desc(1, 10));

        let retained = map(&[(7, 0.0)]);
        let retained_loc = FragmentLocation {
            number: 42,
            start: 0,
            length: 5,
            smallest: 7,
            largest: 7,
        };
        let extracted_loc = FragmentLocation {
            number: 43,
            start: 0,
            length: 5,
            smallest: 2,
            largest: 2,
        };

        install_results(
            &mut index,
            &mut filter_file,
            false,
            0,
            Some((retained_loc, &retained)),
            Some(extracted_loc),
        )?;

        let version = index.get_version(0)?;
        assert_eq!(version.len(), 2);
        assert_eq!(version[0].number, 42);
        assert!(version[0].filter_length > 0);
        assert_eq!(version[1].number, 43);
        assert_eq!(version[1].level, 1);

        Ok(())
    }

    #[test]
    fn install_results_with_no_retained_output_installs_a_flag() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let filter_path = dir.path().join("FILTER");
        let mut filter_file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&filter_path)?;

        let mut index = VersionIndex::default();
        index.add_l0_node(desc(1, 10));

        install_results(&mut index, &mut filter_file, false, 0, None, None)?;

        let version = index.get_version(0)?;
        assert_eq!(version[0].tag, Tag::Flag);

        Ok(())
    }
}
