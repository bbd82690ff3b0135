// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

// The version index: a two-dimensional linked structure realized as a
// newest-first `Vec` of columns, each holding a level-0-first `Vec` of
// children. A `Vec`-of-`Vec` is an acceptable stand-in for the conceptual
// "two thin linked lists" shape: every descriptor is owned exclusively by
// the index, so there is no aliasing to manage, and a flat vector gives the
// same O(columns) traversal a pointer-chasing linked list would.

mod column;

use std::collections::HashSet;

use crate::descriptor::{Descriptor, Tag};
use crate::error::{Error, Result};

pub use column::Column;

/// Holds every fragment descriptor, newest column first.
#[derive(Debug, Default)]
pub struct VersionIndex {
    columns: Vec<Column>,
    next_file_number: u64,
}

impl VersionIndex {
    /// Builds an index from the descriptors replayed out of the manifest.
    /// `descriptors` need not be sorted; columns are reconstructed from
    /// `column`/`level` fields.
    pub fn rebuild(mut descriptors: Vec<Descriptor>) -> Result<Self> {
        descriptors.sort_by_key(|d| (d.column, d.level));

        let max_number = descriptors.iter().map(|d| d.number).max().unwrap_or(0);

        let mut columns: Vec<Column> = Vec::new();

        for d in descriptors {
            match columns.last_mut() {
                Some(last) if last.column == d.column => {
                    let expected_level = last.children.len() as u32;
                    if d.level != expected_level {
                        return Err(Error::CorruptManifest(format!(
                            "column {} expected level {expected_level}, got {}",
                            d.column, d.level
                        )));
                    }
                    last.children.push(d);
                }
                _ => {
                    if d.level != 0 {
                        return Err(Error::CorruptManifest(format!(
                            "column {} starts at level {}, expected 0",
                            d.column, d.level
                        )));
                    }
                    columns.push(Column::new(d));
                }
            }
        }

        for c in &mut columns {
            c.num_empty_children = c
                .children
                .iter()
                .filter(|d| d.tag == Tag::Flag)
                .count();
        }

        // `descriptors` was sorted ascending by column; the index stores
        // newest first.
        columns.reverse();

        Ok(Self {
            columns,
            next_file_number: max_number,
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    fn find(&self, column: u32) -> Option<usize> {
        self.columns.iter().position(|c| c.column == column)
    }

    /// Assigns `fragment.column` one past the current newest column (or 0
    /// if the index is empty) and prepends a new column head for it.
    pub fn add_l0_node(&mut self, mut fragment: Descriptor) -> u32 {
        let column = self.columns.first().map_or(0, |c| c.column + 1);
        fragment.column = column;
        fragment.level = 0;
        self.columns.insert(0, Column::new(fragment));
        column
    }

    /// Swaps the level-0 descriptor of `column` for `fragment`.
    pub fn replace_l0_node(&mut self, column: u32, mut fragment: Descriptor) -> Result<()> {
        let idx = self
            .find(column)
            .ok_or_else(|| Error::NotFound(format!("column {column}")))?;
        fragment.column = column;
        fragment.level = 0;
        self.columns[idx].children[0] = fragment;
        Ok(())
    }

    /// Inserts `fragment` as the new level-1 child of `column`, pushing any
    /// existing deeper children down by one level.
    pub fn extract_one_child(&mut self, column: u32, mut fragment: Descriptor) -> Result<()> {
        let idx = self
            .find(column)
            .ok_or_else(|| Error::NotFound(format!("column {column}")))?;
        fragment.column = column;
        self.columns[idx].extract_one_child(fragment);
        Ok(())
    }

    /// For every column other than the head whose id is not in
    /// `columns_touched`, pushes a `FLAG` placeholder at level 1. Returns
    /// the newly-created placeholder descriptors (for the manifest).
    pub fn move_other_to_deeper(&mut self, columns_touched: &HashSet<u32>) -> Vec<Descriptor> {
        if columns_touched.is_empty() || self.columns.len() < 2 {
            return Vec::new();
        }

        let mut flags = Vec::new();
        for head in self.columns.iter_mut().skip(1) {
            if columns_touched.contains(&head.column) {
                continue;
            }
            flags.push(head.push_flag_at_level_1());
        }
        flags
    }

    /// Reconstructs `version`: the column's own width W children, then the
    /// first W children of every older column.
    pub fn get_version(&self, version: u32) -> Result<Vec<Descriptor>> {
        let idx = self
            .find(version)
            .ok_or_else(|| Error::NotFound(format!("version {version}")))?;

        let width = self.columns[idx].num_children();
        let mut out = Vec::new();

        for head in &self.columns[idx..] {
            if head.num_children() < width {
                return Err(Error::InvariantViolation(format!(
                    "column {} has {} children, expected at least {width}",
                    head.column,
                    head.num_children()
                )));
            }
            out.extend(head.children[..width].iter().cloned());
        }

        Ok(out)
    }

    /// Candidates for extraction against the head column: every other
    /// column's level-0 descriptor (skipping `FLAG`s) whose key range
    /// overlaps the head's.
    #[must_use]
    pub fn get_overlapped_files_l0(&self) -> Vec<Descriptor> {
        let Some(head) = self.columns.first() else {
            return Vec::new();
        };
        let head_l0 = head.level0().clone();

        self.columns
            .iter()
            .skip(1)
            .filter(|c| c.level0().tag != Tag::Flag)
            .map(Column::level0)
            .filter(|d| d.overlaps(&head_l0))
            .cloned()
            .collect()
    }

    /// Prunes all versions at or before `n`: every column from `n` onward
    /// keeps only children shallower than the width of the column
    /// immediately newer than `n` (0 if `n` is the newest column).
    /// Returns the discarded `NEW`-tagged descriptors (callers should
    /// unlink their files) - discarded `MERGED` descriptors are also
    /// returned so callers can adjust reference counts.
    pub fn delete_version(&mut self, n: u32) -> Result<Vec<Descriptor>> {
        let target_idx = self
            .find(n)
            .ok_or_else(|| Error::NotFound(format!("version {n}")))?;

        let width = if target_idx > 0 {
            self.columns[target_idx - 1].num_children()
        } else {
            0
        };

        let tail = self.columns.split_off(target_idx);
        let mut should_delete = Vec::new();
        let mut kept = Vec::with_capacity(tail.len());

        for mut head in tail {
            let (keep, discard): (Vec<_>, Vec<_>) =
                head.children.into_iter().partition(|d| (d.level as usize) < width);

            should_delete.extend(discard.into_iter().filter(|d| {
                matches!(d.tag, Tag::New | Tag::Merged)
            }));

            if keep.is_empty() {
                continue;
            }

            head.children = keep;
            head.num_empty_children = head
                .children
                .iter()
                .filter(|d| d.tag == Tag::Flag)
                .count();
            kept.push(head);
        }

        self.columns.extend(kept);

        Ok(should_delete)
    }

    /// Collects fragment groups eligible to be concatenated into one file,
    /// one group per depth across the column range `[start, end]`
    /// (inclusive, `start` newer than or equal to `end`). Returns an empty
    /// result if the range was already (partially) merged.
    #[must_use]
    pub fn merge_columns(&self, start: u32, end: u32) -> Vec<Vec<Descriptor>> {
        let Some(start_idx) = self.find(start) else {
            return Vec::new();
        };

        let mut member_idxs = Vec::new();
        let mut max_depth = None;

        for (offset, head) in self.columns[start_idx..].iter().enumerate() {
            member_idxs.push(start_idx + offset);
            if head.column == end {
                max_depth = Some(head.num_children());
                break;
            }
        }

        let Some(max_depth) = max_depth else {
            return Vec::new();
        };

        let mut groups = Vec::new();

        for depth in 0..max_depth {
            let mut group = Vec::new();

            for &idx in &member_idxs {
                if let Some(d) = self.columns[idx].children.get(depth) {
                    match d.tag {
                        Tag::Merged => return Vec::new(),
                        Tag::New => group.push(d.clone()),
                        _ => {}
                    }
                }
            }

            if group.len() > 1 {
                groups.push(group);
            }
        }

        groups
    }

    /// `Some((start, end))` when the newest column is a positive multiple
    /// of `merge_length`.
    #[must_use]
    pub fn should_merge(&self, merge_length: u32) -> Option<(u32, u32)> {
        let newest = self.columns.first()?.column;
        if merge_length > 0 && newest > 0 && newest % merge_length == 0 {
            Some((newest - 1, newest - merge_length))
        } else {
            None
        }
    }

    /// Returns a fresh, monotonically-increasing file number.
    pub fn next_file_number(&mut self) -> u64 {
        self.next_file_number += 1;
        self.next_file_number
    }

    /// Replaces the descriptors at `(column, level_index)` in place -
    /// used by the administrative `Merge` operation to rewrite members of
    /// a merged group with their new `tag`/`number`/`start`/`length`.
    pub fn update_descriptor(&mut self, column: u32, level: u32, updated: Descriptor) -> Result<()> {
        let idx = self
            .find(column)
            .ok_or_else(|| Error::NotFound(format!("column {column}")))?;
        let child = self
            .columns[idx]
            .children
            .get_mut(level as usize)
            .ok_or_else(|| Error::NotFound(format!("level {level} in column {column}")))?;
        *child = updated;
        Ok(())
    }

    /// All live descriptors, in no particular order - used for manifest
    /// rewrites.
    pub fn all_descriptors(&self) -> impl Iterator<Item = &Descriptor> {
        self.columns.iter().flat_map(|c| c.children.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Descriptor;
    use test_log::test;

    fn new_l0(number: u64, smallest: u32, largest: u32) -> Descriptor {
        Descriptor::new_l0(number, 100, smallest, largest, 0, 0)
    }

    #[test]
    fn add_l0_assigns_increasing_columns() {
        let mut idx = VersionIndex::default();
        let c0 = idx.add_l0_node(new_l0(1, 1, 5));
        let c1 = idx.add_l0_node(new_l0(2, 1, 5));
        let c2 = idx.add_l0_node(new_l0(3, 1, 5));

        assert_eq!((c0, c1, c2), (0, 1, 2));
        assert_eq!(idx.column_count(), 3);
    }

    #[test]
    fn extract_one_child_shifts_deeper_levels() {
        let mut idx = VersionIndex::default();
        idx.add_l0_node(new_l0(1, 1, 5));
        idx.add_l0_node(new_l0(2, 1, 5));

        idx.extract_one_child(0, new_l0(3, 1, 2)).unwrap();
        idx.extract_one_child(0, new_l0(4, 3, 3)).unwrap();

        let v = idx.get_version(0).unwrap();
        // column 0 has its own l0 plus two extracted levels, but get_version(0)
        // only returns column 0's own children (it's the newest column).
        assert_eq!(v.len(), 3);
        assert_eq!(v[0].level, 0);
        assert_eq!(v[1].level, 1);
        assert_eq!(v[2].level, 2);
    }

    #[test]
    fn move_other_to_deeper_skips_touched_and_head() {
        let mut idx = VersionIndex::default();
        idx.add_l0_node(new_l0(1, 1, 5)); // column 0 (head)
        idx.add_l0_node(new_l0(2, 1, 5)); // column 1
        idx.add_l0_node(new_l0(3, 1, 5)); // column 2, head after these inserts

        let mut touched = HashSet::new();
        touched.insert(1u32);

        let flags = idx.move_other_to_deeper(&touched);
        // only column 0 gets a flag (column 1 touched, column 2 is the head)
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].column, 0);
        assert_eq!(idx.get_version(0).unwrap().len(), 2);
        assert_eq!(idx.get_version(1).unwrap().len(), 1);
    }

    #[test]
    fn get_version_walks_older_columns_at_fixed_width() {
        let mut idx = VersionIndex::default();
        idx.add_l0_node(new_l0(1, 1, 5)); // column 0
        idx.add_l0_node(new_l0(2, 1, 5)); // column 1

        idx.extract_one_child(0, new_l0(3, 1, 2)).unwrap(); // column 0 width -> 2

        let v1 = idx.get_version(1).unwrap();
        assert_eq!(v1.len(), 2); // column1's own l0 + column0's first 1 child...

        // width of column 1 is 1, so only l0 of column0 is pulled in, despite
        // column 0 having 2 children.
        assert_eq!(v1[0].column, 1);
        assert_eq!(v1[1].column, 0);
        assert_eq!(v1[1].level, 0);
    }

    #[test]
    fn get_overlapped_l0_skips_flags_and_disjoint_ranges() {
        let mut idx = VersionIndex::default();
        idx.add_l0_node(new_l0(1, 1, 2)); // column 0, disjoint from head later
        idx.add_l0_node(new_l0(2, 10, 20)); // column 1, head

        let overlapped = idx.get_overlapped_files_l0();
        assert!(overlapped.is_empty());

        idx.replace_l0_node(0, new_l0(3, 15, 16)).unwrap();
        let overlapped = idx.get_overlapped_files_l0();
        assert_eq!(overlapped.len(), 1);
        assert_eq!(overlapped[0].column, 0);
    }

    #[test]
    fn delete_version_prunes_deeper_children() {
        let mut idx = VersionIndex::default();
        idx.add_l0_node(new_l0(1, 1, 5)); // column 0
        idx.add_l0_node(new_l0(2, 1, 5)); // column 1

        idx.extract_one_child(0, new_l0(3, 1, 2)).unwrap(); // column0 width -> 2

        let deleted = idx.delete_version(0).unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].number, 3);
        assert_eq!(idx.get_version(0).unwrap().len(), 1);
    }

    #[test]
    fn delete_version_can_empty_the_index() {
        let mut idx = VersionIndex::default();
        idx.add_l0_node(new_l0(1, 1, 5));
        idx.add_l0_node(new_l0(2, 1, 5));

        idx.delete_version(1).unwrap();
        assert!(idx.is_empty());
    }

    #[test]
    fn merge_columns_aborts_if_already_merged() {
        let mut idx = VersionIndex::default();
        idx.add_l0_node(new_l0(1, 1, 5));
        idx.add_l0_node(new_l0(2, 1, 5));

        let mut merged = new_l0(3, 1, 5);
        merged.tag = Tag::Merged;
        idx.replace_l0_node(0, merged).unwrap();

        assert!(idx.merge_columns(1, 0).is_empty());
    }

    #[test]
    fn should_merge_fires_on_multiples() {
        let mut idx = VersionIndex::default();
        for i in 0..4 {
            idx.add_l0_node(new_l0(i + 1, 1, 5));
        }
        // newest column is 3, not a multiple of 2
        assert_eq!(idx.should_merge(2), None);

        idx.add_l0_node(new_l0(5, 1, 5)); // column 4
        assert_eq!(idx.should_merge(2), Some((3, 2)));
    }
}
