// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.
//
// Grounded in `Label`/`LabelLocation` in `x86_64.cpp`: a label is bound
// exactly once, and every reference made before it's bound queues a patch
// site that gets fixed up the moment the label is bound. A label the
// function builder never binds (dead code) simply never gets its sites
// patched, which the original treats as a programmer error, not a runtime
// one — so does this one.

use anna_encoding_x86_64::LabelId;
use anna_types::EncodingError;

/// The original caps a label's pending-reference list at 32 entries (a
/// label this heavily forward-referenced almost always signals a runaway
/// loop in the caller); kept as a sanity ceiling rather than a hard
/// architectural limit.
pub const MAX_PENDING_PATCH_SITES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelativeWidth {
    Rel8,
    Rel32,
}

impl RelativeWidth {
    fn byte_len(self) -> usize {
        match self {
            RelativeWidth::Rel8 => 1,
            RelativeWidth::Rel32 => 4,
        }
    }
}

/// A not-yet-patched reference to a label: `patch_offset` is where the
/// displacement bytes live in the instruction buffer, `anchor_offset` is
/// the buffer offset the displacement is measured from (the address of the
/// byte right after those displacement bytes).
#[derive(Debug, Clone, Copy)]
pub struct PatchSite {
    pub patch_offset: usize,
    pub anchor_offset: usize,
    pub width: RelativeWidth,
}

#[derive(Debug, Default)]
pub struct Label {
    target: Option<usize>,
    sites: Vec<PatchSite>,
}

impl Label {
    pub fn is_bound(&self) -> bool {
        self.target.is_some()
    }
}

#[derive(Debug, Default)]
pub struct LabelManager {
    labels: Vec<Label>,
}

impl LabelManager {
    pub fn new() -> Self {
        LabelManager::default()
    }

    pub fn create_label(&mut self) -> LabelId {
        self.labels.push(Label::default());
        LabelId(self.labels.len() - 1)
    }

    /// Called by the encoder when it meets a `RelativeToLabel` operand. If
    /// the label is already bound, writes the displacement immediately;
    /// otherwise queues a patch site and leaves a zero-filled placeholder in
    /// `buffer` for `bind` to overwrite later.
    pub fn reference(
        &mut self,
        label: LabelId,
        buffer: &mut Vec<u8>,
        width: RelativeWidth,
    ) -> Result<(), EncodingError> {
        let patch_offset = buffer.len();
        buffer.extend(std::iter::repeat(0u8).take(width.byte_len()));
        let anchor_offset = buffer.len();

        let entry = &mut self.labels[label.0];
        if let Some(target) = entry.target {
            write_displacement(buffer, patch_offset, width, target, anchor_offset)?;
            return Ok(());
        }

        if entry.sites.len() >= MAX_PENDING_PATCH_SITES {
            return Err(EncodingError::PatchSiteOverflow {
                max: MAX_PENDING_PATCH_SITES,
            });
        }
        entry.sites.push(PatchSite {
            patch_offset,
            anchor_offset,
            width,
        });
        Ok(())
    }

    /// Binds `label` to `offset` (the address of the very next instruction)
    /// and backpatches every pending reference.
    pub fn bind(
        &mut self,
        label: LabelId,
        buffer: &mut Vec<u8>,
        offset: usize,
    ) -> Result<(), EncodingError> {
        let entry = &mut self.labels[label.0];
        entry.target = Some(offset);
        let sites = std::mem::take(&mut entry.sites);
        for site in sites {
            write_displacement(buffer, site.patch_offset, site.width, offset, site.anchor_offset)?;
        }
        Ok(())
    }

    pub fn is_bound(&self, label: LabelId) -> bool {
        self.labels[label.0].is_bound()
    }
}

fn write_displacement(
    buffer: &mut [u8],
    patch_offset: usize,
    width: RelativeWidth,
    target: usize,
    anchor_offset: usize,
) -> Result<(), EncodingError> {
    let displacement = target as i64 - anchor_offset as i64;
    match width {
        RelativeWidth::Rel8 => {
            let value = i8::try_from(displacement)
                .map_err(|_| EncodingError::DisplacementOverflow(displacement))?;
            buffer[patch_offset] = value as u8;
        }
        RelativeWidth::Rel32 => {
            let value = i32::try_from(displacement)
                .map_err(|_| EncodingError::DisplacementOverflow(displacement))?;
            buffer[patch_offset..patch_offset + 4].copy_from_slice(&value.to_le_bytes());
        }
    }
    Ok(())
}
