//! Delta Submission
//!
//! Walks the order index front to back and emits only what changes between
//! consecutive entries. Settings are interned, so "changed" is an identity
//! compare against the settings held by the previously emitted entry. The
//! first entry of a frame is emitted in full.
//!
//! Per entry, in order:
//! 1. `UseProgram` when the program differs from the previous entry's
//! 2. setting ops for settings the previous entry did not hold
//! 3. `UploadInstances` when the group's buffer changed since its last upload
//! 4. `Draw`

use std::collections::HashMap;

use crate::backend::{Backend, ProgramId};
use crate::draw_command::{BackendOp, FrameReport};
use crate::entry::{Entry, EntrySource};
use crate::instance_batcher::{GroupId, InstanceBatcher};
use crate::order_index::OrderIndex;
use crate::setting_cache::{SettingCache, SettingPayload};

/// Per-frame op stream builder
#[derive(Debug, Default)]
pub struct Submission {
    ops: Vec<BackendOp>,
    /// Buffer version last uploaded per group
    uploaded: HashMap<GroupId, u64>,
}

impl Submission {
    /// Create an empty submission state
    pub fn new() -> Self {
        Self::default()
    }

    /// Build this frame's ops and hand them to `backend`
    pub fn emit<B: Backend + ?Sized>(
        &mut self,
        frame: u64,
        order: &OrderIndex,
        cache: &SettingCache,
        batcher: &InstanceBatcher,
        backend: &mut B,
    ) -> FrameReport {
        self.ops.clear();
        self.uploaded.retain(|group, _| batcher.group(*group).is_some());

        let mut report = FrameReport {
            frame,
            ..Default::default()
        };
        let mut prev: Option<&Entry> = None;
        let mut program: Option<ProgramId> = None;

        for (_, entry) in order.iter() {
            report.entries += 1;

            if entry.settings().iter().any(|s| cache.is_dirty(s)) {
                report.skipped.push(entry.source());
                continue;
            }

            if program != Some(entry.program()) {
                self.ops.push(BackendOp::UseProgram(entry.program()));
                program = Some(entry.program());
                report.program_switches += 1;
            }

            for setting in entry.settings() {
                if prev.map_or(false, |p| p.holds(setting)) {
                    continue;
                }
                let Some(payload) = cache.get(setting.id()).map(|s| s.payload()) else {
                    continue;
                };
                self.ops.push(match payload {
                    SettingPayload::Frame { framebuffer } => BackendOp::BindFramebuffer(*framebuffer),
                    SettingPayload::PipelineState { fragment } => BackendOp::ApplyPipelineState(*fragment),
                    SettingPayload::Uniform { slot, value } => BackendOp::ApplyUniform {
                        slot: *slot,
                        value: value.clone(),
                    },
                });
                report.setting_ops += 1;
            }

            let mut draw = entry.draw().clone();
            if let EntrySource::Group(group_id) = entry.source() {
                if let Some(group) = batcher.group(group_id) {
                    let buffer = group.buffer();
                    if self.uploaded.get(&group_id) != Some(&buffer.version()) {
                        self.ops.push(BackendOp::UploadInstances {
                            group: group_id,
                            stride: buffer.stride(),
                            data: buffer.as_bytes().to_vec(),
                        });
                        self.uploaded.insert(group_id, buffer.version());
                        report.uploads += 1;
                    }
                    draw = draw.instanced(group_id, group.len() as u32);
                    report.instanced_draws += 1;
                    report.instances += group.len() as u32;
                }
            }

            self.ops.push(BackendOp::Draw(draw));
            report.draws += 1;
            prev = Some(entry);
        }

        backend.execute(&self.ops);
        report
    }

    /// Ops of the last emitted frame
    pub fn last_ops(&self) -> &[BackendOp] {
        &self.ops
    }

    /// Force every group buffer to be uploaded again next frame
    pub fn invalidate_uploads(&mut self) {
        self.uploaded.clear();
    }
}
