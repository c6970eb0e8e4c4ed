//! Instancing Data Structures
//!
//! - [`BatchKey`]: the part of a draw's state that must match for two draws
//!   to share one instanced call
//! - [`InstanceBuffer`]: the live per-instance rows of a group, uploaded to
//!   the backend as raw bytes
//!
//! Batch keys compare structurally: two keys built from different snapshots
//! are equal when their program and non-instanced slot values are equal,
//! regardless of which overrides supplied those values.

use serde::{Deserialize, Serialize};

use crate::backend::ProgramId;
use crate::schema::{SlotSchema, StateValue};
use crate::state_tree::StateSnapshot;

/// Smallest capacity an instance buffer shrinks to
pub const MIN_INSTANCE_CAPACITY: usize = 4;

/// Grouping key of a draw
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BatchKey {
    /// Resolved program
    pub program: ProgramId,
    /// Values of the schema's batch slots, in schema order
    pub state: Box<[Option<StateValue>]>,
}

impl BatchKey {
    /// Build the key of a draw with the given program and effective state
    pub fn from_snapshot(program: ProgramId, schema: &SlotSchema, snapshot: &StateSnapshot) -> Self {
        Self {
            program,
            state: schema
                .batch_slots()
                .iter()
                .map(|slot| snapshot.value(*slot).cloned())
                .collect(),
        }
    }
}

/// Build the per-instance row of a draw
///
/// Instanced slots are laid out in schema order, each zero-padded to its
/// declared width. Undefined slots are all zeros.
pub fn instance_row(schema: &SlotSchema, snapshot: &StateSnapshot) -> Vec<f32> {
    let mut row = vec![0.0; schema.instance_stride()];
    let mut offset = 0;
    for slot in schema.instanced_slots() {
        let width = schema.slot(*slot).map_or(0, |d| d.instance_width as usize);
        if let Some(value) = snapshot.value(*slot) {
            value.write_floats(&mut row[offset..offset + width]);
        }
        offset += width;
    }
    row
}

/// Per-instance rows of one group
///
/// Capacity doubles when full and halves once occupancy drops to a quarter,
/// never below the minimum capacity. Every mutation bumps `version`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceBuffer {
    data: Vec<f32>,
    stride: usize,
    len: usize,
    capacity: usize,
    min_capacity: usize,
    version: u64,
}

impl InstanceBuffer {
    /// Create a buffer of `stride` floats per instance
    pub fn new(stride: usize, min_capacity: usize) -> Self {
        let min_capacity = min_capacity.max(MIN_INSTANCE_CAPACITY);
        Self {
            data: vec![0.0; min_capacity * stride],
            stride,
            len: 0,
            capacity: min_capacity,
            min_capacity,
            version: 0,
        }
    }

    /// Append a row, growing geometrically. Returns its index.
    pub fn push(&mut self, row: &[f32]) -> usize {
        if self.len == self.capacity {
            self.capacity *= 2;
            self.data.resize(self.capacity * self.stride, 0.0);
        }
        let index = self.len;
        self.len += 1;
        self.write(index, row);
        index
    }

    /// Overwrite row `index`. Out-of-range writes are ignored.
    pub fn write(&mut self, index: usize, row: &[f32]) {
        if index >= self.len {
            return;
        }
        let start = index * self.stride;
        let dst = &mut self.data[start..start + self.stride];
        dst.fill(0.0);
        let n = row.len().min(self.stride);
        dst[..n].copy_from_slice(&row[..n]);
        self.version += 1;
    }

    /// Remove row `index`, moving the last row into its place
    pub fn swap_remove(&mut self, index: usize) {
        if index >= self.len {
            return;
        }
        let last = self.len - 1;
        if index != last {
            let (head, tail) = self.data.split_at_mut(last * self.stride);
            head[index * self.stride..(index + 1) * self.stride]
                .copy_from_slice(&tail[..self.stride]);
        }
        self.len = last;

        if self.len <= self.capacity / 4 && self.capacity / 2 >= self.min_capacity {
            self.capacity /= 2;
            self.data.truncate(self.capacity * self.stride);
            self.data.shrink_to_fit();
        }
        self.version += 1;
    }

    /// Row `index`
    pub fn row(&self, index: usize) -> Option<&[f32]> {
        (index < self.len).then(|| &self.data[index * self.stride..(index + 1) * self.stride])
    }

    /// Occupied rows as floats
    pub fn as_slice(&self) -> &[f32] {
        &self.data[..self.len * self.stride]
    }

    /// Occupied rows as bytes for upload
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self.as_slice())
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if no rows are stored
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Rows that fit without growing
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Floats per row
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Mutation counter
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Allocated floats
    pub fn allocated_floats(&self) -> usize {
        self.data.len()
    }
}
