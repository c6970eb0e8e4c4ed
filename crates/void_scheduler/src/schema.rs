//! Slot Schema and State Values
//!
//! A slot is one named category of pipeline state ("blend mode", "depth
//! test", "model matrix"). The schema is declared once, up front, and tells
//! the scheduler what each slot is for:
//!
//! - `Priority`, `Framebuffer`, `VertexSource` feed the draw sort key
//! - `Framebuffer` also feeds the Frame setting
//! - `Pipeline` slots are folded into one compiled PipelineState fragment
//! - `Uniform` slots become uniform settings, unless instanced, in which
//!   case grouped draws receive them through the per-instance buffer
//! - `VertexSource` and `IndexRange` describe the draw itself
//!
//! # Usage
//!
//! ```ignore
//! let mut builder = SlotSchema::builder();
//! let priority = builder.add(SlotDesc::new("priority", SlotRole::Priority));
//! let blend = builder.add(SlotDesc::new("blend", SlotRole::Pipeline).affects_program());
//! let model = builder.add(SlotDesc::instanced("model", 16));
//! let schema = builder.build()?;
//! ```

use core::hash::{Hash, Hasher};
use serde::{Deserialize, Serialize};

use void_core::Handle;

use crate::error::SchemaError;

/// Marker type for GPU resources owned outside the scheduler
/// (framebuffers, vertex buffers, textures).
pub enum GpuResource {}

/// Identity of an externally owned GPU resource
pub type ResourceHandle = Handle<GpuResource>;

/// Maximum number of slots a schema may declare
pub const MAX_SLOTS: usize = 1024;

/// Identifies one slot in a [`SlotSchema`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotId(pub u16);

impl SlotId {
    /// Position of this slot in per-node state arrays
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// What a slot is used for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotRole {
    /// Explicit draw priority (`Int`), first component of the sort key
    Priority,
    /// Framebuffer binding (`Resource`)
    Framebuffer,
    /// Vertex source of the draw (`Resource`)
    VertexSource,
    /// Index range of the draw (`Range`)
    IndexRange,
    /// Fixed-function pipeline state
    Pipeline,
    /// Uniform value; instanced uniforms vary within an instance group
    Uniform {
        /// Supplied per instance when the draw is batched
        instanced: bool,
    },
}

impl SlotRole {
    fn is_singular(self) -> bool {
        matches!(
            self,
            Self::Priority | Self::Framebuffer | Self::VertexSource | Self::IndexRange
        )
    }
}

/// Declaration of one slot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDesc {
    /// Human readable name, used in diagnostics
    pub name: String,
    /// What the slot is used for
    pub role: SlotRole,
    /// Whether the slot's value feeds program resolution
    pub affects_program: bool,
    /// Floats per instance for instanced uniforms (0 otherwise)
    pub instance_width: u16,
}

impl SlotDesc {
    /// Declare a slot with the given role
    pub fn new(name: impl Into<String>, role: SlotRole) -> Self {
        Self {
            name: name.into(),
            role,
            affects_program: false,
            instance_width: 0,
        }
    }

    /// Declare an ordinary (non-instanced) uniform
    pub fn uniform(name: impl Into<String>) -> Self {
        Self::new(name, SlotRole::Uniform { instanced: false })
    }

    /// Declare an instanced uniform occupying `width` floats per instance
    pub fn instanced(name: impl Into<String>, width: u16) -> Self {
        Self {
            instance_width: width,
            ..Self::new(name, SlotRole::Uniform { instanced: true })
        }
    }

    /// Mark the slot as an input of program resolution
    pub fn affects_program(mut self) -> Self {
        self.affects_program = true;
        self
    }

    /// Check if the slot is supplied per instance when batched
    pub fn is_instanced(&self) -> bool {
        matches!(self.role, SlotRole::Uniform { instanced: true })
    }
}

/// A resolved state value
///
/// Equality and hashing are structural; floats compare by bit pattern so
/// that values can take part in batch keys.
#[derive(Clone, Debug)]
pub enum StateValue {
    /// Boolean toggle (depth test, culling, ...)
    Bool(bool),
    /// Integer value (priority, enum-like state)
    Int(i64),
    /// Scalar float
    Float(f32),
    /// Four-component vector
    Vec4([f32; 4]),
    /// 4x4 matrix, column-major
    Mat4([[f32; 4]; 4]),
    /// Reference to an externally owned GPU resource
    Resource(ResourceHandle),
    /// Index range of a draw
    Range {
        /// First index
        start: u32,
        /// Number of indices
        count: u32,
    },
}

impl StateValue {
    /// Integer payload, if any
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Resource payload, if any
    pub fn as_resource(&self) -> Option<ResourceHandle> {
        match self {
            Self::Resource(h) => Some(*h),
            _ => None,
        }
    }

    /// Range payload, if any
    pub fn as_range(&self) -> Option<(u32, u32)> {
        match self {
            Self::Range { start, count } => Some((*start, *count)),
            _ => None,
        }
    }

    /// Number of floats this value contributes to an instance row
    pub fn float_len(&self) -> usize {
        match self {
            Self::Float(_) => 1,
            Self::Vec4(_) => 4,
            Self::Mat4(_) => 16,
            _ => 0,
        }
    }

    /// Write the value into `out`, zero-filling what it does not cover
    pub fn write_floats(&self, out: &mut [f32]) {
        out.fill(0.0);
        match self {
            Self::Float(v) => {
                if let Some(first) = out.first_mut() {
                    *first = *v;
                }
            }
            Self::Vec4(v) => {
                for (dst, src) in out.iter_mut().zip(v.iter()) {
                    *dst = *src;
                }
            }
            Self::Mat4(m) => {
                for (dst, src) in out.iter_mut().zip(m.iter().flatten()) {
                    *dst = *src;
                }
            }
            _ => {}
        }
    }

    fn discriminant(&self) -> u8 {
        match self {
            Self::Bool(_) => 0,
            Self::Int(_) => 1,
            Self::Float(_) => 2,
            Self::Vec4(_) => 3,
            Self::Mat4(_) => 4,
            Self::Resource(_) => 5,
            Self::Range { .. } => 6,
        }
    }
}

impl PartialEq for StateValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Vec4(a), Self::Vec4(b)) => {
                a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Self::Mat4(a), Self::Mat4(b)) => a
                .iter()
                .flatten()
                .zip(b.iter().flatten())
                .all(|(x, y)| x.to_bits() == y.to_bits()),
            (Self::Resource(a), Self::Resource(b)) => a == b,
            (
                Self::Range { start: s1, count: c1 },
                Self::Range { start: s2, count: c2 },
            ) => s1 == s2 && c1 == c2,
            _ => false,
        }
    }
}

impl Eq for StateValue {}

impl Hash for StateValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.discriminant().hash(state);
        match self {
            Self::Bool(v) => v.hash(state),
            Self::Int(v) => v.hash(state),
            Self::Float(v) => v.to_bits().hash(state),
            Self::Vec4(v) => v.iter().for_each(|x| x.to_bits().hash(state)),
            Self::Mat4(m) => m.iter().flatten().for_each(|x| x.to_bits().hash(state)),
            Self::Resource(h) => h.hash(state),
            Self::Range { start, count } => {
                start.hash(state);
                count.hash(state);
            }
        }
    }
}

/// The full slot declaration used by every scheduler component
#[derive(Clone, Debug)]
pub struct SlotSchema {
    slots: Vec<SlotDesc>,
    priority: Option<SlotId>,
    framebuffer: Option<SlotId>,
    vertex_source: Option<SlotId>,
    index_range: Option<SlotId>,
    pipeline: Vec<SlotId>,
    uniforms: Vec<SlotId>,
    instanced: Vec<SlotId>,
    program_inputs: Vec<SlotId>,
    batch_slots: Vec<SlotId>,
    instance_stride: usize,
}

impl SlotSchema {
    /// Start declaring a schema
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Number of declared slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if no slots are declared
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Look up a slot declaration
    pub fn slot(&self, slot: SlotId) -> Option<&SlotDesc> {
        self.slots.get(slot.index())
    }

    /// Find a slot by name
    pub fn find(&self, name: &str) -> Option<SlotId> {
        self.slots
            .iter()
            .position(|s| s.name == name)
            .map(|i| SlotId(i as u16))
    }

    /// Priority slot, if declared
    pub fn priority(&self) -> Option<SlotId> {
        self.priority
    }

    /// Framebuffer slot, if declared
    pub fn framebuffer(&self) -> Option<SlotId> {
        self.framebuffer
    }

    /// Vertex source slot, if declared
    pub fn vertex_source(&self) -> Option<SlotId> {
        self.vertex_source
    }

    /// Index range slot, if declared
    pub fn index_range(&self) -> Option<SlotId> {
        self.index_range
    }

    /// Slots folded into the PipelineState setting
    pub fn pipeline_slots(&self) -> &[SlotId] {
        &self.pipeline
    }

    /// All uniform slots, instanced or not
    pub fn uniform_slots(&self) -> &[SlotId] {
        &self.uniforms
    }

    /// Instanced uniform slots, in instance-row order
    pub fn instanced_slots(&self) -> &[SlotId] {
        &self.instanced
    }

    /// Slots whose values feed program resolution
    pub fn program_inputs(&self) -> &[SlotId] {
        &self.program_inputs
    }

    /// Slots that must match structurally for draws to share a group
    pub fn batch_slots(&self) -> &[SlotId] {
        &self.batch_slots
    }

    /// Floats per instance row
    pub fn instance_stride(&self) -> usize {
        self.instance_stride
    }

    /// Check if a slot is supplied per instance when batched
    pub fn is_instanced(&self, slot: SlotId) -> bool {
        self.slot(slot).map_or(false, SlotDesc::is_instanced)
    }

    /// Check that `value` is acceptable for `slot`
    pub fn check(&self, slot: SlotId, value: &StateValue) -> Result<(), SchemaError> {
        let desc = self.slot(slot).ok_or(SchemaError::UnknownSlot(slot))?;
        let ok = match desc.role {
            SlotRole::Priority => matches!(value, StateValue::Int(_)),
            SlotRole::Framebuffer | SlotRole::VertexSource => {
                matches!(value, StateValue::Resource(_))
            }
            SlotRole::IndexRange => matches!(value, StateValue::Range { .. }),
            SlotRole::Uniform { instanced: true } => {
                value.float_len() > 0 && value.float_len() <= desc.instance_width as usize
            }
            SlotRole::Pipeline | SlotRole::Uniform { instanced: false } => true,
        };
        if ok {
            Ok(())
        } else {
            Err(SchemaError::ValueMismatch {
                slot: desc.name.clone(),
                role: desc.role,
            })
        }
    }
}

/// Incremental schema declaration
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    slots: Vec<SlotDesc>,
}

impl SchemaBuilder {
    /// Declare a slot and get its id
    pub fn add(&mut self, desc: SlotDesc) -> SlotId {
        let id = SlotId(self.slots.len() as u16);
        self.slots.push(desc);
        id
    }

    /// Validate the declarations and freeze the schema
    pub fn build(self) -> Result<SlotSchema, SchemaError> {
        if self.slots.len() > MAX_SLOTS {
            return Err(SchemaError::TooManySlots(self.slots.len()));
        }

        let mut schema = SlotSchema {
            slots: Vec::new(),
            priority: None,
            framebuffer: None,
            vertex_source: None,
            index_range: None,
            pipeline: Vec::new(),
            uniforms: Vec::new(),
            instanced: Vec::new(),
            program_inputs: Vec::new(),
            batch_slots: Vec::new(),
            instance_stride: 0,
        };

        for (i, desc) in self.slots.iter().enumerate() {
            let id = SlotId(i as u16);

            if self.slots[..i].iter().any(|other| other.name == desc.name) {
                return Err(SchemaError::DuplicateName(desc.name.clone()));
            }

            if desc.role.is_singular() {
                let target = match desc.role {
                    SlotRole::Priority => &mut schema.priority,
                    SlotRole::Framebuffer => &mut schema.framebuffer,
                    SlotRole::VertexSource => &mut schema.vertex_source,
                    _ => &mut schema.index_range,
                };
                if target.is_some() {
                    return Err(SchemaError::DuplicateRole(desc.role));
                }
                *target = Some(id);
            }

            match desc.role {
                SlotRole::Pipeline => schema.pipeline.push(id),
                SlotRole::Uniform { instanced } => {
                    schema.uniforms.push(id);
                    if instanced {
                        if desc.instance_width == 0 {
                            return Err(SchemaError::ZeroInstanceWidth(desc.name.clone()));
                        }
                        if desc.affects_program {
                            return Err(SchemaError::InstancedProgramInput(desc.name.clone()));
                        }
                        schema.instanced.push(id);
                        schema.instance_stride += desc.instance_width as usize;
                    }
                }
                _ => {}
            }

            if desc.affects_program {
                schema.program_inputs.push(id);
            }
            if !desc.is_instanced() {
                schema.batch_slots.push(id);
            }
        }

        schema.slots = self.slots;
        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_classification() {
        let mut builder = SlotSchema::builder();
        let priority = builder.add(SlotDesc::new("priority", SlotRole::Priority));
        let blend = builder.add(SlotDesc::new("blend", SlotRole::Pipeline).affects_program());
        let tint = builder.add(SlotDesc::uniform("tint"));
        let model = builder.add(SlotDesc::instanced("model", 16));
        let color = builder.add(SlotDesc::instanced("color", 4));
        let schema = builder.build().unwrap();

        assert_eq!(schema.priority(), Some(priority));
        assert_eq!(schema.pipeline_slots(), &[blend]);
        assert_eq!(schema.uniform_slots(), &[tint, model, color]);
        assert_eq!(schema.instanced_slots(), &[model, color]);
        assert_eq!(schema.program_inputs(), &[blend]);
        assert_eq!(schema.batch_slots(), &[priority, blend, tint]);
        assert_eq!(schema.instance_stride(), 20);
        assert_eq!(schema.find("tint"), Some(tint));
    }

    #[test]
    fn test_schema_rejects_duplicate_roles() {
        let mut builder = SlotSchema::builder();
        builder.add(SlotDesc::new("fb0", SlotRole::Framebuffer));
        builder.add(SlotDesc::new("fb1", SlotRole::Framebuffer));
        assert!(matches!(builder.build(), Err(SchemaError::DuplicateRole(SlotRole::Framebuffer))));
    }

    #[test]
    fn test_schema_rejects_zero_width_instance_slot() {
        let mut builder = SlotSchema::builder();
        builder.add(SlotDesc::instanced("model", 0));
        assert!(matches!(builder.build(), Err(SchemaError::ZeroInstanceWidth(_))));
    }

    #[test]
    fn test_value_check() {
        let mut builder = SlotSchema::builder();
        let priority = builder.add(SlotDesc::new("priority", SlotRole::Priority));
        let model = builder.add(SlotDesc::instanced("offset", 4));
        let schema = builder.build().unwrap();

        assert!(schema.check(priority, &StateValue::Int(3)).is_ok());
        assert!(schema.check(priority, &StateValue::Float(3.0)).is_err());
        assert!(schema.check(model, &StateValue::Vec4([1.0; 4])).is_ok());
        assert!(schema.check(model, &StateValue::Mat4([[0.0; 4]; 4])).is_err());
        assert!(matches!(
            schema.check(SlotId(9), &StateValue::Bool(true)),
            Err(SchemaError::UnknownSlot(SlotId(9)))
        ));
    }

    #[test]
    fn test_float_bits_equality() {
        assert_eq!(StateValue::Float(1.5), StateValue::Float(1.5));
        assert_ne!(StateValue::Float(0.0), StateValue::Float(-0.0));
        assert_ne!(StateValue::Int(1), StateValue::Float(1.0));
    }

    #[test]
    fn test_write_floats_pads() {
        let mut row = [9.0f32; 4];
        StateValue::Float(2.0).write_floats(&mut row);
        assert_eq!(row, [2.0, 0.0, 0.0, 0.0]);
    }
}
