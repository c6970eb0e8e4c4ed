//! Integration tests for the render command scheduler
//!
//! Drives the façade the way a scene graph would and replays every emitted
//! frame against a model backend, comparing the state each draw observes
//! with the state re-derived from the tree.

use std::collections::HashMap;

use void_scheduler::prelude::*;
use void_scheduler::{
    CompileError, Entry, EntrySource, GroupId, SettingId, StateHandoff, StagedUpdate,
};

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Resolves the program from the `shading` slot (program 1 when undefined)
struct ByShading {
    slot: SlotId,
    calls: usize,
    offline: bool,
}

impl ProgramResolver for ByShading {
    fn resolve(&mut self, snapshot: &StateSnapshot) -> Result<ProgramId, ResolveError> {
        self.calls += 1;
        if self.offline {
            return Err(ResolveError::Link("resolver offline".into()));
        }
        match snapshot.value(self.slot) {
            None => Ok(ProgramId(1)),
            Some(StateValue::Int(p)) if *p > 0 => Ok(ProgramId(*p as u64)),
            Some(other) => Err(ResolveError::Unsupported(format!("shading {:?}", other))),
        }
    }
}

/// Records the state every live fragment was compiled from
///
/// `Int(99)` anywhere in a request is rejected, `Int(666)` exhausts memory.
#[derive(Default)]
struct Recorder {
    next: u64,
    fragments: HashMap<FragmentId, Vec<(SlotId, Option<StateValue>)>>,
}

impl FragmentCompiler for Recorder {
    fn compile(&mut self, request: &FragmentRequest<'_>) -> Result<FragmentId, CompileError> {
        if request.state.iter().any(|(_, v)| *v == Some(&StateValue::Int(99))) {
            return Err(CompileError::Invalid("blend 99 is not a blend mode".into()));
        }
        if request.state.iter().any(|(_, v)| *v == Some(&StateValue::Int(666))) {
            return Err(CompileError::OutOfMemory);
        }
        self.next += 1;
        let id = FragmentId(self.next);
        self.fragments
            .insert(id, request.state.iter().map(|(s, v)| (*s, v.cloned())).collect());
        Ok(id)
    }

    fn release(&mut self, fragment: FragmentId) {
        assert!(self.fragments.remove(&fragment).is_some(), "double release of {:?}", fragment);
    }
}

/// State observed by one draw
#[derive(Clone, Debug)]
struct Observed {
    program: Option<ProgramId>,
    framebuffer: Option<ResourceHandle>,
    fragment: Option<FragmentId>,
    uniforms: HashMap<SlotId, StateValue>,
    draw: DrawCommand,
    instances: Vec<f32>,
}

/// Backend that replays ops into a flat state machine
#[derive(Default)]
struct Model {
    program: Option<ProgramId>,
    framebuffer: Option<ResourceHandle>,
    fragment: Option<FragmentId>,
    uniforms: HashMap<SlotId, StateValue>,
    instances: HashMap<GroupId, Vec<f32>>,
    draws: Vec<Observed>,
    frames: Vec<Vec<BackendOp>>,
}

impl Backend for Model {
    fn execute(&mut self, ops: &[BackendOp]) {
        self.draws.clear();
        self.frames.push(ops.to_vec());
        for op in ops {
            match op {
                BackendOp::BindFramebuffer(fb) => self.framebuffer = *fb,
                BackendOp::UseProgram(p) => self.program = Some(*p),
                BackendOp::ApplyPipelineState(f) => self.fragment = Some(*f),
                BackendOp::ApplyUniform { slot, value: Some(value) } => {
                    self.uniforms.insert(*slot, value.clone());
                }
                BackendOp::ApplyUniform { slot, value: None } => {
                    self.uniforms.remove(slot);
                }
                BackendOp::UploadInstances { group, stride, data } => {
                    let floats: Vec<f32> = data
                        .chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect();
                    assert_eq!(floats.len() % (*stride).max(1), 0);
                    self.instances.insert(*group, floats);
                }
                BackendOp::Draw(draw) => {
                    let instances = draw
                        .group
                        .and_then(|g| self.instances.get(&g).cloned())
                        .unwrap_or_default();
                    self.draws.push(Observed {
                        program: self.program,
                        framebuffer: self.framebuffer,
                        fragment: self.fragment,
                        uniforms: self.uniforms.clone(),
                        draw: draw.clone(),
                        instances,
                    });
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scene helpers
// ---------------------------------------------------------------------------

struct Slots {
    priority: SlotId,
    target: SlotId,
    mesh: SlotId,
    range: SlotId,
    shading: SlotId,
    blend: SlotId,
    color: SlotId,
    tint: SlotId,
}

type TestScheduler = Scheduler<ByShading, Recorder>;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn scheduler(config: SchedulerConfig) -> (TestScheduler, Slots) {
    init_logging();
    let mut builder = SlotSchema::builder();
    let slots = Slots {
        priority: builder.add(SlotDesc::new("priority", SlotRole::Priority)),
        target: builder.add(SlotDesc::new("target", SlotRole::Framebuffer)),
        mesh: builder.add(SlotDesc::new("mesh", SlotRole::VertexSource)),
        range: builder.add(SlotDesc::new("range", SlotRole::IndexRange)),
        shading: builder.add(SlotDesc::new("shading", SlotRole::Pipeline).affects_program()),
        blend: builder.add(SlotDesc::new("blend", SlotRole::Pipeline)),
        color: builder.add(SlotDesc::uniform("color")),
        tint: builder.add(SlotDesc::instanced("tint", 4)),
    };
    let schema = builder.build().expect("valid schema");
    let resolver = ByShading {
        slot: slots.shading,
        calls: 0,
        offline: false,
    };
    let sched = Scheduler::new(schema, resolver, Recorder::default(), config).expect("valid config");
    (sched, slots)
}

fn res(i: u32) -> StateValue {
    StateValue::Resource(ResourceHandle::new(i, 0))
}

fn tint(v: f32) -> StateValue {
    StateValue::Vec4([v, v + 0.25, v + 0.5, 1.0])
}

fn value_of(sched: &TestScheduler, node: NodeId, slot: SlotId) -> Option<StateValue> {
    sched.tree().get(node, slot).expect("live node").cloned()
}

fn representative(sched: &TestScheduler, entry: &Entry) -> NodeId {
    match entry.source() {
        EntrySource::Bare(node) => node,
        EntrySource::Group(group) => sched.batcher().representative(group).expect("live group"),
    }
}

/// Check every observed draw against the state re-derived from the tree
fn check_frame(sched: &TestScheduler, model: &Model, slots: &Slots) {
    let entries: Vec<&Entry> = sched
        .order()
        .iter()
        .map(|(_, e)| e)
        .filter(|e| !e.settings().iter().any(|s| sched.cache().is_dirty(s)))
        .collect();
    assert_eq!(model.draws.len(), entries.len());

    for (seen, entry) in model.draws.iter().zip(entries) {
        let rep = representative(sched, entry);

        let expected_program = match value_of(sched, rep, slots.shading) {
            Some(StateValue::Int(p)) => ProgramId(p as u64),
            _ => ProgramId(1),
        };
        assert_eq!(seen.program, Some(expected_program));

        let expected_fb = value_of(sched, rep, slots.target).and_then(|v| v.as_resource());
        assert_eq!(seen.framebuffer, expected_fb);

        let fragment = seen.fragment.expect("pipeline state applied");
        let expected_pipeline: Vec<(SlotId, Option<StateValue>)> = sched
            .schema()
            .pipeline_slots()
            .iter()
            .map(|s| (*s, value_of(sched, rep, *s)))
            .collect();
        assert_eq!(sched.compiler().fragments[&fragment], expected_pipeline);

        assert_eq!(seen.uniforms.get(&slots.color).cloned(), value_of(sched, rep, slots.color));

        let expected_vs = value_of(sched, rep, slots.mesh).and_then(|v| v.as_resource());
        assert_eq!(seen.draw.vertex_source, expected_vs);
        let expected_range = value_of(sched, rep, slots.range).and_then(|v| v.as_range());
        assert_eq!(seen.draw.index_range(), expected_range.unwrap_or((0, 0)));

        match entry.source() {
            EntrySource::Bare(node) => {
                assert_eq!(seen.draw.instance_count, 1);
                assert_eq!(seen.uniforms.get(&slots.tint).cloned(), value_of(sched, node, slots.tint));
            }
            EntrySource::Group(group) => {
                let members = sched.batcher().group(group).expect("live group").members();
                assert_eq!(seen.draw.instance_count as usize, members.len());
                assert_eq!(seen.instances.len(), members.len() * 4);
                for (i, member) in members.iter().enumerate() {
                    let mut row = [0.0f32; 4];
                    if let Some(t) = value_of(sched, *member, slots.tint) {
                        t.write_floats(&mut row);
                    }
                    assert_eq!(&seen.instances[i * 4..i * 4 + 4], &row);
                }
            }
        }
    }
}

/// Every setting's refcount equals the number of entries holding it
fn check_refcounts(sched: &TestScheduler) {
    let mut held: HashMap<SettingId, u32> = HashMap::new();
    for (_, entry) in sched.order().iter() {
        for setting in entry.settings() {
            *held.entry(setting.id()).or_default() += 1;
        }
    }
    assert_eq!(held.len(), sched.cache().len());
    for (id, setting) in sched.cache().iter() {
        assert!(setting.refcount() > 0);
        assert_eq!(Some(&setting.refcount()), held.get(&id));
    }
}

/// Walk keys are strictly increasing and match the tree's priorities
fn check_order(sched: &TestScheduler, slots: &Slots) {
    let keys: Vec<_> = sched.order().iter().map(|(_, e)| e.key().clone()).collect();
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    for (_, entry) in sched.order().iter() {
        let rep = representative(sched, entry);
        let priority = value_of(sched, rep, slots.priority)
            .and_then(|v| v.as_int())
            .unwrap_or(0);
        assert_eq!(entry.key().priority, priority);
    }
}

/// Tiny deterministic generator for churn tests
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) % bound
    }
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[test]
fn test_end_to_end_walk_order() {
    let (mut sched, slots) = scheduler(SchedulerConfig::no_instancing());
    let root = sched.create_node(None).unwrap();
    let a = sched.create_node(Some(root)).unwrap();
    let b = sched.create_node(Some(root)).unwrap();
    let c = sched.create_node(Some(root)).unwrap();

    let p1 = StateOp::Define(slots.shading, StateValue::Int(1));
    let p2 = StateOp::Define(slots.shading, StateValue::Int(2));
    sched.add(a, [StateOp::Define(slots.priority, StateValue::Int(0)), p1.clone()]).unwrap();
    sched.add(b, [StateOp::Define(slots.priority, StateValue::Int(0)), p1]).unwrap();
    sched.add(c, [StateOp::Define(slots.priority, StateValue::Int(5)), p2]).unwrap();
    assert_eq!(sched.entry_order(), vec![a, b, c]);

    sched.remove(b).unwrap();
    assert_eq!(sched.entry_order(), vec![a, c]);
    sched.add(b, [StateOp::Define(slots.priority, StateValue::Int(-1))]).unwrap();
    assert_eq!(sched.entry_order(), vec![b, a, c]);

    let mut model = Model::default();
    let report = sched.emit(&mut model);
    assert_eq!(report.draws, 3);
    assert_eq!(report.program_switches, 2);
    check_frame(&sched, &model, &slots);
}

#[test]
fn test_update_keeps_position_when_order_unchanged() {
    let (mut sched, slots) = scheduler(SchedulerConfig::no_instancing());
    let nodes: Vec<NodeId> = (0..3).map(|_| sched.create_node(None).unwrap()).collect();
    for node in &nodes {
        sched.add(*node, [StateOp::Define(slots.color, StateValue::Float(0.0))]).unwrap();
    }
    let before: Vec<_> = sched.order().iter().map(|(id, _)| id).collect();

    sched.update(nodes[0], [StateOp::Define(slots.color, StateValue::Float(1.0))]).unwrap();
    let after: Vec<_> = sched.order().iter().map(|(id, _)| id).collect();
    assert_eq!(before, after);
    assert_eq!(sched.entry_order(), nodes);
}

#[test]
fn test_total_order_and_refcounts_under_churn() {
    let (mut sched, slots) = scheduler(SchedulerConfig::default());
    let root = sched.create_node(None).unwrap();
    sched.update(root, [StateOp::Define(slots.blend, StateValue::Int(1))]).unwrap();
    let nodes: Vec<NodeId> = (0..12).map(|_| sched.create_node(Some(root)).unwrap()).collect();
    let mut rng = Lcg(7);
    let mut model = Model::default();

    for step in 0..300 {
        let node = nodes[rng.next(nodes.len() as u64) as usize];
        if !sched.is_scheduled(node) {
            let ops = [
                StateOp::Define(slots.mesh, res(rng.next(3) as u32 + 1)),
                StateOp::Define(slots.priority, StateValue::Int(rng.next(4) as i64)),
                StateOp::Define(slots.tint, tint(rng.next(10) as f32)),
            ];
            sched.add(node, ops).unwrap();
        } else {
            match rng.next(5) {
                0 => sched.remove(node).unwrap(),
                1 => sched
                    .update(node, [StateOp::Define(slots.priority, StateValue::Int(rng.next(4) as i64))])
                    .unwrap(),
                2 => sched.update(node, [StateOp::Define(slots.tint, tint(step as f32))]).unwrap(),
                3 => sched
                    .update(node, [StateOp::Define(slots.mesh, res(rng.next(3) as u32 + 1))])
                    .unwrap(),
                _ => sched.update(node, [StateOp::Undefine(slots.tint)]).unwrap(),
            }
        }

        check_order(&sched, &slots);
        check_refcounts(&sched);
        if step % 25 == 0 {
            sched.emit(&mut model);
            check_frame(&sched, &model, &slots);
        }
    }
}

// ---------------------------------------------------------------------------
// Inheritance
// ---------------------------------------------------------------------------

#[test]
fn test_inherited_state_falls_through_on_undefine() {
    let (mut sched, slots) = scheduler(SchedulerConfig::default());
    let root = sched.create_node(None).unwrap();
    let mut chain = vec![root];
    for _ in 0..5 {
        let parent = *chain.last().unwrap();
        chain.push(sched.create_node(Some(parent)).unwrap());
    }
    let leaf = *chain.last().unwrap();

    sched.update(root, [StateOp::Define(slots.color, StateValue::Float(0.5))]).unwrap();
    sched.add(leaf, []).unwrap();
    assert_eq!(value_of(&sched, leaf, slots.color), Some(StateValue::Float(0.5)));

    let mut model = Model::default();
    sched.emit(&mut model);
    check_frame(&sched, &model, &slots);

    sched.update(root, [StateOp::Undefine(slots.color)]).unwrap();
    assert_eq!(value_of(&sched, leaf, slots.color), None);
    let entry = sched.order().iter().next().map(|(_, e)| e).unwrap();
    assert_eq!(entry.snapshot().value(slots.color), None);
    check_refcounts(&sched);

    sched.emit(&mut model);
    assert!(model.draws[0].uniforms.get(&slots.color).is_none());
    check_frame(&sched, &model, &slots);
}

#[test]
fn test_undefined_uniform_clears_previous_draw_value() {
    let (mut sched, slots) = scheduler(SchedulerConfig::no_instancing());
    let a = sched.create_node(None).unwrap();
    let c = sched.create_node(None).unwrap();
    sched
        .add(a, [StateOp::Define(slots.mesh, res(1)), StateOp::Define(slots.color, StateValue::Float(1.0))])
        .unwrap();
    sched.add(c, [StateOp::Define(slots.mesh, res(2))]).unwrap();
    assert_eq!(sched.entry_order(), vec![a, c]);

    let mut model = Model::default();
    sched.emit(&mut model);
    assert_eq!(model.draws.len(), 2);
    assert_eq!(model.draws[0].uniforms.get(&slots.color), Some(&StateValue::Float(1.0)));
    assert_eq!(model.draws[1].uniforms.get(&slots.color), None);
    assert_eq!(model.draws[1].uniforms.get(&slots.tint), None);
    check_frame(&sched, &model, &slots);

    // A second undefined node shares the clearing setting
    let d = sched.create_node(None).unwrap();
    sched.add(d, [StateOp::Define(slots.mesh, res(3))]).unwrap();
    let entries: Vec<&Entry> = sched.order().iter().map(|(_, e)| e).collect();
    assert!(entries[2].settings().iter().all(|s| entries[1].holds(s)));
    check_refcounts(&sched);

    sched.emit(&mut model);
    check_frame(&sched, &model, &slots);
}

#[test]
fn test_closer_override_shadows_root_changes() {
    let (mut sched, slots) = scheduler(SchedulerConfig::default());
    let root = sched.create_node(None).unwrap();
    let mid = sched.create_node(Some(root)).unwrap();
    let leaf = sched.create_node(Some(mid)).unwrap();

    sched.update(root, [StateOp::Define(slots.blend, StateValue::Int(1))]).unwrap();
    sched.update(mid, [StateOp::Define(slots.blend, StateValue::Int(2))]).unwrap();
    sched.add(leaf, []).unwrap();
    let compilations = sched.cache().stats().compilations;

    sched.update(root, [StateOp::Define(slots.blend, StateValue::Int(3))]).unwrap();
    assert_eq!(value_of(&sched, leaf, slots.blend), Some(StateValue::Int(2)));
    assert_eq!(sched.cache().stats().compilations, compilations);
}

// ---------------------------------------------------------------------------
// Instancing
// ---------------------------------------------------------------------------

#[test]
fn test_instancing_soundness() {
    let (mut sched, slots) = scheduler(SchedulerConfig::default());
    let root = sched.create_node(None).unwrap();
    sched.update(root, [StateOp::Define(slots.mesh, res(1))]).unwrap();

    let nodes: Vec<NodeId> = (0..5).map(|_| sched.create_node(Some(root)).unwrap()).collect();
    for (i, node) in nodes.iter().enumerate() {
        sched.add(*node, [StateOp::Define(slots.tint, tint(i as f32))]).unwrap();
    }

    assert_eq!(sched.order().len(), 1);
    let (group, g) = sched.batcher().groups().next().unwrap();
    assert_eq!(g.len(), 5);
    assert_eq!(g.buffer().len(), 5);
    for (i, node) in nodes.iter().enumerate() {
        let mut row = [0.0f32; 4];
        tint(i as f32).write_floats(&mut row);
        assert_eq!(sched.batcher().row_of(*node), Some(&row[..]));
    }

    sched.remove(nodes[1]).unwrap();
    let g = sched.batcher().group(group).unwrap();
    assert_eq!(g.len(), 4);
    for (i, node) in nodes.iter().enumerate().filter(|(i, _)| *i != 1) {
        let mut row = [0.0f32; 4];
        tint(i as f32).write_floats(&mut row);
        assert_eq!(sched.batcher().row_of(*node), Some(&row[..]));
    }

    let mut model = Model::default();
    let report = sched.emit(&mut model);
    assert_eq!(report.instanced_draws, 1);
    assert_eq!(report.instances, 4);
    assert_eq!(report.uploads, 1);
    check_frame(&sched, &model, &slots);
    check_refcounts(&sched);
}

#[test]
fn test_group_dissolves_back_to_bare_entry() {
    let (mut sched, slots) = scheduler(SchedulerConfig::default());
    let root = sched.create_node(None).unwrap();
    sched.update(root, [StateOp::Define(slots.mesh, res(1))]).unwrap();
    let a = sched.create_node(Some(root)).unwrap();
    let b = sched.create_node(Some(root)).unwrap();
    sched.add(a, [StateOp::Define(slots.tint, tint(1.0))]).unwrap();
    sched.add(b, [StateOp::Define(slots.tint, tint(2.0))]).unwrap();
    assert_eq!(sched.entries().len(), 1);
    assert!(matches!(sched.entries()[0], EntrySource::Group(_)));

    sched.remove(a).unwrap();
    assert_eq!(sched.entries(), vec![EntrySource::Bare(b)]);

    let mut model = Model::default();
    sched.emit(&mut model);
    check_frame(&sched, &model, &slots);
    check_refcounts(&sched);
}

#[test]
fn test_batch_keys_compare_structurally() {
    let (mut sched, slots) = scheduler(SchedulerConfig::default());
    let a = sched.create_node(None).unwrap();
    let b = sched.create_node(None).unwrap();

    // Equal values from distinct overrides still batch together
    sched.add(a, [StateOp::Define(slots.blend, StateValue::Int(4)), StateOp::Define(slots.tint, tint(0.0))]).unwrap();
    sched.add(b, [StateOp::Define(slots.blend, StateValue::Int(4)), StateOp::Define(slots.tint, tint(1.0))]).unwrap();
    assert_eq!(sched.order().len(), 1);

    sched.update(b, [StateOp::Define(slots.blend, StateValue::Int(5))]).unwrap();
    assert_eq!(sched.order().len(), 2);
    check_refcounts(&sched);
}

#[test]
fn test_instance_identity_change_refills_row() {
    let (mut sched, slots) = scheduler(SchedulerConfig::default());
    let root = sched.create_node(None).unwrap();
    let nodes: Vec<NodeId> = (0..3).map(|_| sched.create_node(Some(root)).unwrap()).collect();
    for node in &nodes {
        sched.add(*node, [StateOp::Define(slots.tint, tint(0.0))]).unwrap();
    }
    let entry_before: Vec<_> = sched.order().iter().map(|(id, _)| id).collect();
    let settings_before = sched.cache().stats().compilations;

    sched.update(nodes[2], [StateOp::Define(slots.tint, tint(9.0))]).unwrap();

    let entry_after: Vec<_> = sched.order().iter().map(|(id, _)| id).collect();
    assert_eq!(entry_before, entry_after);
    assert_eq!(sched.cache().stats().compilations, settings_before);
    let mut row = [0.0f32; 4];
    tint(9.0).write_floats(&mut row);
    assert_eq!(sched.batcher().row_of(nodes[2]), Some(&row[..]));

    let mut model = Model::default();
    sched.emit(&mut model);
    check_frame(&sched, &model, &slots);
}

#[test]
fn test_toggle_instancing_at_runtime() {
    let (mut sched, slots) = scheduler(SchedulerConfig::default());
    let root = sched.create_node(None).unwrap();
    let nodes: Vec<NodeId> = (0..4).map(|_| sched.create_node(Some(root)).unwrap()).collect();
    for (i, node) in nodes.iter().enumerate() {
        sched.add(*node, [StateOp::Define(slots.tint, tint(i as f32))]).unwrap();
    }
    assert_eq!(sched.order().len(), 1);

    assert!(sched.set_instancing(false).is_empty());
    assert_eq!(sched.order().len(), 4);
    assert!(!sched.config().instancing);
    let mut model = Model::default();
    sched.emit(&mut model);
    check_frame(&sched, &model, &slots);
    check_refcounts(&sched);

    assert!(sched.set_instancing(true).is_empty());
    assert_eq!(sched.order().len(), 1);
    sched.emit(&mut model);
    check_frame(&sched, &model, &slots);
    check_refcounts(&sched);
}

// ---------------------------------------------------------------------------
// Emission
// ---------------------------------------------------------------------------

fn mixed_scene() -> (TestScheduler, Slots, Vec<NodeId>) {
    let (mut sched, slots) = scheduler(SchedulerConfig::default());
    let world = sched.create_node(None).unwrap();
    let overlay = sched.create_node(None).unwrap();
    sched
        .update(world, [StateOp::Define(slots.target, res(10)), StateOp::Define(slots.blend, StateValue::Int(1))])
        .unwrap();
    sched
        .update(
            overlay,
            [
                StateOp::Define(slots.target, res(11)),
                StateOp::Define(slots.priority, StateValue::Int(10)),
                StateOp::Define(slots.shading, StateValue::Int(2)),
            ],
        )
        .unwrap();

    let mut drawn = Vec::new();
    for i in 0..6u32 {
        let node = sched.create_node(Some(world)).unwrap();
        sched
            .add(
                node,
                [
                    StateOp::Define(slots.mesh, res(1 + i % 2)),
                    StateOp::Define(slots.range, StateValue::Range { start: 0, count: 36 }),
                    StateOp::Define(slots.tint, tint(i as f32)),
                ],
            )
            .unwrap();
        drawn.push(node);
    }
    for i in 0..3u32 {
        let node = sched.create_node(Some(overlay)).unwrap();
        sched
            .add(
                node,
                [
                    StateOp::Define(slots.mesh, res(5 + i)),
                    StateOp::Define(slots.color, StateValue::Float(i as f32)),
                    StateOp::Define(slots.blend, StateValue::Int(2 + i as i64 % 2)),
                ],
            )
            .unwrap();
        drawn.push(node);
    }
    (sched, slots, drawn)
}

#[test]
fn test_delta_emission_replays_to_effective_state() {
    let (mut sched, slots, drawn) = mixed_scene();
    let mut model = Model::default();

    let report = sched.emit(&mut model);
    assert_eq!(report.draws, 5);
    assert_eq!(report.instanced_draws, 2);
    check_frame(&sched, &model, &slots);

    // Setting ops are issued only where consecutive entries differ
    let entries: Vec<&Entry> = sched.order().iter().map(|(_, e)| e).collect();
    let mut expected_ops = entries[0].settings().len();
    for pair in entries.windows(2) {
        expected_ops += pair[1].settings().iter().filter(|s| !pair[0].holds(s)).count();
    }
    assert_eq!(report.setting_ops as usize, expected_ops);

    sched.update(drawn[7], [StateOp::Define(slots.color, StateValue::Float(7.0))]).unwrap();
    sched.update(drawn[0], [StateOp::Define(slots.priority, StateValue::Int(20))]).unwrap();
    sched.emit(&mut model);
    check_frame(&sched, &model, &slots);
    check_refcounts(&sched);
}

#[test]
fn test_noop_update_is_idempotent() {
    let (mut sched, slots, drawn) = mixed_scene();
    let mut model = Model::default();
    sched.emit(&mut model);
    sched.emit(&mut model);

    let entries: Vec<_> = sched.order().iter().map(|(id, _)| id).collect();
    let settings: Vec<_> = sched.cache().iter().map(|(id, _)| id).collect();
    let stats = sched.cache().stats();

    for node in &drawn {
        sched.update(*node, []).unwrap();
    }
    sched.update(drawn[0], [StateOp::Define(slots.tint, tint(0.0))]).unwrap();
    sched.emit(&mut model);

    assert_eq!(sched.order().iter().map(|(id, _)| id).collect::<Vec<_>>(), entries);
    assert_eq!(sched.cache().iter().map(|(id, _)| id).collect::<Vec<_>>(), settings);
    assert_eq!(sched.cache().stats(), stats);
    assert_eq!(model.frames[2], model.frames[1]);
}

#[test]
fn test_upload_only_when_buffer_changes() {
    let (mut sched, slots, drawn) = mixed_scene();
    let mut model = Model::default();
    assert_eq!(sched.emit(&mut model).uploads, 2);
    assert_eq!(sched.emit(&mut model).uploads, 0);

    sched.update(drawn[2], [StateOp::Define(slots.tint, tint(4.5))]).unwrap();
    assert_eq!(sched.emit(&mut model).uploads, 1);
    check_frame(&sched, &model, &slots);
}

// ---------------------------------------------------------------------------
// Program resolution
// ---------------------------------------------------------------------------

#[test]
fn test_program_resolved_only_when_inputs_change() {
    let (mut sched, slots) = scheduler(SchedulerConfig::default());
    let node = sched.create_node(None).unwrap();
    sched.add(node, [StateOp::Define(slots.shading, StateValue::Int(3))]).unwrap();
    assert_eq!(sched.resolver().calls, 1);

    sched.update(node, [StateOp::Define(slots.color, StateValue::Float(1.0))]).unwrap();
    sched.update(node, [StateOp::Define(slots.tint, tint(1.0))]).unwrap();
    assert_eq!(sched.resolver().calls, 1);

    sched.update(node, [StateOp::Define(slots.shading, StateValue::Int(4))]).unwrap();
    assert_eq!(sched.resolver().calls, 2);
    assert_eq!(sched.order().iter().next().map(|(_, e)| e.program()), Some(ProgramId(4)));
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[test]
fn test_resolve_failure_drops_only_that_entry() {
    let (mut sched, slots) = scheduler(SchedulerConfig::default());
    let good = sched.create_node(None).unwrap();
    let bad = sched.create_node(None).unwrap();
    sched.add(good, [StateOp::Define(slots.mesh, res(1))]).unwrap();

    let err = sched
        .add(bad, [StateOp::Define(slots.mesh, res(2)), StateOp::Define(slots.shading, StateValue::Int(-3))])
        .unwrap_err();
    match &err {
        ScheduleError::Resolve { node, snapshot, .. } => {
            assert_eq!(*node, bad);
            assert_eq!(snapshot.value(slots.shading), Some(&StateValue::Int(-3)));
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(err.node(), Some(bad));
    assert_eq!(sched.failures().count(), 1);

    let mut model = Model::default();
    assert_eq!(sched.emit(&mut model).draws, 1);
    check_frame(&sched, &model, &slots);

    sched.update(bad, [StateOp::Define(slots.shading, StateValue::Int(2))]).unwrap();
    assert_eq!(sched.failures().count(), 0);
    assert_eq!(sched.emit(&mut model).draws, 2);
    check_frame(&sched, &model, &slots);
}

#[test]
fn test_compile_failure_on_add() {
    let (mut sched, slots) = scheduler(SchedulerConfig::default());
    let node = sched.create_node(None).unwrap();
    let err = sched.add(node, [StateOp::Define(slots.blend, StateValue::Int(99))]);
    assert!(matches!(err, Err(ScheduleError::Compile { node: n, .. }) if n == node));
    assert!(sched.order().is_empty());
    assert!(sched.cache().is_empty());

    sched.update(node, [StateOp::Define(slots.blend, StateValue::Int(3))]).unwrap();
    assert_eq!(sched.order().len(), 1);
    check_refcounts(&sched);
}

#[test]
fn test_failed_recompile_skips_entries_until_fixed() {
    let (mut sched, slots) = scheduler(SchedulerConfig::no_instancing());
    let root = sched.create_node(None).unwrap();
    sched.update(root, [StateOp::Define(slots.blend, StateValue::Int(1))]).unwrap();
    let a = sched.create_node(Some(root)).unwrap();
    let b = sched.create_node(Some(root)).unwrap();
    sched.add(a, []).unwrap();
    sched.add(b, []).unwrap();

    let err = sched.update(root, [StateOp::Define(slots.blend, StateValue::Int(99))]);
    assert!(matches!(err, Err(ScheduleError::Compile { .. })));

    let mut model = Model::default();
    let report = sched.emit(&mut model);
    assert_eq!(report.draws, 0);
    assert_eq!(report.skipped.len(), 2);

    sched.update(root, [StateOp::Define(slots.blend, StateValue::Int(2))]).unwrap();
    let report = sched.emit(&mut model);
    assert_eq!(report.draws, 2);
    assert!(report.skipped.is_empty());
    check_frame(&sched, &model, &slots);
    check_refcounts(&sched);
}

#[test]
fn test_shared_setting_failure_names_every_holder() {
    let (mut sched, slots) = scheduler(SchedulerConfig::no_instancing());
    let root = sched.create_node(None).unwrap();
    sched.update(root, [StateOp::Define(slots.blend, StateValue::Int(1))]).unwrap();
    let a = sched.create_node(Some(root)).unwrap();
    let b = sched.create_node(Some(root)).unwrap();
    sched.add(a, [StateOp::Define(slots.mesh, res(1))]).unwrap();
    sched.add(b, [StateOp::Define(slots.mesh, res(2))]).unwrap();

    let mut handoff = StateHandoff::new();
    handoff.writer().stage(root, vec![StateOp::Define(slots.blend, StateValue::Int(99))]);
    let errors = sched.apply_handoff(&mut handoff);

    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| matches!(e, ScheduleError::Compile { .. })));
    let mut named: Vec<NodeId> = errors.iter().filter_map(|e| e.node()).collect();
    named.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(named, expected);
    assert!(errors.iter().all(|e| e.node() != Some(NodeId::null())));
}

#[test]
fn test_resource_exhaustion_reports_stats() {
    let (mut sched, slots) = scheduler(SchedulerConfig::default());
    let ok = sched.create_node(None).unwrap();
    sched.add(ok, [StateOp::Define(slots.blend, StateValue::Int(1))]).unwrap();

    let node = sched.create_node(None).unwrap();
    let err = sched.add(node, [StateOp::Define(slots.blend, StateValue::Int(666))]).unwrap_err();
    match err {
        ScheduleError::ResourceExhausted { node: n, stats } => {
            assert_eq!(n, node);
            assert_eq!(stats.entries, 1);
            assert_eq!(stats.cache.live_settings, sched.cache().len());
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn test_retry_failed_on_emit() {
    let config = SchedulerConfig {
        retry_failed_on_emit: true,
        ..Default::default()
    };
    let (mut sched, slots) = scheduler(config);
    sched.resolver_mut().offline = true;
    let node = sched.create_node(None).unwrap();
    assert!(sched.add(node, [StateOp::Define(slots.mesh, res(1))]).is_err());

    let mut model = Model::default();
    assert_eq!(sched.emit(&mut model).draws, 0);

    sched.resolver_mut().offline = false;
    assert_eq!(sched.emit(&mut model).draws, 1);
    assert!(sched.failure(node).is_none());
    check_frame(&sched, &model, &slots);
}

#[test]
fn test_retry_failed_explicitly() {
    let (mut sched, slots) = scheduler(SchedulerConfig::default());
    sched.resolver_mut().offline = true;
    let nodes: Vec<NodeId> = (0..3).map(|_| sched.create_node(None).unwrap()).collect();
    for node in &nodes {
        assert!(sched.add(*node, [StateOp::Define(slots.tint, tint(1.0))]).is_err());
    }
    assert_eq!(sched.stats().failed, 3);
    assert_eq!(sched.retry_failed().len(), 3);

    sched.resolver_mut().offline = false;
    assert!(sched.retry_failed().is_empty());
    assert_eq!(sched.stats().failed, 0);
    assert_eq!(sched.order().len(), 1);
}

// ---------------------------------------------------------------------------
// Scene graph surface
// ---------------------------------------------------------------------------

#[test]
fn test_destroy_node_unschedules_subtree() {
    let (mut sched, slots) = scheduler(SchedulerConfig::default());
    let root = sched.create_node(None).unwrap();
    let kept = sched.create_node(None).unwrap();
    sched.add(kept, [StateOp::Define(slots.mesh, res(9))]).unwrap();
    for i in 0..4 {
        let node = sched.create_node(Some(root)).unwrap();
        sched.add(node, [StateOp::Define(slots.tint, tint(i as f32))]).unwrap();
    }

    let destroyed = sched.destroy_node(root).unwrap();
    assert_eq!(destroyed.len(), 5);
    assert_eq!(sched.entry_order(), vec![kept]);
    assert_eq!(sched.stats().drawables, 1);
    check_refcounts(&sched);
    assert!(matches!(sched.update(root, []), Err(ScheduleError::UnknownNode(_))));
}

#[test]
fn test_handoff_from_update_thread() {
    let (mut sched, slots) = scheduler(SchedulerConfig::default());
    let root = sched.create_node(None).unwrap();
    let nodes: Vec<NodeId> = (0..4).map(|_| sched.create_node(Some(root)).unwrap()).collect();
    for node in &nodes {
        sched.add(*node, [StateOp::Define(slots.tint, tint(0.0))]).unwrap();
    }

    let mut handoff = StateHandoff::new();
    let writer = handoff.writer();
    let tint_slot = slots.tint;
    let staged = nodes.clone();
    std::thread::spawn(move || {
        writer.stage_batch(staged.iter().enumerate().map(|(i, node)| StagedUpdate {
            node: *node,
            ops: vec![StateOp::Define(tint_slot, tint(i as f32 + 1.0))],
        }));
    })
    .join()
    .unwrap();

    assert!(sched.apply_handoff(&mut handoff).is_empty());
    for (i, node) in nodes.iter().enumerate() {
        let mut row = [0.0f32; 4];
        tint(i as f32 + 1.0).write_floats(&mut row);
        assert_eq!(sched.batcher().row_of(*node), Some(&row[..]));
    }

    let mut model = Model::default();
    sched.emit(&mut model);
    check_frame(&sched, &model, &slots);
}

#[test]
fn test_save_and_restore_state() {
    let (mut sched, slots) = scheduler(SchedulerConfig::default());
    let root = sched.create_node(None).unwrap();
    for i in 0..3 {
        let node = sched.create_node(Some(root)).unwrap();
        sched.add(node, [StateOp::Define(slots.tint, tint(i as f32))]).unwrap();
    }
    let mut model = Model::default();
    sched.emit(&mut model);

    let mut state = sched.save_state();
    assert_eq!(state.frame, 1);
    state.config.instancing = false;
    let json = serde_json::to_string(&state).unwrap();

    let restored = serde_json::from_str(&json).unwrap();
    assert!(sched.restore_state(restored).unwrap().is_empty());
    assert_eq!(sched.order().len(), 3);
    assert_eq!(sched.frame(), 1);
    assert_eq!(sched.emit(&mut model).frame, 2);
    check_frame(&sched, &model, &slots);
}
