//! Debug line drawing
//!
//! A [`DebugSink`] receives line segments from rapier's debug-render
//! pipeline. The sink only ever sees segment endpoints and colors.

use crate::transform::from_point;
use glam::Vec3;
use rapier3d::pipeline::{
    DebugColor, DebugRenderBackend, DebugRenderMode, DebugRenderObject, DebugRenderPipeline,
    DebugRenderStyle,
};
use rapier3d::prelude::*;

/// Receiver of debug line segments (color is RGB in [0, 1])
pub trait DebugSink {
    fn draw_line(&mut self, from: Vec3, to: Vec3, color: Vec3);
}

impl<F: FnMut(Vec3, Vec3, Vec3)> DebugSink for F {
    fn draw_line(&mut self, from: Vec3, to: Vec3, color: Vec3) {
        self(from, to, color)
    }
}

/// What the debug pass draws
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DebugMode {
    /// Collider outlines
    pub wireframe: bool,
    /// Collider bounding boxes
    pub aabbs: bool,
    /// Contact points and normals
    pub contacts: bool,
}

impl DebugMode {
    pub const NONE: Self = Self {
        wireframe: false,
        aabbs: false,
        contacts: false,
    };

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    fn render_mode(self) -> DebugRenderMode {
        let mut mode = DebugRenderMode::empty();
        if self.wireframe {
            mode |= DebugRenderMode::COLLIDER_SHAPES;
        }
        if self.aabbs {
            mode |= DebugRenderMode::COLLIDER_AABBS;
        }
        if self.contacts {
            mode |= DebugRenderMode::CONTACTS;
        }
        mode
    }
}

impl Default for DebugMode {
    fn default() -> Self {
        Self {
            wireframe: true,
            aabbs: true,
            contacts: false,
        }
    }
}

/// Installed sink plus the pipeline feeding it
pub(crate) struct DebugDrawer {
    pipeline: DebugRenderPipeline,
    sink: Box<dyn DebugSink>,
    mode: DebugMode,
}

impl DebugDrawer {
    pub fn new(sink: Box<dyn DebugSink>, mode: DebugMode) -> Self {
        Self {
            pipeline: DebugRenderPipeline::new(DebugRenderStyle::default(), mode.render_mode()),
            sink,
            mode,
        }
    }

    pub fn mode(&self) -> DebugMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: DebugMode) {
        self.mode = mode;
        self.pipeline.mode = mode.render_mode();
    }

    /// Emit one frame of debug lines
    pub fn draw(
        &mut self,
        bodies: &RigidBodySet,
        colliders: &ColliderSet,
        impulse_joints: &ImpulseJointSet,
        multibody_joints: &MultibodyJointSet,
        narrow_phase: &NarrowPhase,
    ) {
        if self.mode.is_none() {
            return;
        }
        let mut backend = SinkBackend {
            sink: self.sink.as_mut(),
        };
        self.pipeline.render(
            &mut backend,
            bodies,
            colliders,
            impulse_joints,
            multibody_joints,
            narrow_phase,
        );
    }
}

struct SinkBackend<'a> {
    sink: &'a mut dyn DebugSink,
}

impl DebugRenderBackend for SinkBackend<'_> {
    fn draw_line(
        &mut self,
        _object: DebugRenderObject,
        a: Point<Real>,
        b: Point<Real>,
        color: DebugColor,
    ) {
        self.sink
            .draw_line(from_point(&a), from_point(&b), hsla_to_rgb(color));
    }
}

/// Convert rapier's HSLA debug colors (hue in degrees) to RGB
fn hsla_to_rgb([h, s, l, _a]: DebugColor) -> Vec3 {
    let c = (1.0 - (2.0 * l - 1.0).abs()) * s;
    let h = (h.rem_euclid(360.0)) / 60.0;
    let x = c * (1.0 - (h % 2.0 - 1.0).abs());
    let (r, g, b) = match h as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = l - c / 2.0;
    Vec3::new(r + m, g + m, b + m)
}
