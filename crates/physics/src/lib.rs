mod body;
mod character_controller;
mod debug;
mod error;
mod filter;
mod handles;
mod mesh;
mod physics;
mod query;
mod shape;
mod transform;
mod world;

pub use body::RigidBodyState;
pub use character_controller::{CharacterController, CharacterControllerConfig, CharacterState};
pub use debug::{DebugMode, DebugSink};
pub use error::{HandleKind, PhysicsError, Result};
pub use filter::CollisionFilter;
pub use handles::{BodyHandle, CharacterHandle, ColliderOwner, ShapeHandle, WorldHandle};
pub use mesh::{IndexWidth, TriangleMesh};
pub use physics::Physics;
pub use query::RayHit;
pub use shape::{CompoundChild, ShapeKind, ShapeRegistry};
pub use transform::{from_isometry, to_isometry};
pub use world::{PhysicsWorld, WorldConfig};

// Re-export for convenience
pub use glam;
pub use rapier3d;
