use groundwork_physics::{Physics, Result, WorldConfig};
use glam::{Quat, Vec3};
use tracing::info;

const DT: f32 = 1.0 / 60.0;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,groundwork_physics=debug".into()),
        )
        .init();

    let mut physics = Physics::new();
    let world = physics.create_world(WorldConfig::default());

    // Ground slab with its top face at y = 0
    let ground_shape = physics.create_box(Vec3::new(50.0, 0.5, 50.0))?;
    let ground = physics.create_body(ground_shape, 0.0, Some(1))?;
    physics.set_body_state(ground, Vec3::new(0.0, -0.5, 0.0), Quat::IDENTITY)?;
    physics.add_body(world, ground)?;

    // A 0.25 high ledge to step onto, and a wall to stop at
    let ledge_shape = physics.create_box(Vec3::new(1.0, 0.125, 5.0))?;
    physics.set_shape_tag(ledge_shape, Some(2))?;
    let ledge = physics.create_body(ledge_shape, 0.0, Some(2))?;
    physics.set_body_state(ledge, Vec3::new(4.0, 0.125, 0.0), Quat::IDENTITY)?;
    physics.add_body(world, ledge)?;

    let wall_shape = physics.create_box(Vec3::new(0.5, 3.0, 5.0))?;
    let wall = physics.create_body(wall_shape, 0.0, Some(3))?;
    physics.set_body_state(wall, Vec3::new(9.0, 3.0, 0.0), Quat::IDENTITY)?;
    physics.add_body(world, wall)?;

    let character = physics.create_capsule_character(1.2, 0.3, 0.35)?;
    physics.set_character_state(character, Vec3::new(0.0, 5.0, 0.0), Quat::IDENTITY)?;
    physics.add_character(world, character)?;

    let report = |physics: &Physics, label: &str, frame: usize| -> Result<()> {
        let state = physics.character_state(character)?;
        info!(
            "{label} t={:.2}s pos=({:.2}, {:.2}, {:.2}) grounded={} vy={:.2}",
            frame as f32 * DT,
            state.position.x,
            state.position.y,
            state.position.z,
            state.grounded,
            physics.character_vertical_velocity(character)?,
        );
        Ok(())
    };

    let mut frame = 0;

    info!("Phase 1: falling to the ground");
    for _ in 0..120 {
        physics.step(world, DT)?;
        if frame % 30 == 0 {
            report(&physics, "fall", frame)?;
        }
        frame += 1;
    }

    info!("Phase 2: walking over the ledge towards the wall");
    physics.set_walk_direction(character, Vec3::new(3.0, 0.0, 0.0))?;
    for _ in 0..180 {
        physics.step(world, DT)?;
        if frame % 20 == 0 {
            report(&physics, "walk", frame)?;
        }
        frame += 1;
    }

    info!("Phase 3: jumping in place");
    physics.set_walk_direction(character, Vec3::ZERO)?;
    physics.jump(character)?;
    for _ in 0..90 {
        physics.step(world, DT)?;
        if frame % 15 == 0 {
            report(&physics, "jump", frame)?;
        }
        frame += 1;
    }

    if let Some(hit) = physics.ray_cast(world, Vec3::new(4.0, 5.0, 0.0), Vec3::new(4.0, -5.0, 0.0))? {
        info!(
            "Ray down at x=4 hit shape tag {:?} at y={:.2}",
            hit.shape_tag, hit.point.y
        );
    }

    physics.enable_debug(world, |from: Vec3, to: Vec3, _: Vec3| {
        tracing::trace!("debug line {from} -> {to}")
    })?;
    physics.debug_draw(world)?;

    physics.remove_character(world, character)?;
    physics.delete_character(character)?;
    for body in [ground, ledge, wall] {
        physics.remove_body(world, body)?;
        physics.delete_body(body)?;
    }
    physics.destroy_world(world)?;
    info!("Example complete");
    Ok(())
}
