use anyhow::Result;
use glam::Vec3;
use tracing::{info, warn};
use voidswarm_core::{BoidParams, SwarmConfig, World};

fn main() -> Result<()> {
    init_tracing();
    let mut world = bootstrap_world()?;
    info!("Starting voidswarm simulation shell");
    run_session(&mut world);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn bootstrap_world() -> Result<World> {
    let config = SwarmConfig {
        world_radius: 25.0,
        history_capacity: 600,
        rng_seed: Some(0xF10C_4B01_D5EE_D001_u64),
        ..SwarmConfig::default()
    };

    let mut world = World::new(config)?;
    world.generate_obstacles(40, 3.0);
    world.generate_asteroids(12, 2.0);

    let scouts = BoidParams {
        max_speed: 0.16,
        flock_attraction: 0.3,
        color: [1.0, 0.6, 0.1],
        ..BoidParams::default()
    };
    let drones = BoidParams::default();
    world.spawn_swarm(400, drones)?;
    world.spawn_swarm(40, scouts)?;

    info!(
        boids = world.boid_count(),
        obstacles = world.obstacles().len(),
        "Seeded world",
    );
    Ok(world)
}

/// Scripted headless session: the player orbits the goal, herding the swarm
/// and firing the occasional shot into it.
fn run_session(world: &mut World) {
    let goal = Vec3::new(6.0, 0.0, -6.0);
    let mut kills = 0usize;
    let mut benefits = 0usize;

    for step in 0..600u32 {
        let angle = step as f32 * 0.02;
        let player = goal + Vec3::new(angle.cos() * 12.0, 2.0, angle.sin() * 12.0);

        let events = world.step(player, goal);
        kills += events.deaths;
        benefits += events.benefits_collected.len();
        if events.player_struck_obstacle {
            warn!(tick = events.tick.0, "Player clipped an obstacle");
        }

        if step % 40 == 0 {
            let shot = world.resolve_shot(player, goal - player);
            if let Some(id) = shot.killed {
                info!(tick = world.tick().0, ?id, "Shot connected");
            }
        }

        if step % 100 == 0 {
            if let Some(summary) = world.history().last() {
                info!(
                    tick = summary.tick.0,
                    boids = summary.boid_count,
                    deaths = summary.deaths,
                    collectibles = summary.collectibles_active,
                    avg_speed = summary.average_speed,
                    "Tick summary",
                );
            }
        }
    }

    info!(
        ticks = world.tick().0,
        survivors = world.boid_count(),
        kills,
        benefits,
        "Session complete",
    );
}
