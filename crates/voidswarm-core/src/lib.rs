//! Core simulation types for the Voidswarm flocking sandbox.
//!
//! The world holds a swarm of steering agents ("boids") indexed by a uniform
//! spatial grid, a field of box/asteroid obstacles, player projectiles, and
//! collectible drops. Each [`World::step`] runs the staged tick pipeline:
//! periodic rebucketing, per-cell flock centroids, force-accumulation
//! steering, player contact, mark-and-sweep death cleanup, and collectible
//! aging. Rendering is a separate concern; everything here exposes positions
//! and alive-state one-way.

use glam::Vec3;
use ordered_float::OrderedFloat;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;
use voidswarm_index::{IndexError, NEIGHBOR_OFFSETS, SpatialGrid};

pub use voidswarm_index::CellCoord;

new_key_type! {
    /// Stable handle for boids backed by a generational slot map.
    ///
    /// The grid stores handles, never boid data; a handle read from a stale
    /// bucket simply resolves to `None` after its boid has been removed.
    pub struct BoidId;
}

/// Monotonic simulation tick counter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Tick(pub u64);

impl Tick {
    /// Tick zero, before any step has run.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// The following tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Denominator fudge used when averaging cell positions into a centroid.
const CENTROID_EPSILON: f32 = 1e-4;

/// Per-archetype steering tunables carried by every boid.
///
/// Distinct archetypes (scouts, drones) are just different parameter bundles
/// handed to the spawner; the steering code never branches on kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoidParams {
    /// Increment of the ray-march parameter per containment test.
    pub ray_step: f32,
    /// Upper bound of the ray-march parameter per probe.
    pub ray_max_length: f32,
    /// Fraction of an applied force blended into the current direction.
    pub force_application: f32,
    /// Speed gained per unit of applied force magnitude.
    pub speed_increase: f32,
    /// Obstacle repulsion numerator.
    pub obstacle_repel_force: f32,
    /// Obstacle repulsion distance decay.
    pub obstacle_repel_decay: f32,
    /// Same-cell peer repulsion numerator.
    pub peer_repel_force: f32,
    /// Peer repulsion distance decay.
    pub peer_repel_decay: f32,
    /// Strength of the pull toward the goal position.
    pub goal_attraction: f32,
    /// Strength of the pull toward the local flock centroid.
    pub flock_attraction: f32,
    /// Hard speed ceiling.
    pub max_speed: f32,
    /// Goals farther than this are ignored entirely.
    pub max_detection_range: f32,
    /// Half-angle (radians) of the sensing cone around forward.
    pub view_angle: f32,
    /// Visual scale, untouched by the simulation.
    pub size: f32,
    /// Visual color, untouched by the simulation.
    pub color: [f32; 3],
}

impl Default for BoidParams {
    fn default() -> Self {
        Self {
            ray_step: 0.01,
            ray_max_length: 0.25,
            force_application: 0.75,
            speed_increase: 0.0003,
            obstacle_repel_force: 7.0,
            obstacle_repel_decay: 8.0,
            peer_repel_force: 1.0,
            peer_repel_decay: 2.0,
            goal_attraction: 1.0,
            flock_attraction: 0.5,
            max_speed: 0.12,
            max_detection_range: 20.0,
            view_angle: std::f32::consts::PI,
            size: 0.1,
            color: [0.0, 0.8, 1.0],
        }
    }
}

/// Immutable inputs to one boid's steering decision.
#[derive(Debug, Clone, Copy)]
pub struct SteerContext<'a> {
    /// Position the swarm is herded toward.
    pub goal: Vec3,
    /// Centroid of the boid's own cell, if the cell was populated.
    pub centroid: Option<Vec3>,
    /// Positions of other boids sharing the cell.
    pub peers: &'a [Vec3],
    /// Obstacles visible in the surrounding cells.
    pub obstacles: &'a [Obstacle],
    /// Raycast hits closer than this embed the boid and kill it.
    pub lethal_range: f32,
    /// Per-tick multiplicative speed drag.
    pub speed_decay: f32,
}

/// A single flocking agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Boid {
    position: Vec3,
    direction: Vec3,
    speed: f32,
    alive: bool,
    params: BoidParams,
}

impl Boid {
    /// Create a stationary boid. Direction starts at zero and only becomes
    /// non-zero once a force is applied.
    #[must_use]
    pub fn new(position: Vec3, params: BoidParams) -> Self {
        Self {
            position,
            direction: Vec3::ZERO,
            speed: 0.0,
            alive: true,
            params,
        }
    }

    #[must_use]
    pub const fn position(&self) -> Vec3 {
        self.position
    }

    /// Current travel direction: unit length, or zero before the first force.
    #[must_use]
    pub const fn direction(&self) -> Vec3 {
        self.direction
    }

    #[must_use]
    pub const fn speed(&self) -> f32 {
        self.speed
    }

    #[must_use]
    pub const fn is_alive(&self) -> bool {
        self.alive
    }

    #[must_use]
    pub const fn params(&self) -> &BoidParams {
        &self.params
    }

    /// Replace the travel direction, renormalizing; zero stays zero.
    pub fn set_direction(&mut self, direction: Vec3) {
        self.direction = direction.normalize_or_zero();
    }

    /// Force the speed, clamped to the archetype ceiling.
    pub fn set_speed(&mut self, speed: f32) {
        self.speed = speed.clamp(0.0, self.params.max_speed);
    }

    /// Kill this boid. Removal happens in the next cleanup sweep.
    pub fn explode(&mut self) {
        self.alive = false;
    }

    /// The subset of the 26 grid directions inside the sensing cone around
    /// forward. A zero forward vector senses all 26 directions.
    #[must_use]
    pub fn sensing_directions(&self) -> Vec<Vec3> {
        let forward = self.direction;
        let has_forward = forward.length_squared() > f32::EPSILON;
        let cos_limit = self.params.view_angle.cos();
        NEIGHBOR_OFFSETS
            .iter()
            .filter_map(|&(dx, dy, dz)| {
                let dir = Vec3::new(dx as f32, dy as f32, dz as f32).normalize();
                if !has_forward || forward.dot(dir) >= cos_limit {
                    Some(dir)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Blend a force into direction and speed.
    ///
    /// Normalizes the force direction (a zero vector applies nothing), adds
    /// the scaled force into the heading, renormalizes, and converts the
    /// force magnitude into speed clamped to `[0, max_speed]`.
    pub fn apply_force(&mut self, force_direction: Vec3, strength: f32) {
        let Some(normalized) = force_direction.try_normalize() else {
            return;
        };
        let force = normalized * strength;
        self.direction += force * self.params.force_application;
        self.direction = self.direction.normalize_or_zero();
        self.speed = (self.speed + force.length() * self.params.speed_increase)
            .clamp(0.0, self.params.max_speed);
    }

    /// March probe rays against the candidate obstacles and convert the first
    /// hit per ray into a repulsion force; hits inside `lethal_range` mark
    /// the boid dead (it embedded itself).
    ///
    /// Each probe direction is `direction - sensing_dir`. The subtraction is
    /// deliberate; it biases probes opposite the sensing offset and the
    /// emergent behavior depends on it.
    fn avoid_obstacles(&mut self, obstacles: &[Obstacle], lethal_range: f32) {
        if obstacles.is_empty() {
            return;
        }
        for sensing_dir in self.sensing_directions() {
            let probe = self.direction - sensing_dir;
            if probe.length_squared() < f32::EPSILON {
                continue;
            }
            let mut t = self.params.ray_step;
            'march: while t <= self.params.ray_max_length {
                let point = self.position + probe * t;
                for obstacle in obstacles {
                    if obstacle.contains(point) {
                        let offset = point - self.position;
                        let dist = offset.length().max(f32::EPSILON);
                        let strength = self.params.obstacle_repel_force
                            / (dist * self.params.obstacle_repel_decay);
                        self.apply_force(-offset, strength);
                        if dist < lethal_range {
                            self.alive = false;
                        }
                        break 'march;
                    }
                }
                t += self.params.ray_step;
            }
        }
    }

    /// One steering decision: accumulate cohesion, goal attraction, peer
    /// repulsion, and obstacle avoidance (in that order — forces normalize
    /// sequentially, so the order is behaviorally significant), then
    /// integrate. Returns `false` when the boid is dead and should be swept.
    pub fn act(&mut self, ctx: &SteerContext<'_>) -> bool {
        if !self.alive {
            return false;
        }

        if let Some(centroid) = ctx.centroid {
            let toward = centroid - self.position;
            if toward.length_squared() > f32::EPSILON {
                self.apply_force(toward, self.params.flock_attraction);
            }
        }

        if self.position.distance(ctx.goal) <= self.params.max_detection_range {
            self.apply_force(ctx.goal - self.position, self.params.goal_attraction);
        }

        for &peer in ctx.peers {
            let away = self.position - peer;
            let dist = away.length();
            if dist <= f32::EPSILON {
                // Coincident peers have no meaningful repulsion axis.
                continue;
            }
            let strength = self.params.peer_repel_force / (dist * self.params.peer_repel_decay);
            self.apply_force(away, strength);
        }

        self.avoid_obstacles(ctx.obstacles, ctx.lethal_range);

        if self.alive {
            self.position += self.direction * self.speed;
            self.speed *= ctx.speed_decay;
        }
        self.alive
    }
}

/// A bounded volume the swarm and the player must avoid.
///
/// Dispatch is a pattern match over the two variants rather than trait
/// objects; obstacles are plain copyable values shared by index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Obstacle {
    /// Axis-aligned box.
    Cuboid { center: Vec3, half_extents: Vec3 },
    /// Sphere-bounded asteroid.
    Asteroid { center: Vec3, radius: f32 },
}

impl Obstacle {
    /// Axis-aligned box from full width/height/depth.
    #[must_use]
    pub fn cuboid(center: Vec3, width: f32, height: f32, depth: f32) -> Self {
        Self::Cuboid {
            center,
            half_extents: Vec3::new(width, height, depth) * 0.5,
        }
    }

    /// Sphere-bounded asteroid.
    #[must_use]
    pub const fn asteroid(center: Vec3, radius: f32) -> Self {
        Self::Asteroid { center, radius }
    }

    #[must_use]
    pub const fn center(&self) -> Vec3 {
        match *self {
            Self::Cuboid { center, .. } | Self::Asteroid { center, .. } => center,
        }
    }

    /// Minimum extent corner.
    #[must_use]
    pub fn min(&self) -> Vec3 {
        match *self {
            Self::Cuboid {
                center,
                half_extents,
            } => center - half_extents,
            Self::Asteroid { center, radius } => center - Vec3::splat(radius),
        }
    }

    /// Maximum extent corner.
    #[must_use]
    pub fn max(&self) -> Vec3 {
        match *self {
            Self::Cuboid {
                center,
                half_extents,
            } => center + half_extents,
            Self::Asteroid { center, radius } => center + Vec3::splat(radius),
        }
    }

    /// Full size along each axis.
    #[must_use]
    pub fn size(&self) -> Vec3 {
        self.max() - self.min()
    }

    /// Containment predicate used by the avoidance raycaster.
    #[must_use]
    pub fn contains(&self, point: Vec3) -> bool {
        match *self {
            Self::Cuboid {
                center,
                half_extents,
            } => {
                let d = (point - center).abs();
                d.x <= half_extents.x && d.y <= half_extents.y && d.z <= half_extents.z
            }
            Self::Asteroid { center, radius } => point.distance_squared(center) <= radius * radius,
        }
    }

    /// Containment against bounds expanded by `clearance` on every side;
    /// used when validating spawn points.
    #[must_use]
    pub fn contains_expanded(&self, point: Vec3, clearance: f32) -> bool {
        match *self {
            Self::Cuboid {
                center,
                half_extents,
            } => {
                let expanded = half_extents + Vec3::splat(clearance);
                let d = (point - center).abs();
                d.x <= expanded.x && d.y <= expanded.y && d.z <= expanded.z
            }
            Self::Asteroid { center, radius } => {
                let expanded = radius + clearance;
                point.distance_squared(center) <= expanded * expanded
            }
        }
    }
}

/// Obstacles bucketed by the cell of their center point.
///
/// Center-cell registration means a volume straddling a boundary is only
/// listed once; queries go through the 27-cell neighborhood to compensate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObstacleField {
    grid: SpatialGrid<usize>,
    items: Vec<Obstacle>,
}

impl ObstacleField {
    /// Empty field with the provided cell size.
    pub fn new(cell_size: f32) -> Result<Self, IndexError> {
        Ok(Self {
            grid: SpatialGrid::new(cell_size)?,
            items: Vec::new(),
        })
    }

    /// Register an obstacle, returning its stable slot index.
    pub fn insert(&mut self, obstacle: Obstacle) -> usize {
        let index = self.items.len();
        self.items.push(obstacle);
        self.grid.insert_at(obstacle.center(), index);
        index
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Obstacle> {
        self.items.get(index)
    }

    /// Iterate every registered obstacle.
    pub fn iter(&self) -> impl Iterator<Item = &Obstacle> + '_ {
        self.items.iter()
    }

    /// Mutable access to the obstacle slots (for drifting asteroids);
    /// call [`ObstacleField::rebucket`] after moving centers.
    pub fn items_mut(&mut self) -> &mut [Obstacle] {
        &mut self.items
    }

    /// Obstacles registered in the cell of `pos` or any adjacent cell.
    pub fn near(&self, pos: Vec3) -> impl Iterator<Item = &Obstacle> + '_ {
        let cell = self.grid.cell_of(pos);
        self.grid
            .neighborhood(cell)
            .filter_map(move |&index| self.items.get(index))
    }

    /// Re-register every obstacle under its current center cell.
    pub fn rebucket(&mut self) {
        let items: Vec<(Vec3, usize)> = self
            .items
            .iter()
            .enumerate()
            .map(|(index, obstacle)| (obstacle.center(), index))
            .collect();
        self.grid.rebuild(items);
    }
}

/// Upgrade carried by a collectible drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Benefit {
    Speed,
    Range,
    Accuracy,
    Health,
}

impl Benefit {
    /// Uniform random benefit.
    pub fn sample(rng: &mut impl Rng) -> Self {
        match rng.random_range(0..4u8) {
            0 => Self::Speed,
            1 => Self::Range,
            2 => Self::Accuracy,
            _ => Self::Health,
        }
    }
}

/// A pickup left behind by a dead boid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Collectible {
    pub position: Vec3,
    pub radius: f32,
    pub benefit: Benefit,
    pub gone: bool,
    ticks_lived: u32,
    max_life: u32,
}

impl Collectible {
    #[must_use]
    pub fn new(position: Vec3, radius: f32, benefit: Benefit, max_life: u32) -> Self {
        Self {
            position,
            radius,
            benefit,
            gone: false,
            ticks_lived: 0,
            max_life,
        }
    }

    /// Age by one tick, expiring at `max_life`. Returns `true` while live.
    pub fn age(&mut self) -> bool {
        self.ticks_lived += 1;
        if self.ticks_lived >= self.max_life {
            self.gone = true;
        }
        !self.gone
    }

    /// Ticks remaining before expiry.
    #[must_use]
    pub const fn remaining_life(&self) -> u32 {
        self.max_life.saturating_sub(self.ticks_lived)
    }
}

/// A fully resolved shot.
///
/// The whole trajectory is simulated at creation time ([`World::resolve_shot`]);
/// what remains afterwards is purely visual: the trail fades over frames via
/// [`Projectile::fade`] until the projectile is discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct Projectile {
    /// Positions visited, in travel order, for trail rendering.
    pub trail: Vec<Vec3>,
    /// The single boid killed, if the shot connected.
    pub killed: Option<BoidId>,
    /// Set when resolution terminated on a hit, or once fully faded.
    pub gone: bool,
    fade: f32,
}

impl Projectile {
    /// Current trail fade in `[0, 1]`.
    #[must_use]
    pub const fn fade_value(&self) -> f32 {
        self.fade
    }

    /// Advance the visual fade one frame. Returns `true` while the trail
    /// should still be drawn.
    pub fn fade(&mut self) -> bool {
        self.fade += 0.01;
        if self.fade >= 1.0 {
            self.gone = true;
        }
        self.fade < 1.0
    }
}

/// Static world configuration. All simulation tunables live here; there is
/// no process-wide mutable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Edge length of one spatial cell in world units.
    pub cell_size: f32,
    /// Half-extent of the cube boids and obstacles are generated within.
    pub world_radius: f32,
    /// Ticks between full grid rebuilds; neighbor queries are only exact
    /// immediately after a rebucket.
    pub rebucket_interval: u32,
    /// Minimum distance between a spawn point and any obstacle surface.
    pub spawn_clearance: f32,
    /// Rejection-sampling cap before a spawn reports failure.
    pub spawn_max_attempts: u32,
    /// Raycast hits closer than this kill the boid outright.
    pub lethal_range: f32,
    /// Multiplicative speed drag applied after each integration.
    pub speed_decay: f32,
    /// Maximum projectile travel, in steps.
    pub bullet_range: u32,
    /// Distance inside which a projectile step registers a kill.
    pub bullet_hit_radius: f32,
    /// Homing deflection coefficient per projectile step.
    pub bullet_accuracy: f32,
    /// Maximum hitscan distance along the aim ray.
    pub hitscan_range: f32,
    /// Probability that a dead boid drops a collectible.
    pub collectible_chance: f32,
    /// Collectible lifetime in ticks.
    pub collectible_life: u32,
    /// Visual radius assigned to dropped collectibles.
    pub collectible_radius: f32,
    /// Player distance inside which a collectible is picked up.
    pub collectible_pickup_radius: f32,
    /// Player distance inside which a boid explodes on contact.
    pub player_contact_radius: f32,
    /// Maximum number of recent tick summaries retained in memory.
    pub history_capacity: usize,
    /// Optional RNG seed for reproducible sessions.
    pub rng_seed: Option<u64>,
    /// Default archetype parameters used by spawners.
    pub boid: BoidParams,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            cell_size: 3.0,
            world_radius: 30.0,
            rebucket_interval: 3,
            spawn_clearance: 0.5,
            spawn_max_attempts: 64,
            lethal_range: 0.1,
            speed_decay: 0.92,
            bullet_range: 50,
            bullet_hit_radius: 0.1,
            bullet_accuracy: 1.01,
            hitscan_range: 100.0,
            collectible_chance: 0.2,
            collectible_life: 10_000,
            collectible_radius: 0.25,
            collectible_pickup_radius: 1.1,
            player_contact_radius: 0.5,
            history_capacity: 256,
            rng_seed: None,
            boid: BoidParams::default(),
        }
    }
}

impl SwarmConfig {
    /// Validate every tunable before a world is built around them.
    pub fn validate(&self) -> Result<(), WorldError> {
        if !(self.cell_size > 0.0) {
            return Err(WorldError::InvalidConfig("cell_size must be positive"));
        }
        if !(self.world_radius > 0.0) {
            return Err(WorldError::InvalidConfig("world_radius must be positive"));
        }
        if self.rebucket_interval == 0 {
            return Err(WorldError::InvalidConfig(
                "rebucket_interval must be at least 1",
            ));
        }
        if self.spawn_max_attempts == 0 {
            return Err(WorldError::InvalidConfig(
                "spawn_max_attempts must be at least 1",
            ));
        }
        if self.spawn_clearance < 0.0 {
            return Err(WorldError::InvalidConfig(
                "spawn_clearance must be non-negative",
            ));
        }
        if !(self.speed_decay > 0.0 && self.speed_decay <= 1.0) {
            return Err(WorldError::InvalidConfig("speed_decay must be in (0, 1]"));
        }
        if self.bullet_range == 0 {
            return Err(WorldError::InvalidConfig("bullet_range must be at least 1"));
        }
        if !(self.bullet_hit_radius > 0.0)
            || !(self.hitscan_range > 0.0)
            || !(self.collectible_pickup_radius > 0.0)
            || !(self.player_contact_radius > 0.0)
        {
            return Err(WorldError::InvalidConfig(
                "hit, hitscan, pickup, and contact radii must be positive",
            ));
        }
        if self.bullet_accuracy < 0.0 || self.lethal_range < 0.0 {
            return Err(WorldError::InvalidConfig(
                "bullet_accuracy and lethal_range must be non-negative",
            ));
        }
        if !(0.0..=1.0).contains(&self.collectible_chance) {
            return Err(WorldError::InvalidConfig(
                "collectible_chance must be in [0, 1]",
            ));
        }
        if self.history_capacity == 0 {
            return Err(WorldError::InvalidConfig(
                "history_capacity must be at least 1",
            ));
        }
        let boid = &self.boid;
        if !(boid.ray_step > 0.0) || boid.ray_max_length < boid.ray_step {
            return Err(WorldError::InvalidConfig(
                "ray_step must be positive and ray_max_length at least ray_step",
            ));
        }
        if !(boid.obstacle_repel_decay > 0.0) || !(boid.peer_repel_decay > 0.0) {
            return Err(WorldError::InvalidConfig(
                "repulsion decay constants must be positive",
            ));
        }
        if boid.max_speed < 0.0 || boid.max_detection_range < 0.0 {
            return Err(WorldError::InvalidConfig(
                "max_speed and max_detection_range must be non-negative",
            ));
        }
        if !(boid.view_angle > 0.0 && boid.view_angle <= std::f32::consts::PI) {
            return Err(WorldError::InvalidConfig("view_angle must be in (0, pi]"));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy when no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::seed_from_u64(rand::random()),
        }
    }
}

/// Errors that can occur constructing or populating a world.
#[derive(Debug, Error)]
pub enum WorldError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Rejection sampling could not find a clear spawn point.
    #[error("spawn failed after {attempts} attempts")]
    SpawnFailed { attempts: u32 },
    /// Propagated spatial index error.
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Events emitted after processing a world tick.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TickEvents {
    pub tick: Tick,
    /// Whether this tick rebuilt the spatial grid.
    pub rebucketed: bool,
    /// Boids removed by the cleanup sweep.
    pub deaths: usize,
    /// Collectibles dropped by those deaths.
    pub collectibles_dropped: usize,
    /// Benefits the player picked up this tick.
    pub benefits_collected: Vec<Benefit>,
    /// Boids that exploded on player contact.
    pub player_contacts: usize,
    /// The player position is inside an obstacle (game-over signal for the
    /// caller; the simulation itself keeps running).
    pub player_struck_obstacle: bool,
}

/// Per-tick summary retained in the bounded history buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct TickSummary {
    pub tick: Tick,
    pub boid_count: usize,
    pub deaths: usize,
    pub collectibles_active: usize,
    pub average_speed: f32,
}

/// Aggregate simulation state: swarm, grid, obstacles, collectibles.
#[derive(Debug)]
pub struct World {
    config: SwarmConfig,
    tick: Tick,
    rng: SmallRng,
    boids: SlotMap<BoidId, Boid>,
    grid: SpatialGrid<BoidId>,
    obstacles: ObstacleField,
    centroids: HashMap<CellCoord, Vec3>,
    pending_deaths: Vec<BoidId>,
    collectibles: Vec<Collectible>,
    history: VecDeque<TickSummary>,
    last_deaths: usize,
}

impl World {
    /// Instantiate a world from a validated configuration.
    pub fn new(config: SwarmConfig) -> Result<Self, WorldError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let grid = SpatialGrid::new(config.cell_size)?;
        let obstacles = ObstacleField::new(config.cell_size)?;
        let history_capacity = config.history_capacity;
        Ok(Self {
            config,
            tick: Tick::zero(),
            rng,
            boids: SlotMap::with_key(),
            grid,
            obstacles,
            centroids: HashMap::new(),
            pending_deaths: Vec::new(),
            collectibles: Vec::new(),
            history: VecDeque::with_capacity(history_capacity),
            last_deaths: 0,
        })
    }

    /// Immutable access to the configuration.
    #[must_use]
    pub const fn config(&self) -> &SwarmConfig {
        &self.config
    }

    /// Mutable access to the configuration (for hot edits).
    pub fn config_mut(&mut self) -> &mut SwarmConfig {
        &mut self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Read-only access to the swarm.
    #[must_use]
    pub const fn boids(&self) -> &SlotMap<BoidId, Boid> {
        &self.boids
    }

    /// Borrow one boid.
    #[must_use]
    pub fn boid(&self, id: BoidId) -> Option<&Boid> {
        self.boids.get(id)
    }

    /// Mutably borrow one boid.
    pub fn boid_mut(&mut self, id: BoidId) -> Option<&mut Boid> {
        self.boids.get_mut(id)
    }

    /// Number of live boids.
    #[must_use]
    pub fn boid_count(&self) -> usize {
        self.boids.len()
    }

    /// Read-only access to the boid spatial grid.
    #[must_use]
    pub const fn grid(&self) -> &SpatialGrid<BoidId> {
        &self.grid
    }

    /// Read-only access to the obstacle field.
    #[must_use]
    pub const fn obstacles(&self) -> &ObstacleField {
        &self.obstacles
    }

    /// Mutable access to the obstacle field.
    pub fn obstacles_mut(&mut self) -> &mut ObstacleField {
        &mut self.obstacles
    }

    /// Re-register drifting obstacles under their current center cells.
    pub fn rebucket_obstacles(&mut self) {
        self.obstacles.rebucket();
    }

    /// Active collectibles.
    #[must_use]
    pub fn collectibles(&self) -> &[Collectible] {
        &self.collectibles
    }

    /// Centroid of a populated cell from the latest centroid pass.
    #[must_use]
    pub fn centroid_of(&self, cell: CellCoord) -> Option<Vec3> {
        self.centroids.get(&cell).copied()
    }

    /// Iterate over retained tick summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// Borrow the world RNG mutably for deterministic sampling.
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Boids removed by the most recent cleanup sweep.
    #[must_use]
    pub const fn last_deaths(&self) -> usize {
        self.last_deaths
    }

    /// Register a single obstacle.
    pub fn add_obstacle(&mut self, obstacle: Obstacle) -> usize {
        self.obstacles.insert(obstacle)
    }

    /// Scatter random axis-aligned boxes through the world volume.
    pub fn generate_obstacles(&mut self, count: usize, max_size: f32) {
        let extent = self.config.world_radius;
        let upper = max_size.max(0.5);
        for _ in 0..count {
            let width = self.rng.random_range(0.5..=upper);
            let height = self.rng.random_range(0.5..=upper);
            let depth = self.rng.random_range(0.5..=upper);
            let center = Vec3::new(
                self.rng.random_range(-extent..=extent),
                self.rng.random_range(-extent..=extent),
                self.rng.random_range(-extent..=extent),
            );
            self.obstacles
                .insert(Obstacle::cuboid(center, width, height, depth));
        }
    }

    /// Scatter random sphere-bounded asteroids through the world volume.
    pub fn generate_asteroids(&mut self, count: usize, max_radius: f32) {
        let extent = self.config.world_radius;
        let upper = max_radius.max(0.5);
        for _ in 0..count {
            let radius = self.rng.random_range(0.5..=upper);
            let center = Vec3::new(
                self.rng.random_range(-extent..=extent),
                self.rng.random_range(-extent..=extent),
                self.rng.random_range(-extent..=extent),
            );
            self.obstacles.insert(Obstacle::asteroid(center, radius));
        }
    }

    /// Rejection-sample a point clear of every registered obstacle.
    ///
    /// Bounded by `spawn_max_attempts`; a densely packed field surfaces as
    /// [`WorldError::SpawnFailed`] instead of looping forever.
    pub fn random_point_outside_obstacles(&mut self) -> Result<Vec3, WorldError> {
        let extent = self.config.world_radius;
        let clearance = self.config.spawn_clearance;
        let attempts = self.config.spawn_max_attempts;
        for _ in 0..attempts {
            let candidate = Vec3::new(
                self.rng.random_range(-extent..=extent),
                self.rng.random_range(-extent..=extent),
                self.rng.random_range(-extent..=extent),
            );
            let blocked = self
                .obstacles
                .iter()
                .any(|obstacle| obstacle.contains_expanded(candidate, clearance));
            if !blocked {
                return Ok(candidate);
            }
        }
        Err(WorldError::SpawnFailed { attempts })
    }

    /// Spawn `count` boids at random obstacle-free points.
    pub fn spawn_swarm(
        &mut self,
        count: usize,
        params: BoidParams,
    ) -> Result<Vec<BoidId>, WorldError> {
        let mut spawned = Vec::with_capacity(count);
        for _ in 0..count {
            let position = self.random_point_outside_obstacles()?;
            spawned.push(self.spawn_boid_at(position, params));
        }
        Ok(spawned)
    }

    /// Spawn a boid at an explicit position, registering it in the grid.
    pub fn spawn_boid_at(&mut self, position: Vec3, params: BoidParams) -> BoidId {
        let id = self.boids.insert(Boid::new(position, params));
        self.grid.insert_at(position, id);
        id
    }

    /// Rebuild the boid grid from current positions. O(N); invoked by the
    /// pipeline every `rebucket_interval` ticks, and available directly for
    /// callers that need an exact grid right now.
    pub fn rebucket(&mut self) {
        let items: Vec<(Vec3, BoidId)> = self
            .boids
            .iter()
            .map(|(id, boid)| (boid.position(), id))
            .collect();
        self.grid.rebuild(items);
    }

    /// Execute one simulation tick pipeline.
    pub fn step(&mut self, player_pos: Vec3, goal_pos: Vec3) -> TickEvents {
        let next_tick = self.tick.next();

        let rebucketed = self
            .tick
            .0
            .is_multiple_of(u64::from(self.config.rebucket_interval));
        if rebucketed {
            self.rebucket();
        }
        self.stage_centroids();
        self.stage_steering(goal_pos);
        let player_contacts = self.stage_player_contact(player_pos);
        let (deaths, collectibles_dropped) = self.stage_death_cleanup();
        let benefits_collected = self.stage_collectibles(player_pos);
        let player_struck_obstacle = self
            .obstacles
            .iter()
            .any(|obstacle| obstacle.contains(player_pos));
        self.push_summary(next_tick, deaths);

        self.tick = next_tick;
        TickEvents {
            tick: next_tick,
            rebucketed,
            deaths,
            collectibles_dropped,
            benefits_collected,
            player_contacts,
            player_struck_obstacle,
        }
    }

    /// Average each populated cell's boid positions into a centroid map.
    /// Runs before steering; centroids are stale-by-one-tick relative to
    /// motion, consistent with the periodic-rebucket design.
    fn stage_centroids(&mut self) {
        let boids = &self.boids;
        let grid = &self.grid;
        let centroids = &mut self.centroids;
        centroids.clear();
        for (cell, bucket) in grid.iter_cells() {
            let mut sum = Vec3::ZERO;
            let mut count = 0.0_f32;
            for id in bucket {
                if let Some(boid) = boids.get(*id) {
                    sum += boid.position();
                    count += 1.0;
                }
            }
            if count > 0.0 {
                centroids.insert(cell, sum / (count + CENTROID_EPSILON));
            }
        }
    }

    /// Steer every boid against an immutable snapshot of the world, then
    /// apply the results serially. The parallel pass only reads; deaths are
    /// queued for the sweep rather than removed mid-iteration.
    fn stage_steering(&mut self, goal: Vec3) {
        if self.boids.is_empty() {
            return;
        }
        let handles: Vec<BoidId> = self.boids.keys().collect();
        let boids = &self.boids;
        let grid = &self.grid;
        let obstacles = &self.obstacles;
        let centroids = &self.centroids;
        let lethal_range = self.config.lethal_range;
        let speed_decay = self.config.speed_decay;

        let results: Vec<(BoidId, Boid)> = handles
            .par_iter()
            .filter_map(|&id| {
                let boid = boids.get(id)?;
                let mut next = boid.clone();
                if !next.is_alive() {
                    return Some((id, next));
                }
                let cell = grid.cell_of(next.position());
                let centroid = centroids.get(&cell).copied();
                let peers: Vec<Vec3> = grid
                    .bucket(cell)
                    .iter()
                    .filter(|&&other| other != id)
                    .filter_map(|&other| boids.get(other).map(Boid::position))
                    .collect();
                let near: Vec<Obstacle> = obstacles.near(next.position()).copied().collect();
                let ctx = SteerContext {
                    goal,
                    centroid,
                    peers: &peers,
                    obstacles: &near,
                    lethal_range,
                    speed_decay,
                };
                next.act(&ctx);
                Some((id, next))
            })
            .collect();

        for (id, next) in results {
            let died = !next.is_alive();
            if let Some(slot) = self.boids.get_mut(id) {
                *slot = next;
            }
            if died {
                self.pending_deaths.push(id);
            }
        }
    }

    /// Explode boids the player has flown into.
    fn stage_player_contact(&mut self, player_pos: Vec3) -> usize {
        let radius = self.config.player_contact_radius;
        let struck: Vec<BoidId> = self
            .boids
            .iter()
            .filter(|(_, boid)| boid.is_alive() && boid.position().distance(player_pos) < radius)
            .map(|(id, _)| id)
            .collect();
        let contacts = struck.len();
        for id in struck {
            if let Some(boid) = self.boids.get_mut(id) {
                boid.explode();
            }
            self.pending_deaths.push(id);
        }
        contacts
    }

    /// Mark-and-sweep removal of dead boids, deduplicated; each removal may
    /// drop a collectible. Grid buckets keep stale handles until the next
    /// rebucket; generational ids make those reads harmless.
    fn stage_death_cleanup(&mut self) -> (usize, usize) {
        if self.pending_deaths.is_empty() {
            self.last_deaths = 0;
            return (0, 0);
        }
        let mut seen = HashSet::new();
        let mut removed = 0;
        let mut dropped = 0;
        let chance = self.config.collectible_chance;
        for id in std::mem::take(&mut self.pending_deaths) {
            if !seen.insert(id) {
                continue;
            }
            if let Some(boid) = self.boids.remove(id) {
                removed += 1;
                if chance > 0.0 && self.rng.random::<f32>() < chance {
                    let benefit = Benefit::sample(&mut self.rng);
                    self.collectibles.push(Collectible::new(
                        boid.position(),
                        self.config.collectible_radius,
                        benefit,
                        self.config.collectible_life,
                    ));
                    dropped += 1;
                }
            }
        }
        self.last_deaths = removed;
        (removed, dropped)
    }

    /// Age collectibles, expire the stale, and hand the player anything in
    /// pickup range.
    fn stage_collectibles(&mut self, player_pos: Vec3) -> Vec<Benefit> {
        let pickup = self.config.collectible_pickup_radius;
        let mut collected = Vec::new();
        for collectible in &mut self.collectibles {
            if collectible.gone {
                continue;
            }
            if player_pos.distance(collectible.position) < pickup {
                collectible.gone = true;
                collected.push(collectible.benefit);
                continue;
            }
            collectible.age();
        }
        self.collectibles.retain(|collectible| !collectible.gone);
        collected
    }

    fn push_summary(&mut self, tick: Tick, deaths: usize) {
        let boid_count = self.boids.len();
        let total_speed: f32 = self.boids.values().map(Boid::speed).sum();
        let average_speed = if boid_count > 0 {
            total_speed / boid_count as f32
        } else {
            0.0
        };
        let summary = TickSummary {
            tick,
            boid_count,
            deaths,
            collectibles_active: self.collectibles.len(),
            average_speed,
        };
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
    }

    /// Resolve a shot synchronously: the projectile walks the grid to
    /// completion here, homing toward the nearest candidate each step and
    /// killing at most one boid. The returned [`Projectile`] is inert apart
    /// from trail fading.
    pub fn resolve_shot(&mut self, origin: Vec3, direction: Vec3) -> Projectile {
        let mut trail = Vec::new();
        let Some(mut heading) = direction.try_normalize() else {
            return Projectile {
                trail,
                killed: None,
                gone: true,
                fade: 1.0,
            };
        };
        let hit_radius = self.config.bullet_hit_radius;
        let accuracy = self.config.bullet_accuracy;
        let mut position = origin;
        let mut killed: Option<BoidId> = None;

        for _ in 0..self.config.bullet_range {
            trail.push(position);
            let cell = self.grid.cell_of(position);
            // Exact cell first; near-miss positions fall back to the first
            // populated adjacent bucket.
            let candidates = self.grid.fallback_bucket(cell);
            let mut nearest: Option<(BoidId, OrderedFloat<f32>)> = None;
            for &id in candidates {
                let Some(boid) = self.boids.get(id) else {
                    continue;
                };
                if !boid.is_alive() {
                    continue;
                }
                let dist = OrderedFloat(boid.position().distance(position));
                if dist.into_inner() < hit_radius {
                    killed = Some(id);
                    break;
                }
                if nearest.map_or(true, |(_, best)| dist < best) {
                    nearest = Some((id, dist));
                }
            }
            if killed.is_some() {
                break;
            }
            if let Some((id, _)) = nearest {
                if let Some(target) = self.boids.get(id) {
                    if let Some(pull) = (target.position() - position).try_normalize() {
                        heading += pull * accuracy;
                    }
                }
            }
            position += heading;
        }

        if let Some(id) = killed {
            if let Some(boid) = self.boids.get_mut(id) {
                boid.explode();
            }
            self.pending_deaths.push(id);
        }
        Projectile {
            trail,
            killed,
            gone: killed.is_some(),
            fade: 0.0,
        }
    }

    /// Instant-ray sidearm: kills the nearest live boid whose perpendicular
    /// distance from the aim ray is within the hit radius.
    pub fn resolve_hitscan(&mut self, origin: Vec3, direction: Vec3) -> Option<BoidId> {
        let dir = direction.try_normalize()?;
        let range = self.config.hitscan_range;
        let threshold = self.config.bullet_hit_radius;
        let mut best: Option<(BoidId, OrderedFloat<f32>)> = None;
        for (id, boid) in &self.boids {
            if !boid.is_alive() {
                continue;
            }
            let to_boid = boid.position() - origin;
            let along = to_boid.dot(dir);
            if along <= 0.0 || along >= range {
                continue;
            }
            let closest = origin + dir * along;
            if closest.distance(boid.position()) <= threshold {
                let key = OrderedFloat(along);
                if best.map_or(true, |(_, d)| key < d) {
                    best = Some((id, key));
                }
            }
        }
        let (id, _) = best?;
        if let Some(boid) = self.boids.get_mut(id) {
            boid.explode();
        }
        self.pending_deaths.push(id);
        Some(id)
    }
}
