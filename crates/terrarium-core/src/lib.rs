//! Core engine for the Terrarium workspace: a tick-based grid world in
//! which autonomous robots move, speak, mark cells, claim and besiege
//! territory, and drain energy from one another in battles.
//!
//! One call to [`WorldState::step`] advances the world by a single tick:
//! working copies are loaded from the snapshot port, every live robot's
//! behavior is consulted (concurrently by default), the collected actions
//! are resolved sequentially in ascending robot-id order, fortification
//! and siege state advance, encounters and battles fire, dead robots are
//! culled, and the working copies are written back.

use rand::{Rng, RngCore, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use thiserror::Error;
use tracing::{info, warn};

/// Number of display identifiers available to a world.
pub const ICON_POOL_SIZE: usize = 52;

/// Stable handle for a robot. Ids are allocated monotonically per world
/// and never reused, unlike display icons which return to the pool.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RobotId(pub u64);

impl fmt::Display for RobotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic tick counter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// A grid coordinate. `Ord` is lexicographic `(x, y)` so territory maps
/// iterate in a stable order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Cell {
    pub x: i32,
    pub y: i32,
}

impl Cell {
    /// Construct a new cell coordinate.
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Chebyshev (8-adjacency) distance to another cell.
    #[must_use]
    pub fn chebyshev(self, other: Self) -> i32 {
        (self.x - other.x).abs().max((self.y - other.y).abs())
    }

    /// Manhattan distance to another cell.
    #[must_use]
    pub fn manhattan(self, other: Self) -> i32 {
        (self.x - other.x).abs() + (self.y - other.y).abs()
    }

    /// Euclidean distance to another cell.
    #[must_use]
    pub fn euclidean(self, other: Self) -> f64 {
        let dx = f64::from(self.x - other.x);
        let dy = f64::from(self.y - other.y);
        (dx * dx + dy * dy).sqrt()
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.x, self.y)
    }
}

/// Terminal palette color assigned to a robot and its territory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DisplayColor {
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    #[default]
    White,
}

impl DisplayColor {
    /// Lowercase name used for storage round-trips.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Red => "red",
            Self::Green => "green",
            Self::Yellow => "yellow",
            Self::Blue => "blue",
            Self::Magenta => "magenta",
            Self::Cyan => "cyan",
            Self::White => "white",
        }
    }
}

impl fmt::Display for DisplayColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error raised when parsing an unknown color name.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown color name: {0}")]
pub struct ColorParseError(String);

impl FromStr for DisplayColor {
    type Err = ColorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "red" => Ok(Self::Red),
            "green" => Ok(Self::Green),
            "yellow" => Ok(Self::Yellow),
            "blue" => Ok(Self::Blue),
            "magenta" => Ok(Self::Magenta),
            "cyan" => Ok(Self::Cyan),
            "white" => Ok(Self::White),
            other => Err(ColorParseError(other.to_string())),
        }
    }
}

/// Cardinal direction toward a neighbor, chosen by dominant axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Compass {
    North,
    South,
    East,
    West,
}

impl Compass {
    /// Unit grid delta for this direction. North is negative `y`.
    #[must_use]
    pub const fn delta(self) -> (i32, i32) {
        match self {
            Self::North => (0, -1),
            Self::South => (0, 1),
            Self::East => (1, 0),
            Self::West => (-1, 0),
        }
    }
}

/// Persistent record of a live robot. One exists per live robot; it is
/// created on join, mutated by resolution every tick, and removed on
/// death or departure. Energy has no upper bound after spawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotRecord {
    pub name: String,
    pub icon: char,
    pub color: DisplayColor,
    pub pos: Cell,
    pub energy: i32,
    pub age: u32,
    pub max_energy: i32,
}

/// A claimed territory cell.
///
/// `strength` is zero immediately after every ownership change and only
/// grows while the owner sits on the cell. `siege_progress` advances only
/// while `siege_by` keeps physically occupying the cell; ownership flips
/// to the besieger exactly when `siege_progress >= strength`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerritoryCell {
    pub owner: RobotId,
    pub owner_name: String,
    pub owner_color: DisplayColor,
    pub claimed_at: Tick,
    pub strength: u32,
    pub siege_by: Option<RobotId>,
    pub siege_progress: u32,
}

impl TerritoryCell {
    fn claimed_by(record: &RobotRecord, owner: RobotId, tick: Tick) -> Self {
        Self {
            owner,
            owner_name: record.name.clone(),
            owner_color: record.color,
            claimed_at: tick,
            strength: 0,
            siege_by: None,
            siege_progress: 0,
        }
    }
}

/// A marker dropped on a cell. At most one marker exists per cell; the
/// total count is FIFO-capped by [`WorldConfig::marker_cap`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub at: Cell,
    pub symbol: char,
    pub color: DisplayColor,
    pub placed_at: Tick,
}

/// One intended action returned by a behavior. Move deltas outside
/// `{-1, 0, 1}` are clamped at resolution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    Move { dx: i32, dy: i32 },
    Say(String),
    PlaceMarker(String),
    Absorb,
}

/// Read-only view of a robot's own state handed to `decide`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotView {
    pub x: i32,
    pub y: i32,
    pub energy: i32,
    pub age: u32,
}

/// A visible neighbor, annotated with rounded distance and the cardinal
/// direction of its dominant axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub name: String,
    pub icon: char,
    pub distance: f64,
    pub direction: Compass,
}

/// Territory summary for one cell inside a robot's viewing window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyTerritory {
    pub at: Cell,
    pub owner: Option<String>,
    pub strength: u32,
    pub mine: bool,
    pub unclaimed: bool,
}

/// Territory overview restricted to the configured window radius.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerritoryView {
    pub nearby: Vec<NearbyTerritory>,
    pub owned: usize,
    pub total_cells: usize,
    pub counts: BTreeMap<String, usize>,
}

/// Read-only world view handed to `decide`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldView {
    pub width: i32,
    pub height: i32,
    pub tick: Tick,
    pub markers: Vec<Marker>,
    pub territory: TerritoryView,
    pub broadcasts: BTreeMap<String, String>,
}

/// Error type for entity logic. Failures are recovered at the scheduler
/// boundary and never abort a tick.
pub type BehaviorError = Box<dyn std::error::Error + Send + Sync>;

/// The entity contract: every simulated robot implements this. The
/// engine only depends on this trait; implementations may be heuristics,
/// command-driven shims, or anything else that returns actions.
pub trait Behavior: Send + Sync {
    /// Static identifier of the behavior implementation.
    fn kind(&self) -> &'static str;

    /// Produce this tick's intended actions from read-only views.
    fn decide(
        &mut self,
        me: &RobotView,
        neighbors: &[Neighbor],
        world: &WorldView,
    ) -> Result<Vec<Action>, BehaviorError>;

    /// Called once per adjacent robot after moves resolve. A returned
    /// action is fed back through the normal resolution rules.
    fn on_encounter(
        &mut self,
        _other_name: &str,
        _other_icon: char,
    ) -> Result<Option<Action>, BehaviorError> {
        Ok(None)
    }
}

type BehaviorSpawner = Box<dyn Fn(&mut dyn RngCore) -> Box<dyn Behavior> + Send + Sync + 'static>;

struct BehaviorEntry {
    kind: Cow<'static, str>,
    spawner: BehaviorSpawner,
}

/// Registry owning behavior factories keyed by opaque handles.
#[derive(Default)]
pub struct BehaviorRegistry {
    next_key: u64,
    entries: HashMap<u64, BehaviorEntry>,
}

impl fmt::Debug for BehaviorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BehaviorRegistry")
            .field("next_key", &self.next_key)
            .field("entry_count", &self.entries.len())
            .finish()
    }
}

impl BehaviorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new behavior factory, returning its registry key.
    pub fn register<F>(&mut self, kind: impl Into<Cow<'static, str>>, factory: F) -> u64
    where
        F: Fn(&mut dyn RngCore) -> Box<dyn Behavior> + Send + Sync + 'static,
    {
        let key = self.next_key;
        self.next_key += 1;
        self.entries.insert(
            key,
            BehaviorEntry {
                kind: kind.into(),
                spawner: Box::new(factory),
            },
        );
        key
    }

    /// Removes a behavior factory from the registry.
    pub fn unregister(&mut self, key: u64) -> bool {
        self.entries.remove(&key).is_some()
    }

    /// Instantiate a new behavior using the factory referenced by `key`.
    pub fn spawn(&self, rng: &mut dyn RngCore, key: u64) -> Option<Box<dyn Behavior>> {
        self.entries.get(&key).map(|entry| (entry.spawner)(rng))
    }

    /// Descriptive identifier associated with a registry entry.
    #[must_use]
    pub fn kind(&self, key: u64) -> Option<&str> {
        self.entries.get(&key).map(|entry| entry.kind.as_ref())
    }

    /// Returns whether a key is registered.
    #[must_use]
    pub fn contains(&self, key: u64) -> bool {
        self.entries.contains_key(&key)
    }
}

/// Runtime attachment of a behavior to a robot. Bindings live in a
/// side-table, never inside the persisted record, so behavior can be
/// swapped at any time between ticks.
#[derive(Default)]
pub struct BehaviorBinding {
    runner: Option<Box<dyn Behavior>>,
    registry_key: Option<u64>,
    kind: Option<String>,
}

impl fmt::Debug for BehaviorBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BehaviorBinding")
            .field("bound", &self.runner.is_some())
            .field("kind", &self.kind)
            .finish()
    }
}

impl BehaviorBinding {
    /// A binding with no behavior attached; the robot never acts.
    #[must_use]
    pub fn unbound() -> Self {
        Self::default()
    }

    /// Bind a concrete behavior directly.
    #[must_use]
    pub fn direct(runner: Box<dyn Behavior>) -> Self {
        let kind = runner.kind().to_string();
        Self {
            runner: Some(runner),
            registry_key: None,
            kind: Some(kind),
        }
    }

    /// Instantiate a binding from a registry factory.
    #[must_use]
    pub fn from_registry(
        registry: &BehaviorRegistry,
        rng: &mut dyn RngCore,
        key: u64,
    ) -> Option<Self> {
        let runner = registry.spawn(rng, key)?;
        let kind = runner.kind().to_string();
        Some(Self {
            runner: Some(runner),
            registry_key: Some(key),
            kind: Some(kind),
        })
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.runner.is_some()
    }

    #[must_use]
    pub fn registry_key(&self) -> Option<u64> {
        self.registry_key
    }

    /// Human-readable description of the bound behavior.
    #[must_use]
    pub fn describe(&self) -> Cow<'_, str> {
        match &self.kind {
            Some(kind) => Cow::Borrowed(kind.as_str()),
            None => Cow::Borrowed("unbound"),
        }
    }

    fn decide(
        &mut self,
        me: &RobotView,
        neighbors: &[Neighbor],
        world: &WorldView,
    ) -> Option<Result<Vec<Action>, BehaviorError>> {
        self.runner
            .as_mut()
            .map(|runner| runner.decide(me, neighbors, world))
    }

    fn encounter(
        &mut self,
        other_name: &str,
        other_icon: char,
    ) -> Option<Result<Option<Action>, BehaviorError>> {
        self.runner
            .as_mut()
            .map(|runner| runner.on_encounter(other_name, other_icon))
    }
}

/// Resolves an externally issued instruction into actions for a robot.
/// Interpretation may be slow; it always runs on the background cache.
pub trait CommandInterpreter: Send + Sync {
    fn interpret(&self, robot_name: &str, instruction: &str) -> Result<Vec<Action>, BehaviorError>;
}

enum Slot<T> {
    Running,
    Done(Option<T>),
}

/// Start-now-harvest-later task cache keyed by `K`.
///
/// Polling a key starts background work when none exists, reports
/// nothing while it runs, and on completion hands back the result while
/// immediately starting a fresh run for next time. At most one task is
/// in flight per key; job panics and errors are logged and stored as an
/// absent result.
pub struct BackgroundTasks<K, T> {
    slots: Arc<Mutex<HashMap<K, Slot<T>>>>,
}

impl<K, T> Default for BackgroundTasks<K, T> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, T> BackgroundTasks<K, T>
where
    K: Eq + std::hash::Hash + Clone + Send + 'static,
    T: Send + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Slot<T>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submit-or-harvest: absent starts `job` and reports nothing;
    /// running reports nothing without restarting; done returns the
    /// cached result and starts a fresh run.
    pub fn poll<F>(&self, key: K, job: F) -> Option<T>
    where
        F: FnOnce() -> Result<T, BehaviorError> + Send + 'static,
    {
        let mut slots = self.lock();
        match slots.remove(&key) {
            None => {
                slots.insert(key.clone(), Slot::Running);
                drop(slots);
                self.spawn(key, job);
                None
            }
            Some(Slot::Running) => {
                slots.insert(key, Slot::Running);
                None
            }
            Some(Slot::Done(result)) => {
                slots.insert(key.clone(), Slot::Running);
                drop(slots);
                self.spawn(key, job);
                result
            }
        }
    }

    /// One-shot submission. Refused while a task for `key` is running;
    /// an unharvested completed result is replaced.
    pub fn start<F>(&self, key: K, job: F) -> bool
    where
        F: FnOnce() -> Result<T, BehaviorError> + Send + 'static,
    {
        let mut slots = self.lock();
        if matches!(slots.get(&key), Some(Slot::Running)) {
            return false;
        }
        slots.insert(key.clone(), Slot::Running);
        drop(slots);
        self.spawn(key, job);
        true
    }

    /// Consume a completed result without restarting anything.
    pub fn take(&self, key: &K) -> Option<T> {
        let mut slots = self.lock();
        match slots.get(key) {
            Some(Slot::Done(_)) => match slots.remove(key) {
                Some(Slot::Done(value)) => value,
                _ => None,
            },
            _ => None,
        }
    }

    /// Inspect a completed result without consuming or restarting.
    pub fn peek(&self, key: &K) -> Option<T>
    where
        T: Clone,
    {
        match self.lock().get(key) {
            Some(Slot::Done(value)) => value.clone(),
            _ => None,
        }
    }

    /// Is a task currently running for this key?
    pub fn pending(&self, key: &K) -> bool {
        matches!(self.lock().get(key), Some(Slot::Running))
    }

    /// Number of tasks currently in flight.
    pub fn pending_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Running))
            .count()
    }

    /// Abandon all tracked work. In-flight threads finish into a map
    /// nobody reads again; they are not joined.
    pub fn shutdown(&self) {
        self.lock().clear();
    }

    fn spawn<F>(&self, key: K, job: F)
    where
        F: FnOnce() -> Result<T, BehaviorError> + Send + 'static,
    {
        let slots = Arc::clone(&self.slots);
        let completion_key = key.clone();
        let spawned = thread::Builder::new()
            .name("terrarium-background".into())
            .spawn(move || {
                let value = match catch_unwind(AssertUnwindSafe(job)) {
                    Ok(Ok(value)) => Some(value),
                    Ok(Err(err)) => {
                        warn!(error = %err, "background task failed");
                        None
                    }
                    Err(_) => {
                        warn!("background task panicked");
                        None
                    }
                };
                let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
                slots.insert(completion_key, Slot::Done(value));
            });
        if let Err(err) = spawned {
            warn!(error = %err, "failed to spawn background worker");
            self.lock().insert(key, Slot::Done(None));
        }
    }
}

/// Fixed pool of display identifiers with an injective robot mapping.
#[derive(Debug, Clone, Default)]
pub struct IconPool {
    assigned: BTreeMap<RobotId, char>,
}

fn icon_pool_order() -> impl Iterator<Item = char> {
    ('A'..='Z').chain('a'..='z')
}

impl IconPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the pool from already-assigned `(robot, icon)` pairs, as
    /// loaded from a snapshot.
    #[must_use]
    pub fn rebuild(assigned: impl IntoIterator<Item = (RobotId, char)>) -> Self {
        Self {
            assigned: assigned.into_iter().collect(),
        }
    }

    /// Assign the first unused icon in fixed pool order, or `None` when
    /// the pool is exhausted. Re-acquiring for an already-assigned robot
    /// returns its existing icon.
    pub fn acquire(&mut self, id: RobotId) -> Option<char> {
        if let Some(icon) = self.assigned.get(&id) {
            return Some(*icon);
        }
        let used: HashSet<char> = self.assigned.values().copied().collect();
        let icon = icon_pool_order().find(|c| !used.contains(c))?;
        self.assigned.insert(id, icon);
        Some(icon)
    }

    /// Release a robot's icon back to the pool.
    pub fn release(&mut self, id: RobotId) -> Option<char> {
        self.assigned.remove(&id)
    }

    #[must_use]
    pub fn icon_of(&self, id: RobotId) -> Option<char> {
        self.assigned.get(&id).copied()
    }

    #[must_use]
    pub fn assigned_count(&self) -> usize {
        self.assigned.len()
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.assigned.len() >= ICON_POOL_SIZE
    }
}

/// Errors raised by snapshot port implementations.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot backend error: {0}")]
    Backend(String),
}

impl SnapshotError {
    /// Wrap any backend failure for transport through the port.
    #[must_use]
    pub fn backend(err: impl fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Bulk load/store port for world snapshots at tick boundaries.
///
/// The engine treats the backing store as an opaque last-writer-wins
/// key-value store: collections are loaded in full before any mutation
/// and written back in full after resolution. Load failures degrade to
/// empty collections inside the engine; save failures propagate so the
/// caller can retry the tick boundary.
pub trait SnapshotPort: Send {
    fn load_registry(&mut self) -> Result<BTreeMap<RobotId, RobotRecord>, SnapshotError>;
    fn save_registry(&mut self, registry: &BTreeMap<RobotId, RobotRecord>)
    -> Result<(), SnapshotError>;
    fn load_territory(&mut self) -> Result<BTreeMap<Cell, TerritoryCell>, SnapshotError>;
    fn save_territory(
        &mut self,
        territory: &BTreeMap<Cell, TerritoryCell>,
    ) -> Result<(), SnapshotError>;
    fn load_markers(&mut self) -> Result<Vec<Marker>, SnapshotError>;
    fn save_markers(&mut self, markers: &[Marker]) -> Result<(), SnapshotError>;
    fn append_event(&mut self, tick: Tick, message: &str) -> Result<(), SnapshotError>;
    fn read_tick(&mut self) -> Result<Tick, SnapshotError>;
    fn increment_tick(&mut self) -> Result<Tick, SnapshotError>;
}

/// In-memory snapshot port used by default and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    registry: BTreeMap<RobotId, RobotRecord>,
    territory: BTreeMap<Cell, TerritoryCell>,
    markers: Vec<Marker>,
    events: Vec<(Tick, String)>,
    tick: Tick,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All events appended so far, in order.
    #[must_use]
    pub fn events(&self) -> &[(Tick, String)] {
        &self.events
    }
}

impl SnapshotPort for MemoryStore {
    fn load_registry(&mut self) -> Result<BTreeMap<RobotId, RobotRecord>, SnapshotError> {
        Ok(self.registry.clone())
    }

    fn save_registry(
        &mut self,
        registry: &BTreeMap<RobotId, RobotRecord>,
    ) -> Result<(), SnapshotError> {
        self.registry = registry.clone();
        Ok(())
    }

    fn load_territory(&mut self) -> Result<BTreeMap<Cell, TerritoryCell>, SnapshotError> {
        Ok(self.territory.clone())
    }

    fn save_territory(
        &mut self,
        territory: &BTreeMap<Cell, TerritoryCell>,
    ) -> Result<(), SnapshotError> {
        self.territory = territory.clone();
        Ok(())
    }

    fn load_markers(&mut self) -> Result<Vec<Marker>, SnapshotError> {
        Ok(self.markers.clone())
    }

    fn save_markers(&mut self, markers: &[Marker]) -> Result<(), SnapshotError> {
        self.markers = markers.to_vec();
        Ok(())
    }

    fn append_event(&mut self, tick: Tick, message: &str) -> Result<(), SnapshotError> {
        self.events.push((tick, message.to_string()));
        Ok(())
    }

    fn read_tick(&mut self) -> Result<Tick, SnapshotError> {
        Ok(self.tick)
    }

    fn increment_tick(&mut self) -> Result<Tick, SnapshotError> {
        self.tick = self.tick.next();
        Ok(self.tick)
    }
}

/// Errors raised by world construction and operation.
#[derive(Debug, Error)]
pub enum WorldError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The identifier pool is exhausted; the join was refused.
    #[error("world full: identifier pool exhausted with {0} live robots")]
    WorldFull(usize),
    /// The referenced robot does not exist.
    #[error("unknown robot {0}")]
    UnknownRobot(RobotId),
    /// A snapshot save failed; the tick boundary may be retried.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// How the decision phase fans out over live robots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DecisionMode {
    /// One rayon task per robot; results keyed by id regardless of
    /// completion order.
    #[default]
    Parallel,
    /// Plain sequential loop, for deterministic debugging.
    Sequential,
}

/// Static configuration for a terrarium world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldConfig {
    /// Grid width in cells.
    pub width: i32,
    /// Grid height in cells.
    pub height: i32,
    /// Optional RNG seed for reproducible worlds.
    pub rng_seed: Option<u64>,
    /// Parallel or sequential decision fan-out.
    pub decision_mode: DecisionMode,
    /// Euclidean neighbor visibility radius.
    pub visibility_radius: f64,
    /// Radius of the territory window exposed in world views.
    pub territory_window: i32,
    /// Energy cost charged for every move action, regardless of outcome.
    pub move_energy_cost: i32,
    /// Energy gained when ending a move on a rival-owned cell.
    pub raid_energy_bonus: i32,
    /// Maximum number of markers; the oldest is evicted first.
    pub marker_cap: usize,
    /// Number of event-log lines retained in memory.
    pub event_log_capacity: usize,
    /// Broadcast lifetime in ticks.
    pub broadcast_ttl: u64,
    /// Placement attempts before spawning on an occupied cell anyway.
    pub spawn_attempts: u32,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            width: 40,
            height: 20,
            rng_seed: None,
            decision_mode: DecisionMode::Parallel,
            visibility_radius: 5.0,
            territory_window: 5,
            move_energy_cost: 1,
            raid_energy_bonus: 1,
            marker_cap: 200,
            event_log_capacity: 50,
            broadcast_ttl: 120,
            spawn_attempts: 50,
        }
    }
}

impl WorldConfig {
    /// Validates the configuration.
    fn validate(&self) -> Result<(), WorldError> {
        if self.width < 1 || self.height < 1 {
            return Err(WorldError::InvalidConfig(
                "world dimensions must be positive",
            ));
        }
        if self.visibility_radius <= 0.0 {
            return Err(WorldError::InvalidConfig(
                "visibility_radius must be positive",
            ));
        }
        if self.territory_window < 0 {
            return Err(WorldError::InvalidConfig(
                "territory_window must be non-negative",
            ));
        }
        if self.move_energy_cost < 0 || self.raid_energy_bonus < 0 {
            return Err(WorldError::InvalidConfig(
                "energy costs must be non-negative",
            ));
        }
        if self.marker_cap == 0 || self.event_log_capacity == 0 {
            return Err(WorldError::InvalidConfig(
                "marker_cap and event_log_capacity must be positive",
            ));
        }
        if self.spawn_attempts == 0 {
            return Err(WorldError::InvalidConfig(
                "spawn_attempts must be positive",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy when no seed is
    /// set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Parameters for a joining robot.
#[derive(Debug, Clone)]
pub struct RobotSpec {
    pub name: String,
    pub color: DisplayColor,
    pub max_energy: i32,
    /// Fixed spawn cell; a random unoccupied cell is picked when absent.
    pub position: Option<Cell>,
}

impl RobotSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, color: DisplayColor, max_energy: i32) -> Self {
        Self {
            name: name.into(),
            color,
            max_energy,
            position: None,
        }
    }

    /// Pin the spawn position instead of rolling a random cell.
    #[must_use]
    pub fn at(mut self, cell: Cell) -> Self {
        self.position = Some(cell);
        self
    }
}

/// Summary of one completed tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub tick: Tick,
    pub robots: usize,
    pub deaths: usize,
    pub battles: usize,
    pub captures: usize,
}

/// Sole-survivor summary returned by [`WorldState::winner`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinnerSummary {
    pub id: RobotId,
    pub name: String,
    pub icon: char,
    pub color: DisplayColor,
    pub territory: usize,
}

#[derive(Debug, Clone)]
struct BroadcastEntry {
    message: String,
    expires_at: Tick,
}

struct DecisionContext {
    view: RobotView,
    neighbors: Vec<Neighbor>,
    world: WorldView,
}

/// The world engine. Owns the working copies of every mutable
/// collection for the duration of a tick; behaviors only ever see
/// read-only views and return pure action data.
pub struct WorldState {
    config: WorldConfig,
    width: i32,
    height: i32,
    tick: Tick,
    rng: SmallRng,
    registry: BTreeMap<RobotId, RobotRecord>,
    territory: BTreeMap<Cell, TerritoryCell>,
    markers: VecDeque<Marker>,
    behaviors: BTreeMap<RobotId, BehaviorBinding>,
    behavior_registry: BehaviorRegistry,
    icons: IconPool,
    next_robot_id: u64,
    absorb_intents: BTreeSet<RobotId>,
    broadcasts: BTreeMap<String, BroadcastEntry>,
    commands: BackgroundTasks<RobotId, Vec<Action>>,
    interpreter: Option<Arc<dyn CommandInterpreter>>,
    port: Box<dyn SnapshotPort>,
    events: VecDeque<String>,
}

impl fmt::Debug for WorldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorldState")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("tick", &self.tick)
            .field("robot_count", &self.registry.len())
            .field("territory_cells", &self.territory.len())
            .finish()
    }
}

impl WorldState {
    /// Instantiate a new world over an in-memory snapshot store.
    pub fn new(config: WorldConfig) -> Result<Self, WorldError> {
        Self::with_port(config, Box::new(MemoryStore::new()))
    }

    /// Instantiate a new world over the supplied snapshot port. Any
    /// state already present in the port is adopted.
    pub fn with_port(config: WorldConfig, port: Box<dyn SnapshotPort>) -> Result<Self, WorldError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let mut world = Self {
            width: config.width,
            height: config.height,
            tick: Tick::zero(),
            rng,
            registry: BTreeMap::new(),
            territory: BTreeMap::new(),
            markers: VecDeque::new(),
            behaviors: BTreeMap::new(),
            behavior_registry: BehaviorRegistry::new(),
            icons: IconPool::new(),
            next_robot_id: 0,
            absorb_intents: BTreeSet::new(),
            broadcasts: BTreeMap::new(),
            commands: BackgroundTasks::new(),
            interpreter: None,
            port,
            events: VecDeque::new(),
            config,
        };
        world.adopt_port_state();
        Ok(world)
    }

    fn adopt_port_state(&mut self) {
        match self.port.read_tick() {
            Ok(tick) => self.tick = tick,
            Err(err) => warn!(error = %err, "tick counter load failed; starting at zero"),
        }
        self.load_working_copies();
    }

    fn load_working_copies(&mut self) {
        match self.port.load_registry() {
            Ok(registry) => self.registry = registry,
            Err(err) => {
                warn!(error = %err, "registry load failed; treating as empty");
                self.registry = BTreeMap::new();
            }
        }
        match self.port.load_territory() {
            Ok(territory) => self.territory = territory,
            Err(err) => {
                warn!(error = %err, "territory load failed; treating as empty");
                self.territory = BTreeMap::new();
            }
        }
        match self.port.load_markers() {
            Ok(markers) => self.markers = markers.into(),
            Err(err) => {
                warn!(error = %err, "marker load failed; treating as empty");
                self.markers = VecDeque::new();
            }
        }
        self.icons = IconPool::rebuild(
            self.registry
                .iter()
                .map(|(id, record)| (*id, record.icon)),
        );
        if let Some(max_id) = self.registry.keys().next_back() {
            self.next_robot_id = self.next_robot_id.max(max_id.0 + 1);
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Admit a robot into the world. Fails with [`WorldError::WorldFull`]
    /// (and logs the refusal) when the identifier pool is exhausted.
    pub fn add_robot(&mut self, spec: RobotSpec) -> Result<RobotId, WorldError> {
        let id = RobotId(self.next_robot_id);
        let Some(icon) = self.icons.acquire(id) else {
            self.log_event(format!(
                "! {} rejected: world full ({ICON_POOL_SIZE} robots)",
                spec.name
            ));
            return Err(WorldError::WorldFull(self.registry.len()));
        };
        self.next_robot_id += 1;

        let pos = match spec.position {
            Some(cell) => Cell::new(
                cell.x.clamp(0, self.width - 1),
                cell.y.clamp(0, self.height - 1),
            ),
            None => self.random_free_cell(),
        };
        let record = RobotRecord {
            name: spec.name,
            icon,
            color: spec.color,
            pos,
            energy: spec.max_energy,
            age: 0,
            max_energy: spec.max_energy,
        };
        let line = format!(
            "+ {} ({}) joined the world at {}",
            record.name, record.icon, record.pos
        );
        self.registry.insert(id, record);
        self.behaviors.insert(id, BehaviorBinding::unbound());
        self.claim_cell(id, pos);
        self.log_event(line);
        if let Err(err) = self.persist_all() {
            warn!(error = %err, "join write-through failed; tick save will retry");
        }
        Ok(id)
    }

    /// Remove a robot (explicit departure), releasing its icon.
    pub fn remove_robot(&mut self, id: RobotId) -> Option<RobotRecord> {
        let record = self.registry.remove(&id)?;
        self.behaviors.remove(&id);
        self.icons.release(id);
        self.absorb_intents.remove(&id);
        self.log_event(format!("- {} left the world", record.name));
        if let Err(err) = self.persist_all() {
            warn!(error = %err, "departure write-through failed; tick save will retry");
        }
        Some(record)
    }

    fn random_free_cell(&mut self) -> Cell {
        let occupied: HashSet<Cell> = self.registry.values().map(|r| r.pos).collect();
        let mut cell = Cell::new(
            self.rng.random_range(0..self.width),
            self.rng.random_range(0..self.height),
        );
        let mut attempts = 0;
        while occupied.contains(&cell) && attempts < self.config.spawn_attempts {
            cell = Cell::new(
                self.rng.random_range(0..self.width),
                self.rng.random_range(0..self.height),
            );
            attempts += 1;
        }
        cell
    }

    /// Attach a behavior instantiated from the registry. Returns `true`
    /// on success.
    pub fn bind_behavior(&mut self, id: RobotId, key: u64) -> bool {
        if !self.registry.contains_key(&id) {
            return false;
        }
        if let Some(binding) =
            BehaviorBinding::from_registry(&self.behavior_registry, &mut self.rng, key)
        {
            self.behaviors.insert(id, binding);
            return true;
        }
        false
    }

    /// Attach a concrete behavior, replacing whatever was bound before.
    pub fn set_behavior(
        &mut self,
        id: RobotId,
        behavior: Box<dyn Behavior>,
    ) -> Result<(), WorldError> {
        if !self.registry.contains_key(&id) {
            return Err(WorldError::UnknownRobot(id));
        }
        self.behaviors.insert(id, BehaviorBinding::direct(behavior));
        Ok(())
    }

    /// Install the command interpreter used by [`Self::issue_command`].
    pub fn set_interpreter(&mut self, interpreter: Arc<dyn CommandInterpreter>) {
        self.interpreter = Some(interpreter);
    }

    /// Queue an instruction for a robot. Interpretation runs in the
    /// background; the resulting actions are appended to the robot's
    /// action list at the next collect after completion.
    pub fn issue_command(&mut self, id: RobotId, instruction: &str) -> Result<(), WorldError> {
        let record = self
            .registry
            .get(&id)
            .ok_or(WorldError::UnknownRobot(id))?;
        let name = record.name.clone();
        let Some(interpreter) = self.interpreter.clone() else {
            self.log_event(format!(
                "! Command for {name} ignored: no interpreter configured"
            ));
            return Ok(());
        };
        let job_name = name.clone();
        let text = instruction.to_string();
        let started = self
            .commands
            .start(id, move || interpreter.interpret(&job_name, &text));
        if started {
            self.log_event(format!("~ Command sent to {name}: {instruction}"));
        } else {
            self.log_event(format!("! {name} is still working on an earlier command"));
        }
        Ok(())
    }

    /// Post a message on the shared broadcast board. Entries expire
    /// after the configured TTL.
    pub fn post_broadcast(&mut self, name: impl Into<String>, message: impl Into<String>) {
        let expires_at = Tick(self.tick.0 + self.config.broadcast_ttl);
        self.broadcasts.insert(
            name.into(),
            BroadcastEntry {
                message: message.into(),
                expires_at,
            },
        );
    }

    // ------------------------------------------------------------------
    // Per-tick pipeline
    // ------------------------------------------------------------------

    /// Advance the world by one tick.
    ///
    /// Resolution applies actions strictly sequentially in ascending
    /// robot-id order, so outcomes are reproducible for a given seed and
    /// action set. Save failures propagate; everything earlier in the
    /// pipeline degrades gracefully.
    pub fn step(&mut self) -> Result<TickReport, WorldError> {
        self.stage_load();
        self.prune_broadcasts();
        let prev_positions: BTreeMap<RobotId, Cell> = self
            .registry
            .iter()
            .map(|(id, record)| (*id, record.pos))
            .collect();
        let decisions = self.stage_collect();
        self.stage_resolve(&decisions);
        let captures = self.stage_fortify(&prev_positions);
        self.stage_encounters();
        let battles = self.stage_battles();
        let deaths = self.stage_cull();
        self.stage_save()?;
        Ok(TickReport {
            tick: self.tick,
            robots: self.registry.len(),
            deaths,
            battles,
            captures,
        })
    }

    fn stage_load(&mut self) {
        match self.port.increment_tick() {
            Ok(tick) => self.tick = tick,
            Err(err) => {
                warn!(error = %err, "tick increment failed; advancing locally");
                self.tick = self.tick.next();
            }
        }
        self.load_working_copies();
    }

    fn prune_broadcasts(&mut self) {
        let now = self.tick;
        self.broadcasts.retain(|_, entry| entry.expires_at > now);
    }

    fn stage_collect(&mut self) -> BTreeMap<RobotId, Vec<Action>> {
        for record in self.registry.values_mut() {
            record.age = record.age.saturating_add(1);
        }

        let contexts: BTreeMap<RobotId, DecisionContext> = self
            .registry
            .iter()
            .map(|(id, record)| (*id, self.decision_context(*id, record)))
            .collect();

        let registry = &self.registry;
        let behaviors = &mut self.behaviors;
        let run = |id: &RobotId, binding: &mut BehaviorBinding| -> (RobotId, Vec<Action>) {
            let Some(ctx) = contexts.get(id) else {
                return (*id, Vec::new());
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                binding.decide(&ctx.view, &ctx.neighbors, &ctx.world)
            }));
            let actions = match outcome {
                Ok(Some(Ok(actions))) => actions,
                Ok(Some(Err(err))) => {
                    warn!(robot = %id, error = %err, "decide failed; no actions this tick");
                    Vec::new()
                }
                Ok(None) => Vec::new(),
                Err(_) => {
                    warn!(robot = %id, "decide panicked; no actions this tick");
                    Vec::new()
                }
            };
            (*id, actions)
        };

        let mut decisions: BTreeMap<RobotId, Vec<Action>> = match self.config.decision_mode {
            DecisionMode::Parallel => behaviors
                .par_iter_mut()
                .filter(|entry| registry.contains_key(entry.0))
                .map(|(id, binding)| run(id, binding))
                .collect(),
            DecisionMode::Sequential => behaviors
                .iter_mut()
                .filter(|entry| registry.contains_key(entry.0))
                .map(|(id, binding)| run(id, binding))
                .collect(),
        };

        let ids: Vec<RobotId> = self.registry.keys().copied().collect();
        for id in ids {
            if let Some(extra) = self.commands.take(&id) {
                if !extra.is_empty() {
                    if let Some(record) = self.registry.get(&id) {
                        let name = record.name.clone();
                        self.log_event(format!("~ {name} acts on a command"));
                    }
                    decisions.entry(id).or_default().extend(extra);
                }
            }
        }
        decisions
    }

    fn decision_context(&self, id: RobotId, record: &RobotRecord) -> DecisionContext {
        DecisionContext {
            view: RobotView {
                x: record.pos.x,
                y: record.pos.y,
                energy: record.energy,
                age: record.age,
            },
            neighbors: self.neighbors_of(id, record),
            world: self.world_view(id, record),
        }
    }

    fn neighbors_of(&self, id: RobotId, record: &RobotRecord) -> Vec<Neighbor> {
        let radius = self.config.visibility_radius;
        self.registry
            .iter()
            .filter(|(other_id, _)| **other_id != id)
            .filter_map(|(_, other)| {
                let dx = f64::from(other.pos.x - record.pos.x);
                let dy = f64::from(other.pos.y - record.pos.y);
                let distance = (dx * dx + dy * dy).sqrt();
                if distance > radius {
                    return None;
                }
                let direction = if dx.abs() > dy.abs() {
                    if dx > 0.0 { Compass::East } else { Compass::West }
                } else if dy > 0.0 {
                    Compass::South
                } else {
                    Compass::North
                };
                Some(Neighbor {
                    name: other.name.clone(),
                    icon: other.icon,
                    distance: (distance * 10.0).round() / 10.0,
                    direction,
                })
            })
            .collect()
    }

    fn world_view(&self, id: RobotId, record: &RobotRecord) -> WorldView {
        let window = self.config.territory_window;
        let mut nearby = Vec::new();
        for dy in -window..=window {
            for dx in -window..=window {
                let at = Cell::new(record.pos.x + dx, record.pos.y + dy);
                if !self.in_bounds(at) {
                    continue;
                }
                let cell = self.territory.get(&at);
                nearby.push(NearbyTerritory {
                    at,
                    owner: cell.map(|c| c.owner_name.clone()),
                    strength: cell.map_or(0, |c| c.strength),
                    mine: cell.is_some_and(|c| c.owner == id),
                    unclaimed: cell.is_none(),
                });
            }
        }
        WorldView {
            width: self.width,
            height: self.height,
            tick: self.tick,
            markers: self.markers.iter().cloned().collect(),
            territory: TerritoryView {
                nearby,
                owned: self.territory.values().filter(|c| c.owner == id).count(),
                total_cells: (self.width as usize) * (self.height as usize),
                counts: self.territory_counts(),
            },
            broadcasts: self
                .broadcasts
                .iter()
                .map(|(name, entry)| (name.clone(), entry.message.clone()))
                .collect(),
        }
    }

    fn stage_resolve(&mut self, decisions: &BTreeMap<RobotId, Vec<Action>>) {
        self.absorb_intents.clear();
        for (id, actions) in decisions {
            for action in actions {
                self.apply_action(*id, action);
            }
        }
    }

    fn apply_action(&mut self, id: RobotId, action: &Action) {
        if !self.registry.contains_key(&id) {
            return;
        }
        match action {
            Action::Move { dx, dy } => self.resolve_move(id, *dx, *dy),
            Action::Say(message) => self.resolve_say(id, message),
            Action::PlaceMarker(symbol) => self.resolve_marker(id, symbol),
            Action::Absorb => {
                self.absorb_intents.insert(id);
            }
        }
    }

    fn resolve_move(&mut self, id: RobotId, dx: i32, dy: i32) {
        let (dx, dy) = (dx.clamp(-1, 1), dy.clamp(-1, 1));
        let Some(record) = self.registry.get(&id) else {
            return;
        };
        let target = Cell::new(
            (record.pos.x + dx).clamp(0, self.width - 1),
            (record.pos.y + dy).clamp(0, self.height - 1),
        );

        // First mover wins: the target must be free in the working copy,
        // which already reflects earlier moves this tick.
        let blocked = self
            .registry
            .iter()
            .any(|(other_id, other)| *other_id != id && other.pos == target);
        if !blocked {
            if let Some(record) = self.registry.get_mut(&id) {
                record.pos = target;
            }
        }

        let Some(here) = self.registry.get(&id).map(|r| r.pos) else {
            return;
        };
        let on_rival_ground = self
            .territory
            .get(&here)
            .is_some_and(|cell| cell.owner != id);
        if on_rival_ground {
            if let Some(record) = self.registry.get_mut(&id) {
                record.energy += self.config.raid_energy_bonus;
            }
        }

        self.claim_cell(id, here);
        if let Some(record) = self.registry.get_mut(&id) {
            record.energy -= self.config.move_energy_cost;
        }
    }

    /// The claim rule: unclaimed cells are taken outright; an owner's
    /// own cell is untouched (fortification is separate); a rival cell
    /// transfers only at strength zero, otherwise the siege mechanic
    /// applies instead.
    fn claim_cell(&mut self, id: RobotId, at: Cell) {
        let Some(record) = self.registry.get(&id) else {
            return;
        };
        match self.territory.get(&at) {
            None => {
                let cell = TerritoryCell::claimed_by(record, id, self.tick);
                self.territory.insert(at, cell);
            }
            Some(existing) if existing.owner == id => {}
            Some(existing) if existing.strength == 0 => {
                let cell = TerritoryCell::claimed_by(record, id, self.tick);
                self.territory.insert(at, cell);
            }
            Some(_) => {}
        }
    }

    fn resolve_say(&mut self, id: RobotId, message: &str) {
        if let Some(record) = self.registry.get(&id) {
            let line = format!("[{}] {}", record.name, message);
            self.log_event(line);
        }
    }

    fn resolve_marker(&mut self, id: RobotId, symbol: &str) {
        let Some(record) = self.registry.get(&id) else {
            return;
        };
        let at = record.pos;
        let marker = Marker {
            at,
            symbol: symbol.chars().next().unwrap_or('.'),
            color: record.color,
            placed_at: self.tick,
        };
        self.markers.retain(|m| m.at != at);
        self.markers.push_back(marker);
        while self.markers.len() > self.config.marker_cap {
            self.markers.pop_front();
        }
    }

    fn stage_fortify(&mut self, prev_positions: &BTreeMap<RobotId, Cell>) -> usize {
        let occupied: BTreeMap<Cell, RobotId> = self
            .registry
            .iter()
            .map(|(id, record)| (record.pos, *id))
            .collect();

        let mut captures: Vec<(String, Cell)> = Vec::new();
        let snapshot: Vec<(RobotId, Cell)> = self
            .registry
            .iter()
            .map(|(id, record)| (*id, record.pos))
            .collect();

        for (id, here) in snapshot {
            let stayed = prev_positions.get(&id) == Some(&here);
            let Some(record) = self.registry.get(&id) else {
                continue;
            };
            let Some(cell) = self.territory.get_mut(&here) else {
                continue;
            };
            if cell.owner == id {
                if stayed {
                    cell.strength += 1;
                }
            } else if cell.strength > 0 {
                if cell.siege_by == Some(id) {
                    if stayed {
                        cell.siege_progress += 1;
                    }
                } else {
                    cell.siege_by = Some(id);
                    cell.siege_progress = u32::from(stayed);
                }
                if cell.siege_progress >= cell.strength {
                    *cell = TerritoryCell::claimed_by(record, id, self.tick);
                    captures.push((record.name.clone(), here));
                }
            }
        }

        // A siege only survives while the besieger physically holds the
        // cell.
        for (at, cell) in &mut self.territory {
            if let Some(besieger) = cell.siege_by
                && occupied.get(at) != Some(&besieger)
            {
                cell.siege_by = None;
                cell.siege_progress = 0;
            }
        }

        let count = captures.len();
        for (name, at) in captures {
            self.log_event(format!("! {name} captured {at} after a siege"));
        }
        count
    }

    fn stage_encounters(&mut self) {
        let entries: Vec<(RobotId, Cell, String, char)> = self
            .registry
            .iter()
            .map(|(id, record)| (*id, record.pos, record.name.clone(), record.icon))
            .collect();

        for (id_a, pos_a, _, _) in &entries {
            for (id_b, pos_b, name_b, icon_b) in &entries {
                if id_a == id_b || pos_a.chebyshev(*pos_b) > 1 {
                    continue;
                }
                let outcome = {
                    let Some(binding) = self.behaviors.get_mut(id_a) else {
                        continue;
                    };
                    catch_unwind(AssertUnwindSafe(|| binding.encounter(name_b, *icon_b)))
                };
                match outcome {
                    Ok(Some(Ok(Some(action)))) => self.apply_action(*id_a, &action),
                    Ok(Some(Ok(None))) | Ok(None) => {}
                    Ok(Some(Err(err))) => {
                        warn!(robot = %id_a, error = %err, "encounter callback failed");
                    }
                    Err(_) => {
                        warn!(robot = %id_a, "encounter callback panicked");
                    }
                }
            }
        }
    }

    fn stage_battles(&mut self) -> usize {
        if self.absorb_intents.is_empty() {
            return 0;
        }

        struct Attack {
            attacker: RobotId,
            target: RobotId,
        }

        let mut attacks: Vec<Attack> = Vec::new();
        for attacker in &self.absorb_intents {
            let Some(attacker_record) = self.registry.get(attacker) else {
                continue;
            };
            let target = self
                .registry
                .iter()
                .filter(|(id, _)| *id != attacker)
                .filter(|(_, record)| record.pos.chebyshev(attacker_record.pos) <= 1)
                .min_by_key(|(id, record)| (record.pos.manhattan(attacker_record.pos), **id));
            if let Some((target_id, _)) = target {
                attacks.push(Attack {
                    attacker: *attacker,
                    target: *target_id,
                });
            }
        }

        // Surface pile-ons before resolving; they have no extra effect.
        let mut by_target: BTreeMap<RobotId, Vec<RobotId>> = BTreeMap::new();
        for attack in &attacks {
            by_target.entry(attack.target).or_default().push(attack.attacker);
        }
        let mut gang_lines: Vec<String> = Vec::new();
        for (target, attackers) in &by_target {
            if attackers.len() < 2 {
                continue;
            }
            let target_name = match self.registry.get(target) {
                Some(record) => record.name.clone(),
                None => continue,
            };
            let attacker_names: Vec<String> = attackers
                .iter()
                .filter_map(|id| self.registry.get(id).map(|r| r.name.clone()))
                .collect();
            gang_lines.push(format!(
                "!! {} gang up on {target_name}",
                attacker_names.join(", ")
            ));
        }
        for line in gang_lines {
            self.log_event(line);
        }

        let mut resolved = 0;
        for attack in &attacks {
            let Some(attacker_energy) = self.registry.get(&attack.attacker).map(|r| r.energy)
            else {
                continue;
            };
            let Some(defender_energy) = self.registry.get(&attack.target).map(|r| r.energy)
            else {
                continue;
            };
            if attacker_energy <= 0 || defender_energy <= 0 {
                continue;
            }
            let drain = (attacker_energy / defender_energy).max(1);
            let mut defender_name = String::new();
            let mut remaining = 0;
            if let Some(defender) = self.registry.get_mut(&attack.target) {
                defender.energy -= drain;
                remaining = defender.energy;
                defender_name = defender.name.clone();
            }
            let mut attacker_name = String::new();
            if let Some(attacker) = self.registry.get_mut(&attack.attacker) {
                attacker.energy += drain;
                attacker_name = attacker.name.clone();
            }
            resolved += 1;
            self.log_event(format!(
                "! {attacker_name} drained {drain} energy from {defender_name} ({remaining} remaining)"
            ));
        }

        self.absorb_intents.clear();
        resolved
    }

    fn stage_cull(&mut self) -> usize {
        let dead: Vec<RobotId> = self
            .registry
            .iter()
            .filter(|(_, record)| record.energy <= 0)
            .map(|(id, _)| *id)
            .collect();
        for id in &dead {
            if let Some(record) = self.registry.remove(id) {
                self.behaviors.remove(id);
                self.icons.release(*id);
                self.log_event(format!("x {} ran out of energy and perished", record.name));
            }
        }
        dead.len()
    }

    fn stage_save(&mut self) -> Result<(), WorldError> {
        self.persist_all()
    }

    fn persist_all(&mut self) -> Result<(), WorldError> {
        self.port.save_registry(&self.registry)?;
        self.port.save_territory(&self.territory)?;
        let markers: Vec<Marker> = self.markers.iter().cloned().collect();
        self.port.save_markers(&markers)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sizing
    // ------------------------------------------------------------------

    /// Resize the grid. Unchanged dimensions are a no-op; non-positive
    /// dimensions are ignored with a logged warning. Every robot is
    /// clamped into the new bounds, out-of-bounds markers and territory
    /// cells are dropped, and the result is persisted. Robot count never
    /// changes.
    pub fn resize(&mut self, width: i32, height: i32) -> Result<(), WorldError> {
        if width == self.width && height == self.height {
            return Ok(());
        }
        if width < 1 || height < 1 {
            warn!(width, height, "resize ignored: dimensions must be positive");
            return Ok(());
        }

        self.width = width;
        self.height = height;
        for record in self.registry.values_mut() {
            record.pos.x = record.pos.x.clamp(0, width - 1);
            record.pos.y = record.pos.y.clamp(0, height - 1);
        }
        self.markers
            .retain(|m| m.at.x < width && m.at.y < height && m.at.x >= 0 && m.at.y >= 0);
        self.territory
            .retain(|at, _| at.x < width && at.y < height && at.x >= 0 && at.y >= 0);
        self.persist_all()
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Immutable reference to the configuration.
    #[must_use]
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Grid width in cells.
    #[must_use]
    pub const fn width(&self) -> i32 {
        self.width
    }

    /// Grid height in cells.
    #[must_use]
    pub const fn height(&self) -> i32 {
        self.height
    }

    /// Number of live robots.
    #[must_use]
    pub fn robot_count(&self) -> usize {
        self.registry.len()
    }

    /// Borrow a robot's record.
    #[must_use]
    pub fn robot(&self, id: RobotId) -> Option<&RobotRecord> {
        self.registry.get(&id)
    }

    /// Mutably borrow a robot's record (for embedding applications and
    /// tests; behaviors never get this).
    #[must_use]
    pub fn robot_mut(&mut self, id: RobotId) -> Option<&mut RobotRecord> {
        self.registry.get_mut(&id)
    }

    /// Iterate over live robots in ascending id order.
    pub fn robots(&self) -> impl Iterator<Item = (RobotId, &RobotRecord)> {
        self.registry.iter().map(|(id, record)| (*id, record))
    }

    /// The robot occupying a cell, if any.
    #[must_use]
    pub fn robot_at(&self, at: Cell) -> Option<(RobotId, &RobotRecord)> {
        self.registry
            .iter()
            .find(|(_, record)| record.pos == at)
            .map(|(id, record)| (*id, record))
    }

    /// The marker on a cell, if any.
    #[must_use]
    pub fn marker_at(&self, at: Cell) -> Option<&Marker> {
        self.markers.iter().find(|m| m.at == at)
    }

    /// Iterate over all markers, oldest first.
    pub fn markers(&self) -> impl Iterator<Item = &Marker> {
        self.markers.iter()
    }

    /// The territory cell at a coordinate, if claimed.
    #[must_use]
    pub fn territory_at(&self, at: Cell) -> Option<&TerritoryCell> {
        self.territory.get(&at)
    }

    /// Iterate over all claimed territory cells in coordinate order.
    pub fn territory_cells(&self) -> impl Iterator<Item = (Cell, &TerritoryCell)> {
        self.territory.iter().map(|(at, cell)| (*at, cell))
    }

    /// Owned-cell counts keyed by owner name.
    #[must_use]
    pub fn territory_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for cell in self.territory.values() {
            *counts.entry(cell.owner_name.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Recent event-log lines, oldest first.
    pub fn event_log(&self) -> impl Iterator<Item = &str> {
        self.events.iter().map(String::as_str)
    }

    /// Current broadcast board contents.
    #[must_use]
    pub fn broadcasts(&self) -> BTreeMap<String, String> {
        self.broadcasts
            .iter()
            .map(|(name, entry)| (name.clone(), entry.message.clone()))
            .collect()
    }

    /// The sole survivor's summary, iff exactly one robot remains.
    #[must_use]
    pub fn winner(&self) -> Option<WinnerSummary> {
        if self.registry.len() != 1 {
            return None;
        }
        let (id, record) = self.registry.iter().next()?;
        Some(WinnerSummary {
            id: *id,
            name: record.name.clone(),
            icon: record.icon,
            color: record.color,
            territory: self.territory.values().filter(|c| c.owner == *id).count(),
        })
    }

    /// Immutable access to the behavior registry.
    #[must_use]
    pub fn behavior_registry(&self) -> &BehaviorRegistry {
        &self.behavior_registry
    }

    /// Mutable access to the behavior registry.
    #[must_use]
    pub fn behavior_registry_mut(&mut self) -> &mut BehaviorRegistry {
        &mut self.behavior_registry
    }

    /// Borrow the world RNG mutably for deterministic sampling.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Number of background command interpretations in flight.
    #[must_use]
    pub fn pending_commands(&self) -> usize {
        self.commands.pending_count()
    }

    /// Persist the working copies through the snapshot port outside the
    /// normal tick boundary. The next `step` reloads from the port, so
    /// direct record edits made between ticks are lost unless committed.
    pub fn commit(&mut self) -> Result<(), WorldError> {
        self.persist_all()
    }

    /// Abandon in-flight background work. Called on shutdown; pending
    /// tasks are not awaited.
    pub fn shutdown(&mut self) {
        self.commands.shutdown();
    }

    fn in_bounds(&self, at: Cell) -> bool {
        at.x >= 0 && at.x < self.width && at.y >= 0 && at.y < self.height
    }

    fn log_event(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        let line = format!("[t{}] {}", self.tick.0, message);
        info!(target: "terrarium::events", "{line}");
        if let Err(err) = self.port.append_event(self.tick, message) {
            warn!(error = %err, "event append failed");
        }
        self.events.push_back(line);
        while self.events.len() > self.config.event_log_capacity {
            self.events.pop_front();
        }
    }
}
