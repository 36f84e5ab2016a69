use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use terrarium_core::{
    Action, Behavior, BehaviorError, Cell, CommandInterpreter, DisplayColor, Neighbor, RobotId,
    RobotRecord, RobotSpec, RobotView, Tick, WorldConfig, WorldState, WorldView,
};

struct Scripted {
    steps: VecDeque<Vec<Action>>,
    encounter: Option<Action>,
}

impl Scripted {
    fn new(steps: Vec<Vec<Action>>) -> Self {
        Self {
            steps: steps.into(),
            encounter: None,
        }
    }

    fn with_encounter(mut self, action: Action) -> Self {
        self.encounter = Some(action);
        self
    }
}

impl Behavior for Scripted {
    fn kind(&self) -> &'static str {
        "test.scripted"
    }

    fn decide(
        &mut self,
        _me: &RobotView,
        _neighbors: &[Neighbor],
        _world: &WorldView,
    ) -> Result<Vec<Action>, BehaviorError> {
        Ok(self.steps.pop_front().unwrap_or_default())
    }

    fn on_encounter(
        &mut self,
        _other_name: &str,
        _other_icon: char,
    ) -> Result<Option<Action>, BehaviorError> {
        Ok(self.encounter.clone())
    }
}

struct Panicking;

impl Behavior for Panicking {
    fn kind(&self) -> &'static str {
        "test.panicking"
    }

    fn decide(
        &mut self,
        _me: &RobotView,
        _neighbors: &[Neighbor],
        _world: &WorldView,
    ) -> Result<Vec<Action>, BehaviorError> {
        panic!("scripted explosion");
    }
}

fn world_with_seed(seed: u64) -> WorldState {
    WorldState::new(WorldConfig {
        width: 12,
        height: 12,
        rng_seed: Some(seed),
        ..WorldConfig::default()
    })
    .expect("world")
}

fn join_at(world: &mut WorldState, name: &str, energy: i32, at: Cell) -> RobotId {
    world
        .add_robot(RobotSpec::new(name, DisplayColor::White, energy).at(at))
        .expect("join accepted")
}

#[test]
fn absorb_drains_at_least_one_energy_unit() {
    let mut world = world_with_seed(1);
    let x = join_at(&mut world, "X", 5, Cell::new(2, 2));
    let y = join_at(&mut world, "Y", 10, Cell::new(3, 2));
    world
        .set_behavior(x, Box::new(Scripted::new(vec![vec![Action::Absorb]])))
        .expect("bind");

    let report = world.step().expect("step");

    assert_eq!(report.battles, 1);
    assert_eq!(world.robot(x).map(|r| r.energy), Some(6));
    assert_eq!(world.robot(y).map(|r| r.energy), Some(9));
}

#[test]
fn siege_flips_fortified_ground_over_full_ticks() {
    let mut world = world_with_seed(2);
    let keeper = join_at(&mut world, "Keeper", 100, Cell::new(2, 2));
    let besieger = join_at(&mut world, "Besieger", 100, Cell::new(2, 0));

    // The keeper fortifies home for three ticks, then abandons it; the
    // besieger walks down and squats until the garrison falls.
    let south = Action::Move { dx: 0, dy: 1 };
    world
        .set_behavior(
            keeper,
            Box::new(Scripted::new(vec![
                vec![],
                vec![],
                vec![],
                vec![south.clone()],
            ])),
        )
        .expect("bind keeper");
    world
        .set_behavior(
            besieger,
            Box::new(Scripted::new(vec![
                vec![],
                vec![],
                vec![],
                vec![south.clone()],
                vec![south.clone()],
            ])),
        )
        .expect("bind besieger");

    for _ in 0..3 {
        world.step().expect("step");
    }
    assert_eq!(
        world.territory_at(Cell::new(2, 2)).map(|c| (c.owner, c.strength)),
        Some((keeper, 3)),
        "three stationary ticks fortify to strength 3"
    );

    // Tick 4: keeper steps off, besieger closes to (2,1).
    world.step().expect("step");
    // Tick 5: besieger arrives on the fortified cell; progress starts at 0.
    world.step().expect("step");
    let cell = world.territory_at(Cell::new(2, 2)).expect("cell");
    assert_eq!(cell.owner, keeper);
    assert_eq!(cell.siege_by, Some(besieger));
    assert_eq!(cell.siege_progress, 0);

    // Three stationary ticks raise progress to the strength threshold.
    world.step().expect("step");
    world.step().expect("step");
    let cell = world.territory_at(Cell::new(2, 2)).expect("cell");
    assert_eq!((cell.owner, cell.siege_progress), (keeper, 2));

    let report = world.step().expect("step");
    let cell = world.territory_at(Cell::new(2, 2)).expect("cell");
    assert_eq!(cell.owner, besieger, "ownership flips on the final siege tick");
    assert_eq!(cell.strength, 0);
    assert_eq!(report.captures, 1);
}

#[test]
fn lethal_battle_frees_icon_and_crowns_winner() {
    let mut world = world_with_seed(3);
    let predator = join_at(&mut world, "Pred", 50, Cell::new(2, 2));
    let prey = join_at(&mut world, "Prey", 3, Cell::new(3, 2));
    world
        .set_behavior(predator, Box::new(Scripted::new(vec![vec![Action::Absorb]])))
        .expect("bind");

    let report = world.step().expect("step");

    // 50 / 3 drains 16 at once; the prey is culled the same tick.
    assert_eq!(report.battles, 1);
    assert_eq!(report.deaths, 1);
    assert!(world.robot(prey).is_none());
    assert_eq!(world.robot(predator).map(|r| r.energy), Some(66));

    let winner = world.winner().expect("sole survivor");
    assert_eq!(winner.name, "Pred");
    assert!(winner.territory >= 1);

    // The freed icon is handed to the next joiner.
    let newcomer = world
        .add_robot(RobotSpec::new("Next", DisplayColor::Green, 10))
        .expect("join after death");
    assert!(world.robot(newcomer).is_some());
    assert!(world.winner().is_none());
}

#[test]
fn encounter_actions_feed_back_into_battle_resolution() {
    let mut world = world_with_seed(4);
    let biter = join_at(&mut world, "Biter", 10, Cell::new(5, 5));
    let bitten = join_at(&mut world, "Bitten", 10, Cell::new(5, 6));
    world
        .set_behavior(
            biter,
            Box::new(Scripted::new(vec![]).with_encounter(Action::Absorb)),
        )
        .expect("bind");

    let report = world.step().expect("step");

    assert_eq!(report.battles, 1, "absorb intents from encounters resolve this tick");
    assert_eq!(world.robot(biter).map(|r| r.energy), Some(11));
    assert_eq!(world.robot(bitten).map(|r| r.energy), Some(9));
}

#[test]
fn panicking_behavior_never_stalls_the_tick() {
    let mut world = world_with_seed(5);
    let bomb = join_at(&mut world, "Bomb", 10, Cell::new(1, 1));
    let mover = join_at(&mut world, "Mover", 10, Cell::new(8, 8));
    world.set_behavior(bomb, Box::new(Panicking)).expect("bind");
    world
        .set_behavior(
            mover,
            Box::new(Scripted::new(vec![
                vec![Action::Move { dx: 1, dy: 0 }],
                vec![Action::Move { dx: 1, dy: 0 }],
            ])),
        )
        .expect("bind");

    for _ in 0..2 {
        world.step().expect("step survives the panic");
    }

    assert_eq!(world.robot(mover).map(|r| r.pos), Some(Cell::new(10, 8)));
    let bomb_record = world.robot(bomb).expect("still alive");
    assert_eq!(bomb_record.energy, 10, "failures carry no penalty");
    assert_eq!(bomb_record.age, 2, "age still advances");
}

#[test]
fn identical_seeds_replay_identically() {
    fn scripted_world(seed: u64) -> WorldState {
        let mut world = world_with_seed(seed);
        // Random spawn cells exercise the seeded RNG.
        let a = world
            .add_robot(RobotSpec::new("A", DisplayColor::Red, 40))
            .expect("join");
        let b = world
            .add_robot(RobotSpec::new("B", DisplayColor::Blue, 40))
            .expect("join");
        world
            .set_behavior(
                a,
                Box::new(Scripted::new(vec![
                    vec![Action::Move { dx: 1, dy: 0 }],
                    vec![Action::Move { dx: 0, dy: 1 }],
                    vec![Action::PlaceMarker("a".into())],
                ])),
            )
            .expect("bind");
        world
            .set_behavior(
                b,
                Box::new(Scripted::new(vec![
                    vec![Action::Move { dx: -1, dy: 0 }],
                    vec![Action::Say("marching".into())],
                    vec![Action::Move { dx: 0, dy: -1 }],
                ])),
            )
            .expect("bind");
        for _ in 0..6 {
            world.step().expect("step");
        }
        world
    }

    let first = scripted_world(99);
    let second = scripted_world(99);

    let snapshot = |world: &WorldState| -> Vec<(RobotId, RobotRecord)> {
        world.robots().map(|(id, r)| (id, r.clone())).collect()
    };
    assert_eq!(snapshot(&first), snapshot(&second));
    let territory = |world: &WorldState| -> Vec<_> {
        world
            .territory_cells()
            .map(|(at, c)| (at, c.owner, c.strength))
            .collect::<Vec<_>>()
    };
    assert_eq!(territory(&first), territory(&second));
}

struct SlowInterpreter;

impl CommandInterpreter for SlowInterpreter {
    fn interpret(&self, _robot_name: &str, _instruction: &str) -> Result<Vec<Action>, BehaviorError> {
        thread::sleep(Duration::from_millis(120));
        Ok(vec![Action::Move { dx: 1, dy: 0 }])
    }
}

#[test]
fn slow_commands_miss_the_current_tick_and_land_later() {
    let mut world = world_with_seed(6);
    let id = join_at(&mut world, "Patient", 20, Cell::new(4, 4));
    world.set_interpreter(Arc::new(SlowInterpreter));
    world.issue_command(id, "advance").expect("command accepted");

    world.step().expect("step");
    assert_eq!(
        world.robot(id).map(|r| r.pos),
        Some(Cell::new(4, 4)),
        "interpretation is still running, so this tick sees no result"
    );

    for _ in 0..500 {
        if world.pending_commands() == 0 {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }
    world.step().expect("step");
    assert_eq!(
        world.robot(id).map(|r| r.pos),
        Some(Cell::new(5, 4)),
        "the completed command applies on the next tick"
    );
}

#[test]
fn tick_counter_is_strictly_sequential() {
    let mut world = world_with_seed(7);
    join_at(&mut world, "Lone", 10, Cell::new(6, 6));
    for expected in 1..=5u64 {
        let report = world.step().expect("step");
        assert_eq!(report.tick, Tick(expected));
        assert_eq!(world.tick(), Tick(expected));
    }
}
