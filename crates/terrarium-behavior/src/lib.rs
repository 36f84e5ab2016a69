//! Built-in heuristic behaviors for Terrarium robots, plus the keyword
//! command interpreter. Everything here lives behind the core engine's
//! `Behavior` and `CommandInterpreter` contracts; the engine never
//! depends on this crate.

use rand::{Rng, RngCore, SeedableRng, rngs::SmallRng};
use std::cmp::Ordering;
use terrarium_core::{
    Action, Behavior, BehaviorError, BehaviorRegistry, CommandInterpreter, Compass, Neighbor,
    RobotView, TerritoryView, WorldView,
};

const CARDINALS: [(i32, i32); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];

/// Direction toward the nearest unclaimed cell in the viewing window,
/// or `None` when everything nearby is claimed.
#[must_use]
pub fn explore_direction(me: &RobotView, territory: &TerritoryView) -> Option<(i32, i32)> {
    let target = territory
        .nearby
        .iter()
        .filter(|c| c.unclaimed)
        .min_by_key(|c| (c.at.x - me.x).abs() + (c.at.y - me.y).abs())?;
    Some(step_toward(me, target.at.x, target.at.y))
}

/// Direction toward the nearest rival-owned cell, or `None`.
#[must_use]
pub fn reclaim_direction(me: &RobotView, territory: &TerritoryView) -> Option<(i32, i32)> {
    let target = territory
        .nearby
        .iter()
        .filter(|c| !c.unclaimed && !c.mine)
        .min_by_key(|c| (c.at.x - me.x).abs() + (c.at.y - me.y).abs())?;
    Some(step_toward(me, target.at.x, target.at.y))
}

/// Direction toward one of our own cells that borders rival territory,
/// or `None` when no frontier exists in the window.
#[must_use]
pub fn patrol_direction(me: &RobotView, territory: &TerritoryView) -> Option<(i32, i32)> {
    let rivals: Vec<(i32, i32)> = territory
        .nearby
        .iter()
        .filter(|c| !c.unclaimed && !c.mine)
        .map(|c| (c.at.x, c.at.y))
        .collect();
    let target = territory
        .nearby
        .iter()
        .filter(|c| c.mine)
        .filter(|c| {
            CARDINALS
                .iter()
                .any(|(dx, dy)| rivals.contains(&(c.at.x + dx, c.at.y + dy)))
        })
        .min_by_key(|c| (c.at.x - me.x).abs() + (c.at.y - me.y).abs())?;
    Some(step_toward(me, target.at.x, target.at.y))
}

/// Blended explore/protect direction. Protection bias grows with
/// coverage so large empires patrol more than they sprawl. Always
/// returns a step.
pub fn suggest_move(
    rng: &mut dyn RngCore,
    me: &RobotView,
    territory: &TerritoryView,
    protect_weight: f64,
) -> (i32, i32) {
    let total = territory.total_cells.max(1);
    let coverage = territory.owned as f64 / total as f64;
    let effective_protect = protect_weight + coverage * 0.5;

    if rng.random::<f64>() < effective_protect {
        if let Some(dir) = patrol_direction(me, territory).or_else(|| reclaim_direction(me, territory))
        {
            return dir;
        }
    }
    if let Some(dir) = explore_direction(me, territory) {
        return dir;
    }
    CARDINALS[rng.random_range(0..CARDINALS.len())]
}

fn step_toward(me: &RobotView, x: i32, y: i32) -> (i32, i32) {
    ((x - me.x).clamp(-1, 1), (y - me.y).clamp(-1, 1))
}

fn nearest_neighbor(neighbors: &[Neighbor]) -> Option<&Neighbor> {
    neighbors.iter().min_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(Ordering::Equal)
    })
}

/// Aimless drifter: one random cardinal step per tick, with the
/// occasional trail marker. Rests when energy runs low.
pub struct Wanderer {
    rng: SmallRng,
}

impl Wanderer {
    #[must_use]
    pub fn new(rng: &mut dyn RngCore) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(rng.next_u64()),
        }
    }
}

impl Behavior for Wanderer {
    fn kind(&self) -> &'static str {
        "wanderer"
    }

    fn decide(
        &mut self,
        me: &RobotView,
        _neighbors: &[Neighbor],
        _world: &WorldView,
    ) -> Result<Vec<Action>, BehaviorError> {
        if me.energy < 3 {
            // Sitting still costs nothing and fortifies home ground.
            return Ok(Vec::new());
        }
        let (dx, dy) = CARDINALS[self.rng.random_range(0..CARDINALS.len())];
        let mut actions = vec![Action::Move { dx, dy }];
        if me.age.is_multiple_of(12) {
            actions.push(Action::PlaceMarker(".".into()));
        }
        Ok(actions)
    }
}

/// Territory farmer: expands toward unclaimed ground while coverage is
/// thin, then alternates patrols with fortification sits.
pub struct Homesteader {
    rng: SmallRng,
    protect_weight: f64,
}

impl Homesteader {
    #[must_use]
    pub fn new(rng: &mut dyn RngCore) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(rng.next_u64()),
            protect_weight: 0.3,
        }
    }
}

impl Behavior for Homesteader {
    fn kind(&self) -> &'static str {
        "homesteader"
    }

    fn decide(
        &mut self,
        me: &RobotView,
        _neighbors: &[Neighbor],
        world: &WorldView,
    ) -> Result<Vec<Action>, BehaviorError> {
        if me.energy < 3 {
            return Ok(Vec::new());
        }
        // Every fourth tick stay put so the current cell gains strength.
        if world.tick.0.is_multiple_of(4) {
            return Ok(Vec::new());
        }
        let (dx, dy) = suggest_move(&mut self.rng, me, &world.territory, self.protect_weight);
        let mut actions = vec![Action::Move { dx, dy }];
        if me.age.is_multiple_of(16) {
            actions.push(Action::PlaceMarker("#".into()));
        }
        Ok(actions)
    }

    fn on_encounter(
        &mut self,
        other_name: &str,
        _other_icon: char,
    ) -> Result<Option<Action>, BehaviorError> {
        Ok(Some(Action::Say(format!(
            "This land is spoken for, {other_name}"
        ))))
    }
}

/// Aggressor: closes on the nearest visible robot and drains it when
/// adjacent; falls back to harrying rival territory.
pub struct Raider {
    rng: SmallRng,
}

impl Raider {
    #[must_use]
    pub fn new(rng: &mut dyn RngCore) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(rng.next_u64()),
        }
    }
}

impl Behavior for Raider {
    fn kind(&self) -> &'static str {
        "raider"
    }

    fn decide(
        &mut self,
        me: &RobotView,
        neighbors: &[Neighbor],
        world: &WorldView,
    ) -> Result<Vec<Action>, BehaviorError> {
        if me.energy < 2 {
            return Ok(Vec::new());
        }
        if let Some(prey) = nearest_neighbor(neighbors) {
            if prey.distance <= 1.5 {
                return Ok(vec![Action::Absorb]);
            }
            let (dx, dy) = prey.direction.delta();
            return Ok(vec![Action::Move { dx, dy }]);
        }
        let (dx, dy) = reclaim_direction(me, &world.territory)
            .unwrap_or_else(|| CARDINALS[self.rng.random_range(0..CARDINALS.len())]);
        Ok(vec![Action::Move { dx, dy }])
    }

    fn on_encounter(
        &mut self,
        _other_name: &str,
        _other_icon: char,
    ) -> Result<Option<Action>, BehaviorError> {
        Ok(Some(Action::Absorb))
    }
}

/// Registry keys for the built-in behavior set.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinBehaviors {
    pub wanderer: u64,
    pub homesteader: u64,
    pub raider: u64,
}

/// Register every built-in behavior factory.
pub fn register_builtins(registry: &mut BehaviorRegistry) -> BuiltinBehaviors {
    BuiltinBehaviors {
        wanderer: registry.register("wanderer", |rng| Box::new(Wanderer::new(rng))),
        homesteader: registry.register("homesteader", |rng| Box::new(Homesteader::new(rng))),
        raider: registry.register("raider", |rng| Box::new(Raider::new(rng))),
    }
}

/// Plain-keyword command interpreter: the built-in stand-in for
/// whatever slow external service an embedder wires up instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordInterpreter;

impl KeywordInterpreter {
    fn direction(token: &str) -> Option<Compass> {
        match token {
            "north" | "up" => Some(Compass::North),
            "south" | "down" => Some(Compass::South),
            "east" | "right" => Some(Compass::East),
            "west" | "left" => Some(Compass::West),
            _ => None,
        }
    }
}

impl CommandInterpreter for KeywordInterpreter {
    fn interpret(&self, _robot_name: &str, instruction: &str) -> Result<Vec<Action>, BehaviorError> {
        let trimmed = instruction.trim();
        let lowered = trimmed.to_lowercase();
        let mut words = lowered.split_whitespace();

        match words.next() {
            Some("move") | Some("go") => {
                let Some(direction) = words.next().and_then(Self::direction) else {
                    return Err(format!("move needs a direction: {trimmed}").into());
                };
                let steps = words
                    .next()
                    .and_then(|w| w.parse::<usize>().ok())
                    .unwrap_or(1)
                    .clamp(1, 5);
                let (dx, dy) = direction.delta();
                Ok(vec![Action::Move { dx, dy }; steps])
            }
            Some("say") => {
                let rest = trimmed
                    .splitn(2, char::is_whitespace)
                    .nth(1)
                    .unwrap_or("")
                    .trim();
                if rest.is_empty() {
                    return Err("say needs a message".into());
                }
                Ok(vec![Action::Say(rest.to_string())])
            }
            Some("mark") => {
                let symbol = words.next().unwrap_or(".");
                Ok(vec![Action::PlaceMarker(symbol.to_string())])
            }
            Some("absorb") | Some("attack") => Ok(vec![Action::Absorb]),
            Some("hold") | Some("stay") | Some("guard") => Ok(Vec::new()),
            _ => Err(format!("unrecognized instruction: {trimmed}").into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use terrarium_core::{Cell, NearbyTerritory, Tick};

    fn view_at(x: i32, y: i32) -> RobotView {
        RobotView {
            x,
            y,
            energy: 50,
            age: 1,
        }
    }

    fn territory(cells: Vec<NearbyTerritory>, owned: usize) -> TerritoryView {
        TerritoryView {
            nearby: cells,
            owned,
            total_cells: 100,
            counts: Default::default(),
        }
    }

    fn cell(x: i32, y: i32, owner: Option<&str>, mine: bool) -> NearbyTerritory {
        NearbyTerritory {
            at: Cell::new(x, y),
            owner: owner.map(str::to_string),
            strength: 0,
            mine,
            unclaimed: owner.is_none(),
        }
    }

    fn world(territory: TerritoryView) -> WorldView {
        WorldView {
            width: 10,
            height: 10,
            tick: Tick(1),
            markers: Vec::new(),
            territory,
            broadcasts: Default::default(),
        }
    }

    #[test]
    fn explore_heads_for_the_nearest_unclaimed_cell() {
        let me = view_at(5, 5);
        let t = territory(
            vec![
                cell(9, 9, None, false),
                cell(6, 5, None, false),
                cell(5, 5, Some("Me"), true),
            ],
            1,
        );
        assert_eq!(explore_direction(&me, &t), Some((1, 0)));
    }

    #[test]
    fn explore_returns_none_when_everything_is_claimed() {
        let me = view_at(5, 5);
        let t = territory(vec![cell(5, 5, Some("Me"), true)], 1);
        assert_eq!(explore_direction(&me, &t), None);
    }

    #[test]
    fn reclaim_targets_rival_ground_only() {
        let me = view_at(5, 5);
        let t = territory(
            vec![
                cell(5, 5, Some("Me"), true),
                cell(5, 3, Some("Rival"), false),
                cell(7, 7, None, false),
            ],
            1,
        );
        assert_eq!(reclaim_direction(&me, &t), Some((0, -1)));
    }

    #[test]
    fn patrol_finds_the_contested_border() {
        let me = view_at(2, 2);
        let t = territory(
            vec![
                cell(4, 2, Some("Me"), true),
                cell(5, 2, Some("Rival"), false),
                cell(2, 2, Some("Me"), true),
            ],
            2,
        );
        // (4,2) is ours and borders the rival cell at (5,2).
        assert_eq!(patrol_direction(&me, &t), Some((1, 0)));
    }

    #[test]
    fn suggest_move_always_steps() {
        let mut rng = SmallRng::seed_from_u64(11);
        let me = view_at(5, 5);
        let t = territory(Vec::new(), 0);
        for _ in 0..16 {
            let (dx, dy) = suggest_move(&mut rng, &me, &t, 0.3);
            assert!(CARDINALS.contains(&(dx, dy)));
        }
    }

    #[test]
    fn wanderer_steps_one_cardinal_per_tick() {
        let mut seed = SmallRng::seed_from_u64(3);
        let mut wanderer = Wanderer::new(&mut seed);
        let actions = wanderer
            .decide(&view_at(5, 5), &[], &world(territory(Vec::new(), 0)))
            .expect("decide");
        match actions.first() {
            Some(Action::Move { dx, dy }) => assert!(CARDINALS.contains(&(*dx, *dy))),
            other => panic!("expected a move, got {other:?}"),
        }
    }

    #[test]
    fn exhausted_wanderer_rests() {
        let mut seed = SmallRng::seed_from_u64(3);
        let mut wanderer = Wanderer::new(&mut seed);
        let mut me = view_at(5, 5);
        me.energy = 1;
        let actions = wanderer
            .decide(&me, &[], &world(territory(Vec::new(), 0)))
            .expect("decide");
        assert!(actions.is_empty());
    }

    #[test]
    fn raider_absorbs_adjacent_prey() {
        let mut seed = SmallRng::seed_from_u64(5);
        let mut raider = Raider::new(&mut seed);
        let prey = Neighbor {
            name: "Prey".into(),
            icon: 'p',
            distance: 1.0,
            direction: Compass::East,
        };
        let actions = raider
            .decide(&view_at(5, 5), &[prey], &world(territory(Vec::new(), 0)))
            .expect("decide");
        assert_eq!(actions, vec![Action::Absorb]);
    }

    #[test]
    fn raider_closes_distance_first() {
        let mut seed = SmallRng::seed_from_u64(5);
        let mut raider = Raider::new(&mut seed);
        let prey = Neighbor {
            name: "Prey".into(),
            icon: 'p',
            distance: 4.0,
            direction: Compass::South,
        };
        let actions = raider
            .decide(&view_at(5, 5), &[prey], &world(territory(Vec::new(), 0)))
            .expect("decide");
        assert_eq!(actions, vec![Action::Move { dx: 0, dy: 1 }]);
    }

    #[test]
    fn keyword_interpreter_parses_core_verbs() {
        let interp = KeywordInterpreter;
        assert_eq!(
            interp.interpret("R", "move north").expect("move"),
            vec![Action::Move { dx: 0, dy: -1 }]
        );
        assert_eq!(
            interp.interpret("R", "go east 3").expect("repeat"),
            vec![Action::Move { dx: 1, dy: 0 }; 3]
        );
        assert_eq!(
            interp.interpret("R", "say Follow Me").expect("say"),
            vec![Action::Say("Follow Me".into())]
        );
        assert_eq!(
            interp.interpret("R", "mark x").expect("mark"),
            vec![Action::PlaceMarker("x".into())]
        );
        assert_eq!(interp.interpret("R", "attack").expect("attack"), vec![Action::Absorb]);
        assert!(interp.interpret("R", "hold").expect("hold").is_empty());
    }

    #[test]
    fn keyword_interpreter_rejects_nonsense() {
        let interp = KeywordInterpreter;
        assert!(interp.interpret("R", "transmogrify").is_err());
        assert!(interp.interpret("R", "move sideways").is_err());
        assert!(interp.interpret("R", "say").is_err());
    }
}
