//! A movecount coefficient for Megaminx algorithms, in the spirit of the
//! [Movecount Coefficient Calculator](https://trangium.github.io/MovecountCoefficient/).
//!
//! The score estimates execution time in units of one index finger flick.
//! Both hands hold the puzzle with `U` on top and `F` facing the solver. `R`
//! and `L` are wrist turns, `U` is flicked by an index finger, `F` is pushed
//! by an index finger, and `BR` and `BL` are turned by the ring fingers.

#![warn(clippy::pedantic)]

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unknown move `{0}`")]
    UnknownMove(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Face {
    U,
    F,
    R,
    BR,
    BL,
    L,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Turn {
    face: Face,
    clockwise: bool,
    double: bool,
}

impl Turn {
    fn parse(token: &str) -> Option<Self> {
        let split = token.find(['2', '\'']).unwrap_or(token.len());
        let (face, suffix) = token.split_at(split);
        let face = match face {
            "U" => Face::U,
            "F" => Face::F,
            "R" => Face::R,
            "BR" => Face::BR,
            "BL" => Face::BL,
            "L" => Face::L,
            _ => return None,
        };
        let (clockwise, double) = match suffix {
            "" => (true, false),
            "'" => (false, false),
            "2" => (true, true),
            "2'" => (false, true),
            _ => return None,
        };
        Some(Self {
            face,
            clockwise,
            double,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Location {
    Home,
    UFlick,
    Push,
    Ring,
}

#[derive(Debug, Clone)]
struct Finger {
    last_move_time: f64,
    location: Location,
}

impl Finger {
    fn new() -> Self {
        Self {
            last_move_time: -1.0,
            location: Location::Home,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hand {
    Left,
    Right,
}

#[derive(Debug)]
struct HandState {
    index: Finger,
    middle: Finger,
    ring: Finger,
    wrist: i8,
}

impl HandState {
    fn new(wrist: i8) -> Self {
        Self {
            index: Finger::new(),
            middle: Finger::new(),
            ring: Finger::new(),
            wrist,
        }
    }

    fn max_finger_time(&self) -> f64 {
        self.index
            .last_move_time
            .max(self.middle.last_move_time.max(self.ring.last_move_time))
    }

    fn rest_fingers(&mut self) {
        for finger in [&mut self.index, &mut self.middle, &mut self.ring] {
            finger.location = Location::Home;
        }
    }
}

/// Weights of the execution model.
#[derive(Debug, Clone)]
pub struct AlgSpeedConfig {
    /// Skip tokens that are not moves instead of failing.
    pub ignore_errors: bool,
    /// Drop `U` turns at either end of the algorithm.
    pub ignore_auf: bool,
    pub wrist_mult: f64,
    pub push_mult: f64,
    pub ring_mult: f64,
    /// Added to finger moves made while the wrist is off its home grip.
    pub destabilize: f64,
    pub add_regrip: f64,
    /// Multiplier for double turns.
    pub double: f64,
    /// Recovery time a finger needs before it can be used again.
    pub over_work_mult: f64,
    /// Added to a finger move right after a wrist turn of the same hand.
    pub move_block: f64,
}

impl Default for AlgSpeedConfig {
    fn default() -> Self {
        Self {
            ignore_errors: false,
            ignore_auf: false,
            wrist_mult: 0.8,
            push_mult: 1.3,
            ring_mult: 1.4,
            destabilize: 0.5,
            add_regrip: 1.0,
            double: 1.65,
            over_work_mult: 2.25,
            move_block: 0.8,
        }
    }
}

#[derive(Debug, Default)]
pub struct AlgSpeed {
    config: AlgSpeedConfig,
}

#[derive(Debug)]
struct TestResult {
    speed: f64,
    left_time: f64,
    right_time: f64,
}

impl TestResult {
    fn total(&self) -> f64 {
        self.speed.max(self.left_time).max(self.right_time)
    }
}

impl AlgSpeed {
    #[must_use]
    pub fn new(config: AlgSpeedConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &AlgSpeedConfig {
        &self.config
    }

    /// Score a whitespace separated algorithm such as `R U R' U'`. Lower is
    /// faster.
    ///
    /// # Errors
    ///
    /// Fails on an unknown move unless `ignore_errors` is set.
    pub fn evaluate(&self, sequence: &str) -> Result<f64, ParseError> {
        let mut turns = vec![];
        for token in sequence.split_whitespace() {
            match Turn::parse(token) {
                Some(turn) => turns.push(turn),
                None if self.config.ignore_errors => {}
                None => return Err(ParseError::UnknownMove(token.to_owned())),
            }
        }

        if self.config.ignore_auf {
            if turns.first().is_some_and(|turn| turn.face == Face::U) {
                turns.remove(0);
            }
            if turns.last().is_some_and(|turn| turn.face == Face::U) {
                turns.pop();
            }
        }

        if turns.is_empty() {
            return Ok(0.0);
        }

        let regripped = 1.0 + self.config.add_regrip;
        let initial_tests = [
            self.test_sequence(&turns, 0, 0, 0.0),
            self.test_sequence(&turns, 0, -1, regripped),
            self.test_sequence(&turns, 0, 1, regripped),
            self.test_sequence(&turns, -1, 0, regripped),
            self.test_sequence(&turns, 1, 0, regripped),
        ];

        Ok(initial_tests
            .iter()
            .map(TestResult::total)
            .min_by(f64::total_cmp)
            .unwrap_or(0.0))
    }

    fn calc_overwork(
        &self,
        finger: &Finger,
        location_prefer: Location,
        penalty: f64,
        speed: f64,
    ) -> f64 {
        if finger.location != location_prefer && speed - finger.last_move_time < penalty {
            penalty - speed + finger.last_move_time
        } else {
            0.0
        }
    }

    fn test_sequence(&self, sequence: &[Turn], l_grip: i8, r_grip: i8, initial_speed: f64) -> TestResult {
        let mut left = HandState::new(l_grip);
        let mut right = HandState::new(r_grip);
        let mut speed = initial_speed;
        let mut last_wrist: Option<Hand> = None;

        for turn in sequence {
            let amount_mult = if turn.double { self.config.double } else { 1.0 };
            match turn.face {
                Face::R | Face::L => {
                    let hand = if turn.face == Face::R { Hand::Right } else { Hand::Left };
                    let state = match hand {
                        Hand::Left => &mut left,
                        Hand::Right => &mut right,
                    };
                    speed = speed.max(state.max_finger_time());
                    let step = match (turn.clockwise, turn.double) {
                        (true, false) => 1,
                        (true, true) => 2,
                        (false, false) => -1,
                        (false, true) => -2,
                    };
                    if (state.wrist + step).abs() > 2 {
                        speed += self.config.add_regrip;
                        state.wrist = 0;
                    }
                    state.wrist += step;
                    state.rest_fingers();
                    speed += self.config.wrist_mult * amount_mult;
                    last_wrist = Some(hand);
                }
                Face::U | Face::F | Face::BR | Face::BL => {
                    let (hand, location, mult) = match (turn.face, turn.clockwise) {
                        (Face::U, true) => (Hand::Right, Location::UFlick, 1.0),
                        (Face::U, false) => (Hand::Left, Location::UFlick, 1.0),
                        (Face::F, true) => (Hand::Left, Location::Push, self.config.push_mult),
                        (Face::F, false) => (Hand::Right, Location::Push, self.config.push_mult),
                        (Face::BR, _) => (Hand::Right, Location::Ring, self.config.ring_mult),
                        _ => (Hand::Left, Location::Ring, self.config.ring_mult),
                    };
                    let state = match hand {
                        Hand::Left => &mut left,
                        Hand::Right => &mut right,
                    };
                    let mut cost = mult * amount_mult;
                    if state.wrist != 0 {
                        cost += self.config.destabilize;
                    }
                    if last_wrist == Some(hand) {
                        cost += self.config.move_block;
                    }
                    let finger = if location == Location::Ring {
                        &mut state.ring
                    } else {
                        &mut state.index
                    };
                    speed += self.calc_overwork(finger, Location::Home, self.config.over_work_mult, speed);
                    speed += cost;
                    finger.location = location;
                    finger.last_move_time = speed;
                    // Double flicks follow through with the middle finger
                    if turn.double && location == Location::UFlick {
                        state.middle.location = location;
                        state.middle.last_move_time = speed;
                    }
                    last_wrist = None;
                }
            }
        }

        TestResult {
            speed,
            left_time: left.max_finger_time(),
            right_time: right.max_finger_time(),
        }
    }
}
