//! The move alphabet: faces, turn amounts, the seven allowed face sets, and
//! the two metrics.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// A turnable face. `U` is the last layer; the other five are the side faces
/// around it, listed counterclockwise when looking down at `U`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Face {
    U,
    F,
    R,
    BR,
    BL,
    L,
}

/// A turn amount in fifths of a revolution, clockwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Amount {
    Clockwise = 1,
    DoubleClockwise = 2,
    DoubleCounterclockwise = 3,
    Counterclockwise = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Move {
    pub face: Face,
    pub amount: Amount,
}

/// Which faces may be turned. `R` and `U` are always available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AllowedFaceSet {
    RU,
    RUF,
    RUL,
    RUBR,
    RUFL,
    RUFBR,
    RUFLBR,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Metric {
    /// Every turn costs one, whatever its amount
    Ftm,
    /// A turn costs the number of fifth turns it is made of
    Qtm,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseMoveError {
    #[error("Unknown face `{0}`")]
    UnknownFace(String),
    #[error("Unknown move `{0}`")]
    UnknownMove(String),
    #[error("Unknown face set `{0}`")]
    UnknownFaceSet(String),
    #[error("Unknown metric `{0}`")]
    UnknownMetric(String),
}

impl Face {
    pub const ALL: [Face; 6] = [Face::U, Face::F, Face::R, Face::BR, Face::BL, Face::L];

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// The position of a side face in the ring around `U`, starting at `F`.
    #[must_use]
    pub fn ring_index(self) -> Option<usize> {
        match self {
            Face::U => None,
            side => Some(side.index() - 1),
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Face::U => "U",
            Face::F => "F",
            Face::R => "R",
            Face::BR => "BR",
            Face::BL => "BL",
            Face::L => "L",
        }
    }
}

impl FromStr for Face {
    type Err = ParseMoveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Face::ALL
            .into_iter()
            .find(|face| face.name() == s)
            .ok_or_else(|| ParseMoveError::UnknownFace(s.to_owned()))
    }
}

impl Amount {
    /// Amounts in the order every face contributes its moves to a move set.
    pub const ALL: [Amount; 4] = [
        Amount::Clockwise,
        Amount::Counterclockwise,
        Amount::DoubleClockwise,
        Amount::DoubleCounterclockwise,
    ];

    #[must_use]
    pub fn fifths(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Amount::Clockwise => Amount::Counterclockwise,
            Amount::DoubleClockwise => Amount::DoubleCounterclockwise,
            Amount::DoubleCounterclockwise => Amount::DoubleClockwise,
            Amount::Counterclockwise => Amount::Clockwise,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Amount::Clockwise => "",
            Amount::Counterclockwise => "'",
            Amount::DoubleClockwise => "2",
            Amount::DoubleCounterclockwise => "2'",
        }
    }
}

impl Move {
    #[must_use]
    pub fn new(face: Face, amount: Amount) -> Self {
        Self { face, amount }
    }

    /// A dense index over all 24 moves, face-major in `Amount::ALL` order.
    #[must_use]
    pub fn index(self) -> usize {
        let amount_index = match self.amount {
            Amount::Clockwise => 0,
            Amount::Counterclockwise => 1,
            Amount::DoubleClockwise => 2,
            Amount::DoubleCounterclockwise => 3,
        };
        self.face.index() * 4 + amount_index
    }

    #[must_use]
    pub fn inverse(self) -> Self {
        Self::new(self.face, self.amount.inverse())
    }

    #[must_use]
    pub fn cost(self, metric: Metric) -> u32 {
        match metric {
            Metric::Ftm => 1,
            Metric::Qtm => {
                let fifths = u32::from(self.amount.fifths());
                fifths.min(5 - fifths)
            }
        }
    }
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.face.name(), self.amount.suffix())
    }
}

impl FromStr for Move {
    type Err = ParseMoveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (face, amount) = if let Some(rest) = s.strip_suffix("2'") {
            (rest, Amount::DoubleCounterclockwise)
        } else if let Some(rest) = s.strip_suffix('\'') {
            (rest, Amount::Counterclockwise)
        } else if let Some(rest) = s.strip_suffix('2') {
            (rest, Amount::DoubleClockwise)
        } else {
            (s, Amount::Clockwise)
        };
        let face = face
            .parse()
            .map_err(|_| ParseMoveError::UnknownMove(s.to_owned()))?;
        Ok(Move::new(face, amount))
    }
}

/// Parse a whitespace separated move sequence such as `R U2' R' U'`.
///
/// # Errors
///
/// Fails on the first token that is not a move.
pub fn parse_algorithm(algorithm: &str) -> Result<Vec<Move>, ParseMoveError> {
    algorithm.split_whitespace().map(str::parse).collect()
}

/// Format a move sequence the way `parse_algorithm` reads it.
#[must_use]
pub fn format_algorithm(moves: &[Move]) -> String {
    moves.iter().join(" ")
}

impl AllowedFaceSet {
    pub const ALL: [AllowedFaceSet; 7] = [
        AllowedFaceSet::RU,
        AllowedFaceSet::RUF,
        AllowedFaceSet::RUL,
        AllowedFaceSet::RUBR,
        AllowedFaceSet::RUFL,
        AllowedFaceSet::RUFBR,
        AllowedFaceSet::RUFLBR,
    ];

    /// The faces of this set in their fixed generation order.
    #[must_use]
    pub fn faces(self) -> &'static [Face] {
        match self {
            AllowedFaceSet::RU => &[Face::R, Face::U],
            AllowedFaceSet::RUF => &[Face::R, Face::U, Face::F],
            AllowedFaceSet::RUL => &[Face::R, Face::U, Face::L],
            AllowedFaceSet::RUBR => &[Face::R, Face::U, Face::BR],
            AllowedFaceSet::RUFL => &[Face::R, Face::U, Face::F, Face::L],
            AllowedFaceSet::RUFBR => &[Face::R, Face::U, Face::F, Face::BR],
            AllowedFaceSet::RUFLBR => &[Face::R, Face::U, Face::F, Face::L, Face::BR],
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            AllowedFaceSet::RU => "RU",
            AllowedFaceSet::RUF => "RUF",
            AllowedFaceSet::RUL => "RUL",
            AllowedFaceSet::RUBR => "RUBR",
            AllowedFaceSet::RUFL => "RUFL",
            AllowedFaceSet::RUFBR => "RUFBR",
            AllowedFaceSet::RUFLBR => "RUFLBR",
        }
    }
}

impl fmt::Display for AllowedFaceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AllowedFaceSet {
    type Err = ParseMoveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AllowedFaceSet::ALL
            .into_iter()
            .find(|faces| faces.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseMoveError::UnknownFaceSet(s.to_owned()))
    }
}

impl Metric {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Metric::Ftm => "FTM",
            Metric::Qtm => "QTM",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = ParseMoveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Metric::Ftm, Metric::Qtm]
            .into_iter()
            .find(|metric| metric.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseMoveError::UnknownMetric(s.to_owned()))
    }
}

/// The legal moves of one allowed face set, in their fixed order: faces in
/// the set's order, each contributing `X X' X2 X2'`.
#[derive(Debug, Clone)]
pub struct MoveSet {
    allowed_faces: AllowedFaceSet,
    moves: Vec<Move>,
}

impl MoveSet {
    #[must_use]
    pub fn moves_for(allowed_faces: AllowedFaceSet) -> Self {
        let moves = allowed_faces
            .faces()
            .iter()
            .flat_map(|&face| Amount::ALL.map(|amount| Move::new(face, amount)))
            .collect();
        Self {
            allowed_faces,
            moves,
        }
    }

    #[must_use]
    pub fn allowed_faces(&self) -> AllowedFaceSet {
        self.allowed_faces
    }

    #[must_use]
    pub fn moves(&self) -> &[Move] {
        &self.moves
    }

    /// The position of a move's face within the allowed face set.
    #[must_use]
    pub fn face_class(&self, face: Face) -> Option<usize> {
        self.allowed_faces.faces().iter().position(|&f| f == face)
    }

    /// The unit steps of a breadth first search under `metric`. Under QTM a
    /// double turn is two steps, so only the single turns are generators.
    #[must_use]
    pub fn bfs_generators(&self, metric: Metric) -> Vec<Move> {
        self.moves
            .iter()
            .copied()
            .filter(|&move_| metric == Metric::Ftm || move_.cost(Metric::Qtm) == 1)
            .collect()
    }
}
