//! Megaminx pieces reachable from the last layer and how face turns move them.
//!
//! Facets of the dodecahedron are numbered `0` for `U`, `1..=5` for the side
//! faces around it (`F R BR BL L`, so a side face's facet number equals its
//! [`Face::index`]), and `6..=10` for the lower ring, where lower facet `j`
//! sits between side faces `j` and `j + 1`. Only the six turnable faces
//! matter; every piece they can touch lives in one of 15 corner slots and 20
//! edge slots.
//!
//! Corner slots, each listed with its facets in clockwise order:
//! - `0..5`: last layer corner `i` at `(U, side i+1, side i)`
//! - `5..10`: middle corner `(side i, side i+1, lower i)`
//! - `10..15`: bottom corner `(side i, lower i, lower i-1)`
//!
//! Edge slots:
//! - `0..5`: last layer edge `(U, side i)`
//! - `5..10`: vertical edge `(side i, side i+1)`
//! - `10..15`: lower edge `(side i, lower i)`
//! - `15..20`: lower edge `(side i, lower i-1)`
//!
//! The orientation of a piece in a slot is the position, within the slot's
//! facet list, of the facet showing the piece's reference sticker. Stored
//! pruning tables depend on this numbering.

use crate::moves::{Amount, Face, Move};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::LazyLock};
use thiserror::Error;

pub const CORNER_SLOTS: usize = 15;
pub const EDGE_SLOTS: usize = 20;
pub const LAST_LAYER_PIECES: usize = 5;

const UP: u8 = 0;

const fn side(i: usize) -> u8 {
    1 + (i % 5) as u8
}

const fn lower(i: usize) -> u8 {
    6 + (i % 5) as u8
}

pub(crate) const CORNER_FACETS: [[u8; 3]; CORNER_SLOTS] = {
    let mut facets = [[0; 3]; CORNER_SLOTS];
    let mut i = 0;
    while i < 5 {
        facets[i] = [UP, side(i + 1), side(i)];
        facets[5 + i] = [side(i), side(i + 1), lower(i)];
        facets[10 + i] = [side(i), lower(i), lower(i + 4)];
        i += 1;
    }
    facets
};

pub(crate) const EDGE_FACETS: [[u8; 2]; EDGE_SLOTS] = {
    let mut facets = [[0; 2]; EDGE_SLOTS];
    let mut i = 0;
    while i < 5 {
        facets[i] = [UP, side(i)];
        facets[5 + i] = [side(i), side(i + 1)];
        facets[10 + i] = [side(i), lower(i)];
        facets[15 + i] = [side(i), lower(i + 4)];
        i += 1;
    }
    facets
};

/// The facets around a face, in the order a clockwise turn cycles them.
fn neighbours(face: Face) -> [u8; 5] {
    match face.ring_index() {
        None => [side(0), side(4), side(3), side(2), side(1)],
        Some(i) => [UP, side(i + 1), lower(i), lower(i + 4), side(i + 4)],
    }
}

/// Where a transformation sends the piece in each slot, and how much it
/// twists the piece on the way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OrbitTransformation<const N: usize> {
    pub destination: [u8; N],
    pub twist: [u8; N],
}

impl<const N: usize> OrbitTransformation<N> {
    fn identity() -> Self {
        Self {
            destination: std::array::from_fn(|slot| slot as u8),
            twist: [0; N],
        }
    }

    fn face_turn<const K: usize>(facets: &[[u8; K]; N], face: Face) -> Self {
        let face_facet = face.index() as u8;
        let neighbours = neighbours(face);
        let turn = |facet: u8| match neighbours.iter().position(|&n| n == facet) {
            Some(k) => neighbours[(k + 1) % 5],
            None => facet,
        };

        let mut transformation = Self::identity();
        for (slot, slot_facets) in facets.iter().enumerate() {
            if !slot_facets.contains(&face_facet) {
                continue;
            }
            let turned = slot_facets.map(turn);
            let destination = facets
                .iter()
                .position(|candidate| turned.iter().all(|facet| candidate.contains(facet)))
                .expect("A face turn maps the facets of a slot onto another slot");
            transformation.destination[slot] = destination as u8;
            transformation.twist[slot] = facets[destination]
                .iter()
                .position(|&facet| facet == turned[0])
                .expect("The destination slot contains every turned facet")
                as u8;
        }
        transformation
    }

    /// Perform `self` and then `then`.
    fn then(&self, then: &Self, orientation_count: u8) -> Self {
        let mut composed = Self::identity();
        for slot in 0..N {
            let middle = self.destination[slot] as usize;
            composed.destination[slot] = then.destination[middle];
            composed.twist[slot] = (self.twist[slot] + then.twist[middle]) % orientation_count;
        }
        composed
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct MoveTransformation {
    pub corners: OrbitTransformation<CORNER_SLOTS>,
    pub edges: OrbitTransformation<EDGE_SLOTS>,
}

/// Transformations of all 24 moves, indexed by [`Move::index`].
pub(crate) static MOVE_TRANSFORMATIONS: LazyLock<Vec<MoveTransformation>> = LazyLock::new(|| {
    let mut transformations = vec![];
    for face in Face::ALL {
        let corner_turn = OrbitTransformation::face_turn(&CORNER_FACETS, face);
        let edge_turn = OrbitTransformation::face_turn(&EDGE_FACETS, face);
        for amount in Amount::ALL {
            let mut corners = OrbitTransformation::identity();
            let mut edges = OrbitTransformation::identity();
            for _ in 0..amount.fifths() {
                corners = corners.then(&corner_turn, 3);
                edges = edges.then(&edge_turn, 2);
            }
            debug_assert_eq!(transformations.len(), Move::new(face, amount).index());
            transformations.push(MoveTransformation { corners, edges });
        }
    }
    transformations
});

pub(crate) fn corner_slot_touches(slot: usize, face: Face) -> bool {
    CORNER_FACETS[slot].contains(&(face.index() as u8))
}

pub(crate) fn edge_slot_touches(slot: usize, face: Face) -> bool {
    EDGE_FACETS[slot].contains(&(face.index() as u8))
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidStateError {
    #[error("Corner positions {0:?} are not a permutation of 0..5")]
    CornerPositionsNotPermutation([u8; LAST_LAYER_PIECES]),
    #[error("Edge positions {0:?} are not a permutation of 0..5")]
    EdgePositionsNotPermutation([u8; LAST_LAYER_PIECES]),
    #[error("Corner orientation {0} is out of range")]
    CornerOrientationOutOfRange(u8),
    #[error("Edge orientation {0} is out of range")]
    EdgeOrientationOutOfRange(u8),
    #[error("An odd corner permutation cannot be reached by face turns")]
    OddCornerPermutation,
    #[error("An odd edge permutation cannot be reached by face turns")]
    OddEdgePermutation,
    #[error("Corner twists must sum to a multiple of three")]
    CornerTwist,
    #[error("Edge flips must sum to a multiple of two")]
    EdgeFlip,
    #[error("The first two layers are not solved")]
    FirstTwoLayersUnsolved,
    #[error("Malformed last layer state `{0}`; expected CP/CO/EP/EO such as 01234/00000/01234/00000")]
    Malformed(String),
}

/// Which aspects of the last layer need not be solved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnoreFlags {
    pub corner_positions: bool,
    pub edge_positions: bool,
    pub corner_orientations: bool,
    pub edge_orientations: bool,
}

impl IgnoreFlags {
    pub const NONE: Self = Self {
        corner_positions: false,
        edge_positions: false,
        corner_orientations: false,
        edge_orientations: false,
    };

    /// Whether every check is switched off, making every state solved.
    #[must_use]
    pub fn ignores_everything(&self) -> bool {
        self.corner_positions
            && self.edge_positions
            && self.corner_orientations
            && self.edge_orientations
    }
}

impl fmt::Display for IgnoreFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (self.corner_positions, "cp"),
            (self.corner_orientations, "co"),
            (self.edge_positions, "ep"),
            (self.edge_orientations, "eo"),
        ]
        .into_iter()
        .filter_map(|(ignored, name)| ignored.then_some(name))
        .collect::<Vec<_>>();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join(","))
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown ignore flag `{0}`; expected a comma separated list of cp, co, ep, eo")]
pub struct ParseIgnoreFlagsError(String);

impl FromStr for IgnoreFlags {
    type Err = ParseIgnoreFlagsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut flags = IgnoreFlags::NONE;
        if s.trim().eq_ignore_ascii_case("none") {
            return Ok(flags);
        }
        for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token.to_ascii_lowercase().as_str() {
                "cp" => flags.corner_positions = true,
                "co" => flags.corner_orientations = true,
                "ep" => flags.edge_positions = true,
                "eo" => flags.edge_orientations = true,
                _ => return Err(ParseIgnoreFlagsError(token.to_owned())),
            }
        }
        Ok(flags)
    }
}

/// Every piece the six turnable faces can reach. Each slot stores the piece
/// in it (pieces are labelled by their home slot) and that piece's
/// orientation.
///
/// Values of this type only come from [`PuzzleState::solved`], from a
/// [`LastLayerState`], or from applying moves, so they are always reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PuzzleState {
    corners: [u8; CORNER_SLOTS],
    corner_orientations: [u8; CORNER_SLOTS],
    edges: [u8; EDGE_SLOTS],
    edge_orientations: [u8; EDGE_SLOTS],
}

impl Default for PuzzleState {
    fn default() -> Self {
        Self::solved()
    }
}

impl PuzzleState {
    #[must_use]
    pub fn solved() -> Self {
        Self {
            corners: std::array::from_fn(|slot| slot as u8),
            corner_orientations: [0; CORNER_SLOTS],
            edges: std::array::from_fn(|slot| slot as u8),
            edge_orientations: [0; EDGE_SLOTS],
        }
    }

    /// Write `self` followed by `move_` into `out`, reusing its storage.
    pub fn replace_apply(&self, move_: Move, out: &mut Self) {
        let transformation = &MOVE_TRANSFORMATIONS[move_.index()];
        for slot in 0..CORNER_SLOTS {
            let destination = transformation.corners.destination[slot] as usize;
            out.corners[destination] = self.corners[slot];
            out.corner_orientations[destination] =
                (self.corner_orientations[slot] + transformation.corners.twist[slot]) % 3;
        }
        for slot in 0..EDGE_SLOTS {
            let destination = transformation.edges.destination[slot] as usize;
            out.edges[destination] = self.edges[slot];
            out.edge_orientations[destination] =
                (self.edge_orientations[slot] + transformation.edges.twist[slot]) % 2;
        }
    }

    #[must_use]
    pub fn apply_move(&self, move_: Move) -> Self {
        let mut out = *self;
        self.replace_apply(move_, &mut out);
        out
    }

    #[must_use]
    pub fn apply_moves(&self, moves: &[Move]) -> Self {
        moves
            .iter()
            .fold(*self, |state, &move_| state.apply_move(move_))
    }

    #[must_use]
    pub fn corners(&self) -> &[u8; CORNER_SLOTS] {
        &self.corners
    }

    #[must_use]
    pub fn corner_orientations(&self) -> &[u8; CORNER_SLOTS] {
        &self.corner_orientations
    }

    #[must_use]
    pub fn edges(&self) -> &[u8; EDGE_SLOTS] {
        &self.edges
    }

    #[must_use]
    pub fn edge_orientations(&self) -> &[u8; EDGE_SLOTS] {
        &self.edge_orientations
    }

    /// Whether every piece outside the last layer is home and unturned.
    #[must_use]
    pub fn first_two_layers_solved(&self) -> bool {
        (LAST_LAYER_PIECES..CORNER_SLOTS)
            .all(|slot| self.corners[slot] == slot as u8 && self.corner_orientations[slot] == 0)
            && (LAST_LAYER_PIECES..EDGE_SLOTS)
                .all(|slot| self.edges[slot] == slot as u8 && self.edge_orientations[slot] == 0)
    }

    /// A state is solved when the first two layers are intact and every
    /// last layer aspect not covered by `ignore` matches the solved state.
    #[must_use]
    pub fn is_solved(&self, ignore: IgnoreFlags) -> bool {
        self.first_two_layers_solved()
            && (0..LAST_LAYER_PIECES).all(|slot| {
                (ignore.corner_positions || self.corners[slot] == slot as u8)
                    && (ignore.corner_orientations || self.corner_orientations[slot] == 0)
                    && (ignore.edge_positions || self.edges[slot] == slot as u8)
                    && (ignore.edge_orientations || self.edge_orientations[slot] == 0)
            })
    }

    /// Whether every piece that `faces` cannot reach is home and unturned,
    /// which is necessary for turning only `faces` to solve the state.
    #[must_use]
    pub fn is_confined_to(&self, faces: &[Face]) -> bool {
        let corner_reachable =
            |slot: usize| faces.iter().any(|&face| corner_slot_touches(slot, face));
        let edge_reachable = |slot: usize| faces.iter().any(|&face| edge_slot_touches(slot, face));
        (0..CORNER_SLOTS).all(|slot| {
            corner_reachable(slot)
                || (self.corners[slot] == slot as u8 && self.corner_orientations[slot] == 0)
        }) && (0..EDGE_SLOTS).all(|slot| {
            edge_reachable(slot) || (self.edges[slot] == slot as u8 && self.edge_orientations[slot] == 0)
        })
    }

    /// Whether a move sequence leaves the same state regardless of the order
    /// of the two moves.
    #[must_use]
    pub fn moves_commute(a: Move, b: Move) -> bool {
        let solved = Self::solved();
        solved.apply_move(a).apply_move(b) == solved.apply_move(b).apply_move(a)
    }
}

/// A last layer configuration: which piece sits in each last layer slot and
/// how it is turned. The first two layers are implicitly solved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LastLayerState {
    corner_positions: [u8; LAST_LAYER_PIECES],
    corner_orientations: [u8; LAST_LAYER_PIECES],
    edge_positions: [u8; LAST_LAYER_PIECES],
    edge_orientations: [u8; LAST_LAYER_PIECES],
}

fn is_permutation(positions: &[u8; LAST_LAYER_PIECES]) -> bool {
    let mut seen = [false; LAST_LAYER_PIECES];
    positions.iter().all(|&piece| {
        (piece as usize) < LAST_LAYER_PIECES && !std::mem::replace(&mut seen[piece as usize], true)
    })
}

/// Whether a permutation decomposes into an even number of transpositions.
fn is_even(positions: &[u8; LAST_LAYER_PIECES]) -> bool {
    let mut visited = [false; LAST_LAYER_PIECES];
    let mut transpositions = 0;
    for start in 0..LAST_LAYER_PIECES {
        let mut slot = start;
        let mut cycle_length = 0;
        while !visited[slot] {
            visited[slot] = true;
            slot = positions[slot] as usize;
            cycle_length += 1;
        }
        if cycle_length > 0 {
            transpositions += cycle_length - 1;
        }
    }
    transpositions % 2 == 0
}

impl LastLayerState {
    /// Validate and build a last layer state.
    ///
    /// # Errors
    ///
    /// Rejects malformed states as well as states that no sequence of face
    /// turns can reach. See [`InvalidStateError`].
    pub fn new(
        corner_positions: [u8; LAST_LAYER_PIECES],
        corner_orientations: [u8; LAST_LAYER_PIECES],
        edge_positions: [u8; LAST_LAYER_PIECES],
        edge_orientations: [u8; LAST_LAYER_PIECES],
    ) -> Result<Self, InvalidStateError> {
        if !is_permutation(&corner_positions) {
            return Err(InvalidStateError::CornerPositionsNotPermutation(
                corner_positions,
            ));
        }
        if !is_permutation(&edge_positions) {
            return Err(InvalidStateError::EdgePositionsNotPermutation(
                edge_positions,
            ));
        }
        if let Some(&twist) = corner_orientations.iter().find(|&&twist| twist > 2) {
            return Err(InvalidStateError::CornerOrientationOutOfRange(twist));
        }
        if let Some(&flip) = edge_orientations.iter().find(|&&flip| flip > 1) {
            return Err(InvalidStateError::EdgeOrientationOutOfRange(flip));
        }
        // Every face turn is a five-cycle on corners and on edges
        if !is_even(&corner_positions) {
            return Err(InvalidStateError::OddCornerPermutation);
        }
        if !is_even(&edge_positions) {
            return Err(InvalidStateError::OddEdgePermutation);
        }
        if corner_orientations.iter().map(|&t| u32::from(t)).sum::<u32>() % 3 != 0 {
            return Err(InvalidStateError::CornerTwist);
        }
        if edge_orientations.iter().map(|&f| u32::from(f)).sum::<u32>() % 2 != 0 {
            return Err(InvalidStateError::EdgeFlip);
        }
        Ok(Self {
            corner_positions,
            corner_orientations,
            edge_positions,
            edge_orientations,
        })
    }

    #[must_use]
    pub fn solved() -> Self {
        Self {
            corner_positions: [0, 1, 2, 3, 4],
            corner_orientations: [0; LAST_LAYER_PIECES],
            edge_positions: [0, 1, 2, 3, 4],
            edge_orientations: [0; LAST_LAYER_PIECES],
        }
    }

    #[must_use]
    pub fn corner_positions(&self) -> &[u8; LAST_LAYER_PIECES] {
        &self.corner_positions
    }

    #[must_use]
    pub fn corner_orientations(&self) -> &[u8; LAST_LAYER_PIECES] {
        &self.corner_orientations
    }

    #[must_use]
    pub fn edge_positions(&self) -> &[u8; LAST_LAYER_PIECES] {
        &self.edge_positions
    }

    #[must_use]
    pub fn edge_orientations(&self) -> &[u8; LAST_LAYER_PIECES] {
        &self.edge_orientations
    }

    #[must_use]
    pub fn is_solved(&self, ignore: IgnoreFlags) -> bool {
        PuzzleState::from(*self).is_solved(ignore)
    }

    /// Apply a move that keeps the first two layers intact, such as any `U`
    /// turn. Other moves yield `None`.
    #[must_use]
    pub fn apply_move(&self, move_: Move) -> Option<Self> {
        Self::try_from(&PuzzleState::from(*self).apply_move(move_)).ok()
    }
}

impl From<LastLayerState> for PuzzleState {
    fn from(last_layer: LastLayerState) -> Self {
        let mut state = PuzzleState::solved();
        state.corners[..LAST_LAYER_PIECES].copy_from_slice(&last_layer.corner_positions);
        state.corner_orientations[..LAST_LAYER_PIECES]
            .copy_from_slice(&last_layer.corner_orientations);
        state.edges[..LAST_LAYER_PIECES].copy_from_slice(&last_layer.edge_positions);
        state.edge_orientations[..LAST_LAYER_PIECES]
            .copy_from_slice(&last_layer.edge_orientations);
        state
    }
}

impl TryFrom<&PuzzleState> for LastLayerState {
    type Error = InvalidStateError;

    fn try_from(state: &PuzzleState) -> Result<Self, Self::Error> {
        if !state.first_two_layers_solved() {
            return Err(InvalidStateError::FirstTwoLayersUnsolved);
        }
        let mut last_layer = LastLayerState::solved();
        last_layer
            .corner_positions
            .copy_from_slice(&state.corners[..LAST_LAYER_PIECES]);
        last_layer
            .corner_orientations
            .copy_from_slice(&state.corner_orientations[..LAST_LAYER_PIECES]);
        last_layer
            .edge_positions
            .copy_from_slice(&state.edges[..LAST_LAYER_PIECES]);
        last_layer
            .edge_orientations
            .copy_from_slice(&state.edge_orientations[..LAST_LAYER_PIECES]);
        Ok(last_layer)
    }
}

impl fmt::Display for LastLayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, digits) in [
            &self.corner_positions,
            &self.corner_orientations,
            &self.edge_positions,
            &self.edge_orientations,
        ]
        .into_iter()
        .enumerate()
        {
            if i > 0 {
                f.write_str("/")?;
            }
            for digit in digits {
                write!(f, "{digit}")?;
            }
        }
        Ok(())
    }
}

impl FromStr for LastLayerState {
    type Err = InvalidStateError;

    /// Parse `CP/CO/EP/EO`, four groups of five digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || InvalidStateError::Malformed(s.to_owned());
        let groups = s
            .trim()
            .split('/')
            .map(|group| {
                let digits = group
                    .chars()
                    .map(|c| c.to_digit(10).map(|d| d as u8))
                    .collect::<Option<Vec<u8>>>()?;
                <[u8; LAST_LAYER_PIECES]>::try_from(digits).ok()
            })
            .collect::<Option<Vec<_>>>()
            .ok_or_else(malformed)?;
        let [cp, co, ep, eo] = groups[..] else {
            return Err(malformed());
        };
        LastLayerState::new(cp, co, ep, eo)
    }
}
