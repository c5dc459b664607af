//! Dense coordinates over the last layer pieces of one orbit.
//!
//! A coordinate only looks at the five last layer pieces of an orbit and at
//! the slots the allowed faces can move them through (the "region", always
//! starting with the five last layer slots). It has a position part and an
//! optional orientation part:
//!
//! - With permutation tracked, the position part ranks the ordered tuple of
//!   slots holding pieces `0..5` in mixed radix `n, n-1, ..., n-4`, and
//!   orientation digit `k` belongs to piece `k`.
//! - Without it, the position part ranks the set of occupied slots in the
//!   combinatorial number system, and orientation digit `k` belongs to the
//!   `k`th occupied slot in ascending order.
//!
//! The coordinate is `position * m^5 + sum(digit_k * m^k)` where `m` is the
//! number of orientations of the orbit. The solved state is always zero.

use crate::{
    BINOMIAL,
    moves::{AllowedFaceSet, Move},
    puzzle::{
        CORNER_SLOTS, EDGE_SLOTS, LAST_LAYER_PIECES, MOVE_TRANSFORMATIONS, PuzzleState,
        corner_slot_touches, edge_slot_touches,
    },
};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

const OUTSIDE_REGION: u8 = u8::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Orbit {
    Corners,
    Edges,
}

impl Orbit {
    #[must_use]
    pub fn orientation_count(self) -> u8 {
        match self {
            Orbit::Corners => 3,
            Orbit::Edges => 2,
        }
    }

    #[must_use]
    pub fn slot_count(self) -> usize {
        match self {
            Orbit::Corners => CORNER_SLOTS,
            Orbit::Edges => EDGE_SLOTS,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Orbit::Corners => "corners",
            Orbit::Edges => "edges",
        }
    }
}

/// Which sub-components of one orbit a coordinate tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CoordinateShape {
    pub orbit: Orbit,
    pub permutation: bool,
    pub orientation: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown coordinate shape `{0}`")]
pub struct ParseShapeError(String);

impl CoordinateShape {
    /// The corner and edge shapes that track exactly the aspects `ignore`
    /// leaves active. Placement is always tracked because last layer pieces
    /// must end up back in the last layer.
    #[must_use]
    pub fn for_ignore_flags(ignore: crate::puzzle::IgnoreFlags) -> [CoordinateShape; 2] {
        [
            CoordinateShape {
                orbit: Orbit::Corners,
                permutation: !ignore.corner_positions,
                orientation: !ignore.corner_orientations,
            },
            CoordinateShape {
                orbit: Orbit::Edges,
                permutation: !ignore.edge_positions,
                orientation: !ignore.edge_orientations,
            },
        ]
    }

    fn tracked_name(self) -> &'static str {
        match (self.permutation, self.orientation) {
            (true, true) => "perm-ori",
            (true, false) => "perm",
            (false, true) => "ori",
            (false, false) => "place",
        }
    }
}

impl fmt::Display for CoordinateShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.orbit.name(), self.tracked_name())
    }
}

impl FromStr for CoordinateShape {
    type Err = ParseShapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseShapeError(s.to_owned());
        let (orbit, tracked) = s.split_once('-').ok_or_else(err)?;
        let orbit = match orbit {
            "corners" => Orbit::Corners,
            "edges" => Orbit::Edges,
            _ => return Err(err()),
        };
        let (permutation, orientation) = match tracked {
            "perm-ori" => (true, true),
            "perm" => (true, false),
            "ori" => (false, true),
            "place" => (false, false),
            _ => return Err(err()),
        };
        Ok(CoordinateShape {
            orbit,
            permutation,
            orientation,
        })
    }
}

/// A move restricted to the region of a coordinate space.
#[derive(Debug, Clone)]
pub(crate) struct LocalMove {
    destination: Vec<u8>,
    twist: Vec<u8>,
}

/// The effect of one move on every coordinate sharing a position part.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockStep {
    next_position: usize,
    digit_target: [u8; LAST_LAYER_PIECES],
    twist: [u8; LAST_LAYER_PIECES],
}

/// The coordinate space of one shape under one allowed face set.
#[derive(Debug, Clone)]
pub struct CoordinateSpace {
    shape: CoordinateShape,
    region: Vec<u8>,
    local_of: [u8; EDGE_SLOTS],
    position_count: usize,
    orientation_count: usize,
    modulus: u8,
}

impl CoordinateSpace {
    #[must_use]
    pub fn new(allowed_faces: AllowedFaceSet, shape: CoordinateShape) -> Self {
        let faces = allowed_faces.faces();
        let region = (0..shape.orbit.slot_count())
            .filter(|&slot| {
                faces.iter().any(|&face| match shape.orbit {
                    Orbit::Corners => corner_slot_touches(slot, face),
                    Orbit::Edges => edge_slot_touches(slot, face),
                })
            })
            .map(|slot| slot as u8)
            .collect::<Vec<_>>();
        let mut local_of = [OUTSIDE_REGION; EDGE_SLOTS];
        for (local, &slot) in region.iter().enumerate() {
            local_of[slot as usize] = local as u8;
        }
        debug_assert!((0..LAST_LAYER_PIECES).all(|slot| local_of[slot] as usize == slot));

        let n = region.len();
        let position_count = if shape.permutation {
            (n - LAST_LAYER_PIECES + 1..=n).product()
        } else {
            BINOMIAL[n][LAST_LAYER_PIECES]
        };
        let modulus = shape.orbit.orientation_count();
        let orientation_count = if shape.orientation {
            usize::from(modulus).pow(LAST_LAYER_PIECES as u32)
        } else {
            1
        };

        Self {
            shape,
            region,
            local_of,
            position_count,
            orientation_count,
            modulus,
        }
    }

    #[must_use]
    pub fn shape(&self) -> CoordinateShape {
        self.shape
    }

    /// The number of coordinates, `N`. Coordinates are exactly `0..N`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.position_count * self.orientation_count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The global slots the allowed faces can move these pieces through.
    #[must_use]
    pub fn region(&self) -> &[u8] {
        &self.region
    }

    #[must_use]
    pub fn position_count(&self) -> usize {
        self.position_count
    }

    #[must_use]
    pub fn orientation_count(&self) -> usize {
        self.orientation_count
    }

    /// Pack a state. The state must be confined to the allowed faces of this
    /// space, see [`PuzzleState::is_confined_to`].
    #[must_use]
    pub fn coordinate_for(&self, state: &PuzzleState) -> usize {
        let (pieces, orientations): (&[u8], &[u8]) = match self.shape.orbit {
            Orbit::Corners => (state.corners(), state.corner_orientations()),
            Orbit::Edges => (state.edges(), state.edge_orientations()),
        };
        let mut slots = [0; LAST_LAYER_PIECES];
        let mut digits = [0; LAST_LAYER_PIECES];
        if self.shape.permutation {
            for (slot, (&piece, &orientation)) in pieces.iter().zip(orientations).enumerate() {
                if (piece as usize) < LAST_LAYER_PIECES {
                    slots[piece as usize] = self.local_of[slot];
                    digits[piece as usize] = orientation;
                }
            }
        } else {
            let occupied = self
                .region
                .iter()
                .enumerate()
                .filter(|&(_, &slot)| (pieces[slot as usize] as usize) < LAST_LAYER_PIECES);
            for (k, (local, &slot)) in occupied.enumerate() {
                slots[k] = local as u8;
                digits[k] = orientations[slot as usize];
            }
        }
        debug_assert!(slots.iter().all(|&local| local != OUTSIDE_REGION));
        self.encode(&slots, &digits)
    }

    /// Pack local slots and orientation digits. Without permutation tracking
    /// `slots` must be ascending.
    pub(crate) fn encode(
        &self,
        slots: &[u8; LAST_LAYER_PIECES],
        digits: &[u8; LAST_LAYER_PIECES],
    ) -> usize {
        let position = if self.shape.permutation {
            rank_arrangement(slots, self.region.len())
        } else {
            rank_combination(slots)
        };
        let orientation = if self.shape.orientation {
            digits
                .iter()
                .rev()
                .fold(0, |acc, &digit| acc * usize::from(self.modulus) + usize::from(digit))
        } else {
            0
        };
        position * self.orientation_count + orientation
    }

    /// Unpack a coordinate into local slots and orientation digits.
    pub(crate) fn decode(
        &self,
        coordinate: usize,
    ) -> ([u8; LAST_LAYER_PIECES], [u8; LAST_LAYER_PIECES]) {
        let position = coordinate / self.orientation_count;
        let orientation = coordinate % self.orientation_count;
        (self.position_slots(position), self.digits(orientation))
    }

    fn position_slots(&self, position: usize) -> [u8; LAST_LAYER_PIECES] {
        if self.shape.permutation {
            unrank_arrangement(position, self.region.len())
        } else {
            unrank_combination(position, self.region.len())
        }
    }

    fn digits(&self, mut orientation: usize) -> [u8; LAST_LAYER_PIECES] {
        let mut digits = [0; LAST_LAYER_PIECES];
        if self.shape.orientation {
            for digit in &mut digits {
                *digit = (orientation % usize::from(self.modulus)) as u8;
                orientation /= usize::from(self.modulus);
            }
        }
        digits
    }

    /// Restrict a move to the region. The move must turn an allowed face.
    pub(crate) fn local_move(&self, move_: Move) -> LocalMove {
        let transformation = &MOVE_TRANSFORMATIONS[move_.index()];
        let (destination, twist): (&[u8], &[u8]) = match self.shape.orbit {
            Orbit::Corners => (
                &transformation.corners.destination,
                &transformation.corners.twist,
            ),
            Orbit::Edges => (
                &transformation.edges.destination,
                &transformation.edges.twist,
            ),
        };
        LocalMove {
            destination: self
                .region
                .iter()
                .map(|&slot| self.local_of[destination[slot as usize] as usize])
                .collect(),
            twist: self
                .region
                .iter()
                .map(|&slot| twist[slot as usize])
                .collect(),
        }
    }

    pub(crate) fn block_step(&self, position: usize, local_move: &LocalMove) -> BlockStep {
        let slots = self.position_slots(position);
        let moved = slots.map(|local| local_move.destination[local as usize]);
        let twist = slots.map(|local| local_move.twist[local as usize]);
        if self.shape.permutation {
            BlockStep {
                next_position: rank_arrangement(&moved, self.region.len()),
                digit_target: [0, 1, 2, 3, 4],
                twist,
            }
        } else {
            let digit_target =
                moved.map(|slot| moved.iter().filter(|&&other| other < slot).count() as u8);
            let mut sorted = moved;
            sorted.sort_unstable();
            BlockStep {
                next_position: rank_combination(&sorted),
                digit_target,
                twist,
            }
        }
    }

    /// The coordinate reached from `position * orientation_count +
    /// orientation` by the move `step` was built from.
    pub(crate) fn apply_block_step(&self, step: &BlockStep, orientation: usize) -> usize {
        if !self.shape.orientation {
            return step.next_position;
        }
        let modulus = usize::from(self.modulus);
        let mut remaining = orientation;
        let mut next_orientation = 0;
        for k in 0..LAST_LAYER_PIECES {
            let digit = remaining % modulus;
            remaining /= modulus;
            let turned = (digit + usize::from(step.twist[k])) % modulus;
            next_orientation += turned * modulus.pow(u32::from(step.digit_target[k]));
        }
        step.next_position * self.orientation_count + next_orientation
    }
}

fn rank_arrangement(slots: &[u8; LAST_LAYER_PIECES], n: usize) -> usize {
    let mut used = 0_u32;
    let mut rank = 0;
    for (k, &slot) in slots.iter().enumerate() {
        let unused_below = slot as usize - (used & ((1 << slot) - 1)).count_ones() as usize;
        rank = rank * (n - k) + unused_below;
        used |= 1 << slot;
    }
    rank
}

fn unrank_arrangement(mut rank: usize, n: usize) -> [u8; LAST_LAYER_PIECES] {
    let mut digits = [0; LAST_LAYER_PIECES];
    for k in (0..LAST_LAYER_PIECES).rev() {
        digits[k] = rank % (n - k);
        rank /= n - k;
    }
    let mut used = 0_u32;
    digits.map(|digit| {
        let mut remaining = digit;
        let mut slot = 0;
        loop {
            if used & (1 << slot) == 0 {
                if remaining == 0 {
                    break;
                }
                remaining -= 1;
            }
            slot += 1;
        }
        used |= 1 << slot;
        slot as u8
    })
}

fn rank_combination(sorted_slots: &[u8; LAST_LAYER_PIECES]) -> usize {
    sorted_slots
        .iter()
        .enumerate()
        .map(|(k, &slot)| BINOMIAL[slot as usize][k + 1])
        .sum()
}

fn unrank_combination(mut rank: usize, n: usize) -> [u8; LAST_LAYER_PIECES] {
    let mut slots = [0; LAST_LAYER_PIECES];
    let mut limit = n;
    for k in (0..LAST_LAYER_PIECES).rev() {
        let mut slot = limit - 1;
        while BINOMIAL[slot][k + 1] > rank {
            slot -= 1;
        }
        rank -= BINOMIAL[slot][k + 1];
        slots[k] = slot as u8;
        limit = slot;
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        moves::{MoveSet, parse_algorithm},
        puzzle::IgnoreFlags,
    };

    fn all_shapes() -> Vec<CoordinateShape> {
        let mut shapes = vec![];
        for orbit in [Orbit::Corners, Orbit::Edges] {
            for permutation in [true, false] {
                for orientation in [true, false] {
                    shapes.push(CoordinateShape {
                        orbit,
                        permutation,
                        orientation,
                    });
                }
            }
        }
        shapes
    }

    #[test]
    fn test_region_sizes() {
        let corners = CoordinateShape::for_ignore_flags(IgnoreFlags::NONE)[0];
        let edges = CoordinateShape::for_ignore_flags(IgnoreFlags::NONE)[1];
        assert_eq!(CoordinateSpace::new(AllowedFaceSet::RU, corners).region().len(), 8);
        assert_eq!(CoordinateSpace::new(AllowedFaceSet::RU, edges).region().len(), 9);
        assert_eq!(CoordinateSpace::new(AllowedFaceSet::RUFLBR, corners).region().len(), 14);
        assert_eq!(CoordinateSpace::new(AllowedFaceSet::RUFLBR, edges).region().len(), 18);
        assert_eq!(CoordinateSpace::new(AllowedFaceSet::RU, corners).len(), 6720 * 243);
    }

    #[test]
    fn test_solved_is_zero() {
        for allowed_faces in AllowedFaceSet::ALL {
            for shape in all_shapes() {
                let space = CoordinateSpace::new(allowed_faces, shape);
                assert_eq!(space.coordinate_for(&PuzzleState::solved()), 0);
            }
        }
    }

    fn assert_decode_inverts_encode(space: &CoordinateSpace, coordinate: usize) {
        let n = space.region().len() as u8;
        let (slots, digits) = space.decode(coordinate);
        assert!(slots.iter().all(|&slot| slot < n));
        assert!(
            slots
                .iter()
                .enumerate()
                .all(|(i, slot)| !slots[i + 1..].contains(slot))
        );
        assert_eq!(space.encode(&slots, &digits), coordinate);
    }

    #[test]
    fn test_decode_is_inverse_of_encode() {
        for shape in all_shapes() {
            let space = CoordinateSpace::new(AllowedFaceSet::RU, shape);
            for coordinate in 0..space.len() {
                assert_decode_inverts_encode(&space, coordinate);
            }
        }
    }

    #[test]
    fn test_decode_is_inverse_of_encode_in_large_regions() {
        for allowed_faces in AllowedFaceSet::ALL {
            for shape in all_shapes() {
                let space = CoordinateSpace::new(allowed_faces, shape);
                if allowed_faces == AllowedFaceSet::RUFLBR && !shape.orientation {
                    // Every position of the largest region
                    for coordinate in 0..space.len() {
                        assert_decode_inverts_encode(&space, coordinate);
                    }
                } else {
                    assert_decode_inverts_encode(&space, space.len() - 1);
                    for _ in 0..10_000 {
                        assert_decode_inverts_encode(&space, fastrand::usize(..space.len()));
                    }
                }
            }
        }
    }

    #[test]
    fn test_block_steps_track_moves() {
        let move_set = MoveSet::moves_for(AllowedFaceSet::RUF);
        for shape in all_shapes() {
            let space = CoordinateSpace::new(AllowedFaceSet::RUF, shape);
            let mut state = PuzzleState::solved();
            for _ in 0..200 {
                let move_ = move_set.moves()[fastrand::usize(..move_set.moves().len())];
                let coordinate = space.coordinate_for(&state);
                let step = space.block_step(
                    coordinate / space.orientation_count(),
                    &space.local_move(move_),
                );
                state = state.apply_move(move_);
                let stepped =
                    space.apply_block_step(&step, coordinate % space.orientation_count());
                assert_eq!(stepped, space.coordinate_for(&state));
                assert!(stepped < space.len());
            }
        }
    }

    #[test]
    fn test_untracked_aspects_do_not_affect_coordinates() {
        let u = PuzzleState::solved().apply_moves(&parse_algorithm("U").unwrap());
        let [corners, _] = CoordinateShape::for_ignore_flags(IgnoreFlags::NONE);
        let placement_and_twist = CoordinateShape {
            permutation: false,
            ..corners
        };
        assert_ne!(
            CoordinateSpace::new(AllowedFaceSet::RU, corners).coordinate_for(&u),
            0
        );
        assert_eq!(
            CoordinateSpace::new(AllowedFaceSet::RU, placement_and_twist).coordinate_for(&u),
            0
        );
    }

    #[test]
    fn test_shape_names_round_trip() {
        for shape in all_shapes() {
            assert_eq!(shape.to_string().parse::<CoordinateShape>(), Ok(shape));
        }
    }
}
