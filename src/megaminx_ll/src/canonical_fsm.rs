//! Canonical sequence finite state machine, derived primarily from Lucas
//! Garron's implementation in twsearch:
//! https://github.com/cubing/twsearch/blob/main/src/rs/_internal/canonical_fsm/canonical_fsm.rs
//!
//! Move classes here are the faces of an allowed face set. The machine
//! rejects turning the same face twice in a row and imposes a total order on
//! faces that commute, so `R L` is searched but `L R` is not.

use crate::{
    moves::{Amount, Move, MoveSet},
    puzzle::PuzzleState,
};
use fxhash::FxHashMap;

// Bit N is indexed by a move class index of N.
#[derive(Copy, Clone, Eq, Hash, PartialEq)]
struct MoveClassMask(u64);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CanonicalFSMState(usize);

const ILLEGAL: CanonicalFSMState = CanonicalFSMState(!0);

#[derive(Debug)]
pub struct CanonicalFSM {
    next_state_lookup: Vec<Vec<CanonicalFSMState>>,
}

impl From<&MoveSet> for CanonicalFSM {
    fn from(move_set: &MoveSet) -> Self {
        let faces = move_set.allowed_faces().faces();
        let num_move_classes = faces.len();

        let mut commutes = vec![MoveClassMask((1 << num_move_classes) - 1); num_move_classes];
        for (i, &face_1) in faces.iter().enumerate() {
            for (j, &face_2) in faces.iter().enumerate() {
                if !PuzzleState::moves_commute(
                    Move::new(face_1, Amount::Clockwise),
                    Move::new(face_2, Amount::Clockwise),
                ) {
                    commutes[i].0 &= !(1 << j);
                    commutes[j].0 &= !(1 << i);
                }
            }
        }

        let mut next_state_lookup = vec![];

        let mut mask_to_state = FxHashMap::default();
        mask_to_state.insert(MoveClassMask(0), CanonicalFSMState(0));
        // Indexed by state ordinal, the set of move classes in the sequence
        // so far with no later move that fails to commute with them
        let mut state_to_mask = vec![MoveClassMask(0)];

        let mut queue_index = 0;
        while queue_index < state_to_mask.len() {
            let mut next_state = vec![ILLEGAL; num_move_classes];
            let dequeue_move_class_mask = state_to_mask[queue_index];
            queue_index += 1;

            for (move_class_index, next) in next_state.iter_mut().enumerate() {
                // If a greater move class in the state commutes with this
                // one, or this one is already in it, the move is redundant
                let skip = (dequeue_move_class_mask.0 & commutes[move_class_index].0)
                    >> (move_class_index + 1)
                    != 0
                    || ((dequeue_move_class_mask.0 >> move_class_index) & 1) != 0;
                if skip {
                    continue;
                }

                let mut next_state_bits = (dequeue_move_class_mask.0
                    & commutes[move_class_index].0)
                    | (1 << move_class_index);

                // If a pair of bits are set with the same commutating moves,
                // we can clear out the lower ones
                for i in 0..num_move_classes {
                    if (next_state_bits >> i) & 1 != 0 {
                        for j in (i + 1)..num_move_classes {
                            if ((next_state_bits >> j) & 1) != 0 && commutes[i] == commutes[j] {
                                next_state_bits &= !(1 << i);
                            }
                        }
                    }
                }

                let next_move_class_mask = MoveClassMask(next_state_bits);
                *next = *mask_to_state
                    .entry(next_move_class_mask)
                    .or_insert_with(|| {
                        state_to_mask.push(next_move_class_mask);
                        CanonicalFSMState(state_to_mask.len() - 1)
                    });
            }
            next_state_lookup.push(next_state);
        }

        Self { next_state_lookup }
    }
}

impl CanonicalFSM {
    pub fn next_state(
        &self,
        current_fsm_state: CanonicalFSMState,
        move_class_index: usize,
    ) -> Option<CanonicalFSMState> {
        match self.next_state_lookup[current_fsm_state.0][move_class_index] {
            ILLEGAL => None,
            state => Some(state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moves::AllowedFaceSet;

    #[test]
    fn test_canonical_fsm_initially_all_legal() {
        for allowed_faces in AllowedFaceSet::ALL {
            let canonical_fsm = CanonicalFSM::from(&MoveSet::moves_for(allowed_faces));
            for move_class_index in 0..allowed_faces.faces().len() {
                assert!(
                    canonical_fsm
                        .next_state(CanonicalFSMState::default(), move_class_index)
                        .is_some()
                );
            }
        }
    }

    #[test]
    fn test_canonical_fsm_prevents_self() {
        for allowed_faces in AllowedFaceSet::ALL {
            let canonical_fsm = CanonicalFSM::from(&MoveSet::moves_for(allowed_faces));
            for move_class_index in 0..allowed_faces.faces().len() {
                let after_one = canonical_fsm
                    .next_state(CanonicalFSMState::default(), move_class_index)
                    .unwrap();
                assert!(
                    canonical_fsm
                        .next_state(after_one, move_class_index)
                        .is_none()
                );
            }
        }
    }

    #[test]
    fn test_canonical_fsm_orders_commuting_faces() {
        let move_set = MoveSet::moves_for(AllowedFaceSet::RUFLBR);
        let canonical_fsm = CanonicalFSM::from(&move_set);
        let faces = AllowedFaceSet::RUFLBR.faces();
        for (i, &face_1) in faces.iter().enumerate() {
            for (j, &face_2) in faces.iter().enumerate() {
                if i == j {
                    continue;
                }
                let allows = |first: usize, second: usize| {
                    canonical_fsm
                        .next_state(
                            canonical_fsm
                                .next_state(CanonicalFSMState::default(), first)
                                .unwrap(),
                            second,
                        )
                        .is_some()
                };
                let commute = PuzzleState::moves_commute(
                    Move::new(face_1, Amount::Clockwise),
                    Move::new(face_2, Amount::Clockwise),
                );
                if commute {
                    assert!(allows(i, j) ^ allows(j, i));
                } else {
                    assert!(allows(i, j) && allows(j, i));
                }
            }
        }
    }
}
