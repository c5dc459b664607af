use crate::{moves::MoveSet, puzzle::PuzzleState};

/// The stack of states along the current search path. Entry zero is the
/// root; every later entry is the previous state followed by the move at
/// the recorded move index.
pub struct PuzzleStateHistory {
    stack: Vec<(PuzzleState, usize)>,
    stack_pointer: usize,
}

impl From<PuzzleState> for PuzzleStateHistory {
    fn from(root: PuzzleState) -> Self {
        Self {
            // it is important this is zero so an empty history has no moves
            stack: vec![(root, 0)],
            stack_pointer: 0,
        }
    }
}

impl PuzzleStateHistory {
    /// Push a new state onto the stack by applying the given move to the
    /// last state in the stack.
    pub fn push_stack(&mut self, move_index: usize, move_set: &MoveSet) {
        if self.stack_pointer + 1 == self.stack.len() {
            self.stack.push(self.stack[self.stack_pointer]);
        }
        let (left, right) = self.stack.split_at_mut(self.stack_pointer + 1);
        let next_entry = &mut right[0];
        left[self.stack_pointer]
            .0
            .replace_apply(move_set.moves()[move_index], &mut next_entry.0);
        next_entry.1 = move_index;
        self.stack_pointer += 1;
    }

    /// Pop the last state from the stack.
    pub fn pop_stack(&mut self) {
        debug_assert!(self.stack_pointer > 0);
        self.stack_pointer -= 1;
    }

    /// Make room for a search path of `max_stack_pointer` moves up front.
    pub fn reserve(&mut self, max_stack_pointer: usize) {
        if self.stack.len() <= max_stack_pointer {
            let root = self.stack[0].0;
            self.stack.resize(max_stack_pointer + 1, (root, usize::MAX));
        }
    }

    pub fn last_state(&self) -> &PuzzleState {
        &self.stack[self.stack_pointer].0
    }

    /// The number of moves on the current path.
    pub fn depth(&self) -> usize {
        self.stack_pointer
    }

    /// Create a new move history from the current state of the stack.
    pub fn create_move_history(&self) -> Vec<usize> {
        (1..=self.stack_pointer).map(|i| self.stack[i].1).collect()
    }
}
