//! The command queue: the only path by which intent reaches the world.
//!
//! Commands are stamped on enqueue with a strictly increasing sequence number
//! and a scheduled tick. [`CommandQueue::flush`] hands out every command due
//! at a tick, sorted by sequence number, so arrival order never leaks into
//! the order of application.
//!
//! Enqueueing is crate-private. Outside callers reach the queue only through
//! a transport attached to the kernel.

use std::collections::VecDeque;

use tidelock_core::command::Command;
use tidelock_core::{Tick, ValidationError};
use tracing::{debug, warn};

/// Default number of flushed commands kept for inspection.
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

/// Pending and recently flushed commands.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    pending: Vec<Command>,
    history: VecDeque<Command>,
    next_sequence: u64,
    scheduling_delay: u64,
    history_limit: usize,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new(1, DEFAULT_HISTORY_LIMIT)
    }
}

impl CommandQueue {
    /// Create an empty queue. Unscheduled commands run `scheduling_delay`
    /// ticks after the tick they were enqueued at.
    pub fn new(scheduling_delay: u64, history_limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            history: VecDeque::new(),
            next_sequence: 0,
            scheduling_delay,
            history_limit,
        }
    }

    /// Stamp and store a command, returning the stamped copy.
    ///
    /// A command that already carries a sequence number keeps it (it was
    /// stamped by an authority) and the local counter skips past it. A
    /// different command claiming a pending sequence number is rejected;
    /// the same command delivered twice is accepted once. A sequence number
    /// still in the flushed history has already run and is rejected. A
    /// missing scheduled tick becomes `current_tick + scheduling_delay`.
    pub(crate) fn enqueue(
        &mut self,
        mut command: Command,
        current_tick: Tick,
    ) -> Result<Command, ValidationError> {
        let sequence = match command.sequence {
            Some(seq) => {
                if let Some(existing) = self.pending.iter().find(|c| c.sequence == Some(seq)) {
                    // Re-delivery of the same stamped command is a no-op.
                    if existing.id == command.id
                        && existing.issuer == command.issuer
                        && existing.kind == command.kind
                        && existing.targets == command.targets
                    {
                        return Ok(existing.clone());
                    }
                    return Err(ValidationError::DuplicateSequence { sequence: seq });
                }
                if self.history.iter().any(|c| c.sequence == Some(seq)) {
                    warn!(command = %command.id, sequence = seq, "command already ran");
                    return Err(ValidationError::DuplicateSequence { sequence: seq });
                }
                self.next_sequence = self.next_sequence.max(seq + 1);
                seq
            }
            None => {
                let seq = self.next_sequence;
                self.next_sequence += 1;
                seq
            }
        };
        command.sequence = Some(sequence);

        let scheduled = *command
            .scheduled_tick
            .get_or_insert(current_tick + self.scheduling_delay);
        if scheduled <= current_tick {
            debug!(
                command = %command.id,
                scheduled,
                current_tick,
                "late command will run at the next flush"
            );
        }

        self.pending.push(command.clone());
        Ok(command)
    }

    /// Remove and return every command scheduled at or before `tick`,
    /// ordered by sequence number.
    ///
    /// A second flush for the same tick returns nothing.
    pub(crate) fn flush(&mut self, tick: Tick) -> Vec<Command> {
        let (mut due, rest): (Vec<Command>, Vec<Command>) = self
            .pending
            .drain(..)
            .partition(|c| c.scheduled_tick.is_some_and(|t| t <= tick));
        self.pending = rest;
        due.sort_by_key(|c| c.sequence);

        for command in &due {
            if self.history.len() == self.history_limit {
                self.history.pop_front();
            }
            if self.history_limit > 0 {
                self.history.push_back(command.clone());
            }
        }
        due
    }

    /// Replace the pending set and sequence counter. Flushed history is
    /// cleared along with them.
    pub(crate) fn restore(&mut self, pending: Vec<Command>, next_sequence: u64) {
        self.pending = pending;
        self.history.clear();
        self.next_sequence = next_sequence;
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Pending commands ordered by (scheduled tick, sequence).
    pub fn pending(&self) -> Vec<&Command> {
        let mut out: Vec<&Command> = self.pending.iter().collect();
        out.sort_by_key(|c| (c.scheduled_tick, c.sequence));
        out
    }

    /// Recently flushed commands, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Command> {
        self.history.iter()
    }

    /// The sequence number the next unstamped command will receive.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn scheduling_delay(&self) -> u64 {
        self.scheduling_delay
    }
}

#[cfg(test)]
mod tests {
    use tidelock_core::prelude::*;

    use super::*;

    fn stamped(serial: u64, seq: u64, tick: Tick) -> Command {
        let mut cmd = Command::new(CommandId(serial), PeerId(1), CommandKind::Stop)
            .with_targets(vec![EntityId::new("unit-1")])
            .at_tick(tick);
        cmd.sequence = Some(seq);
        cmd
    }

    fn sequences(cmds: &[Command]) -> Vec<u64> {
        cmds.iter().filter_map(|c| c.sequence).collect()
    }

    // -- 1. stamping -------------------------------------------------------

    #[test]
    fn unstamped_commands_get_increasing_sequences() {
        let mut queue = CommandQueue::default();
        let a = queue
            .enqueue(Command::new(CommandId(1), PeerId(1), CommandKind::Stop), 0)
            .unwrap();
        let b = queue
            .enqueue(Command::new(CommandId(2), PeerId(1), CommandKind::Stop), 0)
            .unwrap();
        assert_eq!(a.sequence, Some(0));
        assert_eq!(b.sequence, Some(1));
        assert_eq!(a.scheduled_tick, Some(1));
    }

    #[test]
    fn scheduling_delay_applies_to_unscheduled_commands() {
        let mut queue = CommandQueue::new(3, 16);
        let cmd = queue
            .enqueue(Command::new(CommandId(1), PeerId(1), CommandKind::Stop), 10)
            .unwrap();
        assert_eq!(cmd.scheduled_tick, Some(13));
    }

    #[test]
    fn preassigned_sequence_is_kept_and_counter_skips_past_it() {
        let mut queue = CommandQueue::default();
        queue.enqueue(stamped(1, 40, 5), 0).unwrap();
        let next = queue
            .enqueue(Command::new(CommandId(2), PeerId(1), CommandKind::Stop), 0)
            .unwrap();
        assert_eq!(next.sequence, Some(41));
    }

    #[test]
    fn duplicate_pending_sequence_is_rejected() {
        let mut queue = CommandQueue::default();
        queue.enqueue(stamped(1, 7, 5), 0).unwrap();
        let err = queue.enqueue(stamped(2, 7, 5), 0).unwrap_err();
        assert_eq!(err, ValidationError::DuplicateSequence { sequence: 7 });
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn redelivered_command_is_kept_once() {
        let mut queue = CommandQueue::default();
        queue.enqueue(stamped(1, 7, 5), 0).unwrap();
        queue.enqueue(stamped(1, 7, 5), 0).unwrap();
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(queue.flush(5).len(), 1);
    }

    #[test]
    fn command_that_already_ran_is_rejected() {
        let mut queue = CommandQueue::default();
        queue.enqueue(stamped(1, 7, 2), 0).unwrap();
        assert_eq!(queue.flush(2).len(), 1);

        let err = queue.enqueue(stamped(1, 7, 2), 3).unwrap_err();
        assert_eq!(err, ValidationError::DuplicateSequence { sequence: 7 });
        assert_eq!(queue.pending_count(), 0);
        assert!(queue.flush(4).is_empty());
        assert_eq!(queue.history().count(), 1);
    }

    // -- 2. flush ----------------------------------------------------------

    #[test]
    fn flush_orders_by_sequence_not_arrival() {
        let mut queue = CommandQueue::default();
        queue.enqueue(stamped(1, 5, 10), 0).unwrap();
        queue.enqueue(stamped(2, 3, 10), 0).unwrap();
        queue.enqueue(stamped(3, 4, 10), 0).unwrap();

        let due = queue.flush(10);
        assert_eq!(sequences(&due), vec![3, 4, 5]);
    }

    #[test]
    fn flush_leaves_future_commands_pending() {
        let mut queue = CommandQueue::default();
        queue.enqueue(stamped(1, 0, 4), 0).unwrap();
        queue.enqueue(stamped(2, 1, 9), 0).unwrap();

        assert_eq!(sequences(&queue.flush(5)), vec![0]);
        assert_eq!(queue.pending_count(), 1);
        assert!(queue.pending().iter().all(|c| c.scheduled_tick > Some(5)));
    }

    #[test]
    fn flush_twice_returns_nothing_the_second_time() {
        let mut queue = CommandQueue::default();
        queue.enqueue(stamped(1, 0, 2), 0).unwrap();
        assert_eq!(queue.flush(2).len(), 1);
        assert!(queue.flush(2).is_empty());
    }

    #[test]
    fn flush_on_empty_queue_is_empty() {
        let mut queue = CommandQueue::default();
        assert!(queue.flush(100).is_empty());
    }

    #[test]
    fn history_is_capped() {
        let mut queue = CommandQueue::new(1, 2);
        for i in 0..5 {
            queue.enqueue(stamped(i, i, 1), 0).unwrap();
        }
        queue.flush(1);
        let kept: Vec<u64> = queue.history().filter_map(|c| c.sequence).collect();
        assert_eq!(kept, vec![3, 4]);
    }

    // -- 3. restore --------------------------------------------------------

    #[test]
    fn restore_replaces_pending_and_forgets_history() {
        let mut queue = CommandQueue::default();
        queue.enqueue(stamped(1, 0, 1), 0).unwrap();
        queue.flush(1);
        queue.enqueue(stamped(2, 1, 9), 1).unwrap();

        queue.restore(vec![stamped(3, 0, 4)], 5);
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(queue.history().count(), 0);
        assert_eq!(queue.next_sequence(), 5);
        assert_eq!(sequences(&queue.flush(4)), vec![0]);
    }

    // -- 4. properties -----------------------------------------------------

    use proptest::prelude::*;

    proptest! {
        /// Whatever order stamped commands arrive in, each flush yields them
        /// sorted by sequence, and flushing the same tick again yields nothing.
        #[test]
        fn flush_is_sorted_and_idempotent(
            ticks in proptest::collection::vec(1u64..20, 1..40),
            order in any::<proptest::sample::Index>(),
        ) {
            let mut arrivals: Vec<Command> = ticks
                .iter()
                .enumerate()
                .map(|(i, &t)| stamped(i as u64, i as u64, t))
                .collect();
            let pivot = order.index(arrivals.len());
            arrivals.rotate_left(pivot);
            arrivals.reverse();

            let mut queue = CommandQueue::default();
            for cmd in arrivals {
                queue.enqueue(cmd, 0).unwrap();
            }

            let mut seen = 0;
            for tick in 1..20 {
                let due = queue.flush(tick);
                let seqs = sequences(&due);
                prop_assert!(seqs.windows(2).all(|w| w[0] < w[1]));
                prop_assert!(due.iter().all(|c| c.scheduled_tick == Some(tick)));
                prop_assert!(queue.flush(tick).is_empty());
                seen += due.len();
            }
            prop_assert_eq!(seen, ticks.len());
            prop_assert_eq!(queue.pending_count(), 0);
        }
    }
}
