//! Ordering and de-duplication of progress notifications within one wait.

use crate::types::{CallPhase, CallProgress, CallStatusKind};

/// How far the caller has been told a call has advanced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProgressMarker {
    pub status_rank: u8,
    pub phase_rank: u8,
    /// Number of transcript turns already delivered.
    pub turns: usize,
}

/// Filters raw progress snapshots down to the ones that move the call forward.
///
/// The same tracker is used for stream events and poll snapshots, so switching
/// transports mid-wait never replays a phase or a transcript turn.
#[derive(Debug, Default, Clone)]
pub struct ProgressTracker {
    marker: Option<ProgressMarker>,
    last_status: Option<CallStatusKind>,
    last_phase: Option<CallPhase>,
    last_sequence: Option<u64>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marker of the last delivered notification, if any.
    pub fn marker(&self) -> Option<ProgressMarker> {
        self.marker
    }

    /// Highest event sequence number seen on the stream.
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    /// Returns the notification to deliver, or `None` when it adds nothing.
    ///
    /// Events whose `sequence` is not above the last seen one are replays and
    /// are dropped outright. A known phase that would move backwards is clamped
    /// to the last delivered phase; unknown phases ride along but never count
    /// as progress. `new_turns` carries the transcript turns not delivered yet.
    pub fn admit(
        &mut self,
        mut progress: CallProgress,
        sequence: Option<u64>,
    ) -> Option<CallProgress> {
        if let Some(seq) = sequence {
            if matches!(self.last_sequence, Some(last) if seq <= last) {
                return None;
            }
            self.last_sequence = Some(seq);
        }

        let current = self.marker.unwrap_or_default();

        let mut status_rank = progress.status.rank();
        if status_rank < current.status_rank {
            if let Some(status) = &self.last_status {
                progress.status = status.clone();
            }
            status_rank = current.status_rank;
        }

        let phase_rank = match progress.phase.as_ref().and_then(CallPhase::rank) {
            Some(rank) if rank >= current.phase_rank => rank,
            Some(_) => {
                progress.phase = self.last_phase.clone();
                current.phase_rank
            }
            None => {
                if progress.phase.is_none() {
                    progress.phase = self.last_phase.clone();
                }
                current.phase_rank
            }
        };

        let turns = progress.partial_transcript.len();
        let next = ProgressMarker {
            status_rank,
            phase_rank,
            turns: turns.max(current.turns),
        };

        let advanced = match self.marker {
            None => true,
            Some(prev) => {
                next.status_rank > prev.status_rank
                    || next.phase_rank > prev.phase_rank
                    || next.turns > prev.turns
            }
        };
        if !advanced {
            return None;
        }

        progress.new_turns = if turns > current.turns {
            progress.partial_transcript[current.turns..].to_vec()
        } else {
            Vec::new()
        };

        self.marker = Some(next);
        self.last_status = Some(progress.status.clone());
        if progress
            .phase
            .as_ref()
            .and_then(CallPhase::rank)
            .is_some()
        {
            self.last_phase = progress.phase.clone();
        }
        Some(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TranscriptEntry;

    fn snapshot(phase: Option<&str>, turns: usize) -> CallProgress {
        CallProgress {
            call_id: "c1".into(),
            status: CallStatusKind::InProgress,
            phase: phase.map(CallPhase::from),
            duration_seconds: None,
            partial_transcript: (0..turns)
                .map(|i| TranscriptEntry::new("agent", format!("turn {i}")))
                .collect(),
            new_turns: Vec::new(),
        }
    }

    #[test]
    fn first_snapshot_is_always_delivered() {
        let mut tracker = ProgressTracker::new();
        let delivered = tracker.admit(snapshot(None, 0), None).expect("first");
        assert!(delivered.new_turns.is_empty());
        assert!(tracker.marker().is_some());
    }

    #[test]
    fn identical_snapshots_are_delivered_once() {
        let mut tracker = ProgressTracker::new();
        assert!(tracker.admit(snapshot(Some("ringing"), 0), None).is_some());
        assert!(tracker.admit(snapshot(Some("ringing"), 0), None).is_none());
        assert!(tracker.admit(snapshot(Some("ringing"), 0), None).is_none());
    }

    #[test]
    fn replayed_sequence_numbers_are_dropped() {
        let mut tracker = ProgressTracker::new();
        assert!(tracker.admit(snapshot(Some("dialing"), 0), Some(1)).is_some());
        assert!(tracker.admit(snapshot(Some("connected"), 0), Some(2)).is_some());
        assert!(tracker.admit(snapshot(Some("speaking"), 1), Some(2)).is_none());
        assert!(tracker.admit(snapshot(Some("speaking"), 1), Some(1)).is_none());
        assert_eq!(tracker.last_sequence(), Some(2));
        assert!(tracker.admit(snapshot(Some("speaking"), 1), Some(3)).is_some());
    }

    #[test]
    fn new_turns_only_carry_undelivered_entries() {
        let mut tracker = ProgressTracker::new();
        let first = tracker.admit(snapshot(Some("speaking"), 2), None).unwrap();
        assert_eq!(first.new_turns.len(), 2);
        let second = tracker.admit(snapshot(Some("speaking"), 3), None).unwrap();
        assert_eq!(second.new_turns, vec![TranscriptEntry::new("agent", "turn 2")]);
        assert_eq!(second.partial_transcript.len(), 3);
    }

    #[test]
    fn regressing_phase_is_clamped() {
        let mut tracker = ProgressTracker::new();
        tracker.admit(snapshot(Some("connected"), 0), None).unwrap();
        assert!(tracker.admit(snapshot(Some("ringing"), 0), None).is_none());
        let delivered = tracker.admit(snapshot(Some("ringing"), 1), None).unwrap();
        assert_eq!(delivered.phase, Some(CallPhase::Connected));
    }

    #[test]
    fn unknown_phase_never_advances() {
        let mut tracker = ProgressTracker::new();
        tracker.admit(snapshot(Some("connected"), 0), None).unwrap();
        assert!(tracker.admit(snapshot(Some("on_hold"), 0), None).is_none());
        let delivered = tracker.admit(snapshot(Some("on_hold"), 1), None).unwrap();
        assert_eq!(delivered.phase, Some(CallPhase::from("on_hold")));
        let next = tracker.admit(snapshot(Some("speaking"), 1), None).unwrap();
        assert_eq!(next.phase, Some(CallPhase::Speaking));
    }

    #[test]
    fn shorter_transcript_does_not_rewind() {
        let mut tracker = ProgressTracker::new();
        tracker.admit(snapshot(Some("speaking"), 3), None).unwrap();
        assert!(tracker.admit(snapshot(Some("speaking"), 1), None).is_none());
        let delivered = tracker.admit(snapshot(Some("wrapping_up"), 0), None).unwrap();
        assert!(delivered.new_turns.is_empty());
        assert_eq!(tracker.marker().unwrap().turns, 3);
    }

    #[test]
    fn status_does_not_move_backwards() {
        let mut tracker = ProgressTracker::new();
        tracker.admit(snapshot(Some("dialing"), 0), None).unwrap();
        let mut pending = snapshot(Some("ringing"), 0);
        pending.status = CallStatusKind::Pending;
        let delivered = tracker.admit(pending, None).unwrap();
        assert_eq!(delivered.status, CallStatusKind::InProgress);
    }
}
