//! Deadline table for the controller's timers.
//!
//! Each timer kind has at most one pending deadline. Arming replaces it and
//! cancelling clears it, so a superseded or cancelled timer can never fire.

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Reconnect,
    ConnectProbe,
    Retry,
    DeferredSend,
    WatchdogPoll,
    Debounce,
    AbortFallback,
    ModelSwitch,
}

impl TimerKind {
    const ALL: [Self; 8] = [
        Self::Reconnect,
        Self::ConnectProbe,
        Self::Retry,
        Self::DeferredSend,
        Self::WatchdogPoll,
        Self::Debounce,
        Self::AbortFallback,
        Self::ModelSwitch,
    ];

    const fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Default)]
pub(crate) struct Timers {
    deadlines: [Option<Instant>; TimerKind::ALL.len()],
}

impl Timers {
    pub(crate) fn arm(&mut self, kind: TimerKind, at: Instant) {
        self.deadlines[kind.index()] = Some(at);
    }

    pub(crate) fn cancel(&mut self, kind: TimerKind) {
        self.deadlines[kind.index()] = None;
    }

    pub(crate) fn cancel_all(&mut self) {
        self.deadlines = [None; TimerKind::ALL.len()];
    }

    pub(crate) fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines[kind.index()].is_some()
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.iter().flatten().min().copied()
    }

    /// Every timer due at `now`, earliest first. Nothing is disarmed.
    pub(crate) fn due(&self, now: Instant) -> Vec<TimerKind> {
        let mut due: Vec<(Instant, TimerKind)> = TimerKind::ALL
            .into_iter()
            .filter_map(|kind| {
                self.deadlines[kind.index()]
                    .filter(|at| *at <= now)
                    .map(|at| (at, kind))
            })
            .collect();
        due.sort_by_key(|(at, _)| *at);
        due.into_iter().map(|(_, kind)| kind).collect()
    }

    /// Disarm `kind` if it is still due at `now`.
    ///
    /// Returns `false` when it was cancelled or re-armed for later since the
    /// batch was collected.
    pub(crate) fn take_if_due(&mut self, kind: TimerKind, now: Instant) -> bool {
        let slot = &mut self.deadlines[kind.index()];
        if slot.is_some_and(|at| at <= now) {
            *slot = None;
            return true;
        }
        false
    }

    #[cfg(test)]
    fn take_due(&mut self, now: Instant) -> Vec<TimerKind> {
        self.due(now)
            .into_iter()
            .filter(|kind| self.take_if_due(*kind, now))
            .collect()
    }
}
