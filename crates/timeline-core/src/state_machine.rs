use crate::{
    error::TimelineError,
    types::{ControllerEvent, PageDirection, SyncState},
};

/// Lifecycle rules of a sync controller.
///
/// Tracks in-flight page requests per direction so that a second request in
/// the same direction short-circuits instead of queueing.
#[derive(Debug, Clone)]
pub struct SyncStateMachine {
    state: SyncState,
    older_in_flight: bool,
    newer_in_flight: bool,
}

impl Default for SyncStateMachine {
    fn default() -> Self {
        Self {
            state: SyncState::Idle,
            older_in_flight: false,
            newer_in_flight: false,
        }
    }
}

impl SyncStateMachine {
    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_disposed(&self) -> bool {
        self.state == SyncState::Disposed
    }

    pub fn is_in_flight(&self, direction: PageDirection) -> bool {
        match direction {
            PageDirection::Older => self.older_in_flight,
            PageDirection::Newer => self.newer_in_flight,
        }
    }

    /// Fail with a disposed error once the controller is torn down.
    pub fn ensure_active(&self, action: &str) -> Result<(), TimelineError> {
        if self.is_disposed() {
            return Err(TimelineError::disposed(action));
        }
        Ok(())
    }

    /// Start an initial load. Valid from `Idle`, or internally from `Reconnecting`.
    pub fn begin_initial_load(&mut self) -> Result<Vec<ControllerEvent>, TimelineError> {
        match self.state {
            SyncState::Idle => Ok(self.transition(SyncState::LoadingInitial)),
            SyncState::Reconnecting => Ok(Vec::new()),
            SyncState::Disposed => Err(TimelineError::disposed("load_initial")),
            current => Err(TimelineError::invalid_state(current, "load_initial")),
        }
    }

    /// Finish an initial load: `Ready` on success, back to `Idle` otherwise.
    pub fn finish_initial_load(
        &mut self,
        success: bool,
    ) -> Result<Vec<ControllerEvent>, TimelineError> {
        if !matches!(
            self.state,
            SyncState::LoadingInitial | SyncState::Reconnecting
        ) {
            return Err(TimelineError::invalid_state(
                self.state,
                "finish_initial_load",
            ));
        }

        let next = if success {
            SyncState::Ready
        } else {
            SyncState::Idle
        };
        Ok(self.transition(next))
    }

    /// Try to start a page request.
    ///
    /// Returns `Ok(None)` when the request should be skipped: the controller is
    /// not ready or a request in the same direction is already running.
    pub fn begin_page(
        &mut self,
        direction: PageDirection,
    ) -> Result<Option<Vec<ControllerEvent>>, TimelineError> {
        self.ensure_active(page_action(direction))?;

        if !matches!(self.state, SyncState::Ready | SyncState::Paging) {
            return Ok(None);
        }
        if self.is_in_flight(direction) {
            return Ok(None);
        }

        self.set_in_flight(direction, true);
        Ok(Some(self.transition(SyncState::Paging)))
    }

    /// Mark a page request as finished, returning to `Ready` when nothing else is in flight.
    pub fn finish_page(&mut self, direction: PageDirection) -> Vec<ControllerEvent> {
        self.set_in_flight(direction, false);
        if self.state == SyncState::Paging && !self.older_in_flight && !self.newer_in_flight {
            return self.transition(SyncState::Ready);
        }
        Vec::new()
    }

    /// React to a gap signal. Only meaningful while a subscription is live.
    ///
    /// Returns `None` when the signal should be ignored.
    pub fn on_gap_detected(&mut self) -> Option<Vec<ControllerEvent>> {
        if !matches!(self.state, SyncState::Ready | SyncState::Paging) {
            return None;
        }
        self.older_in_flight = false;
        self.newer_in_flight = false;
        Some(self.transition(SyncState::Reconnecting))
    }

    /// Enter the terminal state.
    pub fn dispose(&mut self) -> Result<Vec<ControllerEvent>, TimelineError> {
        self.ensure_active("dispose")?;
        self.older_in_flight = false;
        self.newer_in_flight = false;
        Ok(self.transition(SyncState::Disposed))
    }

    fn set_in_flight(&mut self, direction: PageDirection, value: bool) {
        match direction {
            PageDirection::Older => self.older_in_flight = value,
            PageDirection::Newer => self.newer_in_flight = value,
        }
    }

    fn transition(&mut self, next: SyncState) -> Vec<ControllerEvent> {
        if self.state == next {
            return Vec::new();
        }
        self.state = next;
        vec![ControllerEvent::StateChanged { state: next }]
    }
}

fn page_action(direction: PageDirection) -> &'static str {
    match direction {
        PageDirection::Older => "load_older",
        PageDirection::Newer => "load_newer",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TimelineErrorKind;

    fn ready_machine() -> SyncStateMachine {
        let mut sm = SyncStateMachine::default();
        sm.begin_initial_load().expect("initial load must start");
        sm.finish_initial_load(true).expect("initial load must finish");
        sm
    }

    #[test]
    fn runs_happy_path_state_transitions() {
        let mut sm = SyncStateMachine::default();
        assert_eq!(sm.state(), SyncState::Idle);

        let events = sm.begin_initial_load().expect("load should start");
        assert_eq!(
            events,
            vec![ControllerEvent::StateChanged {
                state: SyncState::LoadingInitial
            }]
        );

        sm.finish_initial_load(true).expect("load should finish");
        assert_eq!(sm.state(), SyncState::Ready);

        sm.begin_page(PageDirection::Older)
            .expect("paging allowed")
            .expect("page should start");
        assert_eq!(sm.state(), SyncState::Paging);

        sm.finish_page(PageDirection::Older);
        assert_eq!(sm.state(), SyncState::Ready);

        sm.dispose().expect("dispose should work");
        assert_eq!(sm.state(), SyncState::Disposed);
    }

    #[test]
    fn failed_initial_load_returns_to_idle() {
        let mut sm = SyncStateMachine::default();
        sm.begin_initial_load().expect("load should start");
        sm.finish_initial_load(false).expect("load should finish");
        assert_eq!(sm.state(), SyncState::Idle);
        sm.begin_initial_load().expect("retry should be allowed");
    }

    #[test]
    fn rejects_initial_load_outside_idle() {
        let mut sm = ready_machine();
        let err = sm
            .begin_initial_load()
            .expect_err("load_initial from Ready must fail");
        assert_eq!(err.code, "invalid_state_transition");
    }

    #[test]
    fn same_direction_page_short_circuits() {
        let mut sm = ready_machine();
        assert!(sm.begin_page(PageDirection::Older).unwrap().is_some());
        assert!(sm.begin_page(PageDirection::Older).unwrap().is_none());
        assert!(sm.begin_page(PageDirection::Newer).unwrap().is_some());

        assert!(sm.finish_page(PageDirection::Older).is_empty());
        assert_eq!(sm.state(), SyncState::Paging);
        sm.finish_page(PageDirection::Newer);
        assert_eq!(sm.state(), SyncState::Ready);
    }

    #[test]
    fn paging_is_skipped_before_ready() {
        let mut sm = SyncStateMachine::default();
        assert!(sm.begin_page(PageDirection::Newer).unwrap().is_none());
        sm.begin_initial_load().unwrap();
        assert!(sm.begin_page(PageDirection::Older).unwrap().is_none());
    }

    #[test]
    fn gap_moves_through_reconnecting_back_to_ready() {
        let mut sm = ready_machine();
        sm.begin_page(PageDirection::Older).unwrap();

        let events = sm.on_gap_detected().expect("gap handled while paging");
        assert_eq!(
            events,
            vec![ControllerEvent::StateChanged {
                state: SyncState::Reconnecting
            }]
        );
        assert!(!sm.is_in_flight(PageDirection::Older));

        assert!(sm.begin_initial_load().unwrap().is_empty());
        sm.finish_initial_load(true).unwrap();
        assert_eq!(sm.state(), SyncState::Ready);
    }

    #[test]
    fn ignores_gap_outside_live_states() {
        let mut sm = SyncStateMachine::default();
        assert!(sm.on_gap_detected().is_none());
        assert_eq!(sm.state(), SyncState::Idle);
    }

    #[test]
    fn everything_fails_after_dispose() {
        let mut sm = ready_machine();
        sm.dispose().unwrap();

        let err = sm.begin_page(PageDirection::Older).unwrap_err();
        assert_eq!(err.kind, TimelineErrorKind::Disposed);
        let err = sm.begin_initial_load().unwrap_err();
        assert_eq!(err.kind, TimelineErrorKind::Disposed);
        assert!(sm.dispose().is_err());
    }
}
