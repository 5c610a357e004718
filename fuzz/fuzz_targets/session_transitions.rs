//! The session state machine agrees with the reference model on arbitrary
//! event sequences, and connection ids only ever grow by one.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pairlink_core::{
    SessionEvent, SessionState,
    state::{transition, Disposition, StateAction},
};
use pairlink_harness::{ModelEvent, ModelSession};

fuzz_target!(|events: Vec<ModelEvent>| {
    let mut model = ModelSession::new();
    let mut state = SessionState::Disconnected;
    let mut last_id = 0;

    for event in events {
        let event = SessionEvent::from(event);
        let t = transition(&state, event.clone(), last_id);
        model.apply_event(event);

        for action in &t.actions {
            if let StateAction::OpenConnection { connection_id } = action {
                assert_eq!(*connection_id, last_id + 1);
                last_id = *connection_id;
            }
        }
        if t.disposition == Disposition::Ignored {
            assert!(t.actions.is_empty());
        }

        state = t.state;
        assert_eq!(state.kind(), model.state);
        assert_eq!(last_id, model.last_connection_id);
    }
});
