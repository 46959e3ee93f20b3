//! Race tests for the optimistic concurrency protocol, run against the
//! in-memory store with plain threads.

use std::sync::Arc;
use std::thread;

use chrono::Utc;

use deskserver::shared::enums::{ActorRole, TicketPriority, TicketStatus};
use deskserver::tickets::service::{self, EditOutcome, TicketChanges};
use deskserver::tickets::store::{MemoryTicketStore, TicketDraft, TicketStore};

fn seed(store: &MemoryTicketStore) -> deskserver::tickets::Ticket {
    store
        .create(
            TicketDraft {
                company_id: 1,
                title: "laptop will not boot".to_string(),
                description: None,
                priority: TicketPriority::Medium,
                category_id: None,
                assignee_id: None,
            },
            Utc::now(),
        )
        .expect("create failed")
}

#[test]
fn exactly_one_of_n_concurrent_editors_wins() {
    let store = Arc::new(MemoryTicketStore::new());
    let ticket = seed(&store);

    const N: usize = 16;
    let mut handles = Vec::with_capacity(N);
    for i in 0..N {
        let store = Arc::clone(&store);
        let ticket = ticket.clone();
        handles.push(thread::spawn(move || {
            service::edit_ticket(
                store.as_ref(),
                ticket.id,
                ticket.version,
                TicketChanges {
                    title: Some(format!("edited by thread {i}")),
                    ..Default::default()
                },
                None,
                ActorRole::Employee,
                Utc::now(),
            )
            .expect("store failed")
        }));
    }

    let mut wins = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.join().expect("thread panicked") {
            EditOutcome::Updated(_) => wins += 1,
            EditOutcome::Conflict(latest) => {
                // Every loser sees the winner's committed state.
                assert_ne!(latest.version, ticket.version);
                conflicts += 1;
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    assert_eq!(wins, 1);
    assert_eq!(conflicts, N - 1);
}

#[test]
fn version_tokens_never_repeat_across_successful_edits() {
    let store = MemoryTicketStore::new();
    let mut ticket = seed(&store);

    let mut seen = std::collections::HashSet::new();
    assert!(seen.insert(format!("{}", ticket.version)));

    for round in 0..20 {
        let outcome = service::edit_ticket(
            &store,
            ticket.id,
            ticket.version,
            TicketChanges {
                title: Some(format!("round {round}")),
                ..Default::default()
            },
            None,
            ActorRole::Admin,
            Utc::now(),
        )
        .expect("store failed");

        ticket = match outcome {
            EditOutcome::Updated(t) => t,
            other => panic!("edit {round} did not apply: {:?}", other),
        };
        assert!(
            seen.insert(format!("{}", ticket.version)),
            "token reissued on round {round}"
        );
    }
}

#[test]
fn racing_comment_and_transition_stamp_first_response_once() {
    let store = Arc::new(MemoryTicketStore::new());
    let ticket = seed(&store);

    let commenter = {
        let store = Arc::clone(&store);
        let id = ticket.id;
        thread::spawn(move || {
            service::add_comment(
                store.as_ref(),
                id,
                ActorRole::Employee,
                None,
                "taking a look".to_string(),
                Utc::now(),
            )
            .expect("store failed")
        })
    };

    let transitioner = {
        let store = Arc::clone(&store);
        let ticket = ticket.clone();
        thread::spawn(move || {
            // Retry on conflict, the way a caller is supposed to.
            let mut snapshot = ticket;
            loop {
                let outcome = service::edit_ticket(
                    store.as_ref(),
                    snapshot.id,
                    snapshot.version,
                    TicketChanges::default(),
                    Some(TicketStatus::InProgress),
                    ActorRole::Employee,
                    Utc::now(),
                )
                .expect("store failed");
                match outcome {
                    EditOutcome::Updated(t) => break t,
                    EditOutcome::Conflict(latest) => snapshot = latest,
                    other => panic!("unexpected outcome: {:?}", other),
                }
            }
        })
    };

    commenter.join().expect("commenter panicked");
    transitioner.join().expect("transitioner panicked");

    let finished = store.read(ticket.id).expect("store failed").expect("gone");
    assert_eq!(finished.status, TicketStatus::InProgress);
    let stamp = finished.first_response_at.expect("first response unset");

    // Whichever event won the race, the stamp never moves afterwards.
    let outcome = service::add_comment(
        store.as_ref(),
        ticket.id,
        ActorRole::Admin,
        None,
        "following up".to_string(),
        Utc::now(),
    )
    .expect("store failed");
    let service::CommentOutcome::Added { ticket: after, .. } = outcome else {
        panic!("follow-up comment failed");
    };
    assert_eq!(after.first_response_at, Some(stamp));
}
