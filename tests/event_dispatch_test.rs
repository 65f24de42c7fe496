use std::{
    sync::{mpsc, Arc, Mutex},
    time::SystemTime,
};

use coprotocols_rs::{
    event_dispatch::{start_event_dispatcher, EventHandlers},
    events::{CommitLedgerEvent, Event, RollbackEvent},
    types::data_types::CryptoHash,
};
use log::LevelFilter;

mod common;

use crate::common::logging::setup_logger;

#[test]
fn handlers_see_only_their_event_kind() {
    setup_logger(LevelFilter::Debug);

    let commits = Arc::new(Mutex::new(Vec::new()));
    let rollbacks = Arc::new(Mutex::new(0));
    let handlers = EventHandlers::new()
        .with_default_loggers()
        .on_commit_ledger({
            let commits = commits.clone();
            move |event| commits.lock().unwrap().push(event.size)
        })
        .on_rollback({
            let rollbacks = rollbacks.clone();
            move |_| *rollbacks.lock().unwrap() += 1
        });

    let (event_publisher, event_subscriber) = mpsc::channel();
    let (shutdown, shutdown_signal) = mpsc::channel::<()>();
    let dispatcher = start_event_dispatcher(handlers, event_subscriber, shutdown_signal);

    for size in [1, 2] {
        event_publisher
            .send(Event::CommitLedger(CommitLedgerEvent {
                timestamp: SystemTime::now(),
                ledger: "orders".to_string(),
                root_hash: CryptoHash::new([size as u8; 32]),
                size,
            }))
            .unwrap();
    }
    event_publisher
        .send(Event::Rollback(RollbackEvent {
            timestamp: SystemTime::now(),
            ledger: "orders".to_string(),
            root_hash: CryptoHash::new([0; 32]),
        }))
        .unwrap();

    // Hanging up every publisher lets the dispatcher drain the channel and exit.
    drop(event_publisher);
    dispatcher.join().unwrap();
    drop(shutdown);

    assert_eq!(*commits.lock().unwrap(), vec![1, 2]);
    assert_eq!(*rollbacks.lock().unwrap(), 1);
}
