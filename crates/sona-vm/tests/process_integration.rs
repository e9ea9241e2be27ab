//! Integration tests of processes and messaging below the interpreter

use sona_vm::config::Config;
use sona_vm::heap::LocalHeap;
use sona_vm::message::Envelope;
use sona_vm::object::ObjectKind;
use sona_vm::{Process, ProcessStatus, Value};
use std::sync::Arc;
use std::thread;

fn receiver_heap() -> LocalHeap {
    LocalHeap::new(64 * 1024, 1024 * 1024)
}

#[test]
fn test_per_sender_fifo_with_concurrent_senders() {
    const SENDERS: i64 = 4;
    const MESSAGES: i64 = 200;

    let receiver = Process::new(&Config::for_tests(), false);
    let mut handles = Vec::new();

    // Each sender tags its messages as sender * 1000 + sequence.
    for sender in 0..SENDERS {
        let receiver = Arc::clone(&receiver);

        handles.push(thread::spawn(move || {
            for sequence in 0..MESSAGES {
                let tag = sender * 1000 + sequence;
                let envelope =
                    Envelope::copy(Value::integer(tag).unwrap()).unwrap();

                receiver.send_message(envelope);
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    let mut heap = receiver_heap();
    let mut last_sequence = vec![-1i64; SENDERS as usize];
    let mut total = 0;

    while let Some(envelope) = receiver.mailbox().receive() {
        let tag = envelope.materialize(&mut heap).as_integer().unwrap();
        let sender = (tag / 1000) as usize;
        let sequence = tag % 1000;

        // Messages from one sender arrive in send order, whatever the
        // interleaving across senders.
        assert!(sequence > last_sequence[sender]);

        last_sequence[sender] = sequence;
        total += 1;
    }

    assert_eq!(total, SENDERS * MESSAGES);
}

#[test]
fn test_deep_copy_produces_disjoint_graphs() {
    let mut sender_heap = receiver_heap();
    let mut heap = receiver_heap();

    let element = sender_heap.allocate(Value::nil(), ObjectKind::String("data".into()));
    let array = sender_heap.allocate(Value::nil(), ObjectKind::Array(vec![element]));

    let envelope = Envelope::copy(array).unwrap();
    let copied = envelope.materialize(&mut heap);

    assert_ne!(copied.raw(), array.raw());

    let copied_element = unsafe { copied.object_ref() }.array().unwrap()[0];

    assert_ne!(copied_element.raw(), element.raw());

    // Mutating the copy leaves the original untouched.
    unsafe {
        copied.object_mut().array_mut().unwrap().clear();
    }

    assert_eq!(unsafe { array.object_ref() }.array().unwrap().len(), 1);
}

#[test]
fn test_wake_after_send_is_exclusive() {
    let process = Process::new(&Config::for_tests(), false);

    process.start_waiting(ProcessStatus::WaitingForMessage);

    let mut winners = 0;

    for _ in 0..4 {
        if process.try_wake() {
            winners += 1;
        }
    }

    // Exactly one waker gets to reschedule the process.
    assert_eq!(winners, 1);
    assert_eq!(process.status(), ProcessStatus::Runnable);
}
