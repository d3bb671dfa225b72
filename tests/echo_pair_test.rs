// Copyright (c) 2024 The ltp-runtime Authors. Licensed under Apache License, Version 2.0.

//! End-to-end echo-pair scenario (§8): a parent sends a short message to a worker that
//! replies with the same bytes plus `!`, a hundred times in a row, and every round
//! trip scores a TPASS with zero TFAIL.

use ltp_runtime::channel::Mode;
use ltp_runtime::result::{ResultClass, tally, tst_res};
use ltp_runtime::worker::{WorkerPool, WorkerSpec};

fn echo_body() -> Box<dyn FnOnce(&mut ltp_runtime::worker::Worker) -> i32> {
    Box::new(|w| loop {
        let Ok(Some(msg)) = w.recv(64) else { return 1 };
        if msg.is_empty() {
            return 0;
        }
        let mut reply = msg;
        reply.push(b'!');
        if w.send(&reply).is_err() {
            return 1;
        }
    })
}

#[test]
#[serial_test::serial(fork)]
fn echo_pair_round_trips_one_hundred_times() {
    let pass_before = tally().pass();
    let fail_before = tally().fail();

    let mut pool = WorkerPool::setup(std::time::Duration::from_secs(5)).unwrap();
    let idx = pool
        .spawn(WorkerSpec { name: "echo".into(), mode: Mode::Sync, body: echo_body() })
        .unwrap();
    let worker = pool.get(idx);

    for _ in 0..100 {
        let mut w = worker.borrow_mut();
        w.send(b"hi").unwrap();
        let got = w.recv(64).unwrap().unwrap();
        if got == b"hi!" {
            tst_res(ResultClass::Pass, "echo pair round trip matched");
        } else {
            tst_res(ResultClass::Fail, format!("echo pair round trip mismatched: {got:?}"));
        }
    }

    worker.borrow_mut().send(b"").unwrap();
    pool.run().unwrap();
    pool.cleanup().unwrap();

    assert_eq!(tally().pass() - pass_before, 100);
    assert_eq!(tally().fail() - fail_before, 0);
}
