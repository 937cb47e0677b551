#![allow(dead_code)]

use ioloop::{LoopHandle, Proactor, RuntimeBuilder};

use std::time::{Duration, Instant};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A proactor attached to a fresh loop handle, for driving operations by hand.
pub fn proactor_with(builder: RuntimeBuilder) -> (Proactor, LoopHandle) {
    init_logging();
    let mut proactor = builder.build_proactor().unwrap();
    let handle = LoopHandle::new();
    proactor.set_loop(&handle);
    (proactor, handle)
}

pub fn proactor() -> (Proactor, LoopHandle) {
    proactor_with(RuntimeBuilder::new())
}

/// Polls until `done` holds, failing the test after five seconds.
pub fn poll_until(proactor: &mut Proactor, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for completions");
        proactor.poll(Some(Duration::from_millis(20))).unwrap();
    }
}
