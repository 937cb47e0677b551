mod common;

use ioloop::{Error, EventLoop, Handle, RuntimeBuilder, Task, sleep, spawn};

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

fn event_loop() -> EventLoop {
    common::init_logging();
    RuntimeBuilder::new()
        .close_poll_interval(Duration::from_millis(50))
        .build()
        .unwrap()
}

#[test]
fn test_run_until_complete_returns_the_value() {
    let event_loop = event_loop();

    let value = event_loop.run_until_complete(async { Ok(40 + 2) }).unwrap();

    assert_eq!(value, 42);
    assert!(!event_loop.is_running());
}

#[test]
fn test_failed_computation_fails_its_task() {
    let event_loop = event_loop();

    let outcome: ioloop::Result<()> =
        event_loop.run_until_complete(async { Err(Error::InvalidState("boom")) });

    assert_eq!(outcome, Err(Error::InvalidState("boom")));
}

#[test]
fn test_awaiting_a_spawned_task() {
    let event_loop = event_loop();

    let value = event_loop
        .run_until_complete(async {
            let child = spawn(async { Ok(String::from("child")) });
            let value = child.await?;
            Ok(format!("{value} done"))
        })
        .unwrap();

    assert_eq!(value, "child done");
}

#[test]
fn test_cancellation_is_delivered_at_next_resumption() {
    let event_loop = event_loop();
    let progress = Rc::new(RefCell::new(Vec::new()));
    let log = progress.clone();

    let outcome = event_loop
        .run_until_complete(async move {
            let inner = log.clone();
            let child = Task::spawn(async move {
                inner.borrow_mut().push("started");
                sleep(Duration::from_secs(30)).await?;
                inner.borrow_mut().push("finished");
                Ok(())
            });

            sleep(Duration::from_millis(10)).await?;
            assert!(child.cancel());
            assert!(!child.done(), "cancellation must wait for the next step");

            Ok(child.await)
        })
        .unwrap();

    assert_eq!(outcome, Err(Error::Cancelled));
    assert_eq!(*progress.borrow(), vec!["started"]);
}

#[test]
fn test_cancelling_a_task_aborts_the_recv_it_awaits() {
    let event_loop = event_loop();
    let io = event_loop.clone();

    let data = event_loop
        .run_until_complete(async move {
            let (a, b) = Handle::pair()?;
            let reader = {
                let io = io.clone();
                let a = a.clone();
                spawn(async move { io.sock_recv(&a, 16)?.await })
            };

            sleep(Duration::from_millis(10)).await?;
            assert!(reader.cancel());
            assert_eq!(reader.clone().await, Err(Error::Cancelled));

            // The cancelled recv must not swallow these bytes.
            io.sock_sendall(&b, b"data".to_vec()).await?;
            io.sock_recv(&a, 16)?.await
        })
        .unwrap();

    assert_eq!(data, b"data");
}

#[test]
fn test_computation_observes_cancellation_at_its_await() {
    let event_loop = event_loop();

    let outcome = event_loop
        .run_until_complete(async {
            let child = spawn(async {
                match sleep(Duration::from_secs(30)).await {
                    Err(Error::Cancelled) => Ok("cleaned up"),
                    other => other.map(|()| "slept"),
                }
            });

            sleep(Duration::from_millis(10)).await?;
            assert!(child.cancel());
            child.await
        })
        .unwrap();

    assert_eq!(outcome, "cleaned up");
}

#[test]
fn test_every_awaiter_sees_the_result() {
    let event_loop = event_loop();

    let values = event_loop
        .run_until_complete(async {
            let shared = spawn(async {
                sleep(Duration::from_millis(10)).await?;
                Ok(String::from("shared"))
            });
            let first = spawn({
                let shared = shared.clone();
                async move { shared.await }
            });
            let second = spawn({
                let shared = shared.clone();
                async move { shared.await }
            });

            Ok(vec![first.await?, second.await?, shared.await?])
        })
        .unwrap();

    assert_eq!(values, vec!["shared", "shared", "shared"]);
}

#[test]
fn test_ready_callbacks_run_in_fifo_order() {
    let event_loop = event_loop();
    let order = Rc::new(RefCell::new(Vec::new()));

    for label in 1..=3 {
        let order = order.clone();
        event_loop.call_soon(move || {
            order.borrow_mut().push(label);
            Ok(())
        });
    }
    event_loop.run_until_complete(async { Ok(()) }).unwrap();

    assert_eq!(*order.borrow(), vec![1, 2, 3]);
}

#[test]
fn test_timers_fire_in_deadline_order_unless_cancelled() {
    let event_loop = event_loop();
    let order = Rc::new(RefCell::new(Vec::new()));

    for (label, delay) in [("late", 30), ("early", 10), ("cancelled", 20)] {
        let order = order.clone();
        let timer = event_loop.call_later(Duration::from_millis(delay), move || {
            order.borrow_mut().push(label);
            Ok(())
        });
        if label == "cancelled" {
            timer.cancel();
        }
    }

    let started = Instant::now();
    event_loop
        .run_until_complete(async { sleep(Duration::from_millis(50)).await })
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(*order.borrow(), vec!["early", "late"]);
}

#[test]
fn test_callback_errors_stop_the_loop() {
    let event_loop = event_loop();
    event_loop.call_soon(|| Err(Error::InvalidState("callback failed")));

    let outcome = event_loop.run_until_complete(async { sleep(Duration::from_secs(30)).await });

    assert_eq!(outcome, Err(Error::InvalidState("callback failed")));
    assert!(!event_loop.is_running());
}

#[test]
fn test_nested_runs_are_rejected() {
    let event_loop = event_loop();
    let inner = event_loop.clone();

    let nested = event_loop
        .run_until_complete(async move { Ok(inner.run_forever()) })
        .unwrap();

    assert!(matches!(nested, Err(Error::InvalidState(_))));
}

#[test]
fn test_socket_roundtrip_through_the_loop() {
    let event_loop = event_loop();
    let io = event_loop.clone();

    let data = event_loop
        .run_until_complete(async move {
            let (a, b) = Handle::pair()?;
            let payload = vec![7u8; 256 * 1024];

            let writer = {
                let io = io.clone();
                let a = a.clone();
                let payload = payload.clone();
                spawn(async move { io.sock_sendall(&a, payload).await })
            };

            let mut received = Vec::new();
            while received.len() < payload.len() {
                let chunk = io.sock_recv(&b, 64 * 1024)?.await?;
                assert!(!chunk.is_empty());
                received.extend(chunk);
            }
            writer.await?;
            Ok(received)
        })
        .unwrap();

    assert_eq!(data.len(), 256 * 1024);
    assert!(data.iter().all(|&byte| byte == 7));
}

#[test]
fn test_start_serving_accepts_until_stopped() {
    let event_loop = event_loop();
    let io = event_loop.clone();
    let peers = Rc::new(RefCell::new(Vec::new()));
    let seen = peers.clone();

    event_loop
        .run_until_complete(async move {
            let listener = Handle::listen("127.0.0.1:0".parse().unwrap(), 16)?;
            let address = listener.local_addr()?;
            let serving = io.start_serving(listener.clone(), move |connection, peer| {
                seen.borrow_mut().push((connection, peer));
            });

            let client = Handle::stream_for(&address)?;
            io.sock_connect(&client, address)?.await?;
            while peers.borrow().is_empty() {
                sleep(Duration::from_millis(5)).await?;
            }

            io.stop_serving(&listener);
            serving.await?;
            assert!(listener.is_closed());

            let peer = peers.borrow()[0].1.as_socket();
            assert_eq!(peer, Some(client.local_addr()?));
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_pipe_echo_end_to_end() {
    let event_loop = event_loop();
    let io = event_loop.clone();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("echo");

    let reply = event_loop
        .run_until_complete(async move {
            let server_io = io.clone();
            let serving = io.start_serving_pipe(&path, move |pipe| {
                let io = server_io.clone();
                server_io.spawn(async move {
                    let Some(handle) = pipe.handle() else {
                        return Ok(());
                    };
                    let data = io.sock_recv(&handle, 64)?.await?;
                    io.sock_sendall(&handle, data).await
                });
            })?;

            let client = io.create_pipe_connection(&path)?.await?;
            io.sock_sendall(&client, b"ping".to_vec()).await?;
            let reply = io.sock_recv(&client, 64)?.await?;

            serving.close();
            serving.task().clone().await?;
            assert!(!path.exists());
            Ok(reply)
        })
        .unwrap();

    assert_eq!(reply, b"ping");
}

#[test]
fn test_close_is_idempotent_and_final() {
    let event_loop = event_loop();
    let (a, _b) = Handle::pair().unwrap();

    event_loop.close().unwrap();
    event_loop.close().unwrap();

    assert!(matches!(event_loop.sock_recv(&a, 1), Err(Error::Closed)));
}
