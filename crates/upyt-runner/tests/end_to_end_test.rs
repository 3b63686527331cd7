//! Host and device engines talking to each other over a loopback link.

use std::time::{Duration, Instant};

use serde_json::{json, Value};
use serial_test::serial;
use upyt_host::{Connection, HostError, LinkConfig};
use upyt_runner::commands::{
    call_instruction, comport, device_info, parse_call_args, reset_device,
};
use upyt_runner::sim::{SimulatedBoard, VIRTUAL_PIN};
use upyt_runner::RunnerError;
use upyt_wire::{Args, Request};

fn config() -> LinkConfig {
    LinkConfig {
        read_timeout_ms: 20,
        write_timeout_ms: 5,
        response_timeout_ms: 1000,
        ..LinkConfig::default()
    }
}

fn open_board(name: &str) -> (SimulatedBoard, Connection) {
    let board = SimulatedBoard::spawn(name).unwrap();
    let connection = board.connect(config());
    connection.open().unwrap();
    (board, connection)
}

fn ping(connection: &Connection, value: impl Into<Value>) -> Result<upyt_host::Pending, HostError> {
    connection.call("ping", Args::new().kwarg("value", value))
}

#[test]
#[serial]
fn test_discovered_instructions_are_sorted() {
    let (_board, connection) = open_board("sim-list");
    let names = connection.instructions();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
    for builtin in [
        "break_loop",
        "clean_remote_classes",
        "list_instructions",
        "list_remote_classes",
        "ping",
    ] {
        assert!(names.iter().any(|n| n == builtin), "missing {}", builtin);
    }
    assert_eq!(connection.remote_classes(), vec![VIRTUAL_PIN]);
}

#[test]
#[serial]
fn test_sync_pings_in_order() {
    let (_board, connection) = open_board("sim-sync");
    for v in [10, 20, 30] {
        let reply = ping(&connection, v).unwrap().recv().unwrap();
        assert_eq!(reply, json!({"value": v + 1}));
    }
}

#[test]
#[serial]
fn test_async_batch_in_order() {
    let (_board, connection) = open_board("sim-async");
    connection.set_async_send(true);
    for v in [10, 20, 30, 40, 50, 60] {
        ping(&connection, v).unwrap();
    }
    connection.wait();
    let values: Vec<Value> = connection
        .responses(Duration::from_millis(200))
        .collect::<Result<_, _>>()
        .unwrap();
    let expected: Vec<Value> = [11, 21, 31, 41, 51, 61]
        .iter()
        .map(|v| json!({"value": v}))
        .collect();
    assert_eq!(values, expected);
}

#[test]
#[serial]
fn test_async_fault_after_good_replies() {
    let (board, connection) = open_board("sim-fault");
    connection.set_async_send(true);
    ping(&connection, 10).unwrap();
    ping(&connection, 20).unwrap();
    ping(&connection, 30).unwrap();
    ping(&connection, "abc").unwrap();

    let mut values = Vec::new();
    let fault = loop {
        match connection.receive(Some(Duration::from_secs(2))) {
            Ok(Some(value)) => values.push(value),
            Ok(None) => panic!("no fault reported"),
            Err(err) => break err,
        }
    };
    assert_eq!(
        values,
        vec![json!({"value": 11}), json!({"value": 21}), json!({"value": 31})]
    );
    match fault {
        HostError::Remote(fault) => {
            assert!(fault.lines[0].starts_with("fault: "), "{:?}", fault.lines);
            assert!(fault.message().contains("abc") || fault.message().contains("value"));
        }
        other => panic!("expected remote fault, got {:?}", other),
    }
    assert!(connection.is_halted());
    assert!(matches!(ping(&connection, 1), Err(HostError::Closing)));

    drop(connection);
    assert!(matches!(board.join(), Err(RunnerError::Listener(_))));
}

#[test]
#[serial]
fn test_sync_fault_then_closing() {
    let (_board, connection) = open_board("sim-sync-fault");
    assert!(matches!(
        connection.send(&Request::method(42, "value", Args::new())),
        Err(HostError::Remote(_))
    ));
    assert!(matches!(ping(&connection, 1), Err(HostError::Closing)));
    assert_eq!(connection.remote_faults().len(), 1);
}

#[test]
#[serial]
fn test_remote_ids_survive_clean() {
    let (_board, connection) = open_board("sim-ids");
    let first = connection
        .instantiate(VIRTUAL_PIN, Args::new().arg("X1"))
        .unwrap();
    let second = connection
        .instantiate(VIRTUAL_PIN, Args::new().arg("X2"))
        .unwrap();
    assert!(second.id() > first.id());

    connection.call("clean_remote_classes", Args::new()).unwrap();
    let third = connection
        .instantiate(VIRTUAL_PIN, Args::new().arg("X3"))
        .unwrap();
    assert!(third.id() > second.id());
    let name = third.call("name", Args::new()).unwrap().recv().unwrap();
    assert_eq!(name, json!("X3"));
}

#[test]
#[serial]
fn test_object_references() {
    let (_board, connection) = open_board("sim-refs");
    let led = connection
        .instantiate(VIRTUAL_PIN, Args::new().arg("LED"))
        .unwrap();
    let button = connection
        .instantiate(VIRTUAL_PIN, Args::new().arg("BTN"))
        .unwrap();
    button
        .call("follow", Args::new().try_arg(&led).unwrap())
        .unwrap();
    button.call("on", Args::new()).unwrap();
    let level = led.call("value", Args::new()).unwrap().recv().unwrap();
    assert_eq!(level, json!(true));
}

#[test]
#[serial]
fn test_no_response_for_void_calls() {
    let (_board, connection) = open_board("sim-void");
    let pin = connection
        .instantiate(VIRTUAL_PIN, Args::new().arg("X1"))
        .unwrap();
    assert_eq!(pin.call("on", Args::new()).unwrap().try_recv().unwrap(), None);
    // The next response belongs to the next call.
    let reply = ping(&connection, 1).unwrap().recv().unwrap();
    assert_eq!(reply, json!({"value": 2}));
}

#[test]
#[serial]
fn test_deferred_reply_waits() {
    let (_board, connection) = open_board("sim-delay");
    let start = Instant::now();
    let reply = connection
        .call("delay_ms", Args::new().arg(50))
        .unwrap()
        .try_recv()
        .unwrap();
    assert_eq!(reply, None);
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[test]
#[serial]
fn test_open_close_idempotent() {
    let board = SimulatedBoard::spawn("sim-reopen").unwrap();
    let connection = board.connect(config());
    connection.open().unwrap();
    connection.open().unwrap();
    connection.close();
    connection.close();
    assert!(!connection.is_open());
    connection.open().unwrap();
    assert_eq!(ping(&connection, 5).unwrap().recv().unwrap(), json!({"value": 6}));
}

#[test]
#[serial]
fn test_break_loop_stops_board() {
    let (board, connection) = open_board("sim-break");
    connection.call("break_loop", Args::new()).unwrap();
    drop(connection);
    board.join().unwrap();
}

#[test]
#[serial]
fn test_commands_against_board() {
    let (_board, connection) = open_board("sim-cli");
    let info = device_info(&connection).unwrap();
    assert_eq!(info.name, "sim-cli");
    assert_eq!(info.remote_classes, vec![VIRTUAL_PIN]);
    let system = info.system.unwrap();
    assert_eq!(system["imp"][0], "rust");

    let args = parse_call_args(&["value=41"]);
    let reply = call_instruction(&connection, "ping", args).unwrap();
    assert_eq!(reply, Some(json!({"value": 42})));
}

fn wait_for(what: &str, timeout: Duration, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
#[serial]
fn test_open_switches_heartbeat_on() {
    let board = SimulatedBoard::spawn("sim-heartbeat").unwrap();
    let connection = board.connect(LinkConfig {
        heartbeat: true,
        ..config()
    });
    connection.open().unwrap();
    let led = board.led();
    wait_for("a heartbeat pulse", Duration::from_secs(1), || led.pulses() >= 1);
}

#[test]
#[serial]
fn test_open_leaves_heartbeat_off() {
    let (board, connection) = open_board("sim-no-heartbeat");
    assert_eq!(ping(&connection, 1).unwrap().recv().unwrap(), json!({"value": 2}));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(board.led().pulses(), 0);
    assert!(!board.led().is_lit());
}

#[test]
#[serial]
fn test_soft_reset_restarts_listener() {
    let (board, connection) = open_board("sim-soft-reset");
    let before = connection
        .instantiate(VIRTUAL_PIN, Args::new().arg("X1"))
        .unwrap();
    connection
        .instantiate(VIRTUAL_PIN, Args::new().arg("X2"))
        .unwrap();
    assert_eq!(before.id(), 0);

    reset_device(&connection, false).unwrap();
    assert!(!connection.is_open());
    wait_for("the second boot", Duration::from_secs(1), || board.boots() == 2);

    connection.open().unwrap();
    let after = connection
        .instantiate(VIRTUAL_PIN, Args::new().arg("X3"))
        .unwrap();
    assert_eq!(after.id(), 0);
    assert_eq!(ping(&connection, 7).unwrap().recv().unwrap(), json!({"value": 8}));
    assert!(board.is_running());
}

#[test]
#[serial]
fn test_hard_reset_through_repl() {
    let (board, connection) = open_board("sim-hard-reset");
    connection
        .instantiate(VIRTUAL_PIN, Args::new().arg("X1"))
        .unwrap();

    reset_device(&connection, true).unwrap();
    assert!(!connection.is_open());
    wait_for("the second boot", Duration::from_secs(1), || board.boots() == 2);

    connection.open().unwrap();
    let pin = connection
        .instantiate(VIRTUAL_PIN, Args::new().arg("X2"))
        .unwrap();
    assert_eq!(pin.id(), 0);
    assert!(board.is_running());
}

#[test]
#[serial]
fn test_comport_of_unattached_serial() {
    let dir = std::env::temp_dir().join(format!("upyt-comport-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(".upytester.yml");
    std::fs::write(&path, "devices: {}\n").unwrap();
    let result = comport("no-such-board-serial", Some(&path));
    std::fs::remove_dir_all(&dir).unwrap();
    assert!(matches!(result, Err(RunnerError::Host(_))));
}
