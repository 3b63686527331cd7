//! Connection tests against a scripted device on a loopback link.

use std::thread;
use std::time::Duration;

use serde_json::{json, Value};
use serial_test::serial;
use upyt_host::{loopback, Connection, HostError, LinkConfig, HARD_RESET};
use upyt_wire::Args;

// ============================================================================
// Scripted Device
// ============================================================================

/// Answers the discovery instructions, `ping`, construction of `Led` and its
/// `on` method. Anything else produces a fault report.
fn scripted_reply(line: &str, next_id: &mut u64) -> String {
    let request: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return String::new(),
    };
    if request.get("rid").is_some() {
        return match request["i"].as_str() {
            Some("on") => "true\rok\r".to_string(),
            _ => format!("fault: no method\rrequest: {}\r", line),
        };
    }
    if let Some(class) = request.get("rc") {
        if class == "Led" {
            let id = *next_id;
            *next_id += 1;
            return format!("{}\rok\r", id);
        }
        return format!("fault: no class\rrequest: {}\r", line);
    }
    match request["i"].as_str() {
        Some("list_instructions") => {
            "[\"clean_remote_classes\",\"list_instructions\",\"list_remote_classes\",\"ping\"]\rok\r"
                .to_string()
        }
        Some("list_remote_classes") => "[\"Led\"]\rok\r".to_string(),
        Some("ping") => match request["k"]["value"].as_i64() {
            Some(v) => format!("{{\"value\":{}}}\rok\r", v + 1),
            None => format!("fault: bad value\rrequest: {}\r", line),
        },
        _ => "ok\r".to_string(),
    }
}

fn config() -> LinkConfig {
    LinkConfig {
        read_timeout_ms: 20,
        write_timeout_ms: 5,
        response_timeout_ms: 500,
        ..LinkConfig::default()
    }
}

fn scripted_connection() -> Connection {
    let (opener, peer) = loopback("scripted");
    let (device_rx, device_tx) = peer.into_parts();
    thread::spawn(move || {
        let mut next_id = 0;
        let mut line = Vec::new();
        while let Ok(byte) = device_rx.recv() {
            if byte != b'\r' {
                line.push(byte);
                continue;
            }
            let reply = scripted_reply(&String::from_utf8_lossy(&line), &mut next_id);
            line.clear();
            for b in reply.bytes() {
                if device_tx.send(b).is_err() {
                    return;
                }
            }
        }
    });
    Connection::new(opener, config())
}

// ============================================================================
// Tests
// ============================================================================

#[test]
#[serial]
fn test_open_discovers_calls() {
    let connection = scripted_connection();
    assert!(!connection.is_open());
    connection.open().unwrap();
    assert!(connection.is_open());
    assert_eq!(
        connection.instructions(),
        vec!["clean_remote_classes", "list_instructions", "list_remote_classes", "ping"]
    );
    assert_eq!(connection.remote_classes(), vec!["Led"]);
    connection.close();
    assert!(connection.instructions().is_empty());
}

#[test]
#[serial]
fn test_open_close_idempotent() {
    let connection = scripted_connection();
    connection.open().unwrap();
    connection.open().unwrap();
    connection.close();
    connection.close();
    connection.open().unwrap();
    let value = connection.call("ping", Args::new().kwarg("value", 1)).unwrap().recv().unwrap();
    assert_eq!(value, json!({"value": 2}));
    connection.close();
}

#[test]
#[serial]
fn test_unknown_names_are_local_errors() {
    let connection = scripted_connection();
    connection.open().unwrap();
    assert!(matches!(
        connection.call("reboot", Args::new()),
        Err(HostError::UnknownInstruction(_))
    ));
    assert!(matches!(
        connection.instantiate("Motor", Args::new()),
        Err(HostError::UnknownClass(_))
    ));
    assert!(matches!(
        connection.instruction("reboot"),
        Err(HostError::UnknownInstruction(_))
    ));
    // Still usable.
    let ping = connection.instruction("ping").unwrap();
    assert_eq!(ping.name(), "ping");
    let value = ping.call(Args::new().kwarg("value", 41)).unwrap().recv().unwrap();
    assert_eq!(value["value"], 42);
}

#[test]
#[serial]
fn test_remote_objects() {
    let connection = scripted_connection();
    connection.open().unwrap();
    let first = connection.instantiate("Led", Args::new()).unwrap();
    let second = connection.instantiate("Led", Args::new()).unwrap();
    assert_eq!(first.class(), "Led");
    assert!(second.id() > first.id());
    let value = first.call("on", Args::new()).unwrap().recv().unwrap();
    assert_eq!(value, json!(true));
}

#[test]
#[serial]
fn test_remote_fault_halts() {
    let connection = scripted_connection();
    connection.open().unwrap();
    let led = connection.instantiate("Led", Args::new()).unwrap();
    match led.call("explode", Args::new()) {
        Err(HostError::Remote(fault)) => {
            assert_eq!(fault.lines[0], "fault: no method");
            assert!(fault.lines[1].starts_with("request: "));
        }
        other => panic!("expected remote fault, got {:?}", other.map(|_| ())),
    }
    assert!(connection.is_halted());
    assert!(matches!(
        connection.call("ping", Args::new().kwarg("value", 1)),
        Err(HostError::Closing)
    ));
    assert_eq!(connection.remote_faults().len(), 1);
    assert!(connection.remote_faults().is_empty());
}

#[test]
#[serial]
fn test_async_responses_iterator() {
    let connection = scripted_connection();
    connection.open().unwrap();
    connection.set_async_send(true);
    assert!(connection.is_async_send());
    for v in [1, 2, 3] {
        connection.call("ping", Args::new().kwarg("value", v)).unwrap();
    }
    connection.wait();
    let values: Vec<Value> = connection
        .responses(Duration::from_millis(100))
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(
        values,
        vec![json!({"value": 2}), json!({"value": 3}), json!({"value": 4})]
    );
    connection.set_async_send(false);
    assert!(!connection.is_async_send());
}

#[test]
#[serial]
fn test_halt_then_close() {
    let connection = scripted_connection();
    connection.open().unwrap();
    connection.halt();
    assert!(matches!(
        connection.call("ping", Args::new().kwarg("value", 1)),
        Err(HostError::Closing)
    ));
    connection.close();
    assert!(!connection.is_open());
}

#[test]
#[serial]
fn test_hard_reset_writes_repl_sequence() {
    let (opener, peer) = loopback("hard");
    let (device_rx, _device_tx) = peer.into_parts();
    let connection = Connection::new(opener, config());
    connection.reset(true).unwrap();
    assert!(!connection.is_open());
    let written: Vec<u8> = device_rx.try_iter().collect();
    assert_eq!(written, HARD_RESET);
    assert_eq!(written, b"\x03\r\nimport pyb\r\npyb.hard_reset()\r\n");
}

#[test]
#[serial]
fn test_soft_reset_needs_machine_reset() {
    let connection = scripted_connection();
    assert!(matches!(
        connection.reset(false),
        Err(HostError::UnknownInstruction(name)) if name == "machine_reset"
    ));
    assert!(!connection.is_open());
}
