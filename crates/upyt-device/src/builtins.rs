//! Instructions every device provides, plus optional diagnostics.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use upyt_wire::{Args, WireError};

use crate::error::{DeviceResult, RegistrationError};
use crate::registry::{Context, RegistryBuilder};
use crate::reply::Reply;

/// How long the heartbeat pulse stays on.
pub const HEARTBEAT_PULSE: Duration = Duration::from_millis(20);

/// Default heartbeat period.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_millis(1000);

pub(crate) fn register_core(builder: &mut RegistryBuilder) {
    builder.insert_builtin("list_instructions", Box::new(list_instructions));
    builder.insert_builtin("list_remote_classes", Box::new(list_remote_classes));
    builder.insert_builtin("clean_remote_classes", Box::new(clean_remote_classes));
    builder.insert_builtin("break_loop", Box::new(break_loop));
    builder.insert_builtin("machine_reset", Box::new(machine_reset));
}

fn list_instructions(ctx: &mut Context<'_>, _: Args) -> DeviceResult<Reply> {
    Ok(Reply::value(ctx.registry().instruction_names()))
}

fn list_remote_classes(ctx: &mut Context<'_>, _: Args) -> DeviceResult<Reply> {
    Ok(Reply::value(ctx.registry().class_names()))
}

fn clean_remote_classes(ctx: &mut Context<'_>, _: Args) -> DeviceResult<Reply> {
    ctx.instances().destroy_all();
    Ok(Reply::none())
}

fn break_loop(ctx: &mut Context<'_>, _: Args) -> DeviceResult<Reply> {
    log::info!("break_loop requested");
    ctx.keepalive().stop();
    Ok(Reply::none())
}

// Acknowledged before the listener exits; whoever drives the loop restarts
// the board.
fn machine_reset(ctx: &mut Context<'_>, _: Args) -> DeviceResult<Reply> {
    log::info!("machine_reset requested");
    ctx.instances().destroy_all();
    ctx.keepalive().request_reset();
    Ok(Reply::none())
}

/// Register `ping`, `get_ticks_ms` and `get_system_info`.
pub fn register_diagnostics(builder: &mut RegistryBuilder) -> Result<(), RegistrationError> {
    builder
        .register_instruction("ping", ping)?
        .register_instruction("get_ticks_ms", get_ticks_ms)?
        .register_instruction("get_system_info", get_system_info)?;
    Ok(())
}

// Echoes the value incremented so the host can tell the reply is fresh.
fn ping(_: &mut Context<'_>, args: Args) -> DeviceResult<Reply> {
    let value: i64 = args.get_or(0, "value", 0)?;
    let next = value.checked_add(1).ok_or_else(|| WireError::InvalidArgument {
        name: "value".to_string(),
        reason: "overflows when incremented".to_string(),
    })?;
    Ok(Reply::value(json!({ "value": next })))
}

fn get_ticks_ms(ctx: &mut Context<'_>, _: Args) -> DeviceResult<Reply> {
    let ticks = u64::try_from(ctx.uptime().as_millis()).unwrap_or(u64::MAX);
    Ok(Reply::value(ticks))
}

fn get_system_info(_: &mut Context<'_>, _: Args) -> DeviceResult<Reply> {
    Ok(Reply::value(json!({
        "imp": ["rust", env!("CARGO_PKG_NAME")],
        "ver": env!("CARGO_PKG_VERSION"),
        "platform": std::env::consts::OS,
    })))
}

/// Build a `heartbeat(enabled=true, period_ms=1000)` instruction.
///
/// While enabled, a local task calls `pulse(true)` once per period and
/// `pulse(false)` [`HEARTBEAT_PULSE`] later. The task is local to the
/// listener loop and ends with it.
pub fn heartbeat<P>(pulse: P) -> impl Fn(&mut Context<'_>, Args) -> DeviceResult<Reply>
where
    P: Fn(bool) + 'static,
{
    let pulse = Rc::new(pulse);
    let task: Rc<RefCell<Option<JoinHandle<()>>>> = Rc::default();

    move |_: &mut Context<'_>, args: Args| -> DeviceResult<Reply> {
        let enabled: bool = args.get_or(0, "enabled", true)?;
        let default_period = u64::try_from(HEARTBEAT_PERIOD.as_millis()).unwrap_or(1000);
        let period_ms: u64 = args.get_or(1, "period_ms", default_period)?;
        if period_ms == 0 {
            return Err(WireError::InvalidArgument {
                name: "period_ms".to_string(),
                reason: "must be positive".to_string(),
            }
            .into());
        }

        if let Some(running) = task.borrow_mut().take() {
            running.abort();
            (*pulse)(false);
        }
        if enabled {
            let pulse = Rc::clone(&pulse);
            let handle = tokio::task::spawn_local(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(period_ms));
                loop {
                    ticker.tick().await;
                    (*pulse)(true);
                    tokio::time::sleep(HEARTBEAT_PULSE).await;
                    (*pulse)(false);
                }
            });
            *task.borrow_mut() = Some(handle);
        }
        log::debug!("heartbeat {}", if enabled { "enabled" } else { "disabled" });
        Ok(Reply::none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instances::InstanceTable;
    use crate::listener::KeepAlive;
    use crate::registry::Registry;
    use serde_json::Value;
    use std::cell::Cell;
    use std::time::Instant;

    fn call(registry: &Registry, name: &str, args: Args) -> (DeviceResult<Reply>, KeepAlive) {
        let mut instances = InstanceTable::new();
        let keepalive = KeepAlive::new();
        let mut ctx = Context {
            registry,
            instances: &mut instances,
            keepalive: &keepalive,
            started: Instant::now(),
        };
        let handler = registry.resolve_instruction(name).unwrap();
        (handler(&mut ctx, args), keepalive)
    }

    fn value(reply: DeviceResult<Reply>) -> Option<Value> {
        match reply.unwrap() {
            Reply::Ready(v) => v,
            Reply::Deferred(_) => panic!("unexpected deferred reply"),
        }
    }

    fn diagnostics_registry() -> Registry {
        let mut builder = Registry::builder();
        register_diagnostics(&mut builder).unwrap();
        builder.build()
    }

    #[test]
    fn test_ping_increments() {
        let registry = diagnostics_registry();
        let (reply, _) = call(&registry, "ping", Args::new().kwarg("value", 10));
        assert_eq!(value(reply), Some(json!({"value": 11})));
        let (reply, _) = call(&registry, "ping", Args::new());
        assert_eq!(value(reply), Some(json!({"value": 1})));
    }

    #[test]
    fn test_ping_rejects_non_integer() {
        let registry = diagnostics_registry();
        let (reply, _) = call(&registry, "ping", Args::new().arg("abc"));
        assert!(reply.is_err());
    }

    #[test]
    fn test_break_loop_clears_keepalive() {
        let registry = Registry::builder().build();
        let (reply, keepalive) = call(&registry, "break_loop", Args::new());
        assert_eq!(value(reply), None);
        assert!(!keepalive.is_alive());
    }

    #[test]
    fn test_machine_reset_requests_restart() {
        let registry = Registry::builder().build();
        let (reply, keepalive) = call(&registry, "machine_reset", Args::new());
        assert_eq!(value(reply), None);
        assert!(!keepalive.is_alive());
        assert_eq!(keepalive.exit(), crate::listener::Exit::Reset);
    }

    #[test]
    fn test_system_info() {
        let registry = diagnostics_registry();
        let (reply, _) = call(&registry, "get_system_info", Args::new());
        let info = value(reply).unwrap();
        assert_eq!(info["ver"], env!("CARGO_PKG_VERSION"));
        assert_eq!(info["imp"][0], "rust");
    }

    #[test]
    fn test_list_remote_classes_empty() {
        let registry = Registry::builder().build();
        let (reply, _) = call(&registry, "list_remote_classes", Args::new());
        assert_eq!(value(reply), Some(json!([])));
    }

    #[tokio::test]
    async fn test_heartbeat_pulses() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let pulses = Rc::new(Cell::new(0u32));
                let counter = Rc::clone(&pulses);
                let mut builder = Registry::builder();
                builder
                    .register_instruction(
                        "heartbeat",
                        heartbeat(move |on| {
                            if on {
                                counter.set(counter.get() + 1);
                            }
                        }),
                    )
                    .unwrap();
                let registry = builder.build();

                let (reply, _) = call(&registry, "heartbeat", Args::new().kwarg("period_ms", 5));
                assert!(reply.is_ok());
                tokio::time::sleep(Duration::from_millis(30)).await;
                assert!(pulses.get() >= 1);

                let (reply, _) = call(&registry, "heartbeat", Args::new().arg(false));
                assert!(reply.is_ok());
                let seen = pulses.get();
                tokio::time::sleep(Duration::from_millis(30)).await;
                assert_eq!(pulses.get(), seen);
            })
            .await;
    }

    #[tokio::test]
    async fn test_heartbeat_disabled_by_keyword() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let pulses = Rc::new(Cell::new(0u32));
                let counter = Rc::clone(&pulses);
                let mut builder = Registry::builder();
                builder
                    .register_instruction(
                        "heartbeat",
                        heartbeat(move |on| {
                            if on {
                                counter.set(counter.get() + 1);
                            }
                        }),
                    )
                    .unwrap();
                let registry = builder.build();

                let args = Args::new().kwarg("enabled", false).kwarg("period_ms", 5);
                let (reply, _) = call(&registry, "heartbeat", args);
                assert!(reply.is_ok());
                tokio::time::sleep(Duration::from_millis(30)).await;
                assert_eq!(pulses.get(), 0);
            })
            .await;
    }
}
