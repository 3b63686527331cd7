//! Command implementations behind the `upyt` binary.

use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use upyt_host::{
    connected_serial_numbers, find_port, ConfigError, Connection, HostError, LinkConfig,
    ProjectConfig,
};
use upyt_wire::Args;

use crate::error::RunnerResult;

/// What a device offers, as reported by `upyt info`.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    /// Link name.
    pub name: String,
    /// Instruction names, sorted.
    pub instructions: Vec<String>,
    /// Remote class names, sorted.
    pub remote_classes: Vec<String>,
    /// Output of `get_system_info`, when offered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<Value>,
}

/// Serial numbers of the USB serial devices currently attached.
pub fn list_devices() -> RunnerResult<Vec<String>> {
    Ok(connected_serial_numbers().map_err(HostError::from)?)
}

/// Resolve `device` to a closed connection.
///
/// Names from the project configuration win; anything else is taken as a USB
/// serial number.
pub fn resolve_connection(device: &str, config_path: Option<&Path>) -> RunnerResult<Connection> {
    match Connection::from_project(device, config_path) {
        Ok(connection) => Ok(connection),
        Err(HostError::Config(ConfigError::NotFound { .. }))
        | Err(HostError::Config(ConfigError::UnknownDevice(_))) => {
            debug!("'{}' is not a configured device, trying it as a serial number", device);
            Ok(Connection::for_serial_number(device, LinkConfig::default())?)
        }
        Err(err) => Err(err.into()),
    }
}

/// USB serial number for `device`: the configured entry's serial when the
/// project configuration names it, otherwise `device` itself.
pub fn resolve_serial(device: &str, config_path: Option<&Path>) -> RunnerResult<String> {
    let project = match ProjectConfig::discover(config_path) {
        Ok((_, project)) => project,
        Err(ConfigError::NotFound { .. }) => return Ok(device.to_string()),
        Err(err) => return Err(HostError::from(err).into()),
    };
    match project.device_entry(device) {
        Ok(entry) => Ok(entry.serial.clone()),
        Err(ConfigError::UnknownDevice(_)) => Ok(device.to_string()),
        Err(err) => Err(HostError::from(err).into()),
    }
}

/// Port name of the attached board for `device`.
pub fn comport(device: &str, config_path: Option<&Path>) -> RunnerResult<String> {
    let serial = resolve_serial(device, config_path)?;
    Ok(find_port(&serial).map_err(HostError::from)?)
}

/// Describe an open connection.
pub fn device_info(connection: &Connection) -> RunnerResult<DeviceInfo> {
    let system = if connection.calls().has_instruction("get_system_info") {
        connection.call("get_system_info", Args::new())?.try_recv()?
    } else {
        None
    };
    Ok(DeviceInfo {
        name: connection.name().to_string(),
        instructions: connection.instructions(),
        remote_classes: connection.remote_classes(),
        system,
    })
}

/// Turn command-line words into call arguments.
///
/// `key=value` becomes a keyword argument when `key` is an identifier;
/// any other word is positional. Values are parsed as JSON and fall back to
/// plain strings.
pub fn parse_call_args<S: AsRef<str>>(words: &[S]) -> Args {
    words.iter().fold(Args::new(), |args, word| {
        let word = word.as_ref();
        match word.split_once('=') {
            Some((key, value)) if is_identifier(key) => args.kwarg(key, parse_value(value)),
            _ => args.arg(parse_value(word)),
        }
    })
}

fn is_identifier(word: &str) -> bool {
    let mut chars = word.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_value(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// Call an instruction synchronously and return its response, if any.
pub fn call_instruction(connection: &Connection, name: &str, args: Args) -> RunnerResult<Option<Value>> {
    Ok(connection.call(name, args)?.try_recv()?)
}

/// Ask the device to leave its listener loop.
pub fn break_loop(connection: &Connection) -> RunnerResult<()> {
    connection.call("break_loop", Args::new())?;
    Ok(())
}

/// Restart the device; the connection is closed afterwards.
pub fn reset_device(connection: &Connection, hard: bool) -> RunnerResult<()> {
    connection.reset(hard)?;
    Ok(())
}
