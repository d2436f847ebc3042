//! Port Worker (section 4.F): one task per physical port, owning the
//! transport handle exclusively and serializing every request against it.
//! Shaped after the teacher's `ShellExecutor` — an unbounded mpsc queue of
//! requests, each carrying a oneshot reply sender, fed into a single
//! `tokio::spawn`ed loop.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::error::CoreError;
use crate::io_dispatch::{analog_io, digital_io};
use crate::model::{DataPoint, FailureTracker, ReadFn, SkipSet, ValueRecord, WriteFn};
use crate::model::{AnalogRecord, DigitalRecord};
use crate::transport::{Command, Frame, Transport};

/// A concrete value to write, already resolved by the Manager from the
/// caller's action/params map into the shape the data point's `write_fn`
/// expects.
#[derive(Debug, Clone, Copy)]
pub enum WriteValue {
    Digital(bool),
    Analog(f64),
}

enum WorkerRequest {
    Read {
        data_point: DataPoint,
        reply: oneshot::Sender<Result<ValueRecord, CoreError>>,
    },
    Write {
        data_point: DataPoint,
        value: WriteValue,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
    /// Bespoke write-path carve-out (section 4.H, "Configuration-driven
    /// polymorphism for devices"): issues a transport command directly,
    /// bypassing the data-point/skip-set machinery entirely. Used only by
    /// equipment controllers whose commands don't fit the generic encoder.
    RawCommand {
        cmd: Command,
        reply: oneshot::Sender<Result<Frame, CoreError>>,
    },
}

/// Handle callers use to talk to a running Port Worker task. Cheaply
/// cloneable; the underlying `mpsc::UnboundedSender` is the only shared
/// state, so cloning does not duplicate the transport or its serialization.
#[derive(Clone)]
pub struct PortWorkerHandle {
    sender: mpsc::UnboundedSender<WorkerRequest>,
}

impl PortWorkerHandle {
    pub async fn read(&self, data_point: DataPoint) -> Result<ValueRecord, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(WorkerRequest::Read { data_point, reply })
            .map_err(|_| CoreError::Disconnected)?;
        rx.await.map_err(|_| CoreError::Disconnected)?
    }

    pub async fn write(&self, data_point: DataPoint, value: WriteValue) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(WorkerRequest::Write { data_point, value, reply })
            .map_err(|_| CoreError::Disconnected)?;
        rx.await.map_err(|_| CoreError::Disconnected)?
    }

    /// Clear failure counters and skip-set entries for this port, used
    /// after a successful reconnect (section 4.F, "Reset").
    pub async fn reset(&self) {
        let (reply, rx) = oneshot::channel();
        if self.sender.send(WorkerRequest::Reset { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Issue a transport command directly, bypassing data-point dispatch
    /// and the skip-set/failure-counter machinery. See
    /// `equipment::water_meter` for the motivating use case.
    pub async fn raw_command(&self, cmd: Command) -> Result<Frame, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(WorkerRequest::RawCommand { cmd, reply })
            .map_err(|_| CoreError::Disconnected)?;
        rx.await.map_err(|_| CoreError::Disconnected)?
    }
}

struct WorkerState {
    port_path: String,
    protocol: crate::model::Protocol,
    transport: Box<dyn Transport>,
    request_timeout: Duration,
    max_consecutive_timeouts: u32,
    failures: FailureTracker,
    skipped: SkipSet,
}

/// Spawn the worker task and return a handle to it. `request_timeout` is
/// the per-request wall-clock deadline (default 3000 ms, section 4.B/4.F).
/// `max_consecutive_timeouts` is the live, operator-configurable skip-set
/// threshold (`CoreConfig::max_consecutive_timeouts`, default 3).
pub fn spawn(
    port_path: String,
    protocol: crate::model::Protocol,
    transport: Box<dyn Transport>,
    request_timeout: Duration,
    max_consecutive_timeouts: u32,
) -> PortWorkerHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerRequest>();

    let mut state = WorkerState {
        port_path,
        protocol,
        transport,
        request_timeout,
        max_consecutive_timeouts,
        failures: FailureTracker::new(),
        skipped: SkipSet::new(),
    };

    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            match request {
                WorkerRequest::Read { data_point, reply } => {
                    let result = handle_read(&mut state, &data_point).await;
                    let _ = reply.send(result);
                }
                WorkerRequest::Write { data_point, value, reply } => {
                    let result = handle_write(&mut state, &data_point, value).await;
                    let _ = reply.send(result);
                }
                WorkerRequest::Reset { reply } => {
                    state.failures = FailureTracker::new();
                    state.skipped = SkipSet::new();
                    info!(port = %state.port_path, "port worker reset: skip set and failure counters cleared");
                    let _ = reply.send(());
                }
                WorkerRequest::RawCommand { cmd, reply } => {
                    let result = tokio::time::timeout(state.request_timeout, state.transport.request(cmd))
                        .await
                        .map_err(|_| CoreError::Timeout)
                        .and_then(|r| r.map_err(CoreError::from));
                    let _ = reply.send(result);
                }
            }
        }
    });

    PortWorkerHandle { sender: tx }
}

async fn handle_read(state: &mut WorkerState, data_point: &DataPoint) -> Result<ValueRecord, CoreError> {
    let key = (state.port_path.clone(), data_point.slave_id);
    let read_fn = data_point
        .read_fn
        .ok_or_else(|| CoreError::NoReadFn(data_point.name.clone()))?;
    if state.skipped.contains(&key) {
        return Err(CoreError::DeviceOfflineSkipped {
            port: state.port_path.clone(),
            slave: data_point.slave_id,
        });
    }

    let outcome = tokio::time::timeout(state.request_timeout, async {
        match read_fn {
            ReadFn::ReadDigitalInput => digital_io::read_digital_input(
                state.transport.as_mut(),
                state.protocol,
                data_point.slave_id,
                data_point.register,
                data_point.channel,
            )
            .await
            .map(DigitalReadOutcome::Bit),
            ReadFn::ReadDigitalOutput => digital_io::read_digital_output(
                state.transport.as_mut(),
                state.protocol,
                data_point.slave_id,
                data_point.register,
                data_point.channel,
            )
            .await
            .map(DigitalReadOutcome::Bit),
            ReadFn::ReadAnalogInput => analog_io::read_analog_input(
                state.transport.as_mut(),
                data_point.slave_id,
                data_point.register,
                data_point.value_type,
                data_point.byte_order,
            )
            .await
            .map(DigitalReadOutcome::Analog),
            ReadFn::ReadAnalogOutput => analog_io::read_analog_output(
                state.transport.as_mut(),
                data_point.slave_id,
                data_point.register,
                data_point.value_type,
                data_point.byte_order,
            )
            .await
            .map(DigitalReadOutcome::Analog),
            ReadFn::ReadVirtualDigitalOutput => {
                unreachable!("virtual data points never reach a Port Worker (invariant 2)")
            }
        }
    })
    .await;

    match outcome {
        Err(_elapsed) => {
            record_timeout(state, &key);
            Err(CoreError::Timeout)
        }
        Ok(Err(transport_err)) => {
            let is_timeout = matches!(transport_err, crate::error::TransportError::Timeout);
            if is_timeout {
                record_timeout(state, &key);
            }
            Err(transport_err.into())
        }
        Ok(Ok(raw)) => {
            state.failures.clear(&key);
            Ok(build_value_record(data_point, raw))
        }
    }
}

enum DigitalReadOutcome {
    Bit(bool),
    Analog(crate::codec::DecodedValue),
}

fn record_timeout(state: &mut WorkerState, key: &(String, u8)) {
    let count = state.failures.record_timeout(key);
    warn!(port = %state.port_path, slave = key.1, count, "consecutive timeout");
    if count >= state.max_consecutive_timeouts {
        state.skipped.insert(key.clone());
        warn!(port = %state.port_path, slave = key.1, "slave added to skip set after repeated timeouts");
    }
}

fn build_value_record(data_point: &DataPoint, raw: DigitalReadOutcome) -> ValueRecord {
    match raw {
        DigitalReadOutcome::Bit(bit) => {
            let logical = if data_point.inverted { !bit } else { bit };
            ValueRecord::Digital(DigitalRecord {
                state: logical as u8,
            })
        }
        DigitalReadOutcome::Analog(decoded) => {
            let raw_f64 = decoded.as_f64();
            let value = crate::codec::apply_conversion(raw_f64, data_point.scale_factor, data_point.offset);
            let valid = crate::codec::check_valid(value, data_point.min_valid, data_point.max_valid);
            ValueRecord::Analog(AnalogRecord {
                value,
                raw: decoded,
                unit: data_point.unit.clone(),
                value_type: data_point.value_type,
                valid,
                min_valid: data_point.min_valid,
                max_valid: data_point.max_valid,
                color_zones: data_point.color_zones.clone(),
            })
        }
    }
}

async fn handle_write(
    state: &mut WorkerState,
    data_point: &DataPoint,
    value: WriteValue,
) -> Result<(), CoreError> {
    let write_fn = data_point
        .write_fn
        .ok_or_else(|| CoreError::NoWriteFn(data_point.name.clone()))?;

    let key = (state.port_path.clone(), data_point.slave_id);
    if state.skipped.contains(&key) {
        return Err(CoreError::DeviceOfflineSkipped {
            port: state.port_path.clone(),
            slave: data_point.slave_id,
        });
    }

    let outcome = tokio::time::timeout(state.request_timeout, async {
        match (write_fn, value) {
            (WriteFn::WriteDigitalOutput, WriteValue::Digital(requested)) => {
                let on_wire = if data_point.inverted { !requested } else { requested };
                digital_io::write_digital_output(
                    state.transport.as_mut(),
                    state.protocol,
                    data_point.slave_id,
                    data_point.register,
                    data_point.channel,
                    on_wire,
                )
                .await
            }
            (WriteFn::WriteAnalogOutput, WriteValue::Analog(requested)) => {
                let raw = (requested - data_point.offset) / data_point.scale_factor;
                analog_io::write_analog_output(
                    state.transport.as_mut(),
                    data_point.slave_id,
                    data_point.register,
                    raw,
                    data_point.value_type,
                    data_point.byte_order,
                )
                .await
            }
            (WriteFn::WriteVirtualDigitalOutput, _) => {
                unreachable!("virtual writes never reach a Port Worker (invariant 2)")
            }
            _ => Err(crate::error::TransportError::Malformed(
                "write value shape does not match the data point's write_fn".to_string(),
            )),
        }
    })
    .await;

    match outcome {
        Err(_elapsed) => Err(CoreError::CommandTimeout),
        Ok(Err(transport_err)) => Err(transport_err.into()),
        Ok(Ok(())) => Ok(()),
    }
}
