//! Generic Device Interpreter (section 4.E): a table-driven reader/writer
//! that turns a register-map template into a named-field record without any
//! bespoke per-device code. See section 6 for the wire JSON schema this
//! mirrors.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::codec::{self, ByteOrder, DecodedValue, ValueType};
use crate::error::CoreError;
use crate::transport::{Command, Frame, Transport};

/// Which Modbus function a batch or field is read through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionCode {
    Holding,
    Input,
    Coil,
    Discrete,
}

impl FunctionCode {
    fn is_bit_oriented(self) -> bool {
        matches!(self, FunctionCode::Coil | FunctionCode::Discrete)
    }
}

/// Which register batches to issue read requests for when the addressable
/// registers are not contiguous under one `{batch_start, batch_count}` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub start: u16,
    pub count: u16,
    pub function_code: FunctionCode,
}

/// Read/write permission on a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    R,
    W,
    Rw,
}

impl Access {
    fn writable(self) -> bool {
        matches!(self, Access::W | Access::Rw)
    }
}

/// One named field within a register-map template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub address: u16,
    #[serde(default = "default_field_count")]
    pub count: u16,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default)]
    pub values: Option<HashMap<String, String>>,
    #[serde(default)]
    pub bits: Option<HashMap<String, String>>,
    #[serde(default = "default_access")]
    pub access: Access,
}

fn default_field_count() -> u16 {
    1
}
fn default_multiplier() -> f64 {
    1.0
}
fn default_access() -> Access {
    Access::R
}

/// The full register-map template (section 6's JSON schema).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMapTemplate {
    pub function_code: FunctionCode,
    pub batch_start: u16,
    pub batch_count: u16,
    #[serde(default)]
    pub batches: Option<Vec<Batch>>,
    pub registers: Vec<FieldDescriptor>,
    #[serde(default)]
    pub byte_order: ByteOrder,
}

impl RegisterMapTemplate {
    fn effective_batches(&self) -> Vec<Batch> {
        match &self.batches {
            Some(batches) if !batches.is_empty() => batches.clone(),
            _ => vec![Batch {
                start: self.batch_start,
                count: self.batch_count,
                function_code: self.function_code,
            }],
        }
    }

    fn find_field(&self, name: &str) -> Result<&FieldDescriptor, CoreError> {
        self.registers
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| CoreError::UnknownField(name.to_string()))
    }
}

enum BatchData {
    Registers(Vec<u16>),
    Bits(Vec<bool>),
}

struct ReadBatch {
    start: u16,
    function_code: FunctionCode,
    data: BatchData,
}

async fn read_batch(
    transport: &mut dyn Transport,
    slave: u8,
    batch: &Batch,
) -> Result<ReadBatch, CoreError> {
    let cmd = match batch.function_code {
        FunctionCode::Holding => Command::ReadHoldingRegisters {
            slave,
            addr: batch.start,
            count: batch.count,
        },
        FunctionCode::Input => Command::ReadInputRegisters {
            slave,
            addr: batch.start,
            count: batch.count,
        },
        FunctionCode::Coil => Command::ReadCoils {
            slave,
            addr: batch.start,
            count: batch.count,
        },
        FunctionCode::Discrete => Command::ReadInputs {
            slave,
            addr: batch.start,
            count: batch.count,
        },
    };

    let frame = transport.request(cmd).await?;
    let data = match frame {
        Frame::Registers(regs) => BatchData::Registers(regs),
        Frame::Bits(bits) => BatchData::Bits(bits),
        Frame::Ack => return Err(CoreError::InvalidResponse("read batch returned an ack".to_string())),
    };
    Ok(ReadBatch {
        start: batch.start,
        function_code: batch.function_code,
        data,
    })
}

fn decode_field(field: &FieldDescriptor, batch: &ReadBatch, byte_order: ByteOrder) -> Result<JsonValue, CoreError> {
    let offset = (field.address - batch.start) as usize;

    if batch.function_code.is_bit_oriented() {
        let BatchData::Bits(bits) = &batch.data else {
            unreachable!("bit-oriented batch must carry Bits data");
        };
        let bit = *bits
            .get(offset)
            .ok_or_else(|| CoreError::InvalidResponse(format!("field '{}' out of batch range", field.name)))?;
        return Ok(JsonValue::Bool(bit));
    }

    let BatchData::Registers(regs) = &batch.data else {
        unreachable!("register-oriented batch must carry Registers data");
    };
    let count = field.value_type.register_count();
    let slice = regs
        .get(offset..offset + count)
        .ok_or_else(|| CoreError::InvalidResponse(format!("field '{}' out of batch range", field.name)))?;

    let decoded = match field.value_type {
        ValueType::Enum => {
            let table = field.values.clone().unwrap_or_default();
            codec::decode_enum(slice, &table)?
        }
        ValueType::Bitmask => {
            let table = field.bits.clone().unwrap_or_default();
            codec::decode_bitmask(slice, &table)?
        }
        other => codec::decode(slice, other, byte_order)?,
    };

    Ok(match decoded {
        DecodedValue::Unsigned(v) => json_number((v as f64) * field.multiplier),
        DecodedValue::Signed(v) => json_number((v as f64) * field.multiplier),
        DecodedValue::Float(v) => json_number(v * field.multiplier),
        DecodedValue::Bool(v) => JsonValue::Bool(v),
        DecodedValue::Enum { raw, label } => serde_json::json!({ "raw": raw, "label": label }),
        DecodedValue::Bitmask(bits) => serde_json::to_value(bits).unwrap_or(JsonValue::Null),
    })
}

fn json_number(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

/// Read every batch the template needs, decode every field, and merge into
/// one `{field_name -> value}` record. Any single-batch error aborts the
/// whole read (section 4.E).
pub async fn interpret(
    transport: &mut dyn Transport,
    slave: u8,
    template: &RegisterMapTemplate,
) -> Result<HashMap<String, JsonValue>, CoreError> {
    let batches = template.effective_batches();
    let mut read_batches = Vec::with_capacity(batches.len());
    for batch in &batches {
        read_batches.push(read_batch(transport, slave, batch).await?);
    }

    let mut record = HashMap::with_capacity(template.registers.len());
    for field in &template.registers {
        let batch = read_batches
            .iter()
            .find(|b| {
                field.address >= b.start
                    && (field.address - b.start) as usize + field_slot_count(field, b.function_code)
                        <= batch_len(b)
            })
            .ok_or_else(|| CoreError::UnknownField(field.name.clone()))?;
        let value = decode_field(field, batch, template.byte_order)?;
        record.insert(field.name.clone(), value);
    }
    Ok(record)
}

fn field_slot_count(field: &FieldDescriptor, function_code: FunctionCode) -> usize {
    if function_code.is_bit_oriented() {
        1
    } else {
        field.value_type.register_count()
    }
}

fn batch_len(batch: &ReadBatch) -> usize {
    match &batch.data {
        BatchData::Registers(regs) => regs.len(),
        BatchData::Bits(bits) => bits.len(),
    }
}

/// Write one field by name. Rejects fields without `w`/`rw` access
/// (section 4.E). 32-bit types write their two registers in order.
pub async fn write_field(
    transport: &mut dyn Transport,
    slave: u8,
    template: &RegisterMapTemplate,
    field_name: &str,
    value: f64,
) -> Result<(), CoreError> {
    let field = template.find_field(field_name)?;
    if !field.access.writable() {
        return Err(CoreError::ReadOnlyField(field_name.to_string()));
    }

    let raw = value / field.multiplier;
    let regs = codec::encode(raw, field.value_type, template.byte_order)?;

    if regs.len() == 1 {
        transport
            .request(Command::WriteHolding {
                slave,
                addr: field.address,
                value: regs[0],
            })
            .await?;
    } else {
        for (i, reg) in regs.iter().enumerate() {
            transport
                .request(Command::WriteHolding {
                    slave,
                    addr: field.address + i as u16,
                    value: *reg,
                })
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedDevice;

    fn flow_meter_template() -> RegisterMapTemplate {
        RegisterMapTemplate {
            function_code: FunctionCode::Holding,
            batch_start: 1,
            batch_count: 28,
            batches: None,
            byte_order: ByteOrder::HighLow,
            registers: vec![
                FieldDescriptor {
                    name: "flow_rate".to_string(),
                    address: 5,
                    count: 2,
                    value_type: ValueType::Float32Le,
                    multiplier: 1.0,
                    values: None,
                    bits: None,
                    access: Access::R,
                },
                FieldDescriptor {
                    name: "valve_status".to_string(),
                    address: 28,
                    count: 1,
                    value_type: ValueType::Bitmask,
                    multiplier: 1.0,
                    values: None,
                    bits: Some(HashMap::from([
                        ("0".to_string(), "open".to_string()),
                        ("1".to_string(), "closed".to_string()),
                        ("2".to_string(), "abnormal".to_string()),
                        ("3".to_string(), "low_battery".to_string()),
                    ])),
                    access: Access::R,
                },
            ],
        }
    }

    #[tokio::test]
    async fn scenario_s5_generic_interpreter() {
        let template = flow_meter_template();
        let device = SimulatedDevice::new();
        // 1.0f32 big-endian split across two registers, with the _le
        // variant swapping halves relative to high_low byte order.
        device.set_register(5, 0x0000).await;
        device.set_register(6, 0x3F80).await;
        device.set_register(28, 0b0001).await;

        let mut transport = device.transport();
        let record = interpret(&mut transport, 1, &template).await.unwrap();

        let flow = record.get("flow_rate").unwrap().as_f64().unwrap();
        assert!((flow - 1.0).abs() < 1e-6);

        let valve = record.get("valve_status").unwrap();
        assert_eq!(valve.get("open"), Some(&JsonValue::Bool(true)));
        assert_eq!(valve.get("closed"), Some(&JsonValue::Bool(false)));
    }

    #[tokio::test]
    async fn write_rejects_read_only_field() {
        let template = flow_meter_template();
        let device = SimulatedDevice::new();
        let mut transport = device.transport();
        let err = write_field(&mut transport, 1, &template, "flow_rate", 2.0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "read_only_field");
    }
}
