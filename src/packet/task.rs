//! Task packet: `(task_name_u16, task_id_u16, length_u32, body[length])`,
//! concatenated, encrypted as a whole under the session key.

use crate::error::{AgentError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub task_name: u16,
    pub task_id: u16,
    pub body: Vec<u8>,
}

pub fn encode_task_packet(tasks: &[TaskRecord]) -> Vec<u8> {
    let mut out = Vec::new();
    for t in tasks {
        out.extend_from_slice(&t.task_name.to_le_bytes());
        out.extend_from_slice(&t.task_id.to_le_bytes());
        out.extend_from_slice(&(t.body.len() as u32).to_le_bytes());
        out.extend_from_slice(&t.body);
    }
    out
}

pub fn decode_task_packet(body: &[u8]) -> Result<Vec<TaskRecord>> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset < body.len() {
        if body.len() - offset < 8 {
            return Err(AgentError::ShortPacket);
        }
        let task_name = u16::from_le_bytes(body[offset..offset + 2].try_into().unwrap());
        let task_id = u16::from_le_bytes(body[offset + 2..offset + 4].try_into().unwrap());
        let length = u32::from_le_bytes(body[offset + 4..offset + 8].try_into().unwrap()) as usize;
        let data_start = offset + 8;
        if body.len() - data_start < length {
            return Err(AgentError::ShortPacket);
        }
        out.push(TaskRecord {
            task_name,
            task_id,
            body: body[data_start..data_start + length].to_vec(),
        });
        offset = data_start + length;
    }
    Ok(out)
}
