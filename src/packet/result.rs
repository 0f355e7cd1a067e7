//! Result packet: `(response_name_u16, total_packets_u16, packet_num_u16,
//! task_id_u16, length_u32, data[length])`; concatenation permitted.
//! Multi-part downloads are segmented only at this layer, never at the
//! task-packet layer.

use crate::error::{AgentError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultChunk {
    pub response_name: u16,
    pub total_packets: u16,
    pub packet_num: u16,
    pub task_id: u16,
    pub data: Vec<u8>,
}

pub fn encode_result_packet(chunks: &[ResultChunk]) -> Vec<u8> {
    let mut out = Vec::new();
    for c in chunks {
        out.extend_from_slice(&c.response_name.to_le_bytes());
        out.extend_from_slice(&c.total_packets.to_le_bytes());
        out.extend_from_slice(&c.packet_num.to_le_bytes());
        out.extend_from_slice(&c.task_id.to_le_bytes());
        out.extend_from_slice(&(c.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&c.data);
    }
    out
}

pub fn decode_result_packet(body: &[u8]) -> Result<Vec<ResultChunk>> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset < body.len() {
        if body.len() - offset < 12 {
            return Err(AgentError::ShortPacket);
        }
        let response_name = u16::from_le_bytes(body[offset..offset + 2].try_into().unwrap());
        let total_packets = u16::from_le_bytes(body[offset + 2..offset + 4].try_into().unwrap());
        let packet_num = u16::from_le_bytes(body[offset + 4..offset + 6].try_into().unwrap());
        let task_id = u16::from_le_bytes(body[offset + 6..offset + 8].try_into().unwrap());
        let length = u32::from_le_bytes(body[offset + 8..offset + 12].try_into().unwrap()) as usize;
        let data_start = offset + 12;
        if body.len() - data_start < length {
            return Err(AgentError::ShortPacket);
        }
        out.push(ResultChunk {
            response_name,
            total_packets,
            packet_num,
            task_id,
            data: body[data_start..data_start + length].to_vec(),
        });
        offset = data_start + length;
    }
    Ok(out)
}
