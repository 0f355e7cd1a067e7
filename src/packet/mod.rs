//! Binary packet framing: the outer routing packet that multiplexes many
//! agents over one transport body, and the inner task/result packets that
//! travel AE-sealed inside a routing frame's payload.
//!
//! Little-endian throughout, per the wire format note in the external
//! interfaces section.

pub mod result;
pub mod routing;
pub mod task;

pub use result::{decode_result_packet, encode_result_packet, ResultChunk};
pub use routing::{decode_routing_packet, encode_routing_packet, RoutingFrame};
pub use task::{decode_task_packet, encode_task_packet, TaskRecord};

/// Agent language, selecting handshake variant and result decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Powershell,
    Python,
}

impl Language {
    pub fn to_byte(self) -> u8 {
        match self {
            Language::Powershell => 0,
            Language::Python => 1,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Language::Powershell),
            1 => Some(Language::Python),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Language::Powershell => "powershell",
            Language::Python => "python",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "powershell" => Some(Language::Powershell),
            "python" => Some(Language::Python),
            _ => None,
        }
    }
}

/// Meta tag carried by a routing frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaTag {
    Stage0,
    Stage1,
    Stage2,
    TaskingRequest,
    ResultPost,
    ServerResponse,
}

impl MetaTag {
    pub fn to_byte(self) -> u8 {
        match self {
            MetaTag::Stage0 => 0,
            MetaTag::Stage1 => 1,
            MetaTag::Stage2 => 2,
            MetaTag::TaskingRequest => 3,
            MetaTag::ResultPost => 4,
            MetaTag::ServerResponse => 5,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(MetaTag::Stage0),
            1 => Some(MetaTag::Stage1),
            2 => Some(MetaTag::Stage2),
            3 => Some(MetaTag::TaskingRequest),
            4 => Some(MetaTag::ResultPost),
            5 => Some(MetaTag::ServerResponse),
            _ => None,
        }
    }
}
