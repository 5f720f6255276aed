use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct InboundFrame {
    #[serde(default)]
    pub correlation_id: String,
    pub body: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct LimitsModel {
    pub time: i32,
    pub mem: i64,
    #[serde(default)]
    pub stack: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct PhaseModel {
    pub exec: String,
    pub run_args: Vec<String>,
    pub limits: LimitsModel,
}

#[derive(Debug, Deserialize)]
pub struct SourceFileModel {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct CompilePhaseModel {
    pub compile: PhaseModel,
    pub code: Vec<SourceFileModel>,
    pub exec_name: String,
}

#[derive(Debug, Deserialize)]
pub struct RunPhaseModel {
    pub run: PhaseModel,
    pub pid: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecRequestModel {
    pub compile_phases: Vec<CompilePhaseModel>,
    pub run_phases: RunPhaseModel,
    pub check_phase: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OmitStringModel {
    pub s: String,
    pub omit_size: u64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecResultModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case: Option<u32>,
    pub exit_code: i32,
    /// Nanoseconds.
    pub user_time: u64,
    /// Nanoseconds.
    pub sys_time: u64,
    /// KiB.
    pub memory: u64,
    pub checker_res: Option<OmitStringModel>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Reply {
        correlation_id: String,
        err: u8,
        msg: String,
        /// JSON encoding of the payload.
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
    Ack {
        correlation_id: String,
    },
}

/// One inbound line, tagged with the connection it arrived on.
#[derive(Debug)]
pub struct Delivery {
    pub connection: Uuid,
    pub received_at: DateTime<Utc>,
    pub line: String,
    /// Held until the delivery is acknowledged; the connection is closed
    /// only after every guard is gone.
    pub guard: mpsc::Sender<()>,
}

#[derive(Debug)]
pub enum Outgoing {
    Frame {
        connection: Uuid,
        frame: OutboundFrame,
    },
    Close {
        connection: Uuid,
    },
}
