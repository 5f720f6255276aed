use std::{path::PathBuf, time::Duration};

use crate::constants::{CUSTOM_CHECK_METHOD, DEFAULT_CHECK_METHOD};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Limits {
    pub time_ms: u32,
    pub memory_bytes: u64,
    pub stack_bytes: Option<u64>,
}

impl Limits {
    pub fn stack_bytes(&self) -> u64 {
        self.stack_bytes.unwrap_or(self.memory_bytes)
    }
}

/// One externally specified executable invocation plus its resource limits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Phase {
    pub exec: String,
    pub args: Vec<String>,
    pub limits: Limits,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceFile {
    pub name: String,
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompilePhase {
    pub compile: Phase,
    pub sources: Vec<SourceFile>,
    pub exec_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunPhase {
    pub run: Phase,
    pub problem_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckMethod {
    /// The shared default comparator at the data root.
    Default,
    /// The custom checker registered for the problem.
    Custom,
    /// A checker built by one of the request's own compile phases.
    Compiled { exec_name: String },
}

impl From<&str> for CheckMethod {
    fn from(method: &str) -> Self {
        match method {
            DEFAULT_CHECK_METHOD => CheckMethod::Default,
            CUSTOM_CHECK_METHOD => CheckMethod::Custom,
            exec_name => CheckMethod::Compiled {
                exec_name: exec_name.to_string(),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecRequest {
    pub compile_phases: Vec<CompilePhase>,
    pub run: RunPhase,
    pub check: CheckMethod,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestCase {
    pub name: String,
    pub input: PathBuf,
    pub answer: PathBuf,
}

/// A truncated text capture paired with the count of bytes not captured.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OmitString {
    pub text: String,
    pub omitted: u64,
}

impl OmitString {
    pub fn from_message(msg: impl ToString) -> Self {
        Self {
            text: msg.to_string(),
            omitted: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileResult {
    pub succeeded: bool,
    pub stderr: Option<OmitString>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub user_time: Duration,
    pub sys_time: Duration,
    pub max_rss_kb: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecResult {
    pub case: Option<u32>,
    pub exit_code: i32,
    pub user_time: Duration,
    pub sys_time: Duration,
    pub memory_kb: u64,
    pub checker: Option<OmitString>,
}

impl ExecResult {
    pub fn from_usage(case: u32, exit_code: i32, usage: &ResourceUsage) -> Self {
        Self {
            case: Some(case),
            exit_code,
            user_time: usage.user_time,
            sys_time: usage.sys_time,
            memory_kb: usage.max_rss_kb,
            checker: None,
        }
    }
}

/// Cause recorded by the watchdog when it had to kill a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    #[error("time limit exceeded")]
    TimeLimitExceeded,
    #[error("out of memory")]
    OutOfMemory,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    WrongAnswer,
    CompileError,
    RuntimeError,
    InternalError,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseCode {
    Ok = 0,
    CompileError = 1,
    InternalError = 2,
    RuntimeError = 3,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Running(u32),
    CompileOutput(Option<OmitString>),
    Exec(ExecResult),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub code: ResponseCode,
    pub message: String,
    pub payload: Option<Payload>,
    /// `None` for interim progress responses.
    pub verdict: Option<Verdict>,
}

impl Response {
    pub fn running(case: u32) -> Self {
        Self {
            code: ResponseCode::Ok,
            message: "running".to_string(),
            payload: Some(Payload::Running(case)),
            verdict: None,
        }
    }

    pub fn ok(result: ExecResult) -> Self {
        Self {
            code: ResponseCode::Ok,
            message: "success".to_string(),
            payload: Some(Payload::Exec(result)),
            verdict: Some(Verdict::Accepted),
        }
    }

    pub fn wrong_answer(result: ExecResult) -> Self {
        Self {
            code: ResponseCode::Ok,
            message: "wrong answer".to_string(),
            payload: Some(Payload::Exec(result)),
            verdict: Some(Verdict::WrongAnswer),
        }
    }

    pub fn runtime_error(fault: Option<Fault>, result: ExecResult) -> Self {
        let message = match fault {
            Some(fault) => fault.to_string(),
            None => "exit code is not zero".to_string(),
        };
        Self {
            code: ResponseCode::RuntimeError,
            message,
            payload: Some(Payload::Exec(result)),
            verdict: Some(Verdict::RuntimeError),
        }
    }

    pub fn compile_error(stderr: Option<OmitString>) -> Self {
        Self {
            code: ResponseCode::CompileError,
            message: "compile error".to_string(),
            payload: Some(Payload::CompileOutput(stderr)),
            verdict: Some(Verdict::CompileError),
        }
    }

    /// The checker shipped with the request did not build: blamed on problem data.
    pub fn checker_compile_error(stderr: Option<OmitString>) -> Self {
        Self {
            code: ResponseCode::InternalError,
            message: "checker compile error".to_string(),
            payload: Some(Payload::CompileOutput(stderr)),
            verdict: Some(Verdict::InternalError),
        }
    }

    pub fn internal_error(msg: impl ToString) -> Self {
        Self {
            code: ResponseCode::InternalError,
            message: msg.to_string(),
            payload: None,
            verdict: Some(Verdict::InternalError),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.verdict.is_some()
    }
}
