use itertools::Itertools;

use crate::{
    constants::{CHECKER_ANSWER_FILE, CHECKER_INPUT_FILE, CHECKER_USER_OUT_FILE},
    core::domain::{
        CheckMethod, CompilePhase, ExecRequest, ExecResult, Limits, OmitString, Payload, Phase,
        Response, RunPhase, SourceFile,
    },
    transport::models::{
        CompilePhaseModel, ExecRequestModel, ExecResultModel, InboundFrame, LimitsModel,
        OmitStringModel, OutboundFrame, PhaseModel, RunPhaseModel, SourceFileModel,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("invalid request: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: i64 },
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("invalid source file name {0:?}")]
    SourceName(String),
    #[error("duplicate exec_name {0}")]
    DuplicateExecName(String),
    #[error("checker exec_name {0} clashes with a staged checker file")]
    ReservedCheckerName(String),
}

/// Splits a raw line into its correlation id and the decoded request.
pub fn decode_frame(line: &str) -> (String, Result<ExecRequest, ConversionError>) {
    let frame: InboundFrame = match serde_json::from_str(line) {
        Ok(frame) => frame,
        Err(e) => return (String::new(), Err(e.into())),
    };
    let request = serde_json::from_value::<ExecRequestModel>(frame.body)
        .map_err(ConversionError::from)
        .and_then(ExecRequest::try_from);
    (frame.correlation_id, request)
}

fn positive(field: &'static str, value: i64) -> Result<u64, ConversionError> {
    if value > 0 {
        Ok(value as u64)
    } else {
        Err(ConversionError::NonPositive { field, value })
    }
}

impl TryFrom<LimitsModel> for Limits {
    type Error = ConversionError;

    fn try_from(limits: LimitsModel) -> Result<Self, ConversionError> {
        Ok(Self {
            time_ms: positive("time", limits.time.into())? as u32,
            memory_bytes: positive("mem", limits.mem)?,
            stack_bytes: limits
                .stack
                .map(|stack| positive("stack", stack))
                .transpose()?,
        })
    }
}

impl TryFrom<PhaseModel> for Phase {
    type Error = ConversionError;

    fn try_from(phase: PhaseModel) -> Result<Self, ConversionError> {
        if phase.run_args.is_empty() {
            return Err(ConversionError::Empty { field: "run_args" });
        }
        Ok(Self {
            exec: phase.exec,
            args: phase.run_args,
            limits: phase.limits.try_into()?,
        })
    }
}

impl TryFrom<SourceFileModel> for SourceFile {
    type Error = ConversionError;

    fn try_from(source: SourceFileModel) -> Result<Self, ConversionError> {
        let name = source.name;
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
            return Err(ConversionError::SourceName(name));
        }
        Ok(Self {
            name,
            content: source.content,
        })
    }
}

impl TryFrom<CompilePhaseModel> for CompilePhase {
    type Error = ConversionError;

    fn try_from(phase: CompilePhaseModel) -> Result<Self, ConversionError> {
        if phase.exec_name.is_empty() {
            return Err(ConversionError::Empty { field: "exec_name" });
        }
        Ok(Self {
            compile: phase.compile.try_into()?,
            sources: phase
                .code
                .into_iter()
                .map(TryInto::try_into)
                .collect::<Result<_, _>>()?,
            exec_name: phase.exec_name,
        })
    }
}

impl TryFrom<RunPhaseModel> for RunPhase {
    type Error = ConversionError;

    fn try_from(phase: RunPhaseModel) -> Result<Self, ConversionError> {
        Ok(Self {
            run: phase.run.try_into()?,
            problem_id: phase.pid,
        })
    }
}

impl TryFrom<ExecRequestModel> for ExecRequest {
    type Error = ConversionError;

    fn try_from(req: ExecRequestModel) -> Result<Self, ConversionError> {
        if let Some(name) = req.compile_phases.iter().map(|p| &p.exec_name).duplicates().next() {
            return Err(ConversionError::DuplicateExecName(name.clone()));
        }
        if req.check_phase.is_empty() {
            return Err(ConversionError::Empty {
                field: "check_phase",
            });
        }

        let check = CheckMethod::from(req.check_phase.as_str());
        if let CheckMethod::Compiled { exec_name } = &check {
            if [CHECKER_INPUT_FILE, CHECKER_ANSWER_FILE, CHECKER_USER_OUT_FILE]
                .contains(&exec_name.as_str())
            {
                return Err(ConversionError::ReservedCheckerName(exec_name.clone()));
            }
        }

        Ok(Self {
            compile_phases: req
                .compile_phases
                .into_iter()
                .map(TryInto::try_into)
                .collect::<Result<_, _>>()?,
            run: req.run_phases.try_into()?,
            check,
        })
    }
}

impl From<&OmitString> for OmitStringModel {
    fn from(omit: &OmitString) -> Self {
        Self {
            s: omit.text.clone(),
            omit_size: omit.omitted,
        }
    }
}

impl From<&ExecResult> for ExecResultModel {
    fn from(result: &ExecResult) -> Self {
        Self {
            case: result.case,
            exit_code: result.exit_code,
            user_time: result.user_time.as_nanos() as u64,
            sys_time: result.sys_time.as_nanos() as u64,
            memory: result.memory_kb,
            checker_res: result.checker.as_ref().map(Into::into),
        }
    }
}

fn encode_payload(payload: &Payload) -> String {
    let encoded = match payload {
        Payload::Running(case) => Ok(case.to_string()),
        Payload::CompileOutput(stderr) => {
            serde_json::to_string(&stderr.as_ref().map(OmitStringModel::from))
        }
        Payload::Exec(result) => serde_json::to_string(&ExecResultModel::from(result)),
    };
    encoded.unwrap_or_else(|e| {
        tracing::error!("Failed to encode payload: {}", e);
        String::new()
    })
}

impl OutboundFrame {
    pub fn reply(correlation_id: &str, response: &Response) -> Self {
        OutboundFrame::Reply {
            correlation_id: correlation_id.to_string(),
            err: response.code as u8,
            msg: response.message.clone(),
            data: response.payload.as_ref().map(encode_payload),
        }
    }

    pub fn ack(correlation_id: &str) -> Self {
        OutboundFrame::Ack {
            correlation_id: correlation_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::domain::{Fault, ResourceUsage};

    const REQUEST: &str = r#"{
        "correlation_id": "42",
        "body": {
            "compile_phases": [{
                "compile": {
                    "exec": "g++",
                    "run_args": ["g++", "main.cpp", "-o", "main", "-O2"],
                    "limits": {"time": 10000, "mem": 536870912}
                },
                "code": [{"name": "main.cpp", "content": "int main() {}"}],
                "exec_name": "main"
            }],
            "run_phases": {
                "run": {
                    "exec": "main",
                    "run_args": ["./main"],
                    "limits": {"time": 1000, "mem": 268435456, "stack": 8388608}
                },
                "pid": "1001"
            },
            "check_phase": "wcmp"
        }
    }"#;

    fn body_with(patch: impl FnOnce(&mut serde_json::Value)) -> String {
        let mut frame: serde_json::Value = serde_json::from_str(REQUEST).unwrap();
        patch(&mut frame["body"]);
        frame.to_string()
    }

    #[test]
    fn test_decode_request() {
        let (correlation_id, request) = decode_frame(REQUEST);
        let request = request.unwrap();

        assert_eq!(correlation_id, "42");
        assert_eq!(request.compile_phases.len(), 1);
        let compile = &request.compile_phases[0];
        assert_eq!(compile.exec_name, "main");
        assert_eq!(compile.sources[0].name, "main.cpp");
        assert_eq!(compile.compile.args[0], "g++");
        assert_eq!(compile.compile.limits.stack_bytes(), 536870912);
        assert_eq!(request.run.problem_id, "1001");
        assert_eq!(request.run.run.limits.time_ms, 1000);
        assert_eq!(request.run.run.limits.stack_bytes(), 8388608);
        assert_eq!(request.check, CheckMethod::Default);
    }

    #[test]
    fn test_decode_not_json() {
        let (correlation_id, request) = decode_frame("SUBMIT main.cpp");

        assert_eq!(correlation_id, "");
        assert!(matches!(request, Err(ConversionError::Json(_))));
    }

    #[test]
    fn test_decode_keeps_correlation_id_on_bad_body() {
        let (correlation_id, request) = decode_frame(r#"{"correlation_id": "7", "body": {}}"#);

        assert_eq!(correlation_id, "7");
        assert!(matches!(request, Err(ConversionError::Json(_))));
    }

    #[test]
    fn test_non_positive_limits() {
        let line = body_with(|body| body["run_phases"]["run"]["limits"]["mem"] = 0.into());
        let (_, request) = decode_frame(&line);
        assert!(matches!(
            request,
            Err(ConversionError::NonPositive { field: "mem", value: 0 })
        ));

        let line = body_with(|body| body["run_phases"]["run"]["limits"]["stack"] = (-1).into());
        let (_, request) = decode_frame(&line);
        assert!(matches!(
            request,
            Err(ConversionError::NonPositive { field: "stack", .. })
        ));
    }

    #[test]
    fn test_empty_run_args() {
        let line = body_with(|body| body["run_phases"]["run"]["run_args"] = serde_json::json!([]));

        let (_, request) = decode_frame(&line);

        assert!(matches!(
            request,
            Err(ConversionError::Empty { field: "run_args" })
        ));
    }

    #[test]
    fn test_bad_source_names() {
        for name in ["../main.cpp", "", "..", "dir/main.cpp"] {
            let line = body_with(|body| {
                body["compile_phases"][0]["code"][0]["name"] = name.into();
            });

            let (_, request) = decode_frame(&line);

            assert!(
                matches!(request, Err(ConversionError::SourceName(_))),
                "{name} accepted"
            );
        }
    }

    #[test]
    fn test_duplicate_exec_names() {
        let line = body_with(|body| {
            let phase = body["compile_phases"][0].clone();
            body["compile_phases"].as_array_mut().unwrap().push(phase);
        });

        let (_, request) = decode_frame(&line);

        assert!(matches!(request, Err(ConversionError::DuplicateExecName(name)) if name == "main"));
    }

    #[test]
    fn test_compiled_checker() {
        let line = body_with(|body| body["check_phase"] = "check".into());

        let (_, request) = decode_frame(&line);

        assert_eq!(
            request.unwrap().check,
            CheckMethod::Compiled {
                exec_name: "check".to_string()
            }
        );
    }

    #[test]
    fn test_checker_named_like_staged_file() {
        for name in ["input", "answer", "user_out"] {
            let line = body_with(|body| body["check_phase"] = name.into());

            let (_, request) = decode_frame(&line);

            assert!(
                matches!(&request, Err(ConversionError::ReservedCheckerName(n)) if n == name),
                "{name} accepted"
            );
        }
    }

    fn reply_json(response: &Response) -> serde_json::Value {
        serde_json::to_value(OutboundFrame::reply("42", response)).unwrap()
    }

    #[test]
    fn test_encode_running() {
        let reply = reply_json(&Response::running(3));

        assert_eq!(
            reply,
            serde_json::json!({
                "type": "reply",
                "correlation_id": "42",
                "err": 0,
                "msg": "running",
                "data": "3"
            })
        );
    }

    #[test]
    fn test_encode_internal_error_has_no_data() {
        let reply = reply_json(&Response::internal_error("cannot find executable main"));

        assert_eq!(reply["err"], 2);
        assert_eq!(reply["msg"], "cannot find executable main");
        assert!(reply.get("data").is_none());
    }

    #[test]
    fn test_encode_compile_error() {
        let reply = reply_json(&Response::compile_error(Some(OmitString {
            text: "main.cpp:1: error".to_string(),
            omitted: 12,
        })));
        assert_eq!(reply["err"], 1);
        let data: OmitStringModel =
            serde_json::from_str(reply["data"].as_str().unwrap()).unwrap();
        assert_eq!(
            data,
            OmitStringModel {
                s: "main.cpp:1: error".to_string(),
                omit_size: 12
            }
        );

        let reply = reply_json(&Response::compile_error(None));
        assert_eq!(reply["data"], "null");
    }

    #[test]
    fn test_encode_runtime_error() {
        let usage = ResourceUsage {
            user_time: Duration::from_millis(1500),
            sys_time: Duration::from_micros(20),
            max_rss_kb: 2048,
        };
        let result = ExecResult::from_usage(2, -1, &usage);

        let reply = reply_json(&Response::runtime_error(
            Some(Fault::TimeLimitExceeded),
            result,
        ));

        assert_eq!(reply["err"], 3);
        assert_eq!(reply["msg"], "time limit exceeded");
        let data: ExecResultModel = serde_json::from_str(reply["data"].as_str().unwrap()).unwrap();
        assert_eq!(
            data,
            ExecResultModel {
                case: Some(2),
                exit_code: -1,
                user_time: 1_500_000_000,
                sys_time: 20_000,
                memory: 2048,
                checker_res: None,
            }
        );
    }

    #[test]
    fn test_encode_ack() {
        let ack = serde_json::to_value(OutboundFrame::ack("42")).unwrap();

        assert_eq!(
            ack,
            serde_json::json!({"type": "ack", "correlation_id": "42"})
        );
    }
}
