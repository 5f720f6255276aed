use std::{
    collections::HashMap,
    ops::ControlFlow,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::sync::mpsc::Sender;

use crate::{
    constants::{
        CHECKER_ANSWER_FILE, CHECKER_INPUT_FILE, CHECKER_MAX_VERDICT_EXIT_CODE,
        CHECKER_MEMORY_LIMIT_BYTES, CHECKER_TIME_LIMIT_MS, CHECKER_USER_OUT_FILE, RES_TX_ERR,
        STAGED_CHECKER_FILE,
    },
    core::{
        artifact::{create_temp_file, make_scratch_dir, open_input, remove_quietly, safe_copy},
        domain::{
            CheckMethod, CompileResult, ExecRequest, ExecResult, Limits, Phase, ResourceUsage,
            Response, TestCase,
        },
        layout::Layout,
        pipeline::{
            Captured, PipelineError,
            compiling::{CompileOutput, compile_all},
            run_capturing_stderr,
            scratch::ScratchRoot,
        },
        registry::Registry,
        traits::sandbox::{ProcessSpec, Sandbox, SandboxGuard},
        watchdog::run_supervised,
    },
};

/// Where and how the checker runs for every case of a request.
#[derive(Debug)]
struct Checker {
    /// Relative to the work dir.
    dir: PathBuf,
    phase: Phase,
}

impl Checker {
    fn new(dir: PathBuf, exec_name: &str) -> Self {
        let args = [
            format!("./{}", exec_name),
            CHECKER_INPUT_FILE.to_string(),
            CHECKER_USER_OUT_FILE.to_string(),
            CHECKER_ANSWER_FILE.to_string(),
        ];
        Checker {
            dir,
            phase: Phase {
                exec: exec_name.to_string(),
                args: args.to_vec(),
                limits: Limits {
                    time_ms: CHECKER_TIME_LIMIT_MS,
                    memory_bytes: CHECKER_MEMORY_LIMIT_BYTES,
                    stack_bytes: None,
                },
            },
        }
    }
}

/// Compile, run and check state machine for one request at a time.
#[derive(Debug)]
pub struct Pipeline {
    sandbox: Arc<dyn Sandbox>,
    registry: Arc<Registry>,
    layout: Arc<Layout>,
}

impl Pipeline {
    pub fn new(sandbox: Arc<dyn Sandbox>, registry: Arc<Registry>, layout: Arc<Layout>) -> Self {
        Pipeline {
            sandbox,
            registry,
            layout,
        }
    }

    /// Sends interim `running` responses and then exactly one terminal
    /// response to `res_tx`. The scratch tree is gone when this returns.
    #[tracing::instrument(skip_all, fields(problem = %request.run.problem_id))]
    pub async fn handle_request(&self, request: ExecRequest, res_tx: &Sender<Response>) {
        let (response, root) = match self.registry.lookup(&request.run.problem_id) {
            None => (
                internal_error(PipelineError::UnknownProblem(request.run.problem_id.clone())),
                None,
            ),
            Some(cases) => match self.execute(&request, cases, res_tx).await {
                Ok((response, root)) => (response, Some(root)),
                Err(e) => (internal_error(e), None),
            },
        };

        tracing::info!(code = ?response.code, "Request finished: {}", response.message);
        res_tx.send(response).await.expect(RES_TX_ERR);

        if let Some(root) = root {
            root.remove().await;
        }
    }

    async fn execute(
        &self,
        request: &ExecRequest,
        cases: &[TestCase],
        res_tx: &Sender<Response>,
    ) -> Result<(Response, ScratchRoot), PipelineError> {
        tracing::debug!("Compiling {} targets", request.compile_phases.len());
        let mut compiled = compile_all(
            &request.compile_phases,
            self.sandbox.clone(),
            self.layout.clone(),
        )
        .await?;

        let judged = match compiled.error.take() {
            Some(e) => Err(e),
            None => self.judge(request, cases, &compiled, res_tx).await,
        };
        let response = judged.unwrap_or_else(internal_error);
        Ok((response, compiled.root))
    }

    async fn judge(
        &self,
        request: &ExecRequest,
        cases: &[TestCase],
        compiled: &CompileOutput,
        res_tx: &Sender<Response>,
    ) -> Result<Response, PipelineError> {
        if let Some(response) = compile_failure(request, &compiled.results) {
            return Ok(response);
        }

        let run = &request.run.run;
        let run_dir = compiled
            .exec_dirs
            .get(&run.exec)
            .ok_or_else(|| PipelineError::MissingExecutable(run.exec.clone()))?;
        let checker = self.prepare_checker(request, compiled).await?;

        let mut max_usage = ResourceUsage::default();
        for (idx, case) in cases.iter().enumerate() {
            let number = idx as u32 + 1;
            res_tx.send(Response::running(number)).await.expect(RES_TX_ERR);

            let (user_out, stdout) = create_temp_file(&self.layout.cache_dir).await?;
            let judged = self
                .judge_case(number, run, run_dir, case, &checker, &user_out, stdout)
                .await;
            remove_quietly(&user_out).await;

            match judged? {
                ControlFlow::Continue(usage) => keep_max(&mut max_usage, &usage),
                ControlFlow::Break(response) => return Ok(response),
            }
        }

        Ok(Response::ok(ExecResult {
            case: None,
            exit_code: 0,
            user_time: max_usage.user_time,
            sys_time: Default::default(),
            memory_kb: max_usage.max_rss_kb,
            checker: None,
        }))
    }

    async fn prepare_checker(
        &self,
        request: &ExecRequest,
        compiled: &CompileOutput,
    ) -> Result<Checker, PipelineError> {
        let problem_id = &request.run.problem_id;
        let source = match &request.check {
            CheckMethod::Default => self.registry.default_checker(),
            CheckMethod::Custom => self
                .registry
                .custom_checker(problem_id)
                .ok_or_else(|| PipelineError::MissingCustomChecker(problem_id.clone()))?
                .to_path_buf(),
            CheckMethod::Compiled { exec_name } => {
                let dir = compiled
                    .exec_dirs
                    .get(exec_name)
                    .ok_or_else(|| PipelineError::MissingExecutable(exec_name.clone()))?;
                return Ok(Checker::new(dir.clone(), exec_name));
            }
        };

        let (name, path) = make_scratch_dir(compiled.root.path(), self.layout.work_user).await?;
        safe_copy(&source, &path.join(STAGED_CHECKER_FILE)).await?;
        tracing::debug!("Staged checker {} into {}", source.display(), path.display());

        Ok(Checker::new(
            Path::new(compiled.root.name()).join(name),
            STAGED_CHECKER_FILE,
        ))
    }

    /// `Continue` with the usage of an accepted case, `Break` with the
    /// terminal response otherwise.
    #[allow(clippy::too_many_arguments)]
    async fn judge_case(
        &self,
        number: u32,
        run: &Phase,
        run_dir: &Path,
        case: &TestCase,
        checker: &Checker,
        user_out: &Path,
        stdout: std::fs::File,
    ) -> Result<ControlFlow<Response, ResourceUsage>, PipelineError> {
        let handle = SandboxGuard::new(self.sandbox.prepare(run, true).await?);
        let spec = ProcessSpec {
            args: run.args.clone(),
            cwd: self.layout.in_rootfs(run_dir),
            stdin: Some(open_input(&case.input).await?),
            stdout: Some(stdout),
            stderr: None,
        };
        let (outcome, fault) = run_supervised(&*handle, spec, run.limits.time_ms).await?;
        drop(handle);
        tracing::debug!(
            "Case {} ({}) exited with {} fault {:?}",
            number,
            case.name,
            outcome.exit_code,
            fault
        );

        let mut result = ExecResult::from_usage(number, outcome.exit_code, &outcome.usage);
        if fault.is_some() || outcome.exit_code != 0 {
            return Ok(ControlFlow::Break(Response::runtime_error(fault, result)));
        }

        let verdict = self.run_checker(checker, case, user_out).await?;
        result.checker = verdict.stderr;

        if let Some(fault) = verdict.fault {
            return Ok(ControlFlow::Break(Response::runtime_error(Some(fault), result)));
        }
        if verdict.outcome.signal.is_some()
            || verdict.outcome.exit_code > CHECKER_MAX_VERDICT_EXIT_CODE
        {
            return Err(PipelineError::CheckerFailed {
                exit_code: verdict.outcome.exit_code,
                signal: verdict.outcome.signal,
            });
        }

        let accepted = result
            .checker
            .as_ref()
            .is_some_and(|transcript| transcript.text.starts_with('o'));
        if !accepted {
            return Ok(ControlFlow::Break(Response::wrong_answer(result)));
        }

        Ok(ControlFlow::Continue(outcome.usage))
    }

    async fn run_checker(
        &self,
        checker: &Checker,
        case: &TestCase,
        user_out: &Path,
    ) -> Result<Captured, PipelineError> {
        let dir = self.layout.global(&checker.dir);
        safe_copy(&case.input, &dir.join(CHECKER_INPUT_FILE)).await?;
        safe_copy(&case.answer, &dir.join(CHECKER_ANSWER_FILE)).await?;
        safe_copy(user_out, &dir.join(CHECKER_USER_OUT_FILE)).await?;

        run_capturing_stderr(
            self.sandbox.as_ref(),
            &self.layout,
            &checker.phase,
            &self.layout.in_rootfs(&checker.dir),
        )
        .await
    }
}

/// The response for a request whose build failed, if it did.
///
/// A failed checker build is blamed on the problem data. Otherwise the first
/// failed target in request order is reported.
fn compile_failure(
    request: &ExecRequest,
    results: &HashMap<String, CompileResult>,
) -> Option<Response> {
    let failed = |name: &str| results.get(name).filter(|result| !result.succeeded);

    if let CheckMethod::Compiled { exec_name } = &request.check {
        if let Some(result) = failed(exec_name.as_str()) {
            return Some(Response::checker_compile_error(result.stderr.clone()));
        }
    }

    request
        .compile_phases
        .iter()
        .find_map(|phase| failed(phase.exec_name.as_str()))
        .map(|result| Response::compile_error(result.stderr.clone()))
}

/// Accepted cases are summarized by their worst case, never by a sum.
fn keep_max(max_usage: &mut ResourceUsage, usage: &ResourceUsage) {
    max_usage.user_time = max_usage.user_time.max(usage.user_time);
    max_usage.max_rss_kb = max_usage.max_rss_kb.max(usage.max_rss_kb);
}

fn internal_error(e: PipelineError) -> Response {
    tracing::error!("Internal error: {}", e);
    Response::internal_error(e)
}

#[cfg(test)]
mod tests {
    use std::{io, time::Duration};

    use tokio::sync::mpsc;

    use super::*;
    use crate::core::{
        domain::{CompilePhase, OmitString, ResponseCode, RunPhase, SourceFile, Verdict},
        traits::sandbox::{MockSandbox, SandboxError},
    };

    fn phase(exec: &str) -> Phase {
        Phase {
            exec: exec.to_string(),
            args: vec![exec.to_string()],
            limits: Limits {
                time_ms: 1000,
                memory_bytes: 64 << 20,
                stack_bytes: None,
            },
        }
    }

    fn request(targets: &[&str], check: CheckMethod, problem_id: &str) -> ExecRequest {
        ExecRequest {
            compile_phases: targets
                .iter()
                .map(|name| CompilePhase {
                    compile: phase("cc"),
                    sources: vec![SourceFile {
                        name: format!("{}.c", name),
                        content: String::new(),
                    }],
                    exec_name: name.to_string(),
                })
                .collect(),
            run: RunPhase {
                run: phase("main"),
                problem_id: problem_id.to_string(),
            },
            check,
        }
    }

    fn result(succeeded: bool, stderr: &str) -> CompileResult {
        CompileResult {
            succeeded,
            stderr: Some(OmitString::from_message(stderr)),
        }
    }

    #[test]
    fn test_compile_failure_none() {
        let request = request(&["main"], CheckMethod::Default, "1");
        let results = HashMap::from([("main".to_string(), result(true, ""))]);

        assert_eq!(compile_failure(&request, &results), None);
    }

    #[test]
    fn test_compile_failure_first_in_request_order() {
        let request = request(&["lib", "main", "gen"], CheckMethod::Default, "1");
        let results = HashMap::from([
            ("lib".to_string(), result(true, "")),
            ("main".to_string(), result(false, "main failed")),
            ("gen".to_string(), result(false, "gen failed")),
        ]);

        let response = compile_failure(&request, &results).unwrap();

        assert_eq!(response.code, ResponseCode::CompileError);
        assert_eq!(response.message, "compile error");
        assert_eq!(
            response,
            Response::compile_error(Some(OmitString::from_message("main failed")))
        );
    }

    #[test]
    fn test_checker_compile_failure_wins() {
        let check = CheckMethod::Compiled {
            exec_name: "check".to_string(),
        };
        let request = request(&["main", "check"], check, "1");
        let results = HashMap::from([
            ("main".to_string(), result(false, "main failed")),
            ("check".to_string(), result(false, "check failed")),
        ]);

        let response = compile_failure(&request, &results).unwrap();

        assert_eq!(response.code, ResponseCode::InternalError);
        assert_eq!(response.message, "checker compile error");
        assert_eq!(response.verdict, Some(Verdict::InternalError));
    }

    #[test]
    fn test_keep_max_is_not_a_sum() {
        let cases = [
            ResourceUsage {
                user_time: Duration::from_millis(300),
                sys_time: Duration::from_millis(5),
                max_rss_kb: 1000,
            },
            ResourceUsage {
                user_time: Duration::from_millis(10),
                sys_time: Duration::from_millis(5),
                max_rss_kb: 4000,
            },
        ];

        let mut max_usage = ResourceUsage::default();
        for usage in &cases {
            keep_max(&mut max_usage, usage);
        }

        assert_eq!(max_usage.user_time, Duration::from_millis(300));
        assert_eq!(max_usage.max_rss_kb, 4000);
    }

    #[test]
    fn test_checker_args() {
        let checker = Checker::new(PathBuf::from("root/sub"), "checker");

        assert_eq!(
            checker.phase.args,
            vec!["./checker", "input", "user_out", "answer"]
        );
        assert_eq!(checker.phase.limits.time_ms, 10_000);
        assert_eq!(checker.phase.limits.stack_bytes(), 1 << 30);
    }

    struct Env {
        _data: tempfile::TempDir,
        rootfs: tempfile::TempDir,
        layout: Arc<Layout>,
        registry: Arc<Registry>,
    }

    async fn env() -> Env {
        let data = tempfile::tempdir().unwrap();
        std::fs::write(data.path().join("fecmp"), "").unwrap();
        std::fs::create_dir(data.path().join("1001")).unwrap();
        std::fs::write(data.path().join("1001/1.in"), "1 2\n").unwrap();
        std::fs::write(data.path().join("1001/1.out"), "3\n").unwrap();

        let rootfs = tempfile::tempdir().unwrap();
        std::fs::create_dir(rootfs.path().join("work")).unwrap();
        std::fs::create_dir(rootfs.path().join("cache")).unwrap();
        let layout = Arc::new(Layout {
            rootfs: rootfs.path().to_path_buf(),
            work_dir: PathBuf::from("/work"),
            cache_dir: rootfs.path().join("cache"),
            work_user: None,
        });
        let registry = Arc::new(Registry::build(data.path()).await.unwrap());

        Env {
            _data: data,
            rootfs,
            layout,
            registry,
        }
    }

    async fn handle(pipeline: &Pipeline, request: ExecRequest) -> Vec<Response> {
        let (res_tx, mut res_rx) = mpsc::channel(10);
        pipeline.handle_request(request, &res_tx).await;
        drop(res_tx);

        let mut responses = Vec::new();
        while let Some(response) = res_rx.recv().await {
            responses.push(response);
        }
        responses
    }

    #[tokio::test]
    async fn test_unknown_problem() {
        let env = env().await;
        let mut sandbox = MockSandbox::new();
        sandbox.expect_prepare().times(0);
        let pipeline = Pipeline::new(Arc::new(sandbox), env.registry, env.layout.clone());

        let responses = handle(&pipeline, request(&["main"], CheckMethod::Default, "9999")).await;

        assert_eq!(
            responses,
            vec![Response::internal_error(
                "cannot find test cases for problem 9999"
            )]
        );
        let scratch = std::fs::read_dir(env.layout.work_dir_global()).unwrap();
        assert_eq!(scratch.count(), 0);
    }

    #[tokio::test]
    async fn test_sandbox_failure_is_internal_error() {
        let env = env().await;
        let mut sandbox = MockSandbox::new();
        sandbox.expect_prepare().returning(|_, _| {
            Err(SandboxError::Create {
                id: "test".to_string(),
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            })
        });
        let pipeline = Pipeline::new(Arc::new(sandbox), env.registry, env.layout.clone());

        let responses = handle(&pipeline, request(&["main"], CheckMethod::Default, "1001")).await;

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].code, ResponseCode::InternalError);
        assert!(responses[0].message.starts_with("cannot init sandbox test"));
        let scratch = std::fs::read_dir(env.layout.work_dir_global()).unwrap();
        assert_eq!(scratch.count(), 0);
        assert!(env.rootfs.path().join("cache").read_dir().unwrap().next().is_none());
    }
}
