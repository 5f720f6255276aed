use std::time::Duration;

pub const RES_TX_ERR: &str = "Failed to send response to res_tx";
pub const OUT_TX_ERR: &str = "Failed to send frame to out_tx";
pub const READ_TX_ERR: &str = "Failed to send socket to read_tx";
pub const DELIVERY_TX_ERR: &str = "Failed to send delivery to delivery_tx";

/// Length of every random name handed out for sandboxes, scratch dirs and temp files.
pub const TOKEN_LEN: usize = 20;

/// Upper bound of bytes kept from a captured stderr/checker transcript.
pub const OMIT_STRING_LEN: u64 = 4096;

/// Added to a phase time limit to get the wall clock budget of the watchdog.
pub const WALL_TIME_REDUNDANCY: Duration = Duration::from_millis(100);

pub const DEFAULT_ENV: &[(&str, &str)] = &[("PATH", "/bin:/usr/bin")];

pub const DEFAULT_CHECK_METHOD: &str = "wcmp";
pub const CUSTOM_CHECK_METHOD: &str = "spj";
pub const DEFAULT_CHECKER_FILE: &str = "fecmp";
pub const CUSTOM_CHECKER_FILE: &str = "spj";
pub const STAGED_CHECKER_FILE: &str = "checker";

/// Longest inbound request line; a longer one closes the connection.
pub const MAX_FRAME_LEN: usize = 16 << 20;

/// Ceiling on live processes per sandbox, compiler drivers included.
pub const SANDBOX_PIDS_MAX: u32 = 128;

pub const CHECKER_TIME_LIMIT_MS: u32 = 10_000;
pub const CHECKER_MEMORY_LIMIT_BYTES: u64 = 1024 << 20;

pub const CHECKER_INPUT_FILE: &str = "input";
pub const CHECKER_ANSWER_FILE: &str = "answer";
pub const CHECKER_USER_OUT_FILE: &str = "user_out";

/// Checker exit codes above this one mean the checker itself failed.
pub const CHECKER_MAX_VERDICT_EXIT_CODE: i32 = 2;

pub fn wall_time_limit(time_limit_ms: u32) -> Duration {
    Duration::from_millis(time_limit_ms as u64) + WALL_TIME_REDUNDANCY
}
