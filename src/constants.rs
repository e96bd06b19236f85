pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const MAX_TIMEOUT_MS: u64 = 60_000;
pub const OUTPUT_CAP_CHARS: usize = 50_000;
pub const HOOK_INSTRUCTION_INTERVAL: u32 = 1_000;
pub const MEMORY_LIMIT_BYTES: usize = 256 * 1024 * 1024;
pub const STARTUP_TIMEOUT_MS: u64 = 10_000;
pub const HARD_KILL_GRACE_MS: u64 = 1_000;

pub const TRUNCATION_MARKER: &str = "\n... [output truncated]";

pub const WORKER_THREAD_NAME: &str = "scriptrunner-worker";
pub const CHUNK_NAME: &str = "=main";

pub const PROGRESS_TX_ERR: &str = "Failed to send batch progress";
