use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_WORKER_THREADS: usize = 4;
pub const LISTEN_BACKLOG: i32 = 1024;
pub const MAX_CONNS: usize = 10_000;
pub const MAX_EVENTS: usize = 64;
pub const READ_CHUNK_SIZE: usize = 4096;
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;
pub const MAX_START_LINE: usize = 8 * 1024;
pub const CONN_TIMEOUT: Duration = Duration::from_secs(30);
