/// Index of the default protocol in every virtual host's protocol list.
pub const DEFAULT_PROTOCOL: usize = 0;

/// Connections store their thread index as u8; never run more service threads than this.
pub const MAX_SERVICE_THREADS: usize = 256;

/// Upper bound accepted for a per-thread poll table.
pub const MAX_FDS_PER_THREAD: usize = 1 << 20;

const _: () = assert!(
    MAX_SERVICE_THREADS <= u8::MAX as usize + 1,
    "thread index is u8"
);
