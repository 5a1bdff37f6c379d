//! Tunables named throughout spec §4–§6.

use std::time::Duration;

/// Timeout for `resolve_addr` (spec §4.1, §5).
pub(crate) const ADDR_RESOLVE_TIMEOUT: Duration = Duration::from_millis(2000);
/// Timeout for `resolve_route` (spec §4.1, §5).
pub(crate) const ROUTE_RESOLVE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Fixed task count of the handshake pool (spec §4.3).
pub(crate) const NUM_CONN_SETUP_TASKS: usize = 4;
/// Inline buffer size used by the handshake pool (spec §4.3).
pub(crate) const CONN_SETUP_BUF_SIZE: usize = 256;

/// `6 ×` multiplier used to size the primary pool (spec §4.3, §4.6, §9 open question).
///
/// Preserved from the source as a tunable: tx-ready + in-flight-recv + in-flight-sent +
/// io-submit queues, doubled for the client holding sent+recv tasks simultaneously.
pub(crate) const PRIMARY_POOL_MULTIPLIER: usize = 6;

/// Default inline/RDMA boundary (spec §6, `rdma_buf_threshold` default).
pub(crate) const SEND_BUF_SZ: usize = 8192;
/// Valid range for `rdma_buf_threshold` (spec §6).
pub(crate) const RDMA_BUF_THRESHOLD_RANGE: std::ops::RangeInclusive<usize> = 1024..=65536;

/// Default scatter-gather-entry count bound (spec §6, `max_in_iovsz`/`max_out_iovsz` default).
pub(crate) const XIO_IOVLEN: usize = 4;

/// CQE chunk size cap used when growing a CQ (spec §4.2).
pub(crate) const CQE_ALLOC_SIZE: u32 = 1024;

/// Per-QP CQE reservation taken at QP setup (spec §4.4).
pub(crate) const MAX_CQE_PER_QP: u32 = 256;
/// `max_send_wr` for QP init attrs (spec §4.4).
pub(crate) const MAX_SEND_WR: u32 = 256;
/// `max_recv_wr` for QP init attrs (spec §4.4).
pub(crate) const MAX_RECV_WR: u32 = 256;
/// Extra receive-queue entries added on top of `max_recv_wr` (spec §4.4).
pub(crate) const EXTRA_RQE: u32 = 16;
/// `max_inline_data` requested at QP setup (spec §4.4).
pub(crate) const MAX_INLINE_DATA: u32 = 64;
