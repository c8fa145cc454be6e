use thiserror::Error;

/// errno values used when errors cross a system-call style boundary
pub mod errno {
    pub const EFAULT: i32 = 14;
    pub const EINVAL: i32 = 22;
    pub const EAGAIN: i32 = 11;
    pub const EMSGSIZE: i32 = 90;
    pub const EAFNOSUPPORT: i32 = 97;
    pub const EADDRINUSE: i32 = 98;
    pub const ENETUNREACH: i32 = 101;
    pub const ENOBUFS: i32 = 105;
    pub const ETIMEDOUT: i32 = 110;
    pub const EHOSTUNREACH: i32 = 113;
    pub const EALREADY: i32 = 114;
    pub const ECANCELED: i32 = 125;
    pub const ESHUTDOWN: i32 = 108;
    pub const EIO: i32 = 5;
}

/// The failure an RPC carries. It is recorded on the RPC and handed to the application as the
///  RPC's result when the RPC is received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("RPC was cancelled")]
    Cancelled,
    #[error("peer did not respond in time")]
    Timeout,
    #[error("peer is unreachable")]
    PeerUnreachable,
    #[error("RPC was aborted with error code {0}")]
    Aborted(i32),
}

impl RpcError {
    pub fn errno(&self) -> i32 {
        match self {
            RpcError::Cancelled => errno::ECANCELED,
            RpcError::Timeout => errno::ETIMEDOUT,
            RpcError::PeerUnreachable => errno::EHOSTUNREACH,
            RpcError::Aborted(code) => *code,
        }
    }
}

/// Errors returned synchronously by endpoint operations and packet I/O.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HomaError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("address family not supported by this endpoint")]
    AddressFamily,
    #[error("copying to the application's buffer failed")]
    Fault,
    #[error("endpoint was shut down")]
    Shutdown,
    #[error("no RPC with id {0}")]
    NoSuchRpc(u64),
    #[error("RPC {0} was already completed")]
    AlreadyCompleted(u64),
    #[error("operation would block")]
    WouldBlock,
    #[error("timed out waiting for an RPC")]
    Timeout,
    #[error("destination host is unreachable")]
    HostUnreachable,
    #[error("no buffer space available for transmission")]
    NoBufferSpace,
    #[error("message of {length} bytes exceeds the maximum of {max} bytes")]
    MessageTooLong { length: usize, max: usize },
    #[error("port {0} is already in use")]
    PortInUse(u16),
    #[error("transmission failed: {0}")]
    Transmit(String),
}

impl HomaError {
    pub fn errno(&self) -> i32 {
        match self {
            HomaError::InvalidArgument(_) => errno::EINVAL,
            HomaError::AddressFamily => errno::EAFNOSUPPORT,
            HomaError::Fault => errno::EFAULT,
            HomaError::Shutdown => errno::ESHUTDOWN,
            HomaError::NoSuchRpc(_) => errno::EINVAL,
            HomaError::AlreadyCompleted(_) => errno::EALREADY,
            HomaError::WouldBlock => errno::EAGAIN,
            HomaError::Timeout => errno::ETIMEDOUT,
            HomaError::HostUnreachable => errno::EHOSTUNREACH,
            HomaError::NoBufferSpace => errno::ENOBUFS,
            HomaError::MessageTooLong { .. } => errno::EMSGSIZE,
            HomaError::PortInUse(_) => errno::EADDRINUSE,
            HomaError::Transmit(_) => errno::EIO,
        }
    }

    /// Transmit-side exhaustion means 'try again later', the data is still there
    pub fn is_recoverable(&self) -> bool {
        matches!(self, HomaError::NoBufferSpace | HomaError::WouldBlock)
    }
}
