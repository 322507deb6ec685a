use thiserror::Error;

/// All errors produced by colloquy-core.
#[derive(Debug, Error)]
pub enum ColloquyError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("capture device lost: {0}")]
    CaptureLost(String),

    #[error("transport authentication failed: {0}")]
    TransportAuth(String),

    #[error("transport connection failed: {0}")]
    TransportNetwork(String),

    #[error("malformed chunk encoding: {0}")]
    MalformedEncoding(String),

    #[error("PCM buffer of {len} bytes is not a multiple of {stride} bytes per frame")]
    InvalidSampleLength { len: usize, stride: usize },

    #[error("session is already running")]
    AlreadyRunning,

    #[error("session is not running")]
    NotRunning,

    #[error("session has ended — construct a new session to retry")]
    SessionEnded,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ColloquyError {
    /// Whether this error should trigger the host's credential-selection
    /// remediation rather than a plain retry message.
    pub fn is_credential_failure(&self) -> bool {
        matches!(self, ColloquyError::TransportAuth(_))
    }
}

pub type Result<T> = std::result::Result<T, ColloquyError>;
