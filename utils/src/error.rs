use std::{path::PathBuf, time::Duration};

use alloy::transports::{RpcError, TransportErrorKind};
use url::Url;

use crate::reqwest::{ReqwestErrorContext, ReqwestInnerError, ReqwestStage};

pub type Result<T> = std::result::Result<T, UtilsError>;

#[derive(Debug, thiserror::Error)]
pub enum UtilsError {
    #[error(transparent)]
    Common(#[from] holdscan_common::Error),

    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),

    #[error("Failed to parse Alchemy response: {0}.")]
    AlchemyResponse(&'static str),

    #[error("At most 3 wallets fit one balances request, got {0}.")]
    TooManyAddresses(usize),

    #[error("Alchemy API key not set, please set it in the config or ALCHEMY_API_KEY.")]
    AlchemyApiKeyNotSet,

    #[error("Failed to get base directories.")]
    BaseDirsFailed,

    #[error("Failed to create directory: {0:?}. (Error: {1:?})")]
    CreateDirAllFailed(PathBuf, std::io::Error),

    #[error("Failed to read the file: {0}. (Error: {1:?})")]
    FileReadFailed(PathBuf, std::io::Error),

    #[error("Failed to write to the file: {0}. (Error: {1:?})")]
    FileWriteFailed(PathBuf, std::io::Error),

    #[error("Terminal I/O failed. (Error: {0:?})")]
    TerminalIo(std::io::Error),

    #[error("Parsing the toml file failed: {0}. (Error: {1:?})")]
    TomlParsingFailed(PathBuf, toml::de::Error),

    #[error("Formatting to toml format failed: {0}. (Error: {1:?})")]
    TomlFormattingFailed(String, toml::ser::Error),

    #[error("Formatting to json failed. (Error: {0})")]
    JsonFormattingFailed(serde_json::Error),

    #[error("Failed to parse URL: {0}. (Error: {1:?})")]
    UrlParsingFailed(String, url::ParseError),

    #[error(transparent)]
    SerdePathToError(#[from] serde_path_to_error::Error<serde_json::Error>),

    #[error("Please check your internet connection, the URL seems to be unreachable: {0}")]
    Internet(Url),

    #[error("Request '{url}' failed at stage '{stage:?}' (Error='{inner:?}', Context='{context:?}')", url = context.url)]
    ReqwestFailed {
        stage: ReqwestStage,
        context: Box<ReqwestErrorContext>,
        inner: ReqwestInnerError,
    },

    #[error("Reqwest builder missing error context, this is a bug please report it.")]
    ReqwestErrorContextMissing,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Rate limited by {url} (retry after: {retry_after:?})")]
    RateLimited {
        url: Url,
        retry_after: Option<Duration>,
    },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Multicall request failed. (Error: {0})")]
    MulticallFailed(Box<alloy::contract::Error>),

    #[error("Multicall returned {got} results for {expected} calls.")]
    MulticallResultMismatch { expected: usize, got: usize },

    #[error("Gave up after {attempts} attempts. (Error: {last})")]
    RetriesExhausted {
        attempts: usize,
        last: Box<UtilsError>,
    },

    #[error("Failed to open database at {0:?}. (Error: {1})")]
    DatabaseOpenFailed(PathBuf, rusqlite::Error),

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error("Staged balance '{0}' is not a decimal integer.")]
    CorruptStagedBalance(String),

    #[error("Wallet {0} is not present in the holder store.")]
    WalletNotFound(String),

    #[error("Token registry entry '{symbol}' is malformed: {reason}")]
    InvalidRegistryEntry { symbol: String, reason: String },

    #[error("Token registry contains '{0}' twice.")]
    DuplicateToken(String),

    #[error("Token registry is empty, nothing to query.")]
    EmptyRegistry,

    #[error("Batch width must be at least 1.")]
    InvalidBatchWidth,

    #[error("Concurrent passes need a wallet-grouped plan.")]
    PlanNotWalletGrouped,

    #[error("Worker task failed. (Error: {0})")]
    WorkerFailed(#[from] tokio::task::JoinError),
}

impl UtilsError {
    pub fn is_connect(&self) -> bool {
        match self {
            Self::Internet(_) => true,
            Self::ReqwestFailed { inner, .. } => inner.is_connect(),
            _ => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::MulticallFailed(err) => http_status(err) == Some(429),
            _ => false,
        }
    }

    /// Server provided wait hint, if the error carried one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Errors worth retrying: timeouts, connection problems, 5xx and transport
    /// level RPC failures. Rate limits are reported separately.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Internet(_) => true,
            Self::ReqwestError(err) => err.is_timeout() || err.is_connect(),
            Self::ReqwestFailed { stage, inner, .. } => match (stage, inner) {
                (ReqwestStage::Send, _) => true,
                (ReqwestStage::Status, ReqwestInnerError::Reqwest(err)) => err
                    .status()
                    .map(|status| status.is_server_error())
                    .unwrap_or(true),
                (ReqwestStage::DecodeText, _) => true,
                _ => false,
            },
            Self::MulticallFailed(err) => matches!(
                err.as_ref(),
                alloy::contract::Error::TransportError(RpcError::Transport(_))
            ),
            _ => false,
        }
    }
}

fn http_status(err: &alloy::contract::Error) -> Option<u16> {
    match err {
        alloy::contract::Error::TransportError(RpcError::Transport(
            TransportErrorKind::HttpError(http),
        )) => Some(http.status),
        _ => None,
    }
}
