use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// 请求本身不合法（名称/描述），不会进入流水线
    #[error("Request validation error: {0}")]
    RequestValidation(String),

    #[error("Provider error: {0}")]
    Provider(String),

    /// 瞬时失败，网关内部按退避策略重试
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// 模型输出不符合期望形状
    #[error("Malformed output: {0}")]
    MalformedOutput(String),

    #[error("Plan generation error: {0}")]
    PlanGeneration(String),

    #[error("Malformed plan: {0}")]
    MalformedPlan(String),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Integration failure: {0}")]
    Integration(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// 同名能力已有进行中的流程
    #[error("Busy: {0}")]
    Busy(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Short, stable name of the error kind, used in TMS entry details.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "ConfigError",
            Error::Io(_) => "IoError",
            Error::Json(_) => "JsonError",
            Error::RequestValidation(_) => "RequestValidationError",
            Error::Provider(_) => "ProviderError",
            Error::Gateway(_) => "GatewayError",
            Error::MalformedOutput(_) => "MalformedOutputError",
            Error::PlanGeneration(_) => "PlanGenerationError",
            Error::MalformedPlan(_) => "MalformedPlanError",
            Error::Synthesis(_) => "SynthesisError",
            Error::Integration(_) => "IntegrationFailure",
            Error::Sandbox(_) => "SandboxError",
            Error::Storage(_) => "StorageError",
            Error::NotFound(_) => "NotFound",
            Error::Timeout(_) => "Timeout",
            Error::Busy(_) => "Busy",
            Error::Cancelled(_) => "Cancelled",
            Error::Other(_) => "Error",
        }
    }

    /// Transient failures the gateway may retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Provider(_) | Error::Gateway(_) | Error::Timeout(_) | Error::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
