use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("loop is already running")]
    AlreadyRunning,
    #[error("no loop command configured")]
    Unconfigured,
    #[error("failed to start loop process: {0}")]
    Spawn(String),
}

impl SupervisorError {
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::AlreadyRunning => "already_running",
            SupervisorError::Unconfigured => "unconfigured",
            SupervisorError::Spawn(_) => "spawn_failed",
        }
    }
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("invalid document name: {0}")]
    InvalidName(String),
    #[error("unknown document: {0}")]
    NotFound(String),
    #[error("document io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DocumentError {
    pub fn code(&self) -> &'static str {
        match self {
            DocumentError::InvalidName(_) => "invalid_name",
            DocumentError::NotFound(_) => "not_found",
            DocumentError::Io(_) => "io_error",
        }
    }
}

#[derive(Debug, Error)]
pub enum ChecklistError {
    #[error("no checklist item at line {0}")]
    NoSuchItem(usize),
    #[error("checklist io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChecklistError {
    pub fn code(&self) -> &'static str {
        match self {
            ChecklistError::NoSuchItem(_) => "no_such_item",
            ChecklistError::Io(_) => "io_error",
        }
    }
}

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("generator is already running")]
    Busy,
    #[error("no generator command configured")]
    Unconfigured,
    #[error("failed to start generator process: {0}")]
    Spawn(String),
}

impl GeneratorError {
    pub fn code(&self) -> &'static str {
        match self {
            GeneratorError::Busy => "generator_busy",
            GeneratorError::Unconfigured => "unconfigured",
            GeneratorError::Spawn(_) => "spawn_failed",
        }
    }
}
