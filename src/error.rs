use core::fmt;

#[derive(Debug, Clone)]
pub enum AecError {
    InvalidConfig(&'static str),
    Unsupported(&'static str),
    IncompleteFlush { total_out: usize },
}

impl fmt::Display for AecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AecError::InvalidConfig(s) => write!(f, "invalid configuration: {s}"),
            AecError::Unsupported(s) => write!(f, "unsupported: {s}"),
            AecError::IncompleteFlush { total_out } => {
                write!(f, "stream not fully flushed ({total_out} bytes written)")
            }
        }
    }
}

impl std::error::Error for AecError {}
