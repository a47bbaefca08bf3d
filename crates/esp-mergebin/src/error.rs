use std::fmt;

#[derive(Debug)]
pub struct Error {
    msg: String,
    exit_code: Option<i32>,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self {
            msg: msg.into(),
            exit_code: None,
        }
    }

    // A child process exited unsuccessfully; keep its code so the CLI can pass it through.
    pub fn exited<M: Into<String>>(msg: M, exit_code: Option<i32>) -> Self {
        Self {
            msg: msg.into(),
            exit_code,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn context<C: fmt::Display>(self, ctx: C) -> Self {
        Self {
            msg: format!("{ctx}: {}", self.msg),
            exit_code: self.exit_code,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
