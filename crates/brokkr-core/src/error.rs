//! Error types for brokkr-core

use thiserror::Error;

/// Result type alias using brokkr-core's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the execution-context substrate
#[derive(Error, Debug)]
pub enum Error {
    /// A configuration variable could not be parsed
    #[error("Invalid value for {key}: {message}")]
    ConfigVar { key: String, message: String },

    /// Unknown context factory name in configuration
    #[error("Unknown context factory: {name}. Valid factories: basic")]
    UnknownFactory { name: String },

    /// Unknown factory wrapper name in configuration
    #[error("Unknown factory wrapper: {name}. Valid wrappers: logging")]
    UnknownFactoryWrapper { name: String },

    /// Unknown attacher name in configuration
    #[error("Unknown context attacher: {name}. Valid attachers: thread-stack, diagnostic")]
    UnknownAttacher { name: String },

    /// A context was detached from a thread other than the one it was attached on
    #[error("Context {context} attached on {attached:?} but detached on {detaching:?}")]
    DetachWrongThread {
        context: String,
        attached: std::thread::ThreadId,
        detaching: std::thread::ThreadId,
    },

    /// A context was detached while it was not the top of the stack
    #[error("Context {context} is not the top of the attachment stack")]
    DetachOutOfOrder { context: String },
}

impl Error {
    /// Create a config variable error
    pub fn config_var(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigVar {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create an unknown factory error
    pub fn unknown_factory(name: impl Into<String>) -> Self {
        Self::UnknownFactory { name: name.into() }
    }

    /// Create an unknown factory wrapper error
    pub fn unknown_factory_wrapper(name: impl Into<String>) -> Self {
        Self::UnknownFactoryWrapper { name: name.into() }
    }

    /// Create an unknown attacher error
    pub fn unknown_attacher(name: impl Into<String>) -> Self {
        Self::UnknownAttacher { name: name.into() }
    }
}
